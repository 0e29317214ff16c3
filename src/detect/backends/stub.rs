use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};

/// Labels the stub pretends to know. A subset of the usual COCO vocabulary,
/// covering the default notification watch list.
const STUB_LABELS: &[&str] = &[
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "bus",
    "truck",
    "bird",
    "cat",
    "dog",
];

/// Stub backend for tests and camera-less development.
///
/// Hashes each frame and reports a single centered "person" whenever the
/// content changed since the previous frame.
pub struct StubBackend {
    labels: Vec<String>,
    last_hash: Option<[u8; 32]>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            labels: STUB_LABELS.iter().map(|s| s.to_string()).collect(),
            last_hash: None,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let current_hash: [u8; 32] = Sha256::digest(pixels).into();

        let changed = match self.last_hash {
            Some(prev) => prev != current_hash,
            None => false,
        };
        self.last_hash = Some(current_hash);

        let confidence = 0.85;
        if !changed || confidence < confidence_threshold {
            return Ok(Vec::new());
        }

        let box_w = width / 2;
        let box_h = height / 2;
        Ok(vec![Detection {
            label: "person".to_string(),
            confidence,
            bbox: BoundingBox {
                x: (width / 4) as i32,
                y: (height / 4) as i32,
                width: box_w,
                height: box_h,
            },
        }])
    }
}
