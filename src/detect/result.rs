use serde::Serialize;

/// Bounding box in pixel coordinates, always `(x, y, width, height)`
/// regardless of the detector's native corner format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Normalize a detector-native `(x1, y1, x2, y2)` corner pair.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        let (left, right) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (top, bottom) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        Self {
            x: left,
            y: top,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        }
    }
}

/// One detected object on one frame.
#[derive(Clone, Debug, Serialize)]
pub struct Detection {
    pub label: String,
    /// In [0, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Ordered detections for one frame. Replaced atomically as a whole;
/// consumers never observe a partially updated set.
#[derive(Clone, Debug, Default)]
pub struct DetectionSet {
    /// Sequence number of the frame the set was computed from, or re-tagged
    /// to when a throttled tick republishes the previous set.
    pub frame_seq: u64,
    pub detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn retagged(&self, frame_seq: u64) -> Self {
        Self {
            frame_seq,
            detections: self.detections.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
