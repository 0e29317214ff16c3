//! Owned frame type shared across the pipeline.
//!
//! A `Frame` is an immutable-once-published RGB24 image buffer:
//!
//! - Produced by the device layer, read-only to all downstream consumers.
//! - Pixel data is behind `Arc`, so cloning a frame (e.g. for the recording
//!   queue) never copies pixels; a consumer that needs to mutate (drawing
//!   boxes) clones the pixels out into an `RgbImage` and builds a new frame.
//! - No frame outlives its pipeline tick except inside the recording queue.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use image::RgbImage;

/// One captured image with its capture timestamp.
#[derive(Clone)]
pub struct Frame {
    /// Capture sequence number, assigned by the capture loop.
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
    data: Arc<[u8]>,
}

impl Frame {
    /// Wrap raw RGB24 pixels. Called by the device layer and by annotation.
    pub fn new(seq: u64, width: u32, height: u32, captured_at: SystemTime, data: Vec<u8>) -> Self {
        Self {
            seq,
            width,
            height,
            captured_at,
            data: data.into(),
        }
    }

    /// Build a frame from an annotated image buffer, keeping the source
    /// frame's identity (seq + timestamp).
    pub fn from_rgb_image(source: &Frame, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            seq: source.seq,
            width,
            height,
            captured_at: source.captured_at,
            data: image.into_raw().into(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// A frame is valid when it has the advertised RGB24 size and is not
    /// all-zero (dead sensors commonly return black frames).
    pub fn is_valid(&self) -> bool {
        let expected = (self.width as usize) * (self.height as usize) * 3;
        if expected == 0 || self.data.len() != expected {
            return false;
        }
        self.data.iter().any(|&b| b != 0)
    }

    /// Clone the pixels out into a mutable image buffer for drawing.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.to_vec()).ok_or_else(|| {
            anyhow!(
                "frame buffer does not match {}x{} RGB24",
                self.width,
                self.height
            )
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}
