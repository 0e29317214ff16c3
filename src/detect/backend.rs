use anyhow::Result;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// The pipeline treats the model as an opaque function from pixels to a
/// list of labeled boxes. Implementations:
///
/// - Must be callable many times per second.
/// - Must treat the pixel slice as read-only and ephemeral; no reference to
///   it may be retained past the call.
/// - Must only return detections at or above `confidence_threshold`, with
///   confidence clamped to [0, 1].
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Fixed label vocabulary. The index of a label in this slice is stable
    /// for the lifetime of the backend and drives the annotation palette.
    fn labels(&self) -> &[String];

    /// Run detection on one RGB24 frame.
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once during pipeline start so that model
    /// loading failures surface as start-up errors.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
