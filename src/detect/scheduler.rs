//! Detection scheduling and per-tick output assembly.
//!
//! The scheduler owns the backend and decides, per captured frame, whether
//! to run inference or republish the previous result. Either way every tick
//! produces one `TickOutput` whose annotated frame and detection set were
//! built together, so downstream consumers can never pair a frame with
//! detections from a different tick.

use std::time::Instant;

use anyhow::Result;
use log::warn;

use crate::annotate::{draw_detection, LabelPalette};
use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectionSet;
use crate::frame::Frame;

/// One tick's worth of pipeline output: the frame with boxes drawn on it
/// and the detection set that produced those boxes.
#[derive(Clone, Debug)]
pub struct TickOutput {
    pub annotated: Frame,
    pub detections: DetectionSet,
}

pub struct DetectionScheduler {
    backend: Box<dyn DetectorBackend>,
    interval: std::time::Duration,
    confidence_threshold: f32,
    palette: LabelPalette,
    last_detection_at: Option<Instant>,
    last_set: DetectionSet,
}

impl DetectionScheduler {
    pub fn new(
        backend: Box<dyn DetectorBackend>,
        interval: std::time::Duration,
        confidence_threshold: f32,
    ) -> Self {
        let palette = LabelPalette::from_vocabulary(backend.labels());
        Self {
            backend,
            interval,
            confidence_threshold,
            palette,
            last_detection_at: None,
            last_set: DetectionSet::default(),
        }
    }

    /// Run the backend's warm-up hook. Called once during pipeline start so
    /// model loading failures abort start-up instead of the first tick.
    pub fn warm_up(&mut self) -> Result<()> {
        self.backend.warm_up()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Process one frame. Runs inference when the detection interval has
    /// elapsed, otherwise re-tags the previous set to this frame.
    ///
    /// A backend failure is logged and degrades the tick to a republish;
    /// it never takes the capture loop down.
    pub fn process(&mut self, frame: &Frame, now: Instant) -> TickOutput {
        let due = match self.last_detection_at {
            Some(at) => now.duration_since(at) >= self.interval,
            None => true,
        };

        if due {
            self.last_detection_at = Some(now);
            match self.backend.detect(
                frame.pixels(),
                frame.width,
                frame.height,
                self.confidence_threshold,
            ) {
                Ok(detections) => {
                    self.last_set = DetectionSet {
                        frame_seq: frame.seq,
                        detections,
                    };
                }
                Err(err) => {
                    warn!(
                        "detector '{}' failed on frame {}: {:#}",
                        self.backend.name(),
                        frame.seq,
                        err
                    );
                }
            }
        }

        let detections = self.last_set.retagged(frame.seq);
        let annotated = self.annotate(frame, &detections);
        TickOutput {
            annotated,
            detections,
        }
    }

    fn annotate(&self, frame: &Frame, detections: &DetectionSet) -> Frame {
        if detections.is_empty() {
            return frame.clone();
        }
        let mut image = match frame.to_rgb_image() {
            Ok(image) => image,
            Err(err) => {
                warn!("skipping annotation of frame {}: {:#}", frame.seq, err);
                return frame.clone();
            }
        };
        for det in &detections.detections {
            // One bad detection must not suppress the rest of the overlay.
            if let Err(err) = draw_detection(&mut image, det, &self.palette) {
                warn!("skipping overlay for one detection: {:#}", err);
            }
        }
        Frame::from_rgb_image(frame, image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::anyhow;

    use crate::detect::result::{BoundingBox, Detection};

    /// Backend double that returns a scripted result per call.
    struct ScriptedBackend {
        labels: Vec<String>,
        calls: usize,
        script: Vec<Result<Vec<Detection>>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<Vec<Detection>>>) -> Self {
            Self {
                labels: vec!["person".to_string()],
                calls: 0,
                script,
            }
        }
    }

    impl DetectorBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn detect(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
            _confidence_threshold: f32,
        ) -> Result<Vec<Detection>> {
            let idx = self.calls.min(self.script.len() - 1);
            self.calls += 1;
            match &self.script[idx] {
                Ok(dets) => Ok(dets.clone()),
                Err(err) => Err(anyhow!("{}", err)),
            }
        }
    }

    fn person() -> Detection {
        Detection {
            label: "person".to_string(),
            confidence: 0.9,
            bbox: BoundingBox {
                x: 2,
                y: 2,
                width: 8,
                height: 8,
            },
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(
            seq,
            16,
            12,
            std::time::SystemTime::now(),
            vec![50u8; 16 * 12 * 3],
        )
    }

    #[test]
    fn throttled_tick_retags_previous_set() {
        let backend = ScriptedBackend::new(vec![Ok(vec![person()])]);
        let mut sched =
            DetectionScheduler::new(Box::new(backend), Duration::from_millis(80), 0.7);

        let t0 = Instant::now();
        let out1 = sched.process(&frame(1), t0);
        assert_eq!(out1.detections.frame_seq, 1);
        assert_eq!(out1.detections.detections.len(), 1);

        // Within the interval: no inference, but the set follows the frame.
        let out2 = sched.process(&frame(2), t0 + Duration::from_millis(10));
        assert_eq!(out2.detections.frame_seq, 2);
        assert_eq!(out2.detections.detections.len(), 1);
    }

    #[test]
    fn interval_elapsed_runs_inference_again() {
        let backend = ScriptedBackend::new(vec![Ok(vec![person()]), Ok(vec![])]);
        let mut sched =
            DetectionScheduler::new(Box::new(backend), Duration::from_millis(80), 0.7);

        let t0 = Instant::now();
        let out1 = sched.process(&frame(1), t0);
        assert_eq!(out1.detections.detections.len(), 1);

        let out2 = sched.process(&frame(2), t0 + Duration::from_millis(100));
        assert!(out2.detections.is_empty());
    }

    #[test]
    fn backend_error_republishes_previous_set() {
        let backend = ScriptedBackend::new(vec![
            Ok(vec![person()]),
            Err(anyhow!("inference blew up")),
        ]);
        let mut sched =
            DetectionScheduler::new(Box::new(backend), Duration::from_millis(80), 0.7);

        let t0 = Instant::now();
        sched.process(&frame(1), t0);
        let out = sched.process(&frame(2), t0 + Duration::from_millis(100));
        assert_eq!(out.detections.detections.len(), 1, "previous set survives");
        assert_eq!(out.detections.frame_seq, 2);
    }

    #[test]
    fn annotation_changes_frame_bytes_when_boxes_present() {
        let backend = ScriptedBackend::new(vec![Ok(vec![person()])]);
        let mut sched =
            DetectionScheduler::new(Box::new(backend), Duration::from_millis(80), 0.7);

        let f = frame(1);
        let out = sched.process(&f, Instant::now());
        assert_ne!(out.annotated.pixels(), f.pixels());
        assert_eq!(out.annotated.seq, f.seq);
    }

    #[test]
    fn no_detections_returns_unmodified_clone() {
        let backend = ScriptedBackend::new(vec![Ok(vec![])]);
        let mut sched =
            DetectionScheduler::new(Box::new(backend), Duration::from_millis(80), 0.7);

        let f = frame(1);
        let out = sched.process(&f, Instant::now());
        assert_eq!(out.annotated.pixels(), f.pixels());
    }
}
