//! Outbound live-view publishing.
//!
//! Each due tick is downscaled, JPEG-encoded, base64-wrapped, and handed to
//! a `FrameTransport` together with the tick's detection summary. The sink
//! paces emission to the configured interval; ticks arriving faster than
//! that are dropped, never queued.

use std::time::Instant;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use log::{debug, error};
use serde::Serialize;

use crate::config::BroadcastSettings;
use crate::detect::TickOutput;
use crate::frame::Frame;

/// One published live-view frame.
#[derive(Clone, Debug, Serialize)]
pub struct FramePacket {
    pub frame_seq: u64,
    pub width: u32,
    pub height: u32,
    /// Base64 of the JPEG bytes.
    pub image: String,
    pub detections: Vec<PacketDetection>,
}

/// Detection summary carried alongside the image; box geometry is already
/// burned into the pixels so only label and confidence travel separately.
#[derive(Clone, Debug, Serialize)]
pub struct PacketDetection {
    pub label: String,
    pub confidence: f32,
}

/// Delivery seam for live-view packets. The pipeline never blocks on a
/// transport; a failing transport only costs the frames it fails on.
pub trait FrameTransport: Send {
    fn emit_frame(&mut self, packet: &FramePacket) -> Result<()>;
    fn emit_error(&mut self, message: &str);
}

/// Default transport: logs a per-frame summary. Stands in wherever a real
/// socket transport is not wired up.
pub struct LogTransport;

impl FrameTransport for LogTransport {
    fn emit_frame(&mut self, packet: &FramePacket) -> Result<()> {
        debug!(
            "live view frame {}: {}x{}, {} detections, {} b64 bytes",
            packet.frame_seq,
            packet.width,
            packet.height,
            packet.detections.len(),
            packet.image.len()
        );
        Ok(())
    }

    fn emit_error(&mut self, message: &str) {
        error!("live view error: {}", message);
    }
}

pub struct BroadcastSink {
    settings: BroadcastSettings,
    transport: Box<dyn FrameTransport>,
    last_emit: Option<Instant>,
}

impl BroadcastSink {
    pub fn new(settings: BroadcastSettings, transport: Box<dyn FrameTransport>) -> Self {
        Self {
            settings,
            transport,
            last_emit: None,
        }
    }

    /// Publish one tick if the pacing interval has elapsed. Encoding and
    /// transport failures are reported through the transport's error path
    /// and never propagate to the capture loop.
    pub fn publish(&mut self, tick: &TickOutput, now: Instant) {
        let due = match self.last_emit {
            Some(at) => now.duration_since(at) >= self.settings.interval,
            None => true,
        };
        if !due {
            return;
        }
        self.last_emit = Some(now);

        let packet = match self.encode(&tick.annotated, &tick.detections.detections) {
            Ok(packet) => packet,
            Err(err) => {
                self.transport
                    .emit_error(&format!("frame encode failed: {:#}", err));
                return;
            }
        };
        if let Err(err) = self.transport.emit_frame(&packet) {
            error!("transport rejected frame {}: {:#}", packet.frame_seq, err);
        }
    }

    /// Surface a pipeline-level error (camera loss, reconnects) to live
    /// viewers through the transport's error path.
    pub fn publish_error(&mut self, message: &str) {
        self.transport.emit_error(message);
    }

    fn encode(
        &self,
        frame: &Frame,
        detections: &[crate::detect::Detection],
    ) -> Result<FramePacket> {
        let image = frame.to_rgb_image()?;
        let resized = imageops::resize(
            &image,
            self.settings.width,
            self.settings.height,
            FilterType::Triangle,
        );

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.settings.jpeg_quality)
            .encode_image(&resized)
            .context("jpeg encode")?;

        Ok(FramePacket {
            frame_seq: frame.seq,
            width: self.settings.width,
            height: self.settings.height,
            image: BASE64.encode(&jpeg),
            detections: detections
                .iter()
                .map(|d| PacketDetection {
                    label: d.label.clone(),
                    confidence: d.confidence,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    use crate::detect::{BoundingBox, Detection, DetectionSet};

    #[derive(Default)]
    struct Captured {
        packets: Vec<FramePacket>,
        errors: Vec<String>,
    }

    struct CapturingTransport(Arc<Mutex<Captured>>);

    impl FrameTransport for CapturingTransport {
        fn emit_frame(&mut self, packet: &FramePacket) -> Result<()> {
            self.0.lock().unwrap().packets.push(packet.clone());
            Ok(())
        }

        fn emit_error(&mut self, message: &str) {
            self.0.lock().unwrap().errors.push(message.to_string());
        }
    }

    fn settings() -> BroadcastSettings {
        BroadcastSettings {
            width: 32,
            height: 24,
            jpeg_quality: 65,
            interval: Duration::from_millis(33),
        }
    }

    fn tick(seq: u64) -> TickOutput {
        let frame = Frame::new(seq, 64, 48, SystemTime::now(), vec![90u8; 64 * 48 * 3]);
        TickOutput {
            annotated: frame,
            detections: DetectionSet {
                frame_seq: seq,
                detections: vec![Detection {
                    label: "person".to_string(),
                    confidence: 0.8,
                    bbox: BoundingBox {
                        x: 1,
                        y: 1,
                        width: 4,
                        height: 4,
                    },
                }],
            },
        }
    }

    #[test]
    fn publishes_resized_base64_jpeg() {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let mut sink = BroadcastSink::new(
            settings(),
            Box::new(CapturingTransport(Arc::clone(&captured))),
        );
        sink.publish(&tick(7), Instant::now());

        let captured = captured.lock().unwrap();
        assert_eq!(captured.packets.len(), 1);
        let packet = &captured.packets[0];
        assert_eq!(packet.frame_seq, 7);
        assert_eq!((packet.width, packet.height), (32, 24));
        assert_eq!(packet.detections.len(), 1);
        let jpeg = BASE64.decode(&packet.image).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "jpeg magic");
    }

    #[test]
    fn paces_to_the_configured_interval() {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let mut sink = BroadcastSink::new(
            settings(),
            Box::new(CapturingTransport(Arc::clone(&captured))),
        );

        let t0 = Instant::now();
        sink.publish(&tick(1), t0);
        sink.publish(&tick(2), t0 + Duration::from_millis(5));
        sink.publish(&tick(3), t0 + Duration::from_millis(40));

        let captured = captured.lock().unwrap();
        let seqs: Vec<u64> = captured.packets.iter().map(|p| p.frame_seq).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn encode_failure_goes_to_error_path() {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let mut sink = BroadcastSink::new(
            settings(),
            Box::new(CapturingTransport(Arc::clone(&captured))),
        );

        // Truncated buffer cannot be reinterpreted as an image.
        let bad = TickOutput {
            annotated: Frame::new(1, 64, 48, SystemTime::now(), vec![1u8; 10]),
            detections: DetectionSet::default(),
        };
        sink.publish(&bad, Instant::now());

        let captured = captured.lock().unwrap();
        assert!(captured.packets.is_empty());
        assert_eq!(captured.errors.len(), 1);
    }
}
