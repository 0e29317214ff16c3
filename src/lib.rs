//! Single-camera monitoring pipeline: capture, object detection,
//! annotated live view, clip recording, and cooldown-gated alerts.
//!
//! The crate is organized around one capture thread per camera that owns
//! the device handle and drives every per-frame stage; everything else
//! observes its output through the [`capture::Pipeline`] supervisor.

pub mod annotate;
pub mod broadcast;
pub mod capture;
pub mod config;
pub mod detect;
pub mod device;
pub mod frame;
pub mod notify;
pub mod record;
pub mod storage;

pub use broadcast::{BroadcastSink, FramePacket, FrameTransport, LogTransport};
pub use capture::{CameraState, Pipeline, PipelineParts};
pub use config::HomecamConfig;
pub use detect::{DetectorBackend, StubBackend, TickOutput};
pub use device::{CameraDevice, DeviceFactory, SystemDeviceFactory};
pub use frame::Frame;
pub use notify::{DetectionEvent, LogNotifier, Notifier};
pub use record::{RecordError, Recorder, RecordingSession, RecordingSummary};
pub use storage::MediaStore;
