//! Object detection: backend trait, result types, and the per-tick
//! scheduler that throttles inference to the configured interval.

pub mod backend;
pub mod backends;
pub mod result;
pub mod scheduler;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
pub use result::{BoundingBox, Detection, DetectionSet};
pub use scheduler::{DetectionScheduler, TickOutput};
