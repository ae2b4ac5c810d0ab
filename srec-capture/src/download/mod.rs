//! Capture job orchestration.

mod orchestrator;
mod progress;

pub use orchestrator::{DANMU_JOIN_TIMEOUT, Download};
pub use progress::{CaptureObserver, CaptureProgress, ProgressLogger, format_bytes};
