//! Domain types shared by the capture pipeline.

mod artifact;
mod format;
mod job;

pub use artifact::CaptureArtifact;
pub use format::VideoFormat;
pub use job::{Platform, StreamJob};
