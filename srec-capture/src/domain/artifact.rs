//! Capture artifact: the record of a produced output.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Descriptor of a capture output.
///
/// Starts as a template built by the orchestrator. The engine fills in the
/// timestamps on success, and the orchestrator clears `danmu_path` when the
/// side channel never came up and drops the `.part` suffix on acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureArtifact {
    pub job_id: String,
    pub streamer_name: String,
    pub title: String,
    pub media_path: PathBuf,
    pub danmu_path: Option<PathBuf>,
    /// Unix seconds at which the capture started (0 until set by the engine).
    pub start_epoch: i64,
    /// Unix seconds at which the capture ended (0 until set by the engine).
    pub end_epoch: i64,
}

impl CaptureArtifact {
    pub fn new(
        job_id: impl Into<String>,
        streamer_name: impl Into<String>,
        title: impl Into<String>,
        media_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            streamer_name: streamer_name.into(),
            title: title.into(),
            media_path: media_path.into(),
            danmu_path: None,
            start_epoch: 0,
            end_epoch: 0,
        }
    }

    pub fn with_danmu_path(mut self, path: Option<PathBuf>) -> Self {
        self.danmu_path = path;
        self
    }

    /// Copy of this artifact stamped with the capture window and final path.
    pub fn completed(&self, start_epoch: i64, end_epoch: i64, media_path: PathBuf) -> Self {
        Self {
            start_epoch,
            end_epoch,
            media_path,
            ..self.clone()
        }
    }

    /// Capture duration in seconds.
    pub fn duration_secs(&self) -> i64 {
        (self.end_epoch - self.start_epoch).max(0)
    }
}
