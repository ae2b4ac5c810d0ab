//! Capture progress observers.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::domain::StreamJob;

/// Progress snapshot of a running capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureProgress {
    /// Bytes written since the capture started.
    pub total_bytes: u64,
    /// Latest bitrate label reported by the engine.
    pub bitrate: String,
}

/// Receives capture lifecycle notifications, in order, from one job.
pub trait CaptureObserver: Send + Sync {
    fn on_started(&self, _job: &StreamJob) {}

    fn on_progress(&self, _job: &StreamJob, _progress: &CaptureProgress) {}

    fn on_finished(&self, _job: &StreamJob, _progress: &CaptureProgress) {}
}

/// Logs capture progress at a fixed interval.
#[derive(Debug)]
pub struct ProgressLogger {
    interval: Duration,
    last_logged: Mutex<Option<Instant>>,
}

impl ProgressLogger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: Mutex::new(None),
        }
    }

    /// Returns whether a progress line is due and records it as logged.
    fn should_log(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_logged.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl Default for ProgressLogger {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl CaptureObserver for ProgressLogger {
    fn on_started(&self, job: &StreamJob) {
        *self.last_logged.lock() = Some(Instant::now());
        info!(streamer = %job.streamer_name, job_id = %job.id, "Capture started");
    }

    fn on_progress(&self, job: &StreamJob, progress: &CaptureProgress) {
        if self.should_log() {
            info!(
                streamer = %job.streamer_name,
                job_id = %job.id,
                "Downloaded {} ({})",
                format_bytes(progress.total_bytes),
                progress.bitrate
            );
        }
    }

    fn on_finished(&self, job: &StreamJob, progress: &CaptureProgress) {
        *self.last_logged.lock() = None;
        info!(
            streamer = %job.streamer_name,
            job_id = %job.id,
            "Capture finished, {} written",
            format_bytes(progress.total_bytes)
        );
    }
}

/// Format bytes into human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
