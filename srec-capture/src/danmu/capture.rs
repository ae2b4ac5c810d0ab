//! Side-channel capture contract used by the download orchestrator.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::Result;
use crate::domain::StreamJob;

/// Why a side-channel fetch was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The media capture ended and the side channel should wrap up.
    DownloadFinished,
    /// The job was torn down before finishing.
    Aborted,
}

/// How a fetch loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The remote side closed the stream.
    StreamClosed,
    Cancelled(CancelReason),
}

/// Fires a [`CancelReason`] to every [`ShutdownSignal`].
///
/// Only the first reason is delivered. Dropping the trigger without firing
/// wakes waiters with [`CancelReason::Aborted`].
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<Option<CancelReason>>,
}

impl ShutdownTrigger {
    /// Returns `false` if a reason was already delivered.
    pub fn trigger(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl ShutdownSignal {
    /// Wait until shutdown is requested.
    pub async fn cancelled(&mut self) -> CancelReason {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(CancelReason::Aborted),
            Err(_) => CancelReason::Aborted,
        }
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(None);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// A side channel recorded next to the media, e.g. live chat.
///
/// One instance serves one job at a time; `init` resets any state left
/// from a previous job.
#[async_trait]
pub trait DanmuCapture: Send + Sync {
    /// Prepare for `job`. `Ok(false)` means the job has no side channel.
    async fn init(&self, job: &StreamJob, start_time: DateTime<Utc>) -> Result<bool>;

    /// Record into [`file_path`](Self::file_path) until the stream closes or
    /// `shutdown` fires.
    async fn fetch(&self, shutdown: ShutdownSignal) -> Result<FetchOutcome>;

    /// Stop accepting new messages.
    async fn finish(&self);

    fn is_initialized(&self) -> bool;

    fn set_file_path(&self, path: PathBuf);

    fn file_path(&self) -> Option<PathBuf>;

    /// Called once the media capture produces its first output.
    fn on_capture_started(&self, at: DateTime<Utc>);
}
