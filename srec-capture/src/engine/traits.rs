//! Capture engine trait and related types.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::domain::{CaptureArtifact, VideoFormat};
use crate::{Error, Result};

/// Desktop browser User-Agent sent with every stream request.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.3029.110 Safari/537.36";
pub const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.8,en-US;q=0.5,en;q=0.3";

/// Type of capture engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// External ffmpeg process.
    #[default]
    Ffmpeg,
    /// In-process HTTP stream copy.
    Native,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ffmpeg => "ffmpeg",
            Self::Native => "native",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ffmpeg" => Ok(Self::Ffmpeg),
            "native" => Ok(Self::Native),
            other => Err(Error::config(format!("unknown engine: {other}"))),
        }
    }
}

/// Everything an engine needs for one run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stream URL.
    pub url: String,
    /// Output container format.
    pub format: VideoFormat,
    /// File the engine writes (`.part` suffixed).
    pub output_path: PathBuf,
    /// Artifact template filled in on success.
    pub artifact: CaptureArtifact,
    /// Cookie header value.
    pub cookies: Option<String>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Time the job started.
    pub start_time: DateTime<Utc>,
    /// Size limit in bytes (0 = unlimited).
    pub max_size_bytes: u64,
    /// Duration limit.
    pub max_duration: Option<Duration>,
    /// Streamer name for logs.
    pub streamer_name: String,
    /// Job id for logs.
    pub job_id: String,
}

impl EngineConfig {
    pub fn new(
        url: impl Into<String>,
        format: VideoFormat,
        output_path: impl Into<PathBuf>,
        artifact: CaptureArtifact,
    ) -> Self {
        Self {
            url: url.into(),
            format,
            output_path: output_path.into(),
            streamer_name: artifact.streamer_name.clone(),
            job_id: artifact.job_id.clone(),
            artifact,
            cookies: None,
            headers: Vec::new(),
            start_time: Utc::now(),
            max_size_bytes: 0,
            max_duration: None,
        }
    }

    pub fn with_cookies(mut self, cookies: Option<String>) -> Self {
        self.cookies = cookies.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_max_duration(mut self, duration: Option<Duration>) -> Self {
        self.max_duration = duration.filter(|d| !d.is_zero());
        self
    }

    /// Request headers in send order: Accept, Accept-Language, Cookie, extras.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Accept".to_string(), DEFAULT_ACCEPT.to_string()),
            ("Accept-Language".to_string(), DEFAULT_ACCEPT_LANGUAGE.to_string()),
        ];
        if let Some(cookies) = &self.cookies {
            headers.push(("Cookie".to_string(), cookies.clone()));
        }
        headers.extend(self.headers.iter().cloned());
        headers
    }
}

/// Events emitted by a running engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Data started flowing to the output file.
    Started,
    /// Bytes written since the previous report and the current bitrate label.
    Progress { bytes: u64, bitrate: String },
    /// The run ended and its resources were released.
    Finished,
}

/// Sender side of the engine event channel.
///
/// `Started` is delivered at most once. `Finished` is delivered once, from
/// [`EngineEvents::finished`] or on drop.
#[derive(Debug)]
pub struct EngineEvents {
    tx: mpsc::Sender<EngineEvent>,
    started: bool,
    finished: bool,
}

impl EngineEvents {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            tx,
            started: false,
            finished: false,
        }
    }

    /// A connected sender and receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    pub async fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let _ = self.tx.send(EngineEvent::Started).await;
    }

    pub async fn progress(&mut self, bytes: u64, bitrate: impl Into<String>) {
        let _ = self
            .tx
            .send(EngineEvent::Progress {
                bytes,
                bitrate: bitrate.into(),
            })
            .await;
    }

    pub async fn finished(mut self) {
        self.finished = true;
        let _ = self.tx.send(EngineEvent::Finished).await;
    }
}

/// Best effort: a full channel drops this `Finished`, so receivers also treat
/// a closed channel as the end of the capture.
impl Drop for EngineEvents {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.try_send(EngineEvent::Finished);
        }
    }
}

/// Create a linked stop handle and engine control.
pub fn engine_control() -> (StopHandle, EngineControl) {
    let token = CancellationToken::new();
    let (exit_tx, exit_rx) = watch::channel(None);
    (
        StopHandle {
            token: token.clone(),
            exit: exit_rx,
        },
        EngineControl {
            token,
            exit: Arc::new(exit_tx),
        },
    )
}

/// External handle used to stop a running engine.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
    exit: watch::Receiver<Option<bool>>,
}

impl StopHandle {
    /// Request a graceful stop and wait for the engine to exit.
    ///
    /// Returns whether the transfer ended cleanly. If the engine already
    /// exited, its recorded status is returned and nothing is signalled.
    /// Returns `false` if the engine went away without reporting.
    pub async fn stop(&self) -> bool {
        if let Some(clean) = *self.exit.borrow() {
            return clean;
        }

        self.token.cancel();
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Recorded exit status, `None` while the engine runs.
    pub fn exit_status(&self) -> Option<bool> {
        *self.exit.borrow()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Engine side of [`engine_control`].
#[derive(Debug, Clone)]
pub struct EngineControl {
    token: CancellationToken,
    exit: Arc<watch::Sender<Option<bool>>>,
}

impl EngineControl {
    /// Resolves once a stop was requested.
    pub async fn stop_requested(&self) {
        self.token.cancelled().await
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record the exit status. Only the first report is kept.
    pub fn report_exit(&self, clean: bool) {
        self.exit.send_if_modified(|status| {
            if status.is_none() {
                *status = Some(clean);
                true
            } else {
                false
            }
        });
    }
}

/// Trait for capture engines.
///
/// Engines hold no per-run state; everything a run needs is in
/// [`EngineConfig`].
#[async_trait]
pub trait CaptureEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn supports_format(&self, format: VideoFormat) -> bool;

    /// Validate `config` before any side effect. Performs no I/O.
    fn init(&self, config: &EngineConfig) -> Result<()> {
        if config.url.trim().is_empty() {
            return Err(Error::validation("stream url is empty"));
        }
        if !self.supports_format(config.format) {
            return Err(Error::UnsupportedFormat {
                engine: self.kind(),
                format: config.format,
            });
        }
        Ok(())
    }

    /// Capture until the stream ends, a limit is hit or a stop is requested.
    ///
    /// Returns the completed artifact on a clean end, `Ok(None)` on abnormal
    /// termination, and `Err` only if the capture could not start.
    async fn run(
        &self,
        config: EngineConfig,
        events: EngineEvents,
        control: EngineControl,
    ) -> Result<Option<CaptureArtifact>>;
}

/// Available engines by kind.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<EngineKind, Arc<dyn CaptureEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the ffmpeg and native engines.
    pub fn with_defaults(ffmpeg_path: impl Into<String>) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(super::FfmpegEngine::new(ffmpeg_path)));
        registry.register(Arc::new(super::NativeEngine::new()?));
        Ok(registry)
    }

    /// Register `engine`, replacing any engine of the same kind.
    pub fn register(&mut self, engine: Arc<dyn CaptureEngine>) {
        self.engines.insert(engine.kind(), engine);
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn CaptureEngine>> {
        self.engines.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        self.engines.keys().copied().collect()
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_from_str() {
        assert_eq!("ffmpeg".parse::<EngineKind>().unwrap(), EngineKind::Ffmpeg);
        assert_eq!("NATIVE".parse::<EngineKind>().unwrap(), EngineKind::Native);
        assert!("streamlink".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_request_headers() {
        let artifact = CaptureArtifact::new("j", "s", "t", "/o.flv.part");
        let config = EngineConfig::new("http://x", VideoFormat::Flv, "/o.flv.part", artifact)
            .with_cookies(Some("a=b".to_string()));

        let headers = config.request_headers();
        assert_eq!(headers[0].0, "Accept");
        assert_eq!(headers[1].0, "Accept-Language");
        assert_eq!(headers[2], ("Cookie".to_string(), "a=b".to_string()));

        let no_cookie = config.with_cookies(Some("  ".to_string()));
        assert_eq!(no_cookie.request_headers().len(), 2);
    }

    #[tokio::test]
    async fn test_events_started_once_finished_on_drop() {
        let (mut events, mut rx) = EngineEvents::channel(8);
        events.started().await;
        events.started().await;
        events.progress(10, "1kbits/s").await;
        drop(events);

        assert_eq!(rx.recv().await, Some(EngineEvent::Started));
        assert_eq!(
            rx.recv().await,
            Some(EngineEvent::Progress {
                bytes: 10,
                bitrate: "1kbits/s".to_string()
            })
        );
        assert_eq!(rx.recv().await, Some(EngineEvent::Finished));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_events_finished_not_duplicated() {
        let (events, mut rx) = EngineEvents::channel(8);
        events.finished().await;

        assert_eq!(rx.recv().await, Some(EngineEvent::Finished));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_stop_waits_for_exit() {
        let (stop, control) = engine_control();

        let engine = tokio::spawn(async move {
            control.stop_requested().await;
            control.report_exit(true);
        });

        assert!(stop.stop().await);
        engine.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_after_exit_returns_recorded_status() {
        let (stop, control) = engine_control();
        control.report_exit(false);
        control.report_exit(true);

        assert!(!stop.stop().await);
        assert!(!stop.is_stop_requested());
        assert_eq!(stop.exit_status(), Some(false));
    }

    #[tokio::test]
    async fn test_stop_when_engine_vanished() {
        let (stop, control) = engine_control();
        drop(control);
        assert!(!stop.stop().await);
    }
}
