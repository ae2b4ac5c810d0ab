//! In-process HTTP capture engine.
//!
//! Copies the response body byte for byte, so only containers that need no
//! remuxing (flv, ts) are supported.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::traits::{
    CaptureEngine, DEFAULT_USER_AGENT, EngineConfig, EngineControl, EngineEvents, EngineKind,
};
use crate::domain::{CaptureArtifact, VideoFormat};
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Why a transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TransferEnd {
    StreamEnded,
    SizeLimit,
    DurationLimit,
    StopRequested,
    Failed(String),
}

impl TransferEnd {
    fn is_clean(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Capture engine copying an HTTP stream into a file.
#[derive(Debug, Clone)]
pub struct NativeEngine {
    client: reqwest::Client,
}

impl NativeEngine {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn headers(config: &EngineConfig) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        for (key, value) in config.request_headers() {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(streamer = %config.streamer_name, "Skipping invalid header {}", key),
            }
        }
        headers
    }
}

fn bitrate_label(total_bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return "0.0kbits/s".to_string();
    }
    format!("{:.1}kbits/s", total_bytes as f64 * 8.0 / 1000.0 / secs)
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl CaptureEngine for NativeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    fn supports_format(&self, format: VideoFormat) -> bool {
        !format.requires_remux()
    }

    async fn run(
        &self,
        config: EngineConfig,
        mut events: EngineEvents,
        control: EngineControl,
    ) -> Result<Option<CaptureArtifact>> {
        let streamer = config.streamer_name.clone();
        info!(
            streamer = %streamer,
            job_id = %config.job_id,
            "Starting native capture to {}",
            config.output_path.display()
        );

        let request = self.client.get(&config.url).headers(Self::headers(&config));
        let response = tokio::select! {
            _ = control.stop_requested() => {
                info!(streamer = %streamer, "Stop requested before the stream opened");
                control.report_exit(false);
                events.finished().await;
                return Ok(None);
            }
            response = request.send() => response,
        };

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                error!(streamer = %streamer, "Stream request failed with status {}", response.status());
                control.report_exit(false);
                events.finished().await;
                return Ok(None);
            }
            Err(e) => {
                error!(streamer = %streamer, "Stream request failed: {}", e);
                control.report_exit(false);
                events.finished().await;
                return Ok(None);
            }
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&config.output_path)
            .await
            .map_err(|e| Error::io_path("creating", &config.output_path, e))?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let mut stream = response.bytes_stream();
        let started_at = Instant::now();
        let deadline = config.max_duration.map(|d| started_at + d);
        let limit = config.max_size_bytes;
        let mut total: u64 = 0;
        let mut reported: u64 = 0;
        let mut last_report = started_at;

        let end = loop {
            tokio::select! {
                biased;
                _ = control.stop_requested() => break TransferEnd::StopRequested,
                _ = until(deadline) => break TransferEnd::DurationLimit,
                chunk = stream.next() => {
                    let chunk = match chunk {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(e)) => break TransferEnd::Failed(format!("read error: {e}")),
                        None => break TransferEnd::StreamEnded,
                    };
                    if chunk.is_empty() {
                        continue;
                    }

                    let take = if limit > 0 {
                        chunk.len().min(limit.saturating_sub(total) as usize)
                    } else {
                        chunk.len()
                    };
                    if let Err(e) = writer.write_all(&chunk[..take]).await {
                        break TransferEnd::Failed(format!("write error: {e}"));
                    }
                    total += take as u64;
                    events.started().await;

                    let now = Instant::now();
                    if now.duration_since(last_report) >= PROGRESS_INTERVAL {
                        events
                            .progress(total - reported, bitrate_label(total, now - started_at))
                            .await;
                        reported = total;
                        last_report = now;
                    }

                    if limit > 0 && total >= limit {
                        break TransferEnd::SizeLimit;
                    }
                }
            }
        };

        let flushed = async {
            writer.flush().await?;
            writer.get_mut().sync_all().await
        }
        .await;
        let end = match (end, flushed) {
            (end, Ok(())) => end,
            (TransferEnd::Failed(reason), Err(_)) => TransferEnd::Failed(reason),
            (_, Err(e)) => TransferEnd::Failed(format!("flush error: {e}")),
        };
        drop(writer);
        drop(stream);

        if total > reported {
            events
                .progress(total - reported, bitrate_label(total, started_at.elapsed()))
                .await;
        }

        let clean = end.is_clean();
        match &end {
            TransferEnd::Failed(reason) => {
                error!(streamer = %streamer, "Native capture failed after {} bytes: {}", total, reason)
            }
            other => info!(streamer = %streamer, "Native capture ended ({:?}), {} bytes", other, total),
        }
        debug!(streamer = %streamer, "Native capture elapsed {:?}", started_at.elapsed());

        control.report_exit(clean);
        events.finished().await;

        if clean {
            Ok(Some(config.artifact.completed(
                config.start_time.timestamp(),
                Utc::now().timestamp(),
                config.output_path.clone(),
            )))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineEvent, engine_control};
    use std::path::Path;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn config(url: &str, output: &Path) -> EngineConfig {
        let artifact = CaptureArtifact::new("job", "alice", "title", output);
        EngineConfig::new(url, VideoFormat::Flv, output, artifact)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = vec![0u8; 8192];
        let mut request = Vec::new();
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8_lossy(&request).to_string()
    }

    /// One-shot HTTP server answering with `head` and then `chunks`.
    async fn serve(
        head: &'static str,
        chunks: Vec<Vec<u8>>,
        hold_open: bool,
    ) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/live.flv", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let _ = tx.send(request);
            socket.write_all(head.as_bytes()).await.unwrap();
            for chunk in chunks {
                if socket.write_all(&chunk).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            if hold_open {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });

        (url, rx)
    }

    #[test]
    fn test_remux_formats_rejected() {
        let engine = NativeEngine::new().unwrap();
        assert!(engine.supports_format(VideoFormat::Flv));
        assert!(engine.supports_format(VideoFormat::Ts));
        assert!(!engine.supports_format(VideoFormat::Mp4));

        let mut cfg = config("http://x", Path::new("/o.mp4.part"));
        cfg.format = VideoFormat::Mp4;
        assert!(matches!(
            engine.init(&cfg),
            Err(Error::UnsupportedFormat {
                engine: EngineKind::Native,
                format: VideoFormat::Mp4
            })
        ));
    }

    #[test]
    fn test_bitrate_label() {
        assert_eq!(bitrate_label(125_000, Duration::from_secs(1)), "1000.0kbits/s");
        assert_eq!(bitrate_label(10, Duration::ZERO), "0.0kbits/s");
    }

    #[tokio::test]
    async fn test_stream_end_is_clean() {
        let body = vec![7u8; 3000];
        let (url, request) = serve(
            "HTTP/1.1 200 OK\r\nContent-Length: 3000\r\nConnection: close\r\n\r\n",
            vec![body[..1000].to_vec(), body[1000..].to_vec()],
            false,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("a.flv.part");
        let (events, mut rx) = EngineEvents::channel(64);
        let (_stop, control) = engine_control();

        let cfg = config(&url, &output).with_cookies(Some("sid=42".to_string()));
        let artifact = NativeEngine::new()
            .unwrap()
            .run(cfg, events, control)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(artifact.media_path, output);
        assert_eq!(std::fs::read(&output).unwrap(), body);

        let request = request.await.unwrap().to_lowercase();
        assert!(request.contains("cookie: sid=42"));
        assert!(request.contains("user-agent: mozilla/5.0"));
        assert!(request.contains("accept-language: zh-cn"));

        let mut bytes = 0;
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if let EngineEvent::Progress { bytes: b, .. } = &event {
                bytes += b;
            }
            seen.push(event);
        }
        assert_eq!(seen.first(), Some(&EngineEvent::Started));
        assert_eq!(seen.last(), Some(&EngineEvent::Finished));
        assert_eq!(bytes, 3000);
    }

    #[tokio::test]
    async fn test_size_limit_truncates() {
        let (url, _request) = serve(
            "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n",
            vec![vec![1u8; 3000], vec![2u8; 3000]],
            true,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("a.flv.part");
        let (events, _rx) = EngineEvents::channel(64);
        let (_stop, control) = engine_control();

        let result = NativeEngine::new()
            .unwrap()
            .run(config(&url, &output).with_max_size(4096), events, control)
            .await
            .unwrap();

        assert!(result.is_some());
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_http_error_is_failure() {
        let (url, _request) = serve(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            Vec::new(),
            false,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("a.flv.part");
        let (events, mut rx) = EngineEvents::channel(64);
        let (stop, control) = engine_control();

        let result = NativeEngine::new()
            .unwrap()
            .run(config(&url, &output), events, control)
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(!output.exists());
        assert!(!stop.stop().await);
        assert_eq!(rx.recv().await, Some(EngineEvent::Finished));
    }

    #[tokio::test]
    async fn test_stop_request_is_clean() {
        let (url, _request) = serve(
            "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n",
            vec![vec![0u8; 512]],
            true,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("a.ts.part");
        let (events, mut rx) = EngineEvents::channel(64);
        let (stop, control) = engine_control();

        let engine = NativeEngine::new().unwrap();
        let cfg = config(&url, &output);
        let run = tokio::spawn(async move { engine.run(cfg, events, control).await });

        assert_eq!(rx.recv().await, Some(EngineEvent::Started));
        assert!(stop.stop().await);

        let artifact = run.await.unwrap().unwrap().unwrap();
        assert_eq!(artifact.media_path, output);
        let written = std::fs::metadata(&output).unwrap().len();
        assert!(written > 0 && written <= 512);
    }

    #[tokio::test]
    async fn test_existing_file_is_never_overwritten() {
        let (url, _request) = serve(
            "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\n",
            vec![b"abcd".to_vec()],
            false,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("a.flv.part");
        std::fs::write(&output, b"keep").unwrap();
        let (events, _rx) = EngineEvents::channel(64);
        let (_stop, control) = engine_control();

        let result = NativeEngine::new()
            .unwrap()
            .run(config(&url, &output), events, control)
            .await;

        assert!(matches!(result, Err(Error::IoPath { .. })));
        assert_eq!(std::fs::read(&output).unwrap(), b"keep");
    }
}
