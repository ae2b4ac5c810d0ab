//! [`DanmuCapture`] implementation driving a [`DanmuProvider`].
//!
//! Messages are buffered and written in timestamp order, either every
//! [`BUFFER_FLUSH_INTERVAL_MS`] or once [`MAX_BUFFER_SIZE`] messages pile up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::capture::{DanmuCapture, FetchOutcome, ShutdownSignal};
use super::provider::{DanmuConnection, DanmuItem, DanmuMessage, DanmuProvider};
use super::writer::{XmlDanmuWriter, offset_secs};
use crate::domain::StreamJob;
use crate::utils::fs::ensure_parent_dir;
use crate::{Error, Result};

/// Buffer flush interval in milliseconds.
pub const BUFFER_FLUSH_INTERVAL_MS: u64 = 500;

/// Maximum buffered messages before a forced flush.
pub const MAX_BUFFER_SIZE: usize = 100;

/// Poll delay when the provider has nothing to deliver.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct RecorderState {
    initialized: bool,
    finished: bool,
    streamer: String,
    job_id: String,
    file_path: Option<PathBuf>,
    video_start: Option<DateTime<Utc>>,
    connection: Option<DanmuConnection>,
}

pub struct DanmuRecorder {
    provider: Arc<dyn DanmuProvider>,
    state: Mutex<RecorderState>,
    flush_interval: Duration,
}

impl DanmuRecorder {
    pub fn new(provider: Arc<dyn DanmuProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(RecorderState::default()),
            flush_interval: Duration::from_millis(BUFFER_FLUSH_INTERVAL_MS),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn platform(&self) -> &str {
        self.provider.platform()
    }

    fn accepts_messages(&self) -> bool {
        let state = self.state.lock();
        !state.finished && state.video_start.is_some()
    }

    async fn flush_buffer(
        &self,
        writer: &mut XmlDanmuWriter,
        buffer: &mut Vec<DanmuMessage>,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let video_start = self.state.lock().video_start;
        let Some(video_start) = video_start else {
            buffer.clear();
            return Ok(());
        };

        buffer.sort_by_key(|msg| msg.timestamp);
        for msg in buffer.drain(..) {
            writer
                .write_message(&msg, offset_secs(msg.timestamp, video_start))
                .await?;
        }
        writer.flush().await
    }

    async fn record(
        &self,
        path: &Path,
        connection: &DanmuConnection,
        shutdown: &mut ShutdownSignal,
    ) -> Result<FetchOutcome> {
        ensure_parent_dir(path).await?;
        let streamer = self.state.lock().streamer.clone();
        let comments = [
            format!("Platform: {}", self.provider.platform()),
            format!("Room ID: {}", connection.room_id),
            format!("Streamer: {}", streamer),
            format!("Recorded at: {}", Utc::now().to_rfc3339()),
        ];
        let mut writer = XmlDanmuWriter::new(path, &comments).await?;

        let mut buffer: Vec<DanmuMessage> = Vec::with_capacity(MAX_BUFFER_SIZE);
        let mut flush_interval = tokio::time::interval(self.flush_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;

                reason = shutdown.cancelled() => {
                    debug!(?reason, "Danmu shutdown requested");
                    break Ok(FetchOutcome::Cancelled(reason));
                }

                _ = flush_interval.tick() => {
                    if let Err(e) = self.flush_buffer(&mut writer, &mut buffer).await {
                        break Err(e);
                    }
                }

                received = self.provider.receive(connection) => {
                    match received {
                        Ok(Some(DanmuItem::Message(msg))) => {
                            if !self.accepts_messages() {
                                continue;
                            }
                            buffer.push(msg);
                            if buffer.len() >= MAX_BUFFER_SIZE
                                && let Err(e) = self.flush_buffer(&mut writer, &mut buffer).await
                            {
                                break Err(e);
                            }
                        }
                        Ok(Some(DanmuItem::StreamClosed)) => {
                            info!(room_id = %connection.room_id, "Danmu stream closed by remote");
                            break Ok(FetchOutcome::StreamClosed);
                        }
                        Ok(None) => tokio::time::sleep(IDLE_POLL_DELAY).await,
                        Err(e) => {
                            warn!(room_id = %connection.room_id, error = %e, "Danmu receive failed");
                            break Err(e);
                        }
                    }
                }
            }
        };

        let flushed = self.flush_buffer(&mut writer, &mut buffer).await;
        let finalized = writer.finalize().await;
        let outcome = outcome?;
        flushed?;
        finalized?;

        debug!(
            path = %path.display(),
            messages = writer.message_count(),
            "Danmu file finalized"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl DanmuCapture for DanmuRecorder {
    async fn init(&self, job: &StreamJob, start_time: DateTime<Utc>) -> Result<bool> {
        *self.state.lock() = RecorderState {
            streamer: job.streamer_name.clone(),
            job_id: job.id.clone(),
            ..Default::default()
        };

        let Some(room_id) = self.provider.extract_room_id(&job.streamer_url) else {
            warn!(
                streamer = %job.streamer_name,
                url = %job.streamer_url,
                platform = self.provider.platform(),
                "No danmu room id in streamer URL"
            );
            return Ok(false);
        };

        let connection = self.provider.connect(&room_id).await?;

        let mut state = self.state.lock();
        state.connection = Some(connection);
        state.initialized = true;
        info!(
            streamer = %job.streamer_name,
            job_id = %job.id,
            room_id = %room_id,
            start_time = %start_time,
            "Danmu connected"
        );
        Ok(true)
    }

    async fn fetch(&self, mut shutdown: ShutdownSignal) -> Result<FetchOutcome> {
        let (path, connection) = {
            let mut state = self.state.lock();
            (state.file_path.clone(), state.connection.take())
        };
        let mut connection =
            connection.ok_or_else(|| Error::danmu("danmu recorder is not connected"))?;
        let Some(path) = path else {
            let _ = self.provider.disconnect(&mut connection).await;
            return Err(Error::danmu("danmu file path is not set"));
        };

        let result = self.record(&path, &connection, &mut shutdown).await;

        if let Err(e) = self.provider.disconnect(&mut connection).await {
            let job_id = self.state.lock().job_id.clone();
            debug!(job_id = %job_id, error = %e, "Danmu disconnect failed");
        }
        result
    }

    async fn finish(&self) {
        self.state.lock().finished = true;
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    fn set_file_path(&self, path: PathBuf) {
        self.state.lock().file_path = Some(path);
    }

    fn file_path(&self) -> Option<PathBuf> {
        self.state.lock().file_path.clone()
    }

    fn on_capture_started(&self, at: DateTime<Utc>) {
        self.state.lock().video_start = Some(at);
    }
}
