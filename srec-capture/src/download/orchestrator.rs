//! The download orchestrator.
//!
//! A [`Download`] runs one capture job at a time: it resolves the job's
//! configuration and output paths, runs the engine next to the optional danmu
//! side channel, and decides whether the produced file is kept.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::progress::{CaptureObserver, CaptureProgress};
use crate::config::{GlobalConfig, ResolvedDownloadConfig};
use crate::danmu::{
    CancelReason, DanmuCapture, FetchOutcome, ShutdownSignal, ShutdownTrigger, shutdown_channel,
};
use crate::domain::{CaptureArtifact, StreamJob};
use crate::engine::{
    EngineConfig, EngineEvent, EngineEvents, EngineRegistry, StopHandle, engine_control,
};
use crate::output::{DiskSpaceProbe, OutputDescriptor, OutputPathResolver, strip_part_suffix};
use crate::retry::{RetryPolicy, run_with_retry};
use crate::utils::fs::{file_size, remove_file_if_exists, rename};
use crate::{Error, Result};

/// How long the danmu task may take to wind down after the engine finished.
pub const DANMU_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct Download {
    global: Arc<GlobalConfig>,
    engines: Arc<EngineRegistry>,
    danmu: Option<Arc<dyn DanmuCapture>>,
    resolver: OutputPathResolver,
    observers: Vec<Arc<dyn CaptureObserver>>,
    danmu_retry: RetryPolicy,
    danmu_join_timeout: Duration,
    active: Mutex<Option<ActiveJob>>,
}

/// The job currently holding a [`Download`].
struct ActiveJob {
    job_id: String,
    stop: Option<StopHandle>,
}

impl Download {
    pub fn new(
        global: GlobalConfig,
        engines: EngineRegistry,
        danmu: Option<Arc<dyn DanmuCapture>>,
        disk_probe: Arc<dyn DiskSpaceProbe>,
    ) -> Self {
        Self {
            global: Arc::new(global),
            engines: Arc::new(engines),
            danmu,
            resolver: OutputPathResolver::new(disk_probe),
            observers: Vec::new(),
            danmu_retry: RetryPolicy::danmu_init(),
            danmu_join_timeout: DANMU_JOIN_TIMEOUT,
            active: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CaptureObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Replace the retry policy of the danmu `init` call.
    pub fn with_danmu_retry(mut self, policy: RetryPolicy) -> Self {
        self.danmu_retry = policy;
        self
    }

    pub fn with_danmu_join_timeout(mut self, timeout: Duration) -> Self {
        self.danmu_join_timeout = timeout;
        self
    }

    pub fn global_config(&self) -> &GlobalConfig {
        &self.global
    }

    /// Whether an engine run is in progress.
    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|active| active.stop.is_some())
    }

    /// Ask the running engine to stop gracefully.
    ///
    /// Returns the engine's exit status, or `false` when nothing is running.
    pub async fn stop(&self) -> bool {
        let handle = self
            .active
            .lock()
            .as_ref()
            .and_then(|active| active.stop.clone());
        match handle {
            Some(handle) => handle.stop().await,
            None => false,
        }
    }

    /// Run `job` to completion.
    ///
    /// `Err` means the job could not start (another job is running, bad input,
    /// unsupported engine or format, path collision, low disk space).
    /// `Ok(None)` means the capture failed and its outputs were removed.
    ///
    /// Dropping the returned future aborts the capture and deletes its
    /// partial outputs.
    pub async fn download(&self, job: &StreamJob) -> Result<Option<CaptureArtifact>> {
        let mut slot = JobSlot::claim(&self.active, job)?;
        let config = self.resolve_config(job)?;
        let start_local = Local::now();
        let start_time = start_local.with_timezone(&Utc);

        let engine = self.engines.get(config.engine).ok_or_else(|| {
            Error::config(format!("engine not supported: {}", config.engine))
        })?;

        let template =
            CaptureArtifact::new(&job.id, &job.streamer_name, job.title(), PathBuf::new());
        let mut engine_config = EngineConfig::new(
            &job.download_url,
            config.output_file_format,
            PathBuf::new(),
            template,
        )
        .with_cookies(config.cookies.clone())
        .with_start_time(start_time)
        .with_max_size(config.max_part_size)
        .with_max_duration(config.max_part_duration.map(Duration::from_secs));

        if let Err(e) = engine.init(&engine_config) {
            error!(
                streamer = %job.streamer_name,
                job_id = %job.id,
                engine = %config.engine,
                error = %e,
                "Engine rejected the job"
            );
            return Err(e);
        }

        let output = match self.resolver.resolve(job, &config, start_local).await {
            Ok(output) => output,
            Err(e) => {
                error!(
                    streamer = %job.streamer_name,
                    job_id = %job.id,
                    error = %e,
                    "Failed to prepare output"
                );
                return Err(e);
            }
        };

        let danmu = self.danmu_for(job, &config);
        let danmu_enabled = danmu.is_some();
        slot.guard_outputs(&output, danmu_enabled);
        engine_config.output_path = output.media_path.clone();
        engine_config.artifact.media_path = output.media_path.clone();
        engine_config.artifact.danmu_path = danmu.as_ref().map(|_| output.danmu_path.clone());

        info!(
            streamer = %job.streamer_name,
            job_id = %job.id,
            engine = %config.engine,
            format = %config.output_file_format,
            danmu = danmu.is_some(),
            "Starting download: {}",
            output.media_path.display()
        );

        let (shutdown, signal) = shutdown_channel();
        let danmu_task = danmu.as_ref().map(|danmu| {
            AbortOnDropHandle::new(tokio::spawn(run_danmu(
                danmu.clone(),
                job.clone(),
                start_time,
                output.danmu_path.clone(),
                self.danmu_retry.clone(),
                signal,
            )))
        });

        let (stop_handle, control) = engine_control();
        slot.set_stop(Some(stop_handle));

        let (events, rx) = EngineEvents::channel(EVENT_CHANNEL_CAPACITY);
        let event_task = AbortOnDropHandle::new(tokio::spawn(forward_events(
            rx,
            job.clone(),
            danmu.clone(),
            self.observers.clone(),
        )));

        let engine_task = AbortOnDropHandle::new(tokio::spawn({
            let control = control.clone();
            async move { engine.run(engine_config, events, control).await }
        }));

        let produced = match engine_task.await {
            Ok(Ok(Some(artifact))) => Some(artifact),
            Ok(Ok(None)) => {
                warn!(
                    streamer = %job.streamer_name,
                    job_id = %job.id,
                    "Engine finished without an artifact"
                );
                None
            }
            Ok(Err(e)) => {
                error!(streamer = %job.streamer_name, job_id = %job.id, error = %e, "Engine failed");
                None
            }
            Err(e) => {
                error!(streamer = %job.streamer_name, job_id = %job.id, error = %e, "Engine task panicked");
                None
            }
        };
        control.report_exit(produced.is_some());
        slot.set_stop(None);

        if let Err(e) = event_task.await {
            debug!(job_id = %job.id, error = %e, "Event task ended abnormally");
        }

        let danmu_kept = match (danmu, danmu_task) {
            (Some(danmu), Some(task)) => {
                self.stop_danmu(job, danmu.as_ref(), &shutdown, task, &output.danmu_path)
                    .await
            }
            _ => false,
        };
        slot.release_outputs();

        let Some(mut artifact) = produced else {
            self.discard_outputs(job, &output, danmu_enabled).await;
            return Ok(None);
        };
        if !danmu_kept {
            artifact.danmu_path = None;
        }

        if config.min_part_size > 0 {
            match file_size(&artifact.media_path).await {
                Ok(size) if size >= config.min_part_size => {}
                Ok(size) => {
                    warn!(
                        streamer = %job.streamer_name,
                        job_id = %job.id,
                        size,
                        min_size = config.min_part_size,
                        "Output below minimum size, discarding"
                    );
                    self.discard_outputs(job, &output, danmu_enabled).await;
                    return Ok(None);
                }
                Err(e) => {
                    error!(streamer = %job.streamer_name, job_id = %job.id, error = %e, "Cannot stat output");
                    self.discard_outputs(job, &output, danmu_enabled).await;
                    return Ok(None);
                }
            }
        }

        let final_path = strip_part_suffix(&artifact.media_path);
        if let Err(e) = rename(&artifact.media_path, &final_path).await {
            error!(
                streamer = %job.streamer_name,
                job_id = %job.id,
                error = %e,
                "Failed to finalize output, leaving it in place"
            );
            return Err(e);
        }
        artifact.media_path = final_path;

        info!(
            streamer = %job.streamer_name,
            job_id = %job.id,
            duration_secs = artifact.duration_secs(),
            "Download finished: {}",
            artifact.media_path.display()
        );
        Ok(Some(artifact))
    }

    fn resolve_config(&self, job: &StreamJob) -> Result<ResolvedDownloadConfig> {
        if job.download_url.trim().is_empty() {
            error!(streamer = %job.streamer_name, job_id = %job.id, "Download url is empty");
            return Err(Error::validation("download url is empty"));
        }
        let Some(overrides) = job.config.as_ref() else {
            error!(streamer = %job.streamer_name, job_id = %job.id, "Download config is missing");
            return Err(Error::validation("download config is missing"));
        };
        Ok(ResolvedDownloadConfig::resolve(&self.global, overrides, job.platform))
    }

    fn danmu_for(
        &self,
        job: &StreamJob,
        config: &ResolvedDownloadConfig,
    ) -> Option<Arc<dyn DanmuCapture>> {
        if !config.danmu {
            return None;
        }
        if self.danmu.is_none() {
            warn!(
                streamer = %job.streamer_name,
                job_id = %job.id,
                "Danmu enabled but no danmu capture is configured"
            );
        }
        self.danmu.clone()
    }

    /// Wind down the danmu task. Returns whether its file is kept.
    async fn stop_danmu(
        &self,
        job: &StreamJob,
        danmu: &dyn DanmuCapture,
        shutdown: &ShutdownTrigger,
        task: AbortOnDropHandle<()>,
        danmu_path: &Path,
    ) -> bool {
        danmu.finish().await;
        shutdown.trigger(CancelReason::DownloadFinished);

        let joined = match tokio::time::timeout(self.danmu_join_timeout, task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(streamer = %job.streamer_name, job_id = %job.id, error = %e, "Danmu task panicked");
                false
            }
            Err(_) => {
                error!(
                    streamer = %job.streamer_name,
                    job_id = %job.id,
                    timeout_secs = self.danmu_join_timeout.as_secs(),
                    "Danmu task did not stop in time"
                );
                false
            }
        };

        if joined && danmu.is_initialized() {
            return true;
        }
        if !joined {
            remove_quietly(job, danmu_path).await;
        }
        debug!(streamer = %job.streamer_name, job_id = %job.id, "No danmu file for this job");
        false
    }

    async fn discard_outputs(&self, job: &StreamJob, output: &OutputDescriptor, danmu: bool) {
        remove_quietly(job, &output.media_path).await;
        if danmu {
            remove_quietly(job, &output.danmu_path).await;
        }
    }
}

/// Holds the single job slot of a [`Download`] until dropped.
///
/// While outputs are guarded, dropping the slot also deletes them.
struct JobSlot<'a> {
    active: &'a Mutex<Option<ActiveJob>>,
    job_id: String,
    outputs: Vec<PathBuf>,
}

impl<'a> JobSlot<'a> {
    fn claim(active: &'a Mutex<Option<ActiveJob>>, job: &StreamJob) -> Result<Self> {
        let mut current = active.lock();
        if let Some(running) = current.as_ref() {
            warn!(
                streamer = %job.streamer_name,
                job_id = %job.id,
                running = %running.job_id,
                "Download is busy with another job"
            );
            return Err(Error::validation(format!(
                "a job is already running: {}",
                running.job_id
            )));
        }
        *current = Some(ActiveJob {
            job_id: job.id.clone(),
            stop: None,
        });
        Ok(Self {
            active,
            job_id: job.id.clone(),
            outputs: Vec::new(),
        })
    }

    fn set_stop(&self, stop: Option<StopHandle>) {
        if let Some(active) = self.active.lock().as_mut() {
            active.stop = stop;
        }
    }

    fn guard_outputs(&mut self, output: &OutputDescriptor, danmu: bool) {
        self.outputs.push(output.media_path.clone());
        if danmu {
            self.outputs.push(output.danmu_path.clone());
        }
    }

    fn release_outputs(&mut self) {
        self.outputs.clear();
    }
}

impl Drop for JobSlot<'_> {
    fn drop(&mut self) {
        self.active.lock().take();
        if self.outputs.is_empty() {
            return;
        }
        warn!(job_id = %self.job_id, "Download dropped mid-capture, removing partial outputs");
        for path in &self.outputs {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(job_id = %self.job_id, "Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(job_id = %self.job_id, error = %e, "Cleanup of {} failed", path.display()),
            }
        }
    }
}

async fn remove_quietly(job: &StreamJob, path: &Path) {
    match remove_file_if_exists(path).await {
        Ok(true) => debug!(job_id = %job.id, "Removed {}", path.display()),
        Ok(false) => {}
        Err(e) => warn!(streamer = %job.streamer_name, job_id = %job.id, error = %e, "Cleanup failed"),
    }
}

/// Bring up the danmu side channel and record until shut down.
async fn run_danmu(
    danmu: Arc<dyn DanmuCapture>,
    job: StreamJob,
    start_time: DateTime<Utc>,
    path: PathBuf,
    retry: RetryPolicy,
    mut signal: ShutdownSignal,
) {
    let init = tokio::select! {
        biased;

        reason = signal.cancelled() => {
            debug!(job_id = %job.id, ?reason, "Danmu init interrupted");
            return;
        }

        result = run_with_retry(
            &retry,
            |e, attempt| {
                warn!(
                    streamer = %job.streamer_name,
                    job_id = %job.id,
                    attempt = attempt + 1,
                    max_attempts = retry.max_attempts,
                    error = %e,
                    "Danmu init failed"
                )
            },
            || danmu.init(&job, start_time),
        ) => result,
    };

    match init {
        Ok(true) => {}
        Ok(false) => {
            warn!(streamer = %job.streamer_name, job_id = %job.id, "Danmu not available for this stream");
            return;
        }
        Err(e) => {
            error!(
                streamer = %job.streamer_name,
                job_id = %job.id,
                error = %e,
                "Danmu init failed, continuing without danmu"
            );
            return;
        }
    }

    danmu.set_file_path(path);

    match danmu.fetch(signal).await {
        Ok(FetchOutcome::Cancelled(CancelReason::DownloadFinished)) => {
            debug!(job_id = %job.id, "Danmu stopped after download finished")
        }
        Ok(FetchOutcome::Cancelled(CancelReason::Aborted)) => {
            warn!(streamer = %job.streamer_name, job_id = %job.id, "Danmu capture aborted")
        }
        Ok(FetchOutcome::StreamClosed) => {
            info!(streamer = %job.streamer_name, job_id = %job.id, "Danmu stream closed")
        }
        Err(e) => {
            error!(streamer = %job.streamer_name, job_id = %job.id, error = %e, "Danmu capture failed")
        }
    }
}

/// Deliver engine events to the danmu side channel and observers, in order.
async fn forward_events(
    mut rx: mpsc::Receiver<EngineEvent>,
    job: StreamJob,
    danmu: Option<Arc<dyn DanmuCapture>>,
    observers: Vec<Arc<dyn CaptureObserver>>,
) {
    let mut progress = CaptureProgress {
        total_bytes: 0,
        bitrate: String::new(),
    };

    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::Started => {
                if let Some(danmu) = &danmu {
                    danmu.on_capture_started(Utc::now());
                }
                for observer in &observers {
                    observer.on_started(&job);
                }
            }
            EngineEvent::Progress { bytes, bitrate } => {
                progress.total_bytes += bytes;
                progress.bitrate = bitrate;
                for observer in &observers {
                    observer.on_progress(&job, &progress);
                }
            }
            EngineEvent::Finished => break,
        }
    }

    // Reached on `Finished` and also when the engine's events were dropped
    // without one getting through.
    for observer in &observers {
        observer.on_finished(&job, &progress);
    }
}
