//! FFmpeg capture engine.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use process_utils::{WaitOutcome, send_command, tokio_command, wait_or_kill};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::traits::{
    CaptureEngine, DEFAULT_USER_AGENT, EngineConfig, EngineControl, EngineEvents, EngineKind,
};
use super::utils::{OutputRecordReader, is_ready_banner, parse_progress};
use crate::domain::{CaptureArtifact, VideoFormat};
use crate::{Error, Result};

/// How long ffmpeg gets to finalize the output after `q`.
const FFMPEG_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Minimum interval between two progress events.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
/// How long to wait for buffered output after the process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Capture engine driving an external ffmpeg process.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    binary_path: String,
}

impl FfmpegEngine {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    pub fn binary_path(&self) -> &str {
        &self.binary_path
    }

    /// First line of `ffmpeg -version`, `None` if the binary cannot run.
    pub fn version(&self) -> Option<String> {
        process_utils::probe_version(&self.binary_path)
    }

    pub fn is_available(&self) -> bool {
        self.version().is_some()
    }

    /// Build ffmpeg command arguments.
    ///
    /// stdin stays open as the control channel, so `-nostdin` is never passed.
    pub fn build_args(config: &EngineConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-n".into()];

        args.extend(["-user_agent".to_string(), DEFAULT_USER_AGENT.to_string()]);

        let header_block: String = config
            .request_headers()
            .iter()
            .map(|(key, value)| format!("{key}: {value}\r\n"))
            .collect();
        args.extend(["-headers".to_string(), header_block]);

        args.extend(["-i".to_string(), config.url.clone()]);
        args.extend(["-c".to_string(), "copy".to_string()]);

        if config.max_size_bytes > 0 {
            args.extend(["-fs".to_string(), config.max_size_bytes.to_string()]);
        }
        if let Some(duration) = config.max_duration {
            args.extend(["-t".to_string(), duration.as_secs().to_string()]);
        }

        args.extend(["-f".to_string(), config.format.ffmpeg_muxer().to_string()]);
        if config.format == VideoFormat::Mp4 {
            args.extend([
                "-movflags".to_string(),
                "+frag_keyframe+empty_moov".to_string(),
            ]);
        }

        args.push(config.output_path.to_string_lossy().to_string());
        args
    }
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

/// Turns status lines into engine events.
struct StatusTracker {
    last_total: u64,
    last_report: Option<Instant>,
}

impl StatusTracker {
    fn new() -> Self {
        Self {
            last_total: 0,
            last_report: None,
        }
    }

    async fn observe(&mut self, line: &str, events: &mut EngineEvents, streamer: &str) {
        if is_ready_banner(line) {
            events.started().await;
            return;
        }

        let Some(progress) = parse_progress(line) else {
            if line.contains("Error") || line.contains("error") {
                warn!(streamer = %streamer, "ffmpeg: {}", line);
            } else {
                debug!(streamer = %streamer, "ffmpeg: {}", line);
            }
            return;
        };

        events.started().await;

        let now = Instant::now();
        let due = self
            .last_report
            .is_none_or(|last| now.duration_since(last) >= PROGRESS_INTERVAL);
        if due {
            let delta = progress.total_bytes.saturating_sub(self.last_total);
            self.last_total = self.last_total.max(progress.total_bytes);
            self.last_report = Some(now);
            events.progress(delta, progress.bitrate).await;
        }
    }
}

fn spawn_reader<R>(stream: R, tx: mpsc::UnboundedSender<String>) -> AbortOnDropHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    AbortOnDropHandle::new(tokio::spawn(async move {
        let mut reader = OutputRecordReader::new(stream);
        loop {
            match reader.next_record().await {
                Ok(Some(record)) => {
                    if tx.send(record).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Error reading ffmpeg output: {}", e);
                    break;
                }
            }
        }
    }))
}

#[async_trait]
impl CaptureEngine for FfmpegEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Ffmpeg
    }

    fn supports_format(&self, _format: VideoFormat) -> bool {
        true
    }

    async fn run(
        &self,
        config: EngineConfig,
        mut events: EngineEvents,
        control: EngineControl,
    ) -> Result<Option<CaptureArtifact>> {
        let args = Self::build_args(&config);
        let streamer = config.streamer_name.clone();

        info!(
            streamer = %streamer,
            job_id = %config.job_id,
            "Starting ffmpeg capture to {}",
            config.output_path.display()
        );
        debug!(streamer = %streamer, "ffmpeg args: {:?}", args);

        let mut command = tokio_command(&self.binary_path);
        command
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| Error::engine(format!("Failed to spawn ffmpeg: {e}")))?;

        let mut stdin = child.stdin.take();
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, line_tx));
        }

        let mut tracker = StatusTracker::new();
        let mut lines_open = true;

        let clean = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => {
                            if status.success() {
                                info!(streamer = %streamer, "ffmpeg exited normally");
                            } else {
                                warn!(streamer = %streamer, "ffmpeg exited with status: {}", status);
                            }
                            status.success()
                        }
                        Err(e) => {
                            error!(streamer = %streamer, "Error waiting for ffmpeg: {}", e);
                            false
                        }
                    };
                }
                _ = control.stop_requested() => {
                    info!(streamer = %streamer, "Stopping ffmpeg capture");
                    match stdin.as_mut() {
                        Some(pipe) => {
                            if let Err(e) = send_command(pipe, b"q\n").await {
                                warn!(streamer = %streamer, "Failed to send stop command to ffmpeg: {}", e);
                            }
                        }
                        None => warn!(streamer = %streamer, "ffmpeg stdin is not available"),
                    }
                    break match wait_or_kill(&mut child, FFMPEG_STOP_TIMEOUT).await {
                        Ok(outcome @ WaitOutcome::Exited(_)) => {
                            debug!(streamer = %streamer, "ffmpeg stopped: {}", outcome.status());
                            outcome.is_clean()
                        }
                        Ok(WaitOutcome::Killed(_)) => {
                            warn!(streamer = %streamer, "ffmpeg did not exit in time; killed");
                            false
                        }
                        Err(e) => {
                            error!(streamer = %streamer, "Error stopping ffmpeg: {}", e);
                            false
                        }
                    };
                }
                line = line_rx.recv(), if lines_open => {
                    match line {
                        Some(line) => tracker.observe(&line, &mut events, &streamer).await,
                        None => lines_open = false,
                    }
                }
            }
        };

        // Output still buffered in the pipes when the process exited.
        while let Ok(Some(line)) = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, line_rx.recv()).await
        {
            tracker.observe(&line, &mut events, &streamer).await;
        }

        drop(stdin);
        drop(child);
        drop(readers);
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
    use std::path::{Path, PathBuf};

    fn config(format: VideoFormat, output: &Path) -> EngineConfig {
        let artifact = CaptureArtifact::new("job", "alice", "title", output);
        EngineConfig::new("https://cdn.example/live.flv", format, output, artifact)
    }

    fn position(args: &[String], flag: &str) -> usize {
        args.iter().position(|a| a == flag).unwrap()
    }

    #[test]
    fn test_build_args_order() {
        let cfg = config(VideoFormat::Flv, Path::new("/out/a.flv.part"))
            .with_cookies(Some("sid=1".to_string()))
            .with_max_size(2048)
            .with_max_duration(Some(Duration::from_secs(3600)));
        let args = FfmpegEngine::build_args(&cfg);

        assert_eq!(&args[..2], &["-hide_banner", "-n"]);
        assert_eq!(args[3], DEFAULT_USER_AGENT);
        assert_eq!(
            args[position(&args, "-headers") + 1],
            format!(
                "Accept: {}\r\nAccept-Language: {}\r\nCookie: sid=1\r\n",
                super::super::traits::DEFAULT_ACCEPT,
                super::super::traits::DEFAULT_ACCEPT_LANGUAGE
            )
        );
        assert_eq!(args[position(&args, "-i") + 1], "https://cdn.example/live.flv");
        assert_eq!(args[position(&args, "-fs") + 1], "2048");
        assert_eq!(args[position(&args, "-t") + 1], "3600");
        assert_eq!(args[position(&args, "-f") + 1], "flv");
        assert!(position(&args, "-i") < position(&args, "-c"));
        assert!(position(&args, "-c") < position(&args, "-fs"));
        assert!(position(&args, "-t") < position(&args, "-f"));
        assert_eq!(args.last().unwrap(), "/out/a.flv.part");
        assert!(!args.contains(&"-nostdin".to_string()));
        assert!(!args.contains(&"-movflags".to_string()));
    }

    #[test]
    fn test_build_args_limits_omitted() {
        let args = FfmpegEngine::build_args(&config(VideoFormat::Ts, Path::new("/o.ts.part")));
        assert!(!args.contains(&"-fs".to_string()));
        assert!(!args.contains(&"-t".to_string()));
        assert_eq!(args[position(&args, "-f") + 1], "mpegts");
        assert!(!args[position(&args, "-headers") + 1].contains("Cookie"));
    }

    #[test]
    fn test_build_args_fragmented_mp4() {
        let args = FfmpegEngine::build_args(&config(VideoFormat::Mp4, Path::new("/o.mp4.part")));
        assert_eq!(args[position(&args, "-f") + 1], "mp4");
        assert_eq!(
            args[position(&args, "-movflags") + 1],
            "+frag_keyframe+empty_moov"
        );
        assert!(position(&args, "-movflags") < args.len() - 1);
    }

    #[test]
    fn test_supports_every_format() {
        let engine = FfmpegEngine::default();
        assert_eq!(engine.kind(), EngineKind::Ffmpeg);
        assert!(engine.supports_format(VideoFormat::Mkv));
        assert!(engine.init(&config(VideoFormat::Mov, Path::new("/o"))).is_ok());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FfmpegEngine::new(dir.path().join("missing-ffmpeg").to_string_lossy());
        let (events, mut rx) = EngineEvents::channel(16);
        let (_stop, control) = engine_control();

        let result = engine
            .run(config(VideoFormat::Flv, &dir.path().join("a.flv.part")), events, control)
            .await;

        assert!(matches!(result, Err(Error::Engine(_))));
        assert_eq!(rx.recv().await, Some(EngineEvent::Finished));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        const HEADER: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then echo "ffmpeg version fake"; exit 0; fi
for last; do :; done
"#;

        /// Write an executable stand-in for ffmpeg and wait until it can run.
        fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
            use std::os::unix::fs::PermissionsExt;

            let path = dir.join("ffmpeg");
            std::fs::write(&path, format!("{HEADER}{body}")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

            // A concurrent fork may briefly hold the write handle (ETXTBSY).
            for _ in 0..100 {
                if std::process::Command::new(&path).arg("-version").output().is_ok() {
                    return path;
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            panic!("fake ffmpeg never became executable");
        }

        async fn collect(mut rx: mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
            let mut all = Vec::new();
            while let Some(event) = rx.recv().await {
                all.push(event);
            }
            all
        }

        #[tokio::test]
        async fn test_natural_end_produces_artifact() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_ffmpeg(
                dir.path(),
                r#"printf 'Press [q] to stop, [?] for help\n' >&2
printf 'frame=1 fps=0 q=-1.0 size=       2kB time=00:00:01.00 bitrate=16.0kbits/s speed=1x\r' >&2
echo data > "$last"
exit 0
"#,
            );
            let engine = FfmpegEngine::new(bin.to_string_lossy());
            assert_eq!(engine.version().as_deref(), Some("ffmpeg version fake"));

            let output = dir.path().join("a.flv.part");
            let (events, rx) = EngineEvents::channel(64);
            let (stop, control) = engine_control();

            let artifact = engine
                .run(config(VideoFormat::Flv, &output), events, control)
                .await
                .unwrap()
                .unwrap();

            assert_eq!(artifact.media_path, output);
            assert!(artifact.end_epoch >= artifact.start_epoch);
            assert!(output.exists());
            assert_eq!(stop.exit_status(), Some(true));

            let events = collect(rx).await;
            assert_eq!(events.first(), Some(&EngineEvent::Started));
            assert_eq!(events.last(), Some(&EngineEvent::Finished));
            assert!(events.contains(&EngineEvent::Progress {
                bytes: 2048,
                bitrate: "16.0kbits/s".to_string()
            }));
            assert_eq!(
                events.iter().filter(|e| **e == EngineEvent::Started).count(),
                1
            );
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_failure() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_ffmpeg(dir.path(), "echo 'Server returned 404 Not Found' >&2\nexit 1\n");
            let engine = FfmpegEngine::new(bin.to_string_lossy());
            let (events, rx) = EngineEvents::channel(64);
            let (stop, control) = engine_control();

            let result = engine
                .run(config(VideoFormat::Flv, &dir.path().join("a.flv.part")), events, control)
                .await
                .unwrap();

            assert!(result.is_none());
            assert!(!stop.stop().await);
            assert_eq!(collect(rx).await, vec![EngineEvent::Finished]);
        }

        #[tokio::test]
        async fn test_graceful_stop_via_stdin() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_ffmpeg(
                dir.path(),
                r#"printf 'Press [q] to stop\n' >&2
echo data > "$last"
while read line; do
  if [ "$line" = "q" ]; then exit 0; fi
done
exit 1
"#,
            );
            let engine = FfmpegEngine::new(bin.to_string_lossy());
            let output = dir.path().join("a.ts.part");
            let (events, mut rx) = EngineEvents::channel(64);
            let (stop, control) = engine_control();

            let run = tokio::spawn({
                let cfg = config(VideoFormat::Ts, &output);
                async move { engine.run(cfg, events, control).await }
            });

            assert_eq!(rx.recv().await, Some(EngineEvent::Started));
            assert!(stop.stop().await);

            let artifact = run.await.unwrap().unwrap();
            assert!(artifact.is_some());
            // Already stopped: the recorded status comes back without a new signal.
            assert!(stop.stop().await);
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn test_terminal_interrupt_does_not_reach_ffmpeg() {
            let dir = tempfile::tempdir().unwrap();
            // Exits the way ffmpeg does on SIGINT when it shares the parent's
            // group, which is where a terminal Ctrl-C lands.
            let bin = fake_ffmpeg(
                dir.path(),
                r#"pgrp() { read -r stat < /proc/$1/stat; set -- ${stat##*") "}; echo $3; }
if [ "$(pgrp $$)" = "$(pgrp $PPID)" ]; then echo 'Exiting normally, received signal 2.' >&2; exit 255; fi
printf 'Press [q] to stop\n' >&2
echo data > "$last"
while read line; do
  if [ "$line" = "q" ]; then exit 0; fi
done
exit 1
"#,
            );
            let engine = FfmpegEngine::new(bin.to_string_lossy());
            let output = dir.path().join("a.flv.part");
            let (events, mut rx) = EngineEvents::channel(64);
            let (stop, control) = engine_control();

            let run = tokio::spawn({
                let cfg = config(VideoFormat::Flv, &output);
                async move { engine.run(cfg, events, control).await }
            });

            assert_eq!(rx.recv().await, Some(EngineEvent::Started));
            assert!(stop.stop().await);

            let artifact = run.await.unwrap().unwrap().unwrap();
            assert_eq!(artifact.media_path, output);
            assert!(output.exists());
        }
    }
}
