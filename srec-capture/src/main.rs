use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use srec_capture::config::{CONFIG_PATH_ENV, DownloadConfig, GlobalConfig};
use srec_capture::domain::{Platform, StreamJob, VideoFormat};
use srec_capture::download::{Download, ProgressLogger};
use srec_capture::engine::{EngineKind, EngineRegistry};
use srec_capture::logging::{self, LOG_RETENTION_DAYS, LogOptions};
use srec_capture::output::SysinfoDiskProbe;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// The media URL to capture
    #[arg(short, long)]
    url: String,

    /// Streamer name used in file names and logs
    #[arg(short, long, default_value = "streamer")]
    streamer: String,

    /// Room URL of the streamer (defaults to the media URL)
    #[arg(long)]
    room_url: Option<String>,

    /// Stream title
    #[arg(short, long, default_value = "")]
    title: String,

    #[arg(short, long)]
    platform: Option<Platform>,

    /// Capture engine: ffmpeg or native
    #[arg(short, long)]
    engine: Option<EngineKind>,

    /// Output format: flv, ts, mp4, mkv or mov
    #[arg(short, long)]
    format: Option<VideoFormat>,

    /// Enable danmu for the job. No danmu provider is bundled with this
    /// binary, so only the media is recorded and a warning is logged.
    #[arg(long)]
    danmu: bool,

    /// Directory for log files
    #[arg(long, env = "SREC_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log filter directive, used when RUST_LOG is unset
    #[arg(long, env = "SREC_LOG_FILTER")]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let _guard = logging::init_logging(&LogOptions {
        log_dir: args.log_dir.clone(),
        filter: args.log_filter.clone(),
    })
    .context("Failed to initialize logging")?;

    if let Some(dir) = &args.log_dir
        && let Err(e) = logging::cleanup_old_logs(dir, LOG_RETENTION_DAYS).await
    {
        warn!(error = %e, "Failed to cleanup old logs");
    }

    let global =
        GlobalConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    global.validate().context("Invalid configuration")?;

    let engines = EngineRegistry::with_defaults(global.ffmpeg_path.clone())
        .context("Failed to set up capture engines")?;
    let progress = Arc::new(ProgressLogger::new(Duration::from_secs(
        global.progress_log_interval_secs,
    )));
    let download = Arc::new(
        Download::new(global, engines, None, Arc::new(SysinfoDiskProbe::new()))
            .with_observer(progress),
    );

    let room_url = args.room_url.clone().unwrap_or_else(|| args.url.clone());
    let job = StreamJob::new(&args.streamer, room_url, &args.url)
        .with_platform(args.platform.unwrap_or_default())
        .with_title(&args.title)
        .with_config(DownloadConfig {
            engine: args.engine,
            output_file_format: args.format,
            danmu: args.danmu.then_some(true),
            ..Default::default()
        });

    let stopper = download.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping capture");
            stopper.stop().await;
        }
    });

    let artifact = download
        .download(&job)
        .await
        .with_context(|| format!("Failed to start capture of {}", args.url))?;

    match artifact {
        Some(artifact) => {
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(())
        }
        None => {
            error!(streamer = %job.streamer_name, job_id = %job.id, "Capture produced no output");
            anyhow::bail!("capture produced no output")
        }
    }
}
