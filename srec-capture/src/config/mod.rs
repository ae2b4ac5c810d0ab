//! Capture configuration.
//!
//! Two layers feed every job:
//! 1. [`GlobalConfig`]: application-wide defaults, loaded from a JSON file.
//! 2. [`DownloadConfig`]: the per-job override; set fields win, `None` or
//!    empty strings fall through to the global layer.
//!
//! [`ResolvedDownloadConfig`] is the merged result consumed by the orchestrator.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Platform, VideoFormat};
use crate::engine::EngineKind;
use crate::{Error, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "SREC_CONFIG";

const GIB: u64 = 1024 * 1024 * 1024;

/// Application-wide capture defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Output folder template.
    pub output_folder: String,
    /// Output filename template (without extension).
    pub output_filename_template: String,
    /// Output container format.
    pub output_file_format: VideoFormat,
    /// Default download engine.
    pub engine: EngineKind,
    /// Path of the ffmpeg binary.
    pub ffmpeg_path: String,
    /// Whether danmu is recorded alongside the media.
    pub danmu: bool,
    /// Maximum size of one part in bytes (0 = unlimited).
    pub max_part_size: u64,
    /// Maximum duration of one part in seconds.
    pub max_part_duration: Option<u64>,
    /// Parts smaller than this many bytes are discarded (0 = keep all).
    pub min_part_size: u64,
    /// Platform-wide cookies used when a job does not carry its own.
    pub platform_cookies: HashMap<Platform, String>,
    /// Interval between progress log lines in seconds.
    pub progress_log_interval_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            output_folder: "./downloads/{streamer}".to_string(),
            output_filename_template: "{streamer}-{title}-%Y%m%d-%H%M%S".to_string(),
            output_file_format: VideoFormat::Flv,
            engine: EngineKind::Ffmpeg,
            ffmpeg_path: "ffmpeg".to_string(),
            danmu: false,
            max_part_size: 2 * GIB,
            max_part_duration: None,
            min_part_size: 0,
            platform_cookies: HashMap::new(),
            progress_log_interval_secs: 120,
        }
    }
}

impl GlobalConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the configuration file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading configuration", path, e))?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_json(&json)
    }

    /// Load from `path`, from `SREC_CONFIG`, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(env_path) if !env_path.trim().is_empty() => Self::from_file(Path::new(&env_path)),
            _ => {
                debug!("No configuration file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject configurations that can never produce a capture.
    pub fn validate(&self) -> Result<()> {
        if self.engine == EngineKind::Native && self.output_file_format.requires_remux() {
            return Err(Error::UnsupportedFormat {
                engine: self.engine,
                format: self.output_file_format,
            });
        }
        if self.engine == EngineKind::Ffmpeg && self.ffmpeg_path.trim().is_empty() {
            return Err(Error::config("ffmpeg_path must not be empty"));
        }
        if self.output_folder.trim().is_empty() {
            return Err(Error::config("output_folder must not be empty"));
        }
        if self.output_filename_template.trim().is_empty() {
            return Err(Error::config("output_filename_template must not be empty"));
        }
        if self.max_part_size > 0 && self.min_part_size > self.max_part_size {
            return Err(Error::config(format!(
                "min_part_size ({}) exceeds max_part_size ({})",
                self.min_part_size, self.max_part_size
            )));
        }
        Ok(())
    }
}

/// Per-job override of the global download settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub output_folder: Option<String>,
    pub output_filename_template: Option<String>,
    pub output_file_format: Option<VideoFormat>,
    pub cookies: Option<String>,
    pub danmu: Option<bool>,
    pub engine: Option<EngineKind>,
    pub max_part_size: Option<u64>,
    pub max_part_duration: Option<u64>,
    pub min_part_size: Option<u64>,
}

/// Download settings for one job after merging the override over the globals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDownloadConfig {
    pub output_folder: String,
    pub output_filename_template: String,
    pub output_file_format: VideoFormat,
    pub cookies: Option<String>,
    pub danmu: bool,
    pub engine: EngineKind,
    pub max_part_size: u64,
    pub max_part_duration: Option<u64>,
    pub min_part_size: u64,
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl ResolvedDownloadConfig {
    /// Merge `overrides` over `global`.
    ///
    /// Cookies fall back to the platform-wide cookies of `platform`.
    pub fn resolve(
        global: &GlobalConfig,
        overrides: &DownloadConfig,
        platform: Platform,
    ) -> Self {
        let cookies = non_empty(overrides.cookies.as_ref())
            .or_else(|| non_empty(global.platform_cookies.get(&platform)));

        let resolved = Self {
            output_folder: non_empty(overrides.output_folder.as_ref())
                .unwrap_or_else(|| global.output_folder.clone()),
            output_filename_template: non_empty(overrides.output_filename_template.as_ref())
                .unwrap_or_else(|| global.output_filename_template.clone()),
            output_file_format: overrides
                .output_file_format
                .unwrap_or(global.output_file_format),
            cookies,
            danmu: overrides.danmu.unwrap_or(global.danmu),
            engine: overrides.engine.unwrap_or(global.engine),
            max_part_size: overrides.max_part_size.unwrap_or(global.max_part_size),
            max_part_duration: overrides
                .max_part_duration
                .or(global.max_part_duration)
                .filter(|secs| *secs > 0),
            min_part_size: overrides.min_part_size.unwrap_or(global.min_part_size),
        };

        debug!(
            "Resolved download config: folder={}, format={}, engine={}, danmu={}, cookies={}",
            resolved.output_folder,
            resolved.output_file_format,
            resolved.engine,
            resolved.danmu,
            resolved.cookies.is_some()
        );
        resolved
    }
}
