//! Stream job: one capture attempt for one streamer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::DownloadConfig;
use crate::output::sanitize_filename;
use crate::{Error, Result};

/// Streaming platform a job belongs to.
///
/// Only used to pick platform-wide defaults (e.g. cookies); URL parsing is
/// done elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Huya,
    Douyin,
    Douyu,
    Bilibili,
    Twitch,
    Pandatv,
    #[default]
    Unknown,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Huya => "huya",
            Self::Douyin => "douyin",
            Self::Douyu => "douyu",
            Self::Bilibili => "bilibili",
            Self::Twitch => "twitch",
            Self::Pandatv => "pandatv",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "huya" => Ok(Self::Huya),
            "douyin" => Ok(Self::Douyin),
            "douyu" => Ok(Self::Douyu),
            "bilibili" => Ok(Self::Bilibili),
            "twitch" => Ok(Self::Twitch),
            "pandatv" => Ok(Self::Pandatv),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(Error::config(format!("unknown platform: {other}"))),
        }
    }
}

/// A single capture attempt.
///
/// Built fresh for every attempt and never mutated once the capture starts.
#[derive(Debug, Clone)]
pub struct StreamJob {
    /// Job identifier used in logs.
    pub id: String,
    /// Streamer display name (not unique).
    pub streamer_name: String,
    /// Room URL of the streamer, used to locate the danmu room.
    pub streamer_url: String,
    /// Platform of the streamer.
    pub platform: Platform,
    /// Resolved media URL to capture.
    pub download_url: String,
    title: String,
    /// Per-job download configuration, merged over the global defaults.
    pub config: Option<DownloadConfig>,
}

impl StreamJob {
    pub fn new(
        streamer_name: impl Into<String>,
        streamer_url: impl Into<String>,
        download_url: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            streamer_name: streamer_name.into(),
            streamer_url: streamer_url.into(),
            platform: Platform::Unknown,
            download_url: download_url.into(),
            title: String::new(),
            config: None,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Set the stream title. Characters illegal in filenames are replaced.
    pub fn with_title(mut self, title: &str) -> Self {
        self.title = if title.is_empty() {
            String::new()
        } else {
            sanitize_filename(title)
        };
        self
    }

    pub fn with_config(mut self, config: DownloadConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sanitized stream title.
    pub fn title(&self) -> &str {
        &self.title
    }
}
