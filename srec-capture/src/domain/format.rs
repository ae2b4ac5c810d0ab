//! Output container formats.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Container format of a captured media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    /// Flash video, written as received.
    #[default]
    Flv,
    /// MPEG transport stream, written as received.
    Ts,
    /// Fragmented MP4.
    Mp4,
    /// Matroska.
    Mkv,
    /// QuickTime.
    Mov,
}

impl VideoFormat {
    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Flv => "flv",
            Self::Ts => "ts",
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Mov => "mov",
        }
    }

    /// Muxer name passed to ffmpeg's `-f`.
    pub fn ffmpeg_muxer(&self) -> &'static str {
        match self {
            Self::Flv => "flv",
            Self::Ts => "mpegts",
            Self::Mp4 => "mp4",
            Self::Mkv => "matroska",
            Self::Mov => "mov",
        }
    }

    /// Whether producing this container needs a muxer rather than a byte copy.
    pub fn requires_remux(&self) -> bool {
        matches!(self, Self::Mp4 | Self::Mkv | Self::Mov)
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for VideoFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "flv" => Ok(Self::Flv),
            "ts" => Ok(Self::Ts),
            "mp4" => Ok(Self::Mp4),
            "mkv" => Ok(Self::Mkv),
            "mov" => Ok(Self::Mov),
            other => Err(Error::config(format!("unknown output format: {other}"))),
        }
    }
}
