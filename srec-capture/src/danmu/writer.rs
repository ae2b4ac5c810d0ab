//! XML writer for danmu messages.
//!
//! Each message becomes
//! `<d p="{offset},{type},{color},{timestamp_ms},{user_id},{username}">{content}</d>`
//! where `offset` is the time in seconds since the video started.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use super::provider::{DanmuMessage, DanmuType};
use crate::{Error, Result};

/// XML writer for danmu messages.
pub struct XmlDanmuWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    message_count: u64,
}

impl XmlDanmuWriter {
    /// Create the file and write the XML header and `comments`.
    pub async fn new(path: &Path, comments: &[String]) -> Result<Self> {
        let file = File::create(path)
            .await
            .map_err(|e| Error::io_path("creating", path, e))?;
        let mut writer = Self {
            path: path.to_path_buf(),
            file: Some(BufWriter::new(file)),
            message_count: 0,
        };
        writer.write_header(comments).await?;
        Ok(writer)
    }

    pub fn output_path(&self) -> &Path {
        &self.path
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if let Some(file) = &mut self.file {
            file.write_all(data)
                .await
                .map_err(|e| Error::io_path("writing", &self.path, e))?;
        }
        Ok(())
    }

    async fn write_header(&mut self, comments: &[String]) -> Result<()> {
        let mut header = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<i>\n");
        for comment in comments {
            header.push_str(&format!("  <!-- {} -->\n", comment.replace("--", "- -")));
        }
        self.write_raw(header.as_bytes()).await
    }

    /// Write one message at `offset_secs` into the video.
    pub async fn write_message(&mut self, message: &DanmuMessage, offset_secs: f64) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let xml = format!(
            "  <d p=\"{:.3},{},{},{},{},{}\">{}</d>\n",
            offset_secs.max(0.0),
            message_type_to_int(message.message_type),
            message.color,
            message.timestamp.timestamp_millis(),
            escape_xml(&message.user_id),
            escape_xml(&message.username),
            escape_xml(&message.content),
        );
        self.write_raw(xml.as_bytes()).await?;
        self.message_count += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Some(file) = &mut self.file {
            file.flush()
                .await
                .map_err(|e| Error::io_path("flushing", &self.path, e))?;
        }
        Ok(())
    }

    /// Write the closing tag and close the file. Later writes are ignored.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.write_raw(b"</i>\n").await?;
        self.flush().await?;
        self.file = None;
        Ok(())
    }
}

/// Offset of `timestamp` from `video_start` in seconds, never negative.
pub fn offset_secs(timestamp: DateTime<Utc>, video_start: DateTime<Utc>) -> f64 {
    ((timestamp - video_start).num_milliseconds() as f64 / 1000.0).max(0.0)
}

/// Convert a message type to its integer representation.
pub fn message_type_to_int(msg_type: DanmuType) -> u8 {
    match msg_type {
        DanmuType::Chat => 1,
        DanmuType::Gift => 2,
        DanmuType::SuperChat => 3,
        DanmuType::System => 4,
        DanmuType::Other => 0,
    }
}

/// Escape special XML characters in a string.
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
