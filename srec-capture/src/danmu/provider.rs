//! Danmu provider trait and common types.
//!
//! A provider owns the platform wire protocol; everything above it only sees
//! [`DanmuMessage`]s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Type of danmu message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DanmuType {
    /// Regular chat message
    #[default]
    Chat,
    /// Gift/donation
    Gift,
    /// Super chat (paid highlighted message)
    SuperChat,
    /// System message
    System,
    /// Other platform-specific message type
    Other,
}

/// A single danmu message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DanmuMessage {
    pub user_id: String,
    pub username: String,
    pub content: String,
    /// Time the message was sent
    pub timestamp: DateTime<Utc>,
    pub message_type: DanmuType,
    /// Display color as `0xRRGGBB`
    #[serde(default = "default_color")]
    pub color: u32,
}

fn default_color() -> u32 {
    0xFFFFFF
}

impl DanmuMessage {
    /// Create a new chat message sent now.
    pub fn chat(
        user_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            content: content.into(),
            timestamp: Utc::now(),
            message_type: DanmuType::Chat,
            color: default_color(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_type(mut self, message_type: DanmuType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }
}

/// Item received from a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum DanmuItem {
    Message(DanmuMessage),
    /// The room closed the danmu stream.
    StreamClosed,
}

/// Connection handle for an active danmu stream.
#[derive(Debug, Clone)]
pub struct DanmuConnection {
    pub id: String,
    pub platform: String,
    pub room_id: String,
    pub is_connected: bool,
    pub connected_at: DateTime<Utc>,
}

impl DanmuConnection {
    pub fn new(platform: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform: platform.into(),
            room_id: room_id.into(),
            is_connected: false,
            connected_at: Utc::now(),
        }
    }

    pub fn set_connected(&mut self) {
        self.is_connected = true;
        self.connected_at = Utc::now();
    }

    pub fn set_disconnected(&mut self) {
        self.is_connected = false;
    }
}

/// Trait for platform-specific danmu providers.
#[async_trait]
pub trait DanmuProvider: Send + Sync {
    /// Platform name this provider handles.
    fn platform(&self) -> &str;

    /// Extract the room id from a streamer URL.
    fn extract_room_id(&self, url: &str) -> Option<String>;

    /// Connect to the danmu stream of a room.
    ///
    /// Network failures should be reported as I/O-class errors so callers
    /// can retry them.
    async fn connect(&self, room_id: &str) -> Result<DanmuConnection>;

    /// Receive the next item. `Ok(None)` means nothing is available yet.
    async fn receive(&self, connection: &DanmuConnection) -> Result<Option<DanmuItem>>;

    async fn disconnect(&self, connection: &mut DanmuConnection) -> Result<()>;
}
