//! Live stream capture core.
//!
//! A [`download::Download`] drives one capture job: it resolves output paths,
//! runs a [`engine::CaptureEngine`] and, when enabled, records the danmu side
//! channel next to the media file.

pub mod config;
pub mod danmu;
pub mod domain;
pub mod download;
pub mod engine;
pub mod error;
pub mod logging;
pub mod output;
pub mod retry;
pub mod utils;

pub use error::{Error, Result};
