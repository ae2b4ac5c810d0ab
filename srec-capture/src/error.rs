//! Crate-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::VideoFormat;
use crate::engine::EngineKind;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", .path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine {engine} does not support the {format} format")]
    UnsupportedFormat {
        engine: EngineKind,
        format: VideoFormat,
    },

    #[error("Output file already exists: {}", .0.display())]
    PathCollision(PathBuf),

    #[error(
        "Not enough disk space at {}: {available} bytes available, {required} bytes required",
        .path.display()
    )]
    InsufficientDiskSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Danmu error: {0}")]
    Danmu(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    pub fn danmu(msg: impl Into<String>) -> Self {
        Self::Danmu(msg.into())
    }

    /// Whether the failure is transient I/O that is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::IoPath { .. } | Self::Http(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_class_errors_are_retryable() {
        let io = Error::Io(std::io::Error::other("reset"));
        let io_path = Error::io_path(
            "opening",
            Path::new("/tmp/x"),
            std::io::Error::from(std::io::ErrorKind::TimedOut),
        );

        assert!(io.is_retryable());
        assert!(io_path.is_retryable());
    }

    #[test]
    fn precondition_errors_are_not_retryable() {
        assert!(!Error::validation("downloadUrl is required").is_retryable());
        assert!(!Error::config("engine not supported").is_retryable());
        assert!(!Error::PathCollision(PathBuf::from("/tmp/a.flv.part")).is_retryable());
        assert!(
            !Error::UnsupportedFormat {
                engine: EngineKind::Native,
                format: VideoFormat::Mp4,
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_path_message_names_operation_and_path() {
        let err = Error::io_path(
            "creating output directory",
            Path::new("/data/out"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        let msg = err.to_string();
        assert!(msg.contains("creating output directory"));
        assert!(msg.contains("/data/out"));
    }
}
