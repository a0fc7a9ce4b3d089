//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during video processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed { message: String, stderr: Option<String> },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("Invalid clip window: {0}")]
    InvalidWindow(String),

    #[error("Master playlist construction failed: {0}")]
    MasterPlaylistFailed(String),

    #[error("Rendition playlist invalid: {0}")]
    InvalidRenditionPlaylist(String),
}

impl MediaError {
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn invalid_window(message: impl Into<String>) -> Self {
        Self::InvalidWindow(message.into())
    }

    pub fn master_playlist_failed(message: impl Into<String>) -> Self {
        Self::MasterPlaylistFailed(message.into())
    }

    pub fn invalid_rendition_playlist(message: impl Into<String>) -> Self {
        Self::InvalidRenditionPlaylist(message.into())
    }

    /// Transient per the error taxonomy: a non-zero ffmpeg exit is retried up
    /// to the caller's configured attempt count before it is treated as fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MediaError::FfmpegFailed { .. } | MediaError::Io(_))
    }
}
