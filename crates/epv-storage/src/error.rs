//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during artifact store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to configure storage client: {0}")]
    ConfigError(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Verification failed for {key}: {reason}")]
    VerificationFailed { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AWS SDK error: {0}")]
    AwsSdk(String),
}

impl StorageError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    pub fn verification_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VerificationFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Transient per the error taxonomy: retried by the caller before being
    /// treated as fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::AwsSdk(_) | StorageError::Io(_))
    }
}
