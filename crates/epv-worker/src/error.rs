//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Credential validation failed: {0}")]
    CredentialValidation(String),

    #[error("Source video could not be downloaded: {0}")]
    SourceDownloadFailed(String),

    #[error("Master playlist could not be constructed: {0}")]
    MasterPlaylistFailed(String),

    #[error("Task protection coordinator error: {0}")]
    TaskProtection(String),

    #[error("Storage error: {0}")]
    Storage(#[from] epv_storage::StorageError),

    #[error("Media error: {0}")]
    Media(#[from] epv_media::MediaError),

    #[error("Database error: {0}")]
    Db(#[from] epv_db::DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] epv_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn credential_validation(msg: impl Into<String>) -> Self {
        Self::CredentialValidation(msg.into())
    }

    pub fn source_download_failed(msg: impl Into<String>) -> Self {
        Self::SourceDownloadFailed(msg.into())
    }

    pub fn master_playlist_failed(msg: impl Into<String>) -> Self {
        Self::MasterPlaylistFailed(msg.into())
    }

    pub fn task_protection(msg: impl Into<String>) -> Self {
        Self::TaskProtection(msg.into())
    }

    /// Fatal per the error taxonomy (spec.md §7): configuration missing,
    /// credentials invalid at startup, master playlist unconstructable,
    /// source video undownloadable. These abort the pipeline for this
    /// message but never the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::ConfigError(_)
                | WorkerError::CredentialValidation(_)
                | WorkerError::SourceDownloadFailed(_)
                | WorkerError::MasterPlaylistFailed(_)
        )
    }
}
