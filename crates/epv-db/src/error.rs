//! Database error types.

use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to configure database pool: {0}")]
    ConfigError(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Advisory lock unavailable for {0}, another writer holds it")]
    LockContended(String),

    #[error("Update touched {actual} rows, expected {expected}: {context}")]
    UnexpectedRowCount {
        context: String,
        expected: u64,
        actual: u64,
    },

    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn unexpected_row_count(
        context: impl Into<String>,
        expected: u64,
        actual: u64,
    ) -> Self {
        Self::UnexpectedRowCount {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Transient per the error taxonomy: connection resets, deadlocks, and
    /// serialization failures are retried; constraint violations and
    /// not-found are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Query(sqlx::Error::Io(_)) | DbError::Query(sqlx::Error::PoolTimedOut) => true,
            DbError::Query(sqlx::Error::Database(db_err)) => {
                matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }
}
