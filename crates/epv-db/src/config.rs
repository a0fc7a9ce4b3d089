//! Repository configuration.

use crate::error::{DbError, DbResult};

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Per-transaction `statement_timeout`, milliseconds.
    pub statement_timeout_ms: u64,
    /// Per-transaction `lock_timeout`, milliseconds — kept very short since
    /// writes never wait on an advisory lock (§4.5).
    pub lock_timeout_ms: u64,
    /// Default chunk size for batched writes.
    pub batch_chunk_size: usize,
}

impl RepositoryConfig {
    pub fn from_env() -> DbResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| DbError::config_error("DATABASE_URL not set"))?;

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let statement_timeout_ms = std::env::var("DB_STATEMENT_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(120_000);
        let lock_timeout_ms = std::env::var("DB_LOCK_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1_000);
        let batch_chunk_size = std::env::var("DB_UPDATE_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20);

        Ok(Self {
            database_url,
            max_connections,
            statement_timeout_ms,
            lock_timeout_ms,
            batch_chunk_size,
        })
    }
}
