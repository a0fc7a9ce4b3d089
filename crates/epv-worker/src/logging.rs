//! Structured episode/item logging utilities.
//!
//! Provides consistent, structured logging for pipeline stages with
//! tracing spans and contextual fields, in the same shape as the teacher's
//! job-scoped logger.

use tracing::{error, info, warn, Span};

/// Per-episode logger for structured logging with consistent fields.
#[derive(Debug, Clone)]
pub struct EpisodeLogger {
    episode_id: String,
}

impl EpisodeLogger {
    pub fn new(episode_id: impl Into<String>) -> Self {
        Self {
            episode_id: episode_id.into(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(episode_id = %self.episode_id, "pipeline started: {}", message);
    }

    pub fn log_progress(&self, message: &str) {
        info!(episode_id = %self.episode_id, "pipeline progress: {}", message);
    }

    pub fn log_warning(&self, message: &str) {
        warn!(episode_id = %self.episode_id, "pipeline warning: {}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(episode_id = %self.episode_id, "pipeline error: {}", message);
    }

    pub fn log_completion(&self, message: &str) {
        info!(episode_id = %self.episode_id, "pipeline completed: {}", message);
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn create_span(&self) -> Span {
        tracing::info_span!("episode_pipeline", episode_id = %self.episode_id)
    }
}

/// Install the process-wide tracing subscriber: JSON formatting layer plus
/// `RUST_LOG`-driven env filter, exactly as the teacher's `main.rs` does.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("epv_worker=info,epv_queue=info,epv_db=info")),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episode_logger_carries_id() {
        let logger = EpisodeLogger::new("e-123");
        assert_eq!(logger.episode_id(), "e-123");
    }
}
