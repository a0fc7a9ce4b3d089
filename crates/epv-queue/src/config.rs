//! Queue configuration.

use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_url: String,
    pub dlq_url: Option<String>,
    /// Long-poll wait time, seconds (SQS max is 20).
    pub wait_time_seconds: i32,
    /// Initial visibility lease applied on receive; the heartbeat renews it
    /// back to this value while a handler is running.
    pub visibility_timeout_seconds: i32,
    /// Fixed delay applied when a message is requeued (NotReady, or Success
    /// with an unconfirmed flag advance).
    pub requeue_delay_seconds: i32,
    /// NotReady outcomes for the same episode before giving up and deleting
    /// without further requeue.
    pub not_ready_max_attempts: u32,
    pub empty_poll_backoff_start_secs: u64,
    pub empty_poll_backoff_max_secs: u64,
    /// Legacy behavior: stop the consumer loop entirely on an empty receive,
    /// instead of backing off and polling again. Off by default.
    pub stop_on_idle: bool,
    /// Messages requested per `ReceiveMessage` call (SQS max is 10).
    pub max_messages_per_receive: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            dlq_url: None,
            wait_time_seconds: 20,
            visibility_timeout_seconds: 14_400,
            requeue_delay_seconds: 180,
            not_ready_max_attempts: 3,
            empty_poll_backoff_start_secs: 1,
            empty_poll_backoff_max_secs: 20,
            stop_on_idle: false,
            max_messages_per_receive: 10,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> QueueResult<Self> {
        let queue_url = std::env::var("SQS_QUEUE_URL")
            .map_err(|_| QueueError::config_error("SQS_QUEUE_URL not set"))?;
        let dlq_url = std::env::var("SQS_DLQ_URL").ok();

        let wait_time_seconds = env_parse("SQS_WAIT_TIME_SECONDS", 20);
        let visibility_timeout_seconds = env_parse("SQS_VISIBILITY_TIMEOUT_SECONDS", 14_400);
        let requeue_delay_seconds = env_parse("SQS_REQUEUE_DELAY_SECONDS", 180);
        let not_ready_max_attempts = env_parse("SQS_NOT_READY_MAX_ATTEMPTS", 3);
        let empty_poll_backoff_start_secs = env_parse("SQS_EMPTY_POLL_BACKOFF_START_SECS", 1);
        let empty_poll_backoff_max_secs = env_parse("SQS_EMPTY_POLL_BACKOFF_MAX_SECS", 20);
        let stop_on_idle = std::env::var("SQS_LEGACY_STOP_ON_IDLE")
            .ok()
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "true" | "1"))
            .unwrap_or(false);
        let max_messages_per_receive = env_parse("SQS_MAX_MESSAGES_PER_RECEIVE", 10);

        Ok(Self {
            queue_url,
            dlq_url,
            wait_time_seconds,
            visibility_timeout_seconds,
            requeue_delay_seconds,
            not_ready_max_attempts,
            empty_poll_backoff_start_secs,
            empty_poll_backoff_max_secs,
            stop_on_idle,
            max_messages_per_receive,
        })
    }

    /// Heartbeat interval: `min(300s, max(60s, timeout/3))`.
    pub fn heartbeat_interval_secs(&self) -> u64 {
        let third = (self.visibility_timeout_seconds / 3).max(0) as u64;
        third.max(60).min(300)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}
