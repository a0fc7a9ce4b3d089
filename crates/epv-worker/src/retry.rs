//! Retry helpers used by the pipeline and task-protection coordinator.
//!
//! Distinct from `epv_db::retry`, which only retries transient database
//! errors; these helpers retry whole pipeline steps (transcode attempts,
//! validation re-reads, flag-advance confirmation) against a fixed attempt
//! budget, following the teacher's `RetryConfig` shape.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Configuration for a fixed-attempt retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub operation_name: String,
}

impl RetryConfig {
    pub fn new(operation_name: impl Into<String>, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(30),
            operation_name: operation_name.into(),
        }
    }
}

/// Run `op` up to `config.max_attempts` times with exponential backoff
/// between attempts, retrying iff `is_retryable` returns true for the error.
pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    is_retryable: impl Fn(&E) -> bool,
    op: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < config.max_attempts && is_retryable(&e) => {
                let delay = exponential_delay(config, attempt);
                warn!(
                    operation = %config.operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after failure: {}",
                    e
                );
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }

    // Unreachable in practice (the loop always returns on its last
    // iteration), but keeps the function total.
    Err(last_error.expect("loop runs at least once"))
}

fn exponential_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config.base_delay.as_millis() as u64 * 2u64.pow(attempt);
    Duration::from_millis(exp.min(config.max_delay.as_millis() as u64))
}

/// Sleep for a uniformly-random duration in `[min, max)`. Used for the
/// pipeline's validation-retry jitter (spec.md §4.3 step 11: 0.2-0.8s).
pub async fn jittered_sleep(min: Duration, max: Duration) {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis().max(min.as_millis() as u128 + 1) as u64;
    let millis = rand::thread_rng().gen_range(min_ms..max_ms);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_ok() {
        let config = RetryConfig::new("op", 3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_retry(&config, |_: &&str| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_retrying_when_error_is_not_retryable() {
        let config = RetryConfig::new("op", 5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_retry(&config, |_: &&str| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("permanent") }
        })
        .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts_then_returns_last_error() {
        let config = RetryConfig::new("op", 3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_retry(&config, |_: &&str| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("transient") }
        })
        .await;
        assert_eq!(result, Err("transient"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn jittered_sleep_respects_bounds() {
        let start = std::time::Instant::now();
        jittered_sleep(Duration::from_millis(5), Duration::from_millis(10)).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
