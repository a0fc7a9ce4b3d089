//! Database metrics collection.
//!
//! Provides standardized metrics for monitoring database operations:
//! - Request counters by operation and outcome
//! - Latency histograms
//! - Retry counters

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    pub const QUERIES_TOTAL: &str = "db_queries_total";
    pub const RETRIES_TOTAL: &str = "db_retries_total";
    pub const LATENCY_SECONDS: &str = "db_latency_seconds";
    pub const LOCK_CONTENDED_TOTAL: &str = "db_lock_contended_total";
}

/// Record metrics for a completed database query.
pub fn record_query(operation: &str, outcome: &str, latency_ms: f64) {
    counter!(
        names::QUERIES_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "operation" => operation.to_string()
    )
    .record(latency_ms / 1000.0);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record that a per-row advisory lock was contended (I6: at-most-one
/// concurrent writer; the loser isn't an error, just a skip).
pub fn record_lock_contended(operation: &str) {
    counter!(
        names::LOCK_CONTENDED_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_stable() {
        assert!(names::QUERIES_TOTAL.contains("queries"));
        assert!(names::RETRIES_TOTAL.contains("retries"));
        assert!(names::LATENCY_SECONDS.contains("latency"));
        assert!(names::LOCK_CONTENDED_TOTAL.contains("lock_contended"));
    }
}
