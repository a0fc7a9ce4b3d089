//! Pipeline-level metrics: fire-and-forget counters for zero-artifact
//! invariants, retry exhaustion, and unclassified exceptions (spec.md §4,
//! "Metrics" row).

use metrics::counter;

pub mod names {
    pub const ZERO_QUOTES_TOTAL: &str = "pipeline_zero_quotes_total";
    pub const ZERO_CHUNKS_TOTAL: &str = "pipeline_zero_chunks_total";
    pub const ZERO_QUOTES_UNEXPECTED_TOTAL: &str = "pipeline_zero_quotes_unexpected_total";
    pub const ZERO_CHUNKS_UNEXPECTED_TOTAL: &str = "pipeline_zero_chunks_unexpected_total";
    pub const DB_UPDATE_RETRY_FAILED_TOTAL: &str = "pipeline_db_update_retry_failed_total";
    pub const UPDATE_PROCESSING_FLAGS_FAILURE_TOTAL: &str =
        "pipeline_update_processing_flags_failure_total";
    pub const UNHANDLED_EXCEPTION_TOTAL: &str = "pipeline_unhandled_exception_total";
}

/// An episode inventory came back with zero quote rows, expected or not.
pub fn record_zero_quotes(episode_id: &str) {
    counter!(names::ZERO_QUOTES_TOTAL, "episode_id" => episode_id.to_string()).increment(1);
}

/// Short-category counterpart of [`record_zero_quotes`].
pub fn record_zero_chunks(episode_id: &str) {
    counter!(names::ZERO_CHUNKS_TOTAL, "episode_id" => episode_id.to_string()).increment(1);
}

/// I3: `quotingDone` was true but the episode had zero quote rows.
pub fn record_zero_quotes_unexpected(episode_id: &str) {
    counter!(names::ZERO_QUOTES_UNEXPECTED_TOTAL, "episode_id" => episode_id.to_string())
        .increment(1);
}

/// I3's short-category counterpart.
pub fn record_zero_chunks_unexpected(episode_id: &str) {
    counter!(names::ZERO_CHUNKS_UNEXPECTED_TOTAL, "episode_id" => episode_id.to_string())
        .increment(1);
}

/// A repository write exhausted its retry budget for one artifact item;
/// the item is left unsuccessful and will be caught by §4.3 validation.
pub fn record_db_update_retry_failed(item_type: &str, item_id: &str) {
    counter!(
        names::DB_UPDATE_RETRY_FAILED_TOTAL,
        "item_type" => item_type.to_string(),
        "item_id" => item_id.to_string()
    )
    .increment(1);
}

/// Step 13's flag-advance write failed after its own retries.
pub fn record_update_processing_flags_failure(episode_id: &str) {
    counter!(names::UPDATE_PROCESSING_FLAGS_FAILURE_TOTAL, "episode_id" => episode_id.to_string())
        .increment(1);
}

/// An unclassified exception escaped pipeline step handling, tagged with
/// the episode id so on-call can find it without a stack trace.
pub fn record_unhandled_exception(episode_id: &str) {
    counter!(names::UNHANDLED_EXCEPTION_TOTAL, "episode_id" => episode_id.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_stable() {
        assert!(names::ZERO_QUOTES_TOTAL.contains("zero_quotes"));
        assert!(names::ZERO_QUOTES_UNEXPECTED_TOTAL.contains("zero_quotes"));
        assert!(names::UNHANDLED_EXCEPTION_TOTAL.contains("unhandled_exception"));
    }
}
