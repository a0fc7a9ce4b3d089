//! Queue-consumer metrics.

use metrics::counter;

pub mod names {
    pub const MESSAGES_RECEIVED_TOTAL: &str = "queue_messages_received_total";
    pub const MESSAGES_DELETED_TOTAL: &str = "queue_messages_deleted_total";
    pub const MESSAGES_REQUEUED_TOTAL: &str = "queue_messages_requeued_total";
    pub const NOT_READY_COUNT_EXCEEDED_TOTAL: &str = "queue_not_ready_count_exceeded_total";
    pub const EMPTY_POLLS_TOTAL: &str = "queue_empty_polls_total";
}

pub fn record_received(count: usize) {
    counter!(names::MESSAGES_RECEIVED_TOTAL).increment(count as u64);
}

pub fn record_deleted(outcome: &str) {
    counter!(names::MESSAGES_DELETED_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn record_requeued(reason: &str) {
    counter!(names::MESSAGES_REQUEUED_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_not_ready_count_exceeded() {
    counter!(names::NOT_READY_COUNT_EXCEEDED_TOTAL).increment(1);
}

pub fn record_empty_poll() {
    counter!(names::EMPTY_POLLS_TOTAL).increment(1);
}
