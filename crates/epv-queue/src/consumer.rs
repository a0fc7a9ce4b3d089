//! Long-polling SQS consumer: hands validated messages to a handler and
//! routes the handler's outcome to delete/requeue/escalate (spec.md §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use tracing::{debug, info, info_span, warn, Instrument};

use epv_models::{EpisodeId, EpisodeMessage, Outcome};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::heartbeat::Heartbeat;
use crate::metrics;

/// Handler contract the consumer drives. `handle` does the actual episode
/// work; the other two methods close the loop on flag advancement after a
/// `Success` outcome (spec.md §4.2's `EnsureFlagsAfterSuccess` step).
#[async_trait]
pub trait EpisodeHandler: Send + Sync {
    async fn handle(&self, message: &EpisodeMessage) -> Outcome;

    /// Re-runs (or confirms) flag advancement for an episode that the
    /// pipeline believes finished successfully. Returns whether the flags
    /// are now known to be persisted.
    async fn ensure_flags_after_success(&self, episode_id: &EpisodeId) -> QueueResult<bool>;

    /// True iff both `videoChunkingDone` and `videoQuotingDone` currently
    /// read true in the store.
    async fn video_flags_both_done(&self, episode_id: &EpisodeId) -> QueueResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Idle = 0,
    Polling = 1,
    Draining = 2,
    Stopped = 3,
}

impl From<u8> for ConsumerState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConsumerState::Polling,
            2 => ConsumerState::Draining,
            3 => ConsumerState::Stopped,
            _ => ConsumerState::Idle,
        }
    }
}

pub struct QueueConsumer {
    client: Client,
    config: QueueConfig,
    not_ready_counts: Mutex<HashMap<String, u32>>,
    drain_requested: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl QueueConsumer {
    pub fn new(client: Client, config: QueueConfig) -> Self {
        Self {
            client,
            config,
            not_ready_counts: Mutex::new(HashMap::new()),
            drain_requested: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(ConsumerState::Idle as u8)),
        }
    }

    pub async fn from_env() -> QueueResult<Self> {
        let config = QueueConfig::from_env()?;
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self::new(Client::new(&aws_config), config))
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from(self.state.load(Ordering::SeqCst))
    }

    /// Requested from the supervisor's signal policy. Finishes any in-flight
    /// handler invocation, then exits without fetching more.
    pub fn request_drain(&self) {
        self.drain_requested.store(true, Ordering::SeqCst);
    }

    fn is_draining(&self) -> bool {
        self.drain_requested.load(Ordering::SeqCst)
    }

    /// Enqueue a message, for backfill/seeding tools.
    pub async fn enqueue(&self, message: &EpisodeMessage) -> QueueResult<()> {
        let body = serde_json::to_string(message)?;
        self.client
            .send_message()
            .queue_url(&self.config.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::send_failed(e.to_string()))?;
        Ok(())
    }

    /// Runs the consume loop until drained. Messages in a batch are
    /// processed sequentially; drain may interrupt between messages but
    /// never mid-message.
    pub async fn run(&self, handler: &dyn EpisodeHandler) -> QueueResult<()> {
        let mut backoff = self.config.empty_poll_backoff_start_secs;

        loop {
            if self.is_draining() {
                break;
            }

            self.state.store(ConsumerState::Polling as u8, Ordering::SeqCst);
            let messages = self.receive_batch().await?;

            if messages.is_empty() {
                metrics::record_empty_poll();
                if self.config.stop_on_idle {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff.saturating_mul(2)).min(self.config.empty_poll_backoff_max_secs);
                continue;
            }

            backoff = self.config.empty_poll_backoff_start_secs;
            metrics::record_received(messages.len());

            for message in messages {
                if self.is_draining() {
                    self.state.store(ConsumerState::Draining as u8, Ordering::SeqCst);
                    break;
                }
                self.process_one(message, handler).await;
            }
        }

        self.state.store(ConsumerState::Stopped as u8, Ordering::SeqCst);
        Ok(())
    }

    async fn receive_batch(&self) -> QueueResult<Vec<aws_sdk_sqs::types::Message>> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.config.queue_url)
            .wait_time_seconds(self.config.wait_time_seconds)
            .max_number_of_messages(self.config.max_messages_per_receive)
            .visibility_timeout(self.config.visibility_timeout_seconds)
            .send()
            .await
            .map_err(|e| QueueError::receive_failed(e.to_string()))?;

        Ok(response.messages.unwrap_or_default())
    }

    async fn process_one(&self, message: aws_sdk_sqs::types::Message, handler: &dyn EpisodeHandler) {
        let Some(receipt_handle) = message.receipt_handle().map(|s| s.to_string()) else {
            warn!("message had no receipt handle, skipping");
            return;
        };

        let body: EpisodeMessage = match message.body().map(serde_json::from_str) {
            Some(Ok(parsed)) => parsed,
            Some(Err(e)) => {
                warn!(error = %e, "malformed message body, deleting without processing");
                self.delete(&receipt_handle).await.ok();
                return;
            }
            None => {
                warn!("message had no body, deleting without processing");
                self.delete(&receipt_handle).await.ok();
                return;
            }
        };

        let episode_id = body.episode_id.clone();
        let span = info_span!("handle_episode_message", episode_id = %episode_id);

        let heartbeat = Heartbeat::spawn(
            self.client.clone(),
            self.config.queue_url.clone(),
            receipt_handle.clone(),
            Duration::from_secs(self.config.heartbeat_interval_secs()),
            self.config.visibility_timeout_seconds,
        );

        let outcome = handler.handle(&body).instrument(span).await;
        heartbeat.stop().await;

        if let Err(e) = self.route_outcome(outcome, &body, &episode_id, &receipt_handle, handler).await {
            warn!(episode_id = %episode_id, error = %e, "failed to route message outcome");
        }
    }

    async fn route_outcome(
        &self,
        outcome: Outcome,
        body: &EpisodeMessage,
        episode_id: &EpisodeId,
        receipt_handle: &str,
        handler: &dyn EpisodeHandler,
    ) -> QueueResult<()> {
        match outcome {
            Outcome::Success => {
                let advanced = handler
                    .ensure_flags_after_success(episode_id)
                    .await
                    .unwrap_or(false);
                let both_done = if advanced {
                    handler.video_flags_both_done(episode_id).await.unwrap_or(false)
                } else {
                    false
                };

                if advanced && both_done {
                    self.delete(receipt_handle).await?;
                    metrics::record_deleted("success");
                    self.reset_not_ready(episode_id);
                    info!(episode_id = %episode_id, "episode processed successfully");
                } else {
                    debug!(episode_id = %episode_id, "flags not yet confirmed persisted, requeueing");
                    self.requeue(body).await?;
                    self.delete(receipt_handle).await?;
                    metrics::record_requeued("flags_unconfirmed");
                }
            }
            Outcome::NotReady => {
                let count = self.increment_not_ready(episode_id);
                if count >= self.config.not_ready_max_attempts {
                    metrics::record_not_ready_count_exceeded();
                    self.delete(receipt_handle).await?;
                    metrics::record_deleted("not_ready_exceeded");
                    self.reset_not_ready(episode_id);
                    warn!(episode_id = %episode_id, attempts = count, "NotReady attempts exceeded, giving up");
                } else {
                    self.requeue(body).await?;
                    self.delete(receipt_handle).await?;
                    metrics::record_requeued("not_ready");
                }
            }
            Outcome::Failed => {
                debug!(episode_id = %episode_id, "handler failed, leaving message for redelivery");
            }
        }
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> QueueResult<()> {
        self.client
            .delete_message()
            .queue_url(&self.config.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::delete_failed(e.to_string()))?;
        Ok(())
    }

    async fn requeue(&self, body: &EpisodeMessage) -> QueueResult<()> {
        let payload = serde_json::to_string(body)?;
        self.client
            .send_message()
            .queue_url(&self.config.queue_url)
            .message_body(payload)
            .delay_seconds(self.config.requeue_delay_seconds)
            .send()
            .await
            .map_err(|e| QueueError::send_failed(e.to_string()))?;
        Ok(())
    }

    fn increment_not_ready(&self, episode_id: &EpisodeId) -> u32 {
        let mut counts = self.not_ready_counts.lock().expect("not_ready_counts mutex poisoned");
        let entry = counts.entry(episode_id.as_str().to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn reset_not_ready(&self, episode_id: &EpisodeId) {
        self.not_ready_counts
            .lock()
            .expect("not_ready_counts mutex poisoned")
            .remove(episode_id.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_interval_matches_spec_bounds() {
        let mut config = QueueConfig::default();
        config.visibility_timeout_seconds = 14_400;
        assert_eq!(config.heartbeat_interval_secs(), 300);

        config.visibility_timeout_seconds = 90;
        assert_eq!(config.heartbeat_interval_secs(), 60);

        config.visibility_timeout_seconds = 600;
        assert_eq!(config.heartbeat_interval_secs(), 200);
    }

    #[test]
    fn consumer_state_round_trips_through_u8() {
        assert_eq!(ConsumerState::from(ConsumerState::Draining as u8), ConsumerState::Draining);
        assert_eq!(ConsumerState::from(99), ConsumerState::Idle);
    }
}
