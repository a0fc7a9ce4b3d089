//! SQS-backed queue consumer.
//!
//! This crate provides:
//! - Long-polling receive with a visibility heartbeat while a handler runs
//! - Outcome routing (delete / requeue / leave-for-redelivery)
//! - In-memory NotReady escalation and empty-poll backoff

pub mod config;
pub mod consumer;
pub mod error;
pub mod heartbeat;
pub mod metrics;

pub use config::QueueConfig;
pub use consumer::{ConsumerState, EpisodeHandler, QueueConsumer};
pub use error::{QueueError, QueueResult};
