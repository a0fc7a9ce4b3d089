//! Shared data models for the episode video worker.
//!
//! These types cover the three entities the pipeline reads and updates
//! (`Episode`, `Quote`, `Short`), the inbound queue message, and the
//! `Outcome` sum type the pipeline returns in place of exceptions.

pub mod additional_data;
pub mod content_type;
pub mod episode;
pub mod message;
pub mod outcome;
pub mod processing_info;
pub mod quote;
pub mod short;
pub mod time_range;

pub use additional_data::AdditionalData;
pub use content_type::ContentType;
pub use episode::{Episode, EpisodeId, SourceLocation};
pub use message::EpisodeMessage;
pub use outcome::Outcome;
pub use processing_info::{FlagUpdate, ProcessingInfo};
pub use quote::{Quote, QuoteId};
pub use short::{ChunkId, Short, MIN_SHORT_DURATION_SECS};
pub use time_range::TimeRange;
