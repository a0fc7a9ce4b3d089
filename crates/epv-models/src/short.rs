//! The `Short` entity (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::additional_data::AdditionalData;
use crate::content_type::ContentType;
use crate::episode::EpisodeId;
use crate::time_range::TimeRange;

/// Shorts are keyed by `chunkId` upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub String);

impl ChunkId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Minimum duration, in seconds, for a short to be a *valid chunk* (I4).
pub const MIN_SHORT_DURATION_SECS: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Short {
    pub chunk_id: ChunkId,
    pub episode_id: EpisodeId,
    pub window: Option<TimeRange>,
    pub is_removed_chunk: bool,
    pub content_type: ContentType,
    pub additional_data: AdditionalData,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Short {
    pub fn clip_window(&self) -> Option<TimeRange> {
        self.window.filter(TimeRange::is_valid)
    }

    /// A valid chunk: duration >= 1s and not marked removed.
    pub fn is_valid_chunk(&self) -> bool {
        if self.is_removed_chunk {
            return false;
        }
        self.clip_window()
            .map(|w| w.duration_secs() >= MIN_SHORT_DURATION_SECS)
            .unwrap_or(false)
    }

    pub fn is_processed(&self, produced_master_url: Option<&str>) -> bool {
        if !self.content_type.is_video() {
            return false;
        }
        let Some(stored) = self.additional_data.video_master_playlist_path() else {
            return false;
        };
        if stored.is_empty() {
            return false;
        }
        match produced_master_url {
            Some(expected) => stored == expected,
            None => true,
        }
    }

    /// A short is pending iff it is a valid chunk and not yet processed.
    pub fn is_pending(&self) -> bool {
        self.is_valid_chunk() && !self.is_processed(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(start: i64, end: i64, removed: bool) -> Short {
        Short {
            chunk_id: ChunkId("c1".into()),
            episode_id: EpisodeId("e1".into()),
            window: Some(TimeRange::new(start, end)),
            is_removed_chunk: removed,
            content_type: ContentType::Audio,
            additional_data: AdditionalData::default(),
            updated_at: None,
        }
    }

    #[test]
    fn duration_under_one_second_is_invalid() {
        let s = short(0, 900, false);
        assert!(!s.is_valid_chunk());
        assert!(!s.is_pending());
    }

    #[test]
    fn removed_chunk_is_never_pending_even_if_long() {
        let s = short(0, 10_000, true);
        assert!(!s.is_valid_chunk());
        assert!(!s.is_pending());
    }

    #[test]
    fn valid_unprocessed_chunk_is_pending() {
        let s = short(0, 10_000, false);
        assert!(s.is_valid_chunk());
        assert!(s.is_pending());
    }
}
