//! The `Quote` entity (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::additional_data::AdditionalData;
use crate::content_type::ContentType;
use crate::episode::EpisodeId;
use crate::time_range::TimeRange;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuoteId(pub String);

impl QuoteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QuoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Quote {
    pub quote_id: QuoteId,
    pub episode_id: EpisodeId,
    pub context: Option<TimeRange>,
    pub quote: Option<TimeRange>,
    pub content_type: ContentType,
    pub additional_data: AdditionalData,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Quote {
    /// The window to clip: prefer the wider `context` range if both bounds
    /// are positive, else fall back to the narrower `quote` range.
    pub fn clip_window(&self) -> Option<TimeRange> {
        if let Some(ctx) = self.context {
            if ctx.is_valid() {
                return Some(ctx);
            }
        }
        self.quote.filter(TimeRange::is_valid)
    }

    /// I4: satisfies the per-artifact witness.
    ///
    /// `produced_master_url`, when given, additionally requires the stored
    /// master URL to equal the URL just produced (post-hoc validation in
    /// pipeline step 10); when `None`, only presence is checked (used by the
    /// independent re-read in pipeline step 13).
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

    /// A quote is pending iff it is not yet processed (spec.md §4.3 step 5).
    /// No duration gate applies to quotes beyond the transcoder's own
    /// `< 0.1s` skip (Open Question in spec.md §9).
    pub fn is_pending(&self) -> bool {
        !self.is_processed(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(context: Option<(i64, i64)>, window: Option<(i64, i64)>) -> Quote {
        Quote {
            quote_id: QuoteId("q1".into()),
            episode_id: EpisodeId("e1".into()),
            context: context.map(|(s, e)| TimeRange::new(s, e)),
            quote: window.map(|(s, e)| TimeRange::new(s, e)),
            content_type: ContentType::Audio,
            additional_data: AdditionalData::default(),
            updated_at: None,
        }
    }

    #[test]
    fn prefers_context_window_when_valid() {
        let q = quote(Some((1000, 5000)), Some((2000, 3000)));
        assert_eq!(q.clip_window(), Some(TimeRange::new(1000, 5000)));
    }

    #[test]
    fn falls_back_to_quote_window_when_context_invalid() {
        let q = quote(Some((0, 5000)), Some((2000, 3000)));
        assert_eq!(q.clip_window(), Some(TimeRange::new(2000, 3000)));
    }

    #[test]
    fn no_window_when_both_invalid() {
        let q = quote(None, None);
        assert_eq!(q.clip_window(), None);
    }

    #[test]
    fn processed_requires_video_and_witness() {
        let mut q = quote(Some((1000, 5000)), None);
        assert!(q.is_pending());
        q.content_type = ContentType::Video;
        q.additional_data
            .set_video_master_playlist_path("https://b/x/master.m3u8");
        assert!(!q.is_pending());
        assert!(q.is_processed(Some("https://b/x/master.m3u8")));
        assert!(!q.is_processed(Some("https://b/other/master.m3u8")));
    }
}
