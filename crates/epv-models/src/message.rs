//! The queue message payload (spec.md §6).

use serde::{Deserialize, Serialize};

use crate::episode::EpisodeId;

fn deserialize_advisory_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    // Accept both JSON booleans and string-encoded booleans ("true"/"false"),
    // since upstream producers have emitted both over time.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolLike {
        Bool(bool),
        Str(String),
    }
    match Option::<BoolLike>::deserialize(deserializer)? {
        None => Ok(false),
        Some(BoolLike::Bool(b)) => Ok(b),
        Some(BoolLike::Str(s)) => Ok(matches!(s.to_ascii_lowercase().as_str(), "true" | "1")),
    }
}

/// Inbound job message body. Unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeMessage {
    #[serde(rename = "episodeId")]
    pub episode_id: EpisodeId,
    /// Advisory only: bypasses the "already processed" pending-filter for
    /// shorts, never an invariant (I1/I2/I3 still apply).
    #[serde(default, deserialize_with = "deserialize_advisory_bool")]
    pub force_video_chunking: bool,
    /// Advisory only: same as above, for quotes.
    #[serde(default, deserialize_with = "deserialize_advisory_bool")]
    pub force_video_quotes: bool,
}

impl EpisodeMessage {
    pub fn new(episode_id: EpisodeId) -> Self {
        Self {
            episode_id,
            force_video_chunking: false,
            force_video_quotes: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_ignored() {
        let msg: EpisodeMessage = serde_json::from_str(
            r#"{"episodeId": "e1", "somethingElse": 42}"#,
        )
        .unwrap();
        assert_eq!(msg.episode_id.as_str(), "e1");
        assert!(!msg.force_video_chunking);
    }

    #[test]
    fn advisory_flags_accept_string_booleans() {
        let msg: EpisodeMessage = serde_json::from_str(
            r#"{"episodeId": "e1", "force_video_chunking": "true", "force_video_quotes": false}"#,
        )
        .unwrap();
        assert!(msg.force_video_chunking);
        assert!(!msg.force_video_quotes);
    }
}
