//! `processingInfo`: the episode's jsonb map of monotonic processing flags.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The four flags this system reads and, for the `video*` pair, writes.
///
/// Stored as a jsonb column upstream; represented here as a typed view over
/// the raw object so unknown keys (written by other pipelines) survive a
/// read-modify-write round trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    #[serde(flatten)]
    raw: Map<String, Value>,
}

const CHUNKING_DONE: &str = "chunkingDone";
const QUOTING_DONE: &str = "quotingDone";
const VIDEO_CHUNKING_DONE: &str = "videoChunkingDone";
const VIDEO_QUOTING_DONE: &str = "videoQuotingDone";

impl ProcessingInfo {
    pub fn from_raw(raw: Map<String, Value>) -> Self {
        Self { raw }
    }

    pub fn into_raw(self) -> Map<String, Value> {
        self.raw
    }

    fn flag(&self, key: &str) -> bool {
        self.raw.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn chunking_done(&self) -> bool {
        self.flag(CHUNKING_DONE)
    }

    pub fn quoting_done(&self) -> bool {
        self.flag(QUOTING_DONE)
    }

    pub fn video_chunking_done(&self) -> bool {
        self.flag(VIDEO_CHUNKING_DONE)
    }

    pub fn video_quoting_done(&self) -> bool {
        self.flag(VIDEO_QUOTING_DONE)
    }

    /// Set a flag true in-place. Never clears a flag (I1: non-decreasing).
    pub fn set_true(&mut self, key: &str) {
        self.raw.insert(key.to_string(), Value::Bool(true));
    }

    pub fn set_video_chunking_done(&mut self) {
        self.set_true(VIDEO_CHUNKING_DONE);
    }

    pub fn set_video_quoting_done(&mut self) {
        self.set_true(VIDEO_QUOTING_DONE);
    }
}

/// The subset of flags a single flag-advance call is permitted to set.
///
/// `UpdateEpisodeProcessingFlags` only ever touches flags explicitly named
/// here; anything left `None` is untouched in the jsonb merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagUpdate {
    pub video_quoting_done: Option<bool>,
    pub video_chunking_done: Option<bool>,
}

impl FlagUpdate {
    pub fn is_empty(&self) -> bool {
        self.video_quoting_done.is_none() && self.video_chunking_done.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_round_trip() {
        let raw: Map<String, Value> = serde_json::from_str(
            r#"{"chunkingDone": true, "quotingDone": true, "somethingElse": 42}"#,
        )
        .unwrap();
        let mut info = ProcessingInfo::from_raw(raw);
        assert!(info.chunking_done());
        assert!(!info.video_chunking_done());
        info.set_video_chunking_done();
        assert!(info.video_chunking_done());
        assert_eq!(info.into_raw().get("somethingElse").unwrap(), &Value::from(42));
    }

    #[test]
    fn set_true_is_monotonic_by_contract() {
        let mut info = ProcessingInfo::default();
        info.set_video_quoting_done();
        assert!(info.video_quoting_done());
        // Nothing in this type exposes a way to clear it back to false.
    }
}
