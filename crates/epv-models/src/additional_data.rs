//! `additionalData`: the free-form jsonb bag carried by episodes, quotes, and shorts.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A jsonb-merge-semantics bag of extra fields.
///
/// Reads preserve unknown keys; writes only ever add or overwrite the keys
/// this system owns (`videoLocation`, `videoQuotePath`, `videoChunkPath`,
/// `videoMasterPlaylistPath`), matching the `jsonb_set(... , true)` merge
/// behavior on the database side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdditionalData(Map<String, Value>);

impl AdditionalData {
    pub fn from_raw(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn into_raw(self) -> Map<String, Value> {
        self.0
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn video_location(&self) -> Option<&str> {
        self.str_field("videoLocation")
    }

    pub fn video_quote_path(&self) -> Option<&str> {
        self.str_field("videoQuotePath")
    }

    pub fn video_chunk_path(&self) -> Option<&str> {
        self.str_field("videoChunkPath")
    }

    pub fn video_master_playlist_path(&self) -> Option<&str> {
        self.str_field("videoMasterPlaylistPath")
    }

    /// True iff the master playlist key is present and non-empty (I4's witness field).
    pub fn has_master_playlist(&self) -> bool {
        self.video_master_playlist_path()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), Value::String(value.into()));
    }

    pub fn set_video_quote_path(&mut self, url: impl Into<String>) {
        self.set("videoQuotePath", url);
    }

    pub fn set_video_chunk_path(&mut self, url: impl Into<String>) {
        self.set("videoChunkPath", url);
    }

    pub fn set_video_master_playlist_path(&mut self, url: impl Into<String>) {
        self.set("videoMasterPlaylistPath", url);
    }

    /// Merge `other`'s keys into `self`, overwriting on conflict. Models the
    /// jsonb merge the database performs server-side; used by callers that
    /// build a diff in memory before issuing the update.
    pub fn merge(&mut self, other: &AdditionalData) {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_requires_non_empty_string() {
        let mut data = AdditionalData::default();
        assert!(!data.has_master_playlist());
        data.set_video_master_playlist_path("");
        assert!(!data.has_master_playlist());
        data.set_video_master_playlist_path("https://bucket.s3.amazonaws.com/x/master.m3u8");
        assert!(data.has_master_playlist());
    }

    #[test]
    fn merge_preserves_unrelated_keys() {
        let mut base = AdditionalData::from_raw(
            serde_json::from_str(r#"{"videoLocation": "https://x/y.mp4", "custom": 1}"#).unwrap(),
        );
        let mut patch = AdditionalData::default();
        patch.set_video_master_playlist_path("https://x/master.m3u8");
        base.merge(&patch);
        assert_eq!(base.video_location(), Some("https://x/y.mp4"));
        assert_eq!(
            base.video_master_playlist_path(),
            Some("https://x/master.m3u8")
        );
    }
}
