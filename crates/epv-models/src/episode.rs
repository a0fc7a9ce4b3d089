//! The `Episode` entity (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::additional_data::AdditionalData;
use crate::content_type::ContentType;
use crate::processing_info::ProcessingInfo;

/// Unique identifier for an episode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(pub String);

impl EpisodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EpisodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An episode row, read by this system and partially updated by it.
///
/// This system only ever reads `content_type` (to filter down to video
/// episodes), `additional_data.videoLocation`, and `processing_info`; it
/// only ever writes `processing_info` (flag advancement), `content_type`
/// (promotion to video), and `updated_at`. All other columns the upstream
/// system owns are opaque and unused here.
#[derive(Debug, Clone)]
pub struct Episode {
    pub episode_id: EpisodeId,
    pub content_type: ContentType,
    pub additional_data: AdditionalData,
    pub processing_info: Option<ProcessingInfo>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Episode {
    /// Parsed source location: bucket, key prefix, and filename.
    ///
    /// `additionalData.videoLocation` looks like
    /// `https://{bucket}.s3.{region}.amazonaws.com/{podcast}/{episode}/{file}`.
    /// Returns `None` if the URL is absent or doesn't parse into at least a
    /// bucket host and a non-empty path.
    pub fn source_location(&self) -> Option<SourceLocation> {
        let raw = self.additional_data.video_location()?;
        SourceLocation::parse(raw)
    }
}

/// A parsed `videoLocation` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub bucket: String,
    pub key_prefix: String,
    pub filename: String,
}

impl SourceLocation {
    pub fn parse(raw: &str) -> Option<Self> {
        let url = url::Url::parse(raw).ok()?;
        let host = url.host_str()?;
        // `{bucket}.s3.{region}.amazonaws.com` — take the first label as the bucket.
        let bucket = host.split('.').next()?.to_string();
        if bucket.is_empty() {
            return None;
        }

        let mut segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
        let filename = segments.pop()?.to_string();
        if filename.is_empty() {
            return None;
        }
        let key_prefix = segments.join("/");

        Some(Self {
            bucket,
            key_prefix,
            filename,
        })
    }

    pub fn full_key(&self) -> String {
        if self.key_prefix.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.key_prefix, self.filename)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_s3_url() {
        let loc =
            SourceLocation::parse("https://b.s3.us-east-1.amazonaws.com/pod/ep/v.mp4").unwrap();
        assert_eq!(loc.bucket, "b");
        assert_eq!(loc.key_prefix, "pod/ep");
        assert_eq!(loc.filename, "v.mp4");
        assert_eq!(loc.full_key(), "pod/ep/v.mp4");
    }

    #[test]
    fn rejects_unparseable_urls() {
        assert!(SourceLocation::parse("not a url").is_none());
        assert!(SourceLocation::parse("https://b.s3.amazonaws.com/").is_none());
    }
}
