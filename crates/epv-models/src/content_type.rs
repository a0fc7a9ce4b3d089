//! The `contentType` column shared by episodes, quotes, and shorts.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Content type of an entity.
///
/// The upstream system has, across revisions, written both `"Video"` and
/// `"video"` into this column. Reads accept either casing; writes always
/// normalize to lowercase `"video"` (see spec Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Audio,
    Video,
    /// Any value this system doesn't recognize; preserved for round-tripping
    /// rather than rejected, since this system only ever promotes toward
    /// `Video` and never needs to branch on other upstream content types.
    Other,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Audio => "audio",
            ContentType::Video => "video",
            ContentType::Other => "other",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, ContentType::Video)
    }

    /// Parse a raw column value (not a JSON string), case-insensitively.
    /// Shared by the `Deserialize` impl and direct database row mapping.
    pub fn from_raw_str(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "video" => ContentType::Video,
            "audio" => ContentType::Audio,
            _ => ContentType::Other,
        }
    }
}

impl<'de> Deserialize<'de> for ContentType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_raw_str(&raw))
    }
}

impl Serialize for ContentType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_either_casing() {
        assert_eq!(
            serde_json::from_str::<ContentType>("\"Video\"").unwrap(),
            ContentType::Video
        );
        assert_eq!(
            serde_json::from_str::<ContentType>("\"video\"").unwrap(),
            ContentType::Video
        );
    }

    #[test]
    fn always_writes_lowercase() {
        assert_eq!(serde_json::to_string(&ContentType::Video).unwrap(), "\"video\"");
    }
}

impl PartialEq<&str> for ContentType {
    fn eq(&self, other: &&str) -> bool {
        self.as_str().eq_ignore_ascii_case(other)
    }
}
