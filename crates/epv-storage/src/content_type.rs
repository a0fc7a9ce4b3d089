//! MIME content-type inference by file extension.

/// Infer the content type to attach to a PUT based on the file's extension.
/// HLS playlists and fMP4 segments need their own MIME types for players
/// that sniff `Content-Type` before falling back to the extension.
pub fn infer_content_type(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if lower.ends_with(".m4s") {
        "video/iso.segment"
    } else if lower.ends_with(".mp4") {
        "video/mp4"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hls_playlist_gets_apple_mpegurl() {
        assert_eq!(infer_content_type("720p.m3u8"), "application/vnd.apple.mpegurl");
    }

    #[test]
    fn fmp4_segment_gets_iso_segment() {
        assert_eq!(infer_content_type("720p_0001.m4s"), "video/iso.segment");
    }

    #[test]
    fn unknown_extension_falls_back_to_octet_stream() {
        assert_eq!(infer_content_type("README"), "application/octet-stream");
    }
}
