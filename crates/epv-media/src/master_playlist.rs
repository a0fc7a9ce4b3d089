//! Master playlist construction: the top-level `.m3u8` that references each
//! rendition with its bandwidth/resolution/codec descriptors.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::{MediaError, MediaResult};
use crate::hls::Rendition;

/// H.264 Main profile / AAC-LC codec tag used across all renditions.
const CODECS_ATTR: &str = "avc1.4d401f,mp4a.40.2";

/// Render the master playlist text referencing each rendition's own
/// playlist by filename (renditions are expected to live alongside the
/// master in the same directory).
pub fn render_master_playlist(renditions: &[Rendition]) -> MediaResult<String> {
    if renditions.is_empty() {
        return Err(MediaError::master_playlist_failed(
            "cannot build a master playlist with zero renditions",
        ));
    }

    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:7\n");

    for rendition in renditions {
        let tier = rendition.tier;
        let width = tier.height * 16 / 9;
        writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},CODECS=\"{}\"",
            tier.bandwidth_bps(),
            width,
            tier.height,
            CODECS_ATTR
        )
        .expect("writing to a String never fails");
        writeln!(out, "{}/{}", tier.name, tier.playlist_filename()).expect("writing to a String never fails");
    }

    Ok(out)
}

/// Build and write the master playlist at `output_path`, then validate it.
pub async fn build_master_playlist(
    renditions: &[Rendition],
    output_path: impl AsRef<Path>,
) -> MediaResult<()> {
    let text = render_master_playlist(renditions)?;
    let output_path = output_path.as_ref();
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(output_path, text).await?;
    validate_master_playlist(output_path).await
}

/// Validate that a master playlist is well-formed and references at least
/// one rendition.
pub async fn validate_master_playlist(path: impl AsRef<Path>) -> MediaResult<()> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        MediaError::master_playlist_failed(format!("could not read {}: {e}", path.display()))
    })?;

    if !contents.contains("#EXTM3U") {
        return Err(MediaError::master_playlist_failed(format!(
            "{} is missing #EXTM3U",
            path.display()
        )));
    }

    let stream_inf_count = contents
        .lines()
        .filter(|line| line.starts_with("#EXT-X-STREAM-INF"))
        .count();
    if stream_inf_count == 0 {
        return Err(MediaError::master_playlist_failed(format!(
            "{} references no renditions",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::RENDITION_TIERS;
    use std::path::PathBuf;

    fn sample_renditions() -> Vec<Rendition> {
        RENDITION_TIERS
            .iter()
            .map(|&tier| Rendition {
                tier,
                playlist_path: PathBuf::from(tier.playlist_filename()),
            })
            .collect()
    }

    #[test]
    fn renders_one_stream_inf_per_rendition() {
        let text = render_master_playlist(&sample_renditions()).unwrap();
        assert_eq!(text.matches("#EXT-X-STREAM-INF").count(), 3);
        assert!(text.starts_with("#EXTM3U\n#EXT-X-VERSION:7\n"));
    }

    #[test]
    fn rejects_empty_rendition_list() {
        let err = render_master_playlist(&[]).unwrap_err();
        assert!(matches!(err, MediaError::MasterPlaylistFailed(_)));
    }

    #[tokio::test]
    async fn build_then_validate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.m3u8");
        build_master_playlist(&sample_renditions(), &path)
            .await
            .unwrap();
        validate_master_playlist(&path).await.unwrap();
    }
}
