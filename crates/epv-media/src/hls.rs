//! HLS rendition generation: fMP4-segmented, VOD-playlist renditions at
//! three fixed quality tiers.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::clip::EncodingPreset;
use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// One fixed HLS rendition tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenditionTier {
    pub name: &'static str,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl RenditionTier {
    pub const fn bandwidth_bps(&self) -> u64 {
        ((self.video_bitrate_kbps + self.audio_bitrate_kbps) as u64) * 1000
    }

    pub fn playlist_filename(&self) -> String {
        format!("{}.m3u8", self.name)
    }
}

/// The three renditions every HLS ladder produces.
pub const RENDITION_TIERS: [RenditionTier; 3] = [
    RenditionTier {
        name: "720p",
        height: 720,
        video_bitrate_kbps: 1200,
        audio_bitrate_kbps: 128,
    },
    RenditionTier {
        name: "480p",
        height: 480,
        video_bitrate_kbps: 700,
        audio_bitrate_kbps: 96,
    },
    RenditionTier {
        name: "360p",
        height: 360,
        video_bitrate_kbps: 400,
        audio_bitrate_kbps: 96,
    },
];

const SEGMENT_TARGET_DURATION_SECS: u32 = 6;

/// A produced rendition: its playlist and the directory holding its segments.
#[derive(Debug, Clone)]
pub struct Rendition {
    pub tier: RenditionTier,
    pub playlist_path: PathBuf,
}

/// Encode `source` (already windowed to the clip in question) into all three
/// HLS renditions under `output_dir`, one fMP4-segmented playlist each.
pub async fn produce_hls_renditions(
    source: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    preset: EncodingPreset,
) -> MediaResult<Vec<Rendition>> {
    let source = source.as_ref();
    let output_dir = output_dir.as_ref();
    tokio::fs::create_dir_all(output_dir).await?;

    let mut renditions = Vec::with_capacity(RENDITION_TIERS.len());
    for tier in RENDITION_TIERS {
        let rendition = produce_single_rendition(source, output_dir, tier, preset).await?;
        validate_rendition_playlist(&rendition.playlist_path).await?;
        renditions.push(rendition);
    }
    Ok(renditions)
}

async fn produce_single_rendition(
    source: &Path,
    output_dir: &Path,
    tier: RenditionTier,
    preset: EncodingPreset,
) -> MediaResult<Rendition> {
    // Each rendition gets its own subdirectory so the uploaded layout matches
    // spec.md §6: `.../hls/{rendition}/{rendition}.m3u8` alongside that
    // rendition's own segments, not a flat `hls/` directory shared by all three.
    let rendition_dir = output_dir.join(tier.name);
    tokio::fs::create_dir_all(&rendition_dir).await?;

    let playlist_path = rendition_dir.join(tier.playlist_filename());
    let segment_pattern = rendition_dir.join(format!("{}_%04d.m4s", tier.name));
    let init_segment = rendition_dir.join(format!("{}_init.mp4", tier.name));

    debug!(
        tier = tier.name,
        height = tier.height,
        "producing hls rendition"
    );

    let cmd = FfmpegCommand::new(source, &playlist_path)
        .video_filter(format!("scale=-2:{}", tier.height))
        .video_codec("libx264")
        .audio_codec("aac")
        .preset(preset.as_ffmpeg_value())
        .output_arg("-b:v")
        .output_arg(format!("{}k", tier.video_bitrate_kbps))
        .output_arg("-maxrate")
        .output_arg(format!("{}k", tier.video_bitrate_kbps))
        .output_arg("-bufsize")
        .output_arg(format!("{}k", tier.video_bitrate_kbps * 2))
        .audio_bitrate(format!("{}k", tier.audio_bitrate_kbps))
        .output_arg("-x264-params")
        .output_arg("keyint=48:min-keyint=48:scenecut=0")
        .output_arg("-f")
        .output_arg("hls")
        .output_arg("-hls_time")
        .output_arg(SEGMENT_TARGET_DURATION_SECS.to_string())
        .output_arg("-hls_playlist_type")
        .output_arg("vod")
        .output_arg("-hls_segment_type")
        .output_arg("fmp4")
        .output_arg("-hls_fmp4_init_filename")
        .output_arg(init_segment.file_name().unwrap().to_string_lossy().to_string())
        .output_arg("-hls_segment_filename")
        .output_arg(segment_pattern.to_string_lossy().to_string());

    FfmpegRunner::new().run(&cmd).await?;

    Ok(Rendition {
        tier,
        playlist_path,
    })
}

/// Validate that a rendition playlist is a well-formed VOD HLS playlist with
/// at least one segment reference.
pub async fn validate_rendition_playlist(playlist_path: impl AsRef<Path>) -> MediaResult<()> {
    let playlist_path = playlist_path.as_ref();
    let contents = tokio::fs::read_to_string(playlist_path)
        .await
        .map_err(|e| {
            MediaError::invalid_rendition_playlist(format!(
                "could not read {}: {e}",
                playlist_path.display()
            ))
        })?;

    if !contents.contains("#EXTM3U") {
        return Err(MediaError::invalid_rendition_playlist(format!(
            "{} is missing #EXTM3U",
            playlist_path.display()
        )));
    }
    if !contents.contains("#EXT-X-TARGETDURATION") {
        return Err(MediaError::invalid_rendition_playlist(format!(
            "{} is missing #EXT-X-TARGETDURATION",
            playlist_path.display()
        )));
    }

    let segment_count = contents
        .lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .count();
    if segment_count == 0 {
        return Err(MediaError::invalid_rendition_playlist(format!(
            "{} has no segment entries",
            playlist_path.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_sums_video_and_audio() {
        let tier = RENDITION_TIERS[0];
        assert_eq!(tier.bandwidth_bps(), 1_328_000);
    }

    #[test]
    fn tier_names_are_distinct() {
        let names: Vec<_> = RENDITION_TIERS.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["720p", "480p", "360p"]);
    }

    #[tokio::test]
    async fn validate_rejects_playlist_without_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.m3u8");
        tokio::fs::write(&path, "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-ENDLIST\n")
            .await
            .unwrap();
        let err = validate_rendition_playlist(&path).await.unwrap_err();
        assert!(matches!(err, MediaError::InvalidRenditionPlaylist(_)));
    }

    #[tokio::test]
    async fn validate_accepts_well_formed_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.m3u8");
        tokio::fs::write(
            &path,
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg_0000.m4s\n#EXT-X-ENDLIST\n",
        )
        .await
        .unwrap();
        validate_rendition_playlist(&path).await.unwrap();
    }
}
