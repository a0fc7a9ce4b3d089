#![deny(unreachable_patterns)]
//! FFmpeg-backed transcoder: progressive MP4 clip extraction and HLS
//! rendition/master-playlist generation, all operating on local paths.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:2`
//! - Cancellation support via tokio
//! - Progressive MP4 clip extraction
//! - Three-tier HLS rendition encoding with fMP4 segments
//! - Master playlist construction and validation

pub mod clip;
pub mod command;
pub mod error;
pub mod hls;
pub mod master_playlist;
pub mod progress;

pub use clip::{extract_mp4_clip, EncodingPreset};
pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use hls::{produce_hls_renditions, validate_rendition_playlist, Rendition, RenditionTier, RENDITION_TIERS};
pub use master_playlist::{build_master_playlist, render_master_playlist, validate_master_playlist};
pub use progress::{FfmpegProgress, ProgressCallback};
