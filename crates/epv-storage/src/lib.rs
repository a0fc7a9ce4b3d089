//! S3-compatible artifact store for transcoded episode renditions.
//!
//! This crate provides:
//! - Single-PUT and multipart upload, switching on file size
//! - Whole-directory tree upload for a rendition ladder + master playlist
//! - HEAD-based upload verification
//! - Content-type inference for HLS playlists and fMP4 segments

pub mod client;
pub mod content_type;
pub mod error;

pub use client::{
    ArtifactStore, ArtifactStoreConfig, DEFAULT_SINGLE_PUT_MAX_BYTES, MULTIPART_PART_SIZE_BYTES,
};
pub use content_type::infer_content_type;
pub use error::{StorageError, StorageResult};
