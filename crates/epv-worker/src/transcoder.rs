//! `Transcoder.ProcessEpisode` (spec.md §4.4): downloads the source video
//! once, then fans out clip extraction, HLS rendition encoding, master
//! playlist construction, upload, and the two repository writes across a
//! bounded worker pool — one task per pending quote or short.
//!
//! Kept in `epv-worker` rather than `epv-media` because it orchestrates
//! across three crates (`epv-media`'s ffmpeg calls, `epv-storage`'s
//! uploads, `epv-db`'s writes); `epv-media` itself stays free of storage
//! and database dependencies.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use epv_db::{Repository, WriteOutcome};
use epv_media::{build_master_playlist, extract_mp4_clip, produce_hls_renditions, EncodingPreset, MediaError};
use epv_models::{AdditionalData, ChunkId, Quote, QuoteId, Short, TimeRange};
use epv_storage::ArtifactStore;

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::{with_retry, RetryConfig};

/// Quotes shorter than this (seconds) are skipped as not worth a clip.
const MIN_QUOTE_DURATION_SECS: f64 = 0.1;
const MIN_SHORT_DURATION_SECS: f64 = 1.0;
const ENCODE_MAX_ATTEMPTS: u32 = 3;
const DB_WRITE_MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Quote,
    Short,
}

impl ItemKind {
    fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Quote => "quote",
            ItemKind::Short => "short",
        }
    }
}

struct PendingItem {
    kind: ItemKind,
    id: String,
    window: TimeRange,
}

/// One successfully produced artifact: the HLS master URL and the
/// progressive MP4 URL, keyed by the quote/short id that produced it.
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub id: String,
    pub hls_master_url: String,
    pub mp4_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessEpisodeResult {
    pub quotes: Vec<ArtifactRecord>,
    pub shorts: Vec<ArtifactRecord>,
}

pub struct Transcoder {
    artifact_store: Arc<ArtifactStore>,
    repository: Arc<Repository>,
    processing_semaphore: Arc<Semaphore>,
    upload_semaphore: Arc<Semaphore>,
    preset: EncodingPreset,
}

impl Transcoder {
    pub fn new(
        artifact_store: Arc<ArtifactStore>,
        repository: Arc<Repository>,
        max_concurrent_processing: usize,
        max_concurrent_uploads: usize,
    ) -> Self {
        let upload_permits = max_concurrent_uploads.clamp(2, 16);
        Self {
            artifact_store,
            repository,
            processing_semaphore: Arc::new(Semaphore::new(max_concurrent_processing.max(1))),
            upload_semaphore: Arc::new(Semaphore::new(upload_permits)),
            preset: EncodingPreset::from_env(),
        }
    }

    /// Downloads `source_key` once, processes every pending quote and short
    /// in parallel, and returns the artifacts that made it all the way
    /// through encode, upload, and both database writes. Items that fail at
    /// any stage are simply omitted; §4.3's validation step is what notices
    /// a short count.
    pub async fn process_episode(
        &self,
        source_key: &str,
        key_prefix: &str,
        pending_shorts: &[Short],
        pending_quotes: &[Quote],
    ) -> WorkerResult<ProcessEpisodeResult> {
        let work_dir = tempfile::tempdir().map_err(WorkerError::Io)?;
        let source_path = work_dir.path().join("source");

        self.artifact_store
            .download_file(source_key, &source_path)
            .await
            .map_err(|e| WorkerError::source_download_failed(e.to_string()))?;

        let items = self.collect_pending_items(pending_quotes, pending_shorts);

        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let item_dir = work_dir.path().join(format!("{}_{}", item.kind.as_str(), item.id));
            let source_path = source_path.clone();
            let processing_semaphore = self.processing_semaphore.clone();
            let upload_semaphore = self.upload_semaphore.clone();
            let artifact_store = self.artifact_store.clone();
            let repository = self.repository.clone();
            let preset = self.preset;
            let key_prefix = key_prefix.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = processing_semaphore
                    .acquire()
                    .await
                    .expect("processing semaphore is never closed");

                process_one_item(
                    &item,
                    &source_path,
                    &item_dir,
                    &key_prefix,
                    preset,
                    &artifact_store,
                    &repository,
                    &upload_semaphore,
                )
                .await
            }));
        }

        let mut result = ProcessEpisodeResult::default();
        for handle in handles {
            match handle.await {
                Ok(Some((ItemKind::Quote, record))) => result.quotes.push(record),
                Ok(Some((ItemKind::Short, record))) => result.shorts.push(record),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "per-item processing task panicked"),
            }
        }

        info!(
            quotes_produced = result.quotes.len(),
            shorts_produced = result.shorts.len(),
            "transcoder finished episode"
        );

        Ok(result)
    }

    fn collect_pending_items(&self, pending_quotes: &[Quote], pending_shorts: &[Short]) -> Vec<PendingItem> {
        let mut items = Vec::with_capacity(pending_quotes.len() + pending_shorts.len());

        for quote in pending_quotes {
            let Some(window) = quote.clip_window() else {
                warn!(quote_id = %quote.quote_id, "pending quote has no usable clip window, skipping");
                continue;
            };
            if window.duration_secs() < MIN_QUOTE_DURATION_SECS {
                warn!(quote_id = %quote.quote_id, "pending quote window too short, skipping");
                continue;
            }
            items.push(PendingItem {
                kind: ItemKind::Quote,
                id: quote.quote_id.as_str().to_string(),
                window,
            });
        }

        for short in pending_shorts {
            let Some(window) = short.clip_window() else {
                warn!(chunk_id = %short.chunk_id, "pending short has no usable clip window, skipping");
                continue;
            };
            if window.duration_secs() < MIN_SHORT_DURATION_SECS {
                warn!(chunk_id = %short.chunk_id, "pending short window too short, skipping");
                continue;
            }
            items.push(PendingItem {
                kind: ItemKind::Short,
                id: short.chunk_id.as_str().to_string(),
                window,
            });
        }

        items
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_one_item(
    item: &PendingItem,
    source_path: &Path,
    item_dir: &Path,
    key_prefix: &str,
    preset: EncodingPreset,
    artifact_store: &ArtifactStore,
    repository: &Repository,
    upload_semaphore: &Semaphore,
) -> Option<(ItemKind, ArtifactRecord)> {
    let mp4_path = item_dir.join("clip.mp4");
    let hls_dir = item_dir.join("hls");
    let master_path = hls_dir.join("master.m3u8");

    let start_secs = item.window.start_ms as f64 / 1000.0;
    let duration_secs = item.window.duration_secs();

    let clip_config = RetryConfig::new(
        format!("extract_mp4_clip({})", item.id),
        ENCODE_MAX_ATTEMPTS,
        Duration::from_millis(500),
    );
    if let Err(e) = with_retry(&clip_config, MediaError::is_retryable, || {
        extract_mp4_clip(source_path, start_secs, duration_secs, &mp4_path, preset)
    })
    .await
    {
        warn!(item_id = %item.id, kind = item.kind.as_str(), error = %e, "clip extraction failed, giving up on item");
        return None;
    }

    let hls_config = RetryConfig::new(
        format!("produce_hls_renditions({})", item.id),
        ENCODE_MAX_ATTEMPTS,
        Duration::from_millis(500),
    );
    let renditions = match with_retry(&hls_config, MediaError::is_retryable, || {
        produce_hls_renditions(&mp4_path, &hls_dir, preset)
    })
    .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(item_id = %item.id, kind = item.kind.as_str(), error = %e, "HLS rendition encoding failed, giving up on item");
            return None;
        }
    };

    if let Err(e) = build_master_playlist(&renditions, &master_path).await {
        warn!(item_id = %item.id, kind = item.kind.as_str(), error = %e, "master playlist construction failed");
        return None;
    }

    // `{podcast}/{episode}/{itemId}/video/...` — the kind (quote vs short)
    // never appears in the key, since item ids are unique across both.
    let item_key_prefix = format!("{}/{}/video", key_prefix.trim_end_matches('/'), item.id);
    let mp4_key = format!("{item_key_prefix}/{}.mp4", item.id);

    let (hls_url, mp4_url) = {
        let _permit = upload_semaphore.acquire().await.expect("upload semaphore is never closed");

        if let Err(e) = artifact_store.upload_tree(&hls_dir, &format!("{item_key_prefix}/hls")).await {
            warn!(item_id = %item.id, kind = item.kind.as_str(), error = %e, "uploading HLS tree failed");
            return None;
        }
        if let Err(e) = artifact_store.upload_file(&mp4_path, &mp4_key).await {
            warn!(item_id = %item.id, kind = item.kind.as_str(), error = %e, "uploading progressive mp4 failed");
            return None;
        }

        let master_key = format!("{item_key_prefix}/hls/master.m3u8");
        (artifact_store.public_url(&master_key), artifact_store.public_url(&mp4_key))
    };

    let wrote = write_artifact_to_repository(item, repository, &hls_url, &mp4_url).await;
    if !wrote {
        metrics::record_db_update_retry_failed(item.kind.as_str(), &item.id);
        return None;
    }

    Some((
        item.kind,
        ArtifactRecord {
            id: item.id.clone(),
            hls_master_url: hls_url,
            mp4_url,
        },
    ))
}

async fn write_artifact_to_repository(
    item: &PendingItem,
    repository: &Repository,
    hls_url: &str,
    mp4_url: &str,
) -> bool {
    let mut data = AdditionalData::default();
    match item.kind {
        ItemKind::Quote => data.set_video_quote_path(mp4_url),
        ItemKind::Short => data.set_video_chunk_path(mp4_url),
    }

    let set_master = match item.kind {
        ItemKind::Quote => {
            retry_write(&format!("set_quote_master({})", item.id), || {
                repository.set_quote_master(&QuoteId(item.id.clone()), hls_url)
            })
            .await
        }
        ItemKind::Short => {
            retry_write(&format!("set_short_master({})", item.id), || {
                repository.set_short_master(&ChunkId(item.id.clone()), hls_url)
            })
            .await
        }
    };

    if !matches!(set_master, Ok(WriteOutcome::Updated) | Ok(WriteOutcome::NoOp)) {
        warn!(item_id = %item.id, kind = item.kind.as_str(), "set_master exhausted retries without success");
        return false;
    }

    let update_data = match item.kind {
        ItemKind::Quote => {
            retry_write(&format!("update_quote_additional_data({})", item.id), || {
                repository.update_quote_additional_data(&QuoteId(item.id.clone()), &data)
            })
            .await
        }
        ItemKind::Short => {
            retry_write(&format!("update_short_additional_data({})", item.id), || {
                repository.update_short_additional_data(&ChunkId(item.id.clone()), &data)
            })
            .await
        }
    };

    matches!(update_data, Ok(WriteOutcome::Updated) | Ok(WriteOutcome::NoOp))
}

/// Retries a repository write up to [`DB_WRITE_MAX_ATTEMPTS`] times whenever
/// it comes back `Skipped` (lock contention). The repository's own retry
/// loop already covers transient postgres errors; this loop exists because
/// a no-wait advisory-lock miss is a successful `Ok` value, not an `Err`,
/// so it needs its own retry policy at this layer.
async fn retry_write<F, Fut>(name: &str, op: F) -> epv_db::DbResult<WriteOutcome>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = epv_db::DbResult<WriteOutcome>>,
{
    let mut delay = Duration::from_millis(100);
    let mut last = op().await;
    for attempt in 1..DB_WRITE_MAX_ATTEMPTS {
        match &last {
            Ok(WriteOutcome::Skipped) => {
                warn!(operation = name, attempt, "write skipped (lock contended), retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(5));
                last = op().await;
            }
            _ => break,
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_key_prefix_pluralizes_kind() {
        assert_eq!(ItemKind::Quote.as_str(), "quote");
        assert_eq!(ItemKind::Short.as_str(), "short");
    }
}
