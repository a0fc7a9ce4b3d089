//! The per-message state machine (spec.md §4.3): loads an episode, works
//! out what's left to produce, drives the transcoder, validates the
//! result, and advances the `processing_info` flags. Implements
//! [`EpisodeHandler`] so [`epv_queue::QueueConsumer`] can drive it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use epv_db::{DbResult, Repository};
use epv_models::{EpisodeId, EpisodeMessage, FlagUpdate, Outcome, Quote, Short};
use epv_queue::{EpisodeHandler, QueueResult};

use crate::metrics;
use crate::retry::jittered_sleep;
use crate::task_protection::{ProtectionEnvironment, TaskProtection};
use crate::transcoder::{ProcessEpisodeResult, Transcoder};

const FLAG_ADVANCE_MAX_ATTEMPTS: u32 = 3;
const FLAG_ADVANCE_RETRY_DELAY: Duration = Duration::from_millis(500);
const VALIDATION_JITTER_MIN: Duration = Duration::from_millis(200);
const VALIDATION_JITTER_MAX: Duration = Duration::from_millis(800);

pub struct EpisodePipeline<E: ProtectionEnvironment + 'static> {
    repository: Arc<Repository>,
    transcoder: Arc<Transcoder>,
    task_protection: Arc<TaskProtection<E>>,
}

impl<E: ProtectionEnvironment + 'static> EpisodePipeline<E> {
    pub fn new(
        repository: Arc<Repository>,
        transcoder: Arc<Transcoder>,
        task_protection: Arc<TaskProtection<E>>,
    ) -> Self {
        Self {
            repository,
            transcoder,
            task_protection,
        }
    }

    async fn handle_inner(&self, message: &EpisodeMessage) -> Outcome {
        let episode_id = &message.episode_id;

        // -- 1. Load ------------------------------------------------------
        let episode = match self.repository.get_episode(episode_id).await {
            Ok(Some(e)) => e,
            Ok(None) => {
                info!(episode_id = %episode_id, "episode not found, treating as no-op");
                return Outcome::Success;
            }
            Err(e) => {
                warn!(episode_id = %episode_id, error = %e, "failed to load episode");
                return Outcome::Failed;
            }
        };

        if !episode.content_type.is_video() {
            info!(episode_id = %episode_id, "episode is not a video episode, no-op");
            return Outcome::Success;
        }

        let Some(processing_info) = &episode.processing_info else {
            warn!(episode_id = %episode_id, "episode has no processing_info, missing precondition");
            return Outcome::Failed;
        };

        // -- 2. Preconditions ----------------------------------------------
        let Some(source) = episode.source_location() else {
            warn!(episode_id = %episode_id, "videoLocation missing or unparseable");
            return Outcome::Failed;
        };
        let source_key = source.full_key();
        let key_prefix = source.key_prefix.clone();

        let quoting_done = processing_info.quoting_done();
        let chunking_done = processing_info.chunking_done();
        let video_quoting_done = processing_info.video_quoting_done();
        let video_chunking_done = processing_info.video_chunking_done();

        // -- 3. Short-circuit ------------------------------------------------
        if video_chunking_done && video_quoting_done {
            // Defensively check for the I3 anomaly even though there's
            // nothing left to advance: if this episode already reports both
            // flags done but its item lists are empty, that's still an
            // upstream invariant worth a metric.
            if let Ok((quotes, shorts)) = self.repository.get_quotes_and_shorts_by_episode(episode_id).await {
                if quoting_done && quotes.is_empty() {
                    metrics::record_zero_quotes(episode_id.as_str());
                    metrics::record_zero_quotes_unexpected(episode_id.as_str());
                }
                if chunking_done && shorts.is_empty() {
                    metrics::record_zero_chunks(episode_id.as_str());
                    metrics::record_zero_chunks_unexpected(episode_id.as_str());
                }
            }
            info!(episode_id = %episode_id, "both video flags already done, no-op");
            return Outcome::Success;
        }

        // -- 4. Inventory ----------------------------------------------------
        let should_read_quotes = quoting_done && !video_quoting_done;
        let should_read_chunks = chunking_done && !video_chunking_done;

        let (all_quotes, all_shorts) = match self.load_inventory(episode_id, should_read_quotes, should_read_chunks).await {
            Ok(v) => v,
            Err(e) => {
                warn!(episode_id = %episode_id, error = %e, "failed to read quotes/shorts");
                return Outcome::Failed;
            }
        };

        if should_read_quotes && all_quotes.is_empty() {
            metrics::record_zero_quotes(episode_id.as_str());
            metrics::record_zero_quotes_unexpected(episode_id.as_str());
        }
        if should_read_chunks && all_shorts.is_empty() {
            metrics::record_zero_chunks(episode_id.as_str());
            metrics::record_zero_chunks_unexpected(episode_id.as_str());
        }

        // -- 5. Filter pending -------------------------------------------------
        // force_video_quotes/force_video_chunking are advisory: they widen
        // the pending set to include already-processed items so they get
        // re-transcoded, but never bypass I1/I2/I3, which live entirely in
        // advance_flags's independent re-read.
        let pending_quotes: Vec<Quote> = all_quotes
            .iter()
            .filter(|q| q.is_pending() || message.force_video_quotes)
            .cloned()
            .collect();
        let pending_shorts: Vec<Short> = all_shorts
            .iter()
            .filter(|s| s.is_pending() || message.force_video_chunking)
            .cloned()
            .collect();

        // -- 6. Fast finalize --------------------------------------------------
        if pending_quotes.is_empty() && pending_shorts.is_empty() {
            return self
                .finalize_without_transcoding(episode_id, &all_quotes, &all_shorts, should_read_quotes, should_read_chunks)
                .await;
        }

        // -- 7. Mark critical ----------------------------------------------------
        self.task_protection.add_critical(episode_id.as_str()).await;

        // -- 8. Record marker ----------------------------------------------------
        let validation_marker = Utc::now();

        // -- 9. Produce artifacts --------------------------------------------------
        let produced = match self
            .transcoder
            .process_episode(&source_key, &key_prefix, &pending_shorts, &pending_quotes)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(episode_id = %episode_id, error = %e, "transcode failed");
                self.task_protection.remove_critical(episode_id.as_str()).await;
                return Outcome::Failed;
            }
        };

        // -- 10-11. Validate, with one jittered retry ---------------------------
        let mut validation = self
            .validate(episode_id, &pending_quotes, &pending_shorts, &produced, validation_marker)
            .await;

        if let Err(e) = &validation {
            warn!(episode_id = %episode_id, reason = %e, "validation failed, retrying once after jitter");
            jittered_sleep(VALIDATION_JITTER_MIN, VALIDATION_JITTER_MAX).await;
            validation = self
                .validate(episode_id, &pending_quotes, &pending_shorts, &produced, validation_marker)
                .await;
        }

        // -- 12. Decide -----------------------------------------------------------
        if let Err(e) = validation {
            warn!(episode_id = %episode_id, reason = %e, "validation failed after retry, not ready");
            self.task_protection.remove_critical(episode_id.as_str()).await;
            return Outcome::NotReady;
        }

        // -- 13. Advance flags ------------------------------------------------------
        let advanced = self
            .advance_flags(episode_id, should_read_quotes, should_read_chunks)
            .await;

        self.task_protection.remove_critical(episode_id.as_str()).await;

        match advanced {
            Ok(()) => Outcome::Success,
            Err(()) => {
                metrics::record_update_processing_flags_failure(episode_id.as_str());
                Outcome::Failed
            }
        }
    }

    async fn load_inventory(
        &self,
        episode_id: &EpisodeId,
        should_read_quotes: bool,
        should_read_chunks: bool,
    ) -> DbResult<(Vec<Quote>, Vec<Short>)> {
        let quotes = if should_read_quotes {
            self.repository.get_quotes_by_episode(episode_id).await?
        } else {
            Vec::new()
        };
        let shorts = if should_read_chunks {
            self.repository.get_shorts_by_episode(episode_id).await?
        } else {
            Vec::new()
        };
        Ok((quotes, shorts))
    }

    /// Step 6: nothing is pending. Re-checks completeness (all existing
    /// items processed per I4) and advances whichever flags now qualify.
    async fn finalize_without_transcoding(
        &self,
        episode_id: &EpisodeId,
        _all_quotes: &[Quote],
        _all_shorts: &[Short],
        should_read_quotes: bool,
        should_read_chunks: bool,
    ) -> Outcome {
        // advance_flags recomputes completeness from a fresh re-read and
        // suppresses a flag advance with zero backing items (I3).
        match self.advance_flags(episode_id, should_read_quotes, should_read_chunks).await {
            Ok(()) => Outcome::Success,
            Err(()) => {
                metrics::record_update_processing_flags_failure(episode_id.as_str());
                Outcome::Failed
            }
        }
    }

    /// Step 10: re-read quotes/shorts in a fresh snapshot and confirm every
    /// pending item now satisfies I4 against the URL the transcoder
    /// reported, was touched at or after `validation_marker`, and that the
    /// produced-URL count matches the pending-id count.
    async fn validate(
        &self,
        episode_id: &EpisodeId,
        pending_quotes: &[Quote],
        pending_shorts: &[Short],
        produced: &ProcessEpisodeResult,
        validation_marker: chrono::DateTime<Utc>,
    ) -> Result<(), String> {
        let (fresh_quotes, fresh_shorts) = self
            .repository
            .get_quotes_and_shorts_by_episode(episode_id)
            .await
            .map_err(|e| format!("re-read failed: {e}"))?;

        if produced.quotes.len() != pending_quotes.len() {
            return Err(format!(
                "quote count mismatch: {} produced vs {} pending",
                produced.quotes.len(),
                pending_quotes.len()
            ));
        }
        if produced.shorts.len() != pending_shorts.len() {
            return Err(format!(
                "short count mismatch: {} produced vs {} pending",
                produced.shorts.len(),
                pending_shorts.len()
            ));
        }

        for artifact in &produced.quotes {
            let Some(quote) = fresh_quotes.iter().find(|q| q.quote_id.as_str() == artifact.id) else {
                return Err(format!("quote {} missing from re-read snapshot", artifact.id));
            };
            validate_item(
                &artifact.id,
                quote.is_processed(Some(&artifact.hls_master_url)),
                quote.updated_at,
                validation_marker,
            )?;
        }

        for artifact in &produced.shorts {
            let Some(short) = fresh_shorts.iter().find(|s| s.chunk_id.as_str() == artifact.id) else {
                return Err(format!("short {} missing from re-read snapshot", artifact.id));
            };
            validate_item(
                &artifact.id,
                short.is_processed(Some(&artifact.hls_master_url)),
                short.updated_at,
                validation_marker,
            )?;
        }

        Ok(())
    }

    /// Step 13: recompute category completion from an independent re-read
    /// (not the just-produced artifacts) and advance whichever flags now
    /// qualify, retrying the write up to [`FLAG_ADVANCE_MAX_ATTEMPTS`] times.
    async fn advance_flags(
        &self,
        episode_id: &EpisodeId,
        should_advance_quoting: bool,
        should_advance_chunking: bool,
    ) -> Result<(), ()> {
        if !should_advance_quoting && !should_advance_chunking {
            return Ok(());
        }

        let (quotes, shorts) = match self.repository.get_quotes_and_shorts_by_episode(episode_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(episode_id = %episode_id, error = %e, "re-read for flag advance failed");
                return Err(());
            }
        };

        let mut update = FlagUpdate::default();

        let mut any_category_complete = false;

        if should_advance_quoting {
            let quoting_complete = !quotes.is_empty() && quotes.iter().all(|q| q.is_processed(None));
            if quotes.is_empty() {
                warn!(episode_id = %episode_id, "quoting category has zero quotes, suppressing flag advance (I3)");
            } else if quoting_complete {
                update.video_quoting_done = Some(true);
                any_category_complete = true;
            }
        }

        if should_advance_chunking {
            // Completeness is judged over *valid chunks* only: a short that
            // is too brief or marked removed is never expected to produce
            // output, so it must not block the category forever the way a
            // genuinely unprocessed valid short would.
            let valid_shorts: Vec<&Short> = shorts.iter().filter(|s| s.is_valid_chunk()).collect();
            let chunking_complete = !valid_shorts.is_empty() && valid_shorts.iter().all(|s| s.is_processed(None));
            if valid_shorts.is_empty() {
                warn!(episode_id = %episode_id, "chunking category has zero valid shorts, suppressing flag advance (I3)");
            } else if chunking_complete {
                update.video_chunking_done = Some(true);
                any_category_complete = true;
            }
        }

        if any_category_complete {
            if let Err(e) = self.repository.promote_episode_to_video(episode_id).await {
                warn!(episode_id = %episode_id, error = %e, "failed to promote episode content_type to video");
            }
        }

        if update.is_empty() {
            return Ok(());
        }

        for attempt in 1..=FLAG_ADVANCE_MAX_ATTEMPTS {
            match self.repository.update_episode_processing_flags(episode_id, &update).await {
                Ok((outcome, _)) if outcome.is_updated() || !outcome.is_skipped() => return Ok(()),
                Ok(_) => {
                    warn!(episode_id = %episode_id, attempt, "flag advance write skipped (lock contended)");
                }
                Err(e) => {
                    warn!(episode_id = %episode_id, attempt, error = %e, "flag advance write failed");
                }
            }
            if attempt < FLAG_ADVANCE_MAX_ATTEMPTS {
                tokio::time::sleep(FLAG_ADVANCE_RETRY_DELAY).await;
            }
        }

        Err(())
    }
}

fn validate_item(
    id: &str,
    is_processed: bool,
    updated_at: Option<chrono::DateTime<Utc>>,
    validation_marker: chrono::DateTime<Utc>,
) -> Result<(), String> {
    if !is_processed {
        return Err(format!("{id} does not satisfy the per-artifact witness"));
    }
    match updated_at {
        Some(ts) if ts >= validation_marker => Ok(()),
        Some(_) => Err(format!("{id} was updated before the validation marker")),
        None => Err(format!("{id} has no updated_at timestamp")),
    }
}

#[async_trait]
impl<E: ProtectionEnvironment + 'static> EpisodeHandler for EpisodePipeline<E> {
    /// Runs the state machine on an isolated task so a panic anywhere in the
    /// chain (transcoder, repository row-conversion, etc.) can't take the
    /// consumer loop down with it — the closest Rust equivalent of the
    /// source's "unhandled exception" catch-all (spec.md §4.3 Failure
    /// semantics), surfaced here as `Outcome::Failed` plus a metric.
    async fn handle(&self, message: &EpisodeMessage) -> Outcome {
        let repository = self.repository.clone();
        let transcoder = self.transcoder.clone();
        let task_protection = self.task_protection.clone();
        let message = message.clone();
        let episode_id = message.episode_id.clone();

        let isolated = Self {
            repository,
            transcoder,
            task_protection,
        };

        match tokio::spawn(async move { isolated.handle_inner(&message).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                warn!(episode_id = %episode_id, error = %join_err, "handler task panicked");
                // A panic between add_critical (step 7) and its matching
                // remove_critical unwinds the spawned task before the cleanup
                // call runs, leaking the token. Clear it here unconditionally
                // — remove_critical on an id that was never added is a no-op.
                self.task_protection.remove_critical(episode_id.as_str()).await;
                metrics::record_unhandled_exception(episode_id.as_str());
                Outcome::Failed
            }
        }
    }

    /// Re-confirms flag advancement for an episode the consumer believes
    /// finished: re-reads `processing_info` and, if the independent
    /// recompute now qualifies a flag that isn't yet set, writes it.
    async fn ensure_flags_after_success(&self, episode_id: &EpisodeId) -> QueueResult<bool> {
        let info = match self.repository.get_processing_info(episode_id).await {
            Ok(Some(info)) => info,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(episode_id = %episode_id, error = %e, "re-read for ensure_flags_after_success failed");
                return Ok(false);
            }
        };

        let should_advance_quoting = info.quoting_done() && !info.video_quoting_done();
        let should_advance_chunking = info.chunking_done() && !info.video_chunking_done();

        if !should_advance_quoting && !should_advance_chunking {
            return Ok(true);
        }

        Ok(self
            .advance_flags(episode_id, should_advance_quoting, should_advance_chunking)
            .await
            .is_ok())
    }

    async fn video_flags_both_done(&self, episode_id: &EpisodeId) -> QueueResult<bool> {
        match self.repository.get_processing_info(episode_id).await {
            Ok(info) => Ok(info.map(|i| i.video_quoting_done() && i.video_chunking_done()).unwrap_or(false)),
            Err(e) => {
                warn!(episode_id = %episode_id, error = %e, "re-read for video_flags_both_done failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epv_models::{QuoteId, TimeRange};

    fn sample_quote(processed: bool) -> Quote {
        let mut additional = epv_models::AdditionalData::default();
        if processed {
            additional.set_video_master_playlist_path("https://b/x/master.m3u8");
        }
        Quote {
            quote_id: QuoteId("q1".into()),
            episode_id: EpisodeId("e1".into()),
            context: Some(TimeRange::new(1000, 5000)),
            quote: None,
            content_type: if processed { epv_models::ContentType::Video } else { epv_models::ContentType::Audio },
            additional_data: additional,
            updated_at: Some(Utc::now()),
        }
    }

    #[test]
    fn validate_item_rejects_stale_timestamp() {
        let marker = Utc::now();
        let stale = marker - chrono::Duration::seconds(5);
        let err = validate_item("q1", true, Some(stale), marker).unwrap_err();
        assert!(err.contains("before the validation marker"));
    }

    #[test]
    fn validate_item_accepts_fresh_processed_witness() {
        let marker = Utc::now();
        let fresh = marker + chrono::Duration::seconds(1);
        assert!(validate_item("q1", true, Some(fresh), marker).is_ok());
    }

    #[test]
    fn sample_quote_is_pending_until_processed() {
        assert!(sample_quote(false).is_pending());
        assert!(!sample_quote(true).is_pending());
    }
}
