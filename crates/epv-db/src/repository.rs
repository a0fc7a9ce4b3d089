//! Persistent-store access for episodes, quotes, and shorts.
//!
//! Every write acquires a transaction-scoped, no-wait advisory lock (I6);
//! contended writes return [`WriteOutcome::Skipped`] rather than blocking.
//! Transient errors (serialization failure, deadlock, connection reset) are
//! retried with backoff; lock contention is not retried here — the caller
//! (the pipeline) decides whether and when to retry.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use epv_models::{
    AdditionalData, ChunkId, ContentType, Episode, EpisodeId, FlagUpdate, ProcessingInfo, Quote,
    QuoteId, Short, TimeRange,
};

use crate::config::RepositoryConfig;
use crate::error::{DbError, DbResult};
use crate::lock::{advisory_lock_key, LockScope};
use crate::metrics::{record_lock_contended, record_query};
use crate::retry::{with_retry, RetryConfig};

/// Outcome of a single-row write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The row was changed.
    Updated,
    /// The row already matched; nothing was written (minimal-diff no-op).
    NoOp,
    /// The advisory lock was contended; the caller should retry later.
    Skipped,
}

impl WriteOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, WriteOutcome::Updated)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, WriteOutcome::Skipped)
    }
}

/// Tally of a chunked batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub updated: usize,
    pub no_op: usize,
    pub skipped: usize,
    pub not_found: usize,
}

impl BatchResult {
    fn record(&mut self, outcome: DbResult<WriteOutcome>) -> DbResult<()> {
        match outcome {
            Ok(WriteOutcome::Updated) => self.updated += 1,
            Ok(WriteOutcome::NoOp) => self.no_op += 1,
            Ok(WriteOutcome::Skipped) => self.skipped += 1,
            Err(DbError::NotFound(_)) => self.not_found += 1,
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

pub struct Repository {
    pool: PgPool,
    config: RepositoryConfig,
    retry_config: RetryConfig,
}

impl Repository {
    pub async fn connect(config: RepositoryConfig) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;

        Ok(Self {
            pool,
            config,
            retry_config: RetryConfig::from_env(),
        })
    }

    pub async fn from_env() -> DbResult<Self> {
        Self::connect(RepositoryConfig::from_env()?).await
    }

    /// Used by the worker's startup self-check.
    pub async fn check_connectivity(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -- reads ---------------------------------------------------------

    pub async fn get_episode(&self, episode_id: &EpisodeId) -> DbResult<Option<Episode>> {
        let start = std::time::Instant::now();
        let row = sqlx::query(
            "SELECT episode_id, content_type, additional_data, processing_info, updated_at \
             FROM episodes WHERE episode_id = $1",
        )
        .bind(episode_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        record_query("get_episode", "ok", start.elapsed().as_secs_f64() * 1000.0);

        Ok(row.map(|r| episode_from_row(&r)))
    }

    pub async fn get_processing_info(
        &self,
        episode_id: &EpisodeId,
    ) -> DbResult<Option<ProcessingInfo>> {
        let row = sqlx::query("SELECT processing_info FROM episodes WHERE episode_id = $1")
            .bind(episode_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| processing_info_from_row(&r, "processing_info")))
    }

    pub async fn get_quotes_by_episode(&self, episode_id: &EpisodeId) -> DbResult<Vec<Quote>> {
        let rows = sqlx::query(
            "SELECT quote_id, episode_id, context_start_ms, context_end_ms, \
             quote_start_ms, quote_end_ms, content_type, additional_data, updated_at \
             FROM quotes WHERE episode_id = $1 AND deleted_at IS NULL",
        )
        .bind(episode_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(quote_from_row).collect())
    }

    pub async fn get_shorts_by_episode(&self, episode_id: &EpisodeId) -> DbResult<Vec<Short>> {
        let rows = sqlx::query(
            "SELECT chunk_id, episode_id, start_ms, end_ms, is_removed_chunk, \
             content_type, additional_data, updated_at \
             FROM shorts WHERE episode_id = $1 AND deleted_at IS NULL",
        )
        .bind(episode_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(short_from_row).collect())
    }

    pub async fn get_quotes_and_shorts_by_episode(
        &self,
        episode_id: &EpisodeId,
    ) -> DbResult<(Vec<Quote>, Vec<Short>)> {
        let (quotes, shorts) = tokio::try_join!(
            self.get_quotes_by_episode(episode_id),
            self.get_shorts_by_episode(episode_id)
        )?;
        Ok((quotes, shorts))
    }

    // -- writes ----------------------------------------------------------

    async fn begin_write_txn(&self) -> DbResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.config.statement_timeout_ms
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = {}",
            self.config.lock_timeout_ms
        ))
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }

    async fn try_lock(
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        scope: LockScope,
        entity_id: &str,
    ) -> DbResult<bool> {
        let key = advisory_lock_key(scope, entity_id);
        let row = sqlx::query("SELECT pg_try_advisory_xact_lock($1)")
            .bind(key)
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.get::<bool, _>(0))
    }

    /// Sets each provided flag true on `processingInfo` via a jsonb merge,
    /// touches `updatedAt`, and returns the merged value for verification.
    /// Only flags explicitly set in `update` are touched (I1: non-decreasing).
    pub async fn update_episode_processing_flags(
        &self,
        episode_id: &EpisodeId,
        update: &FlagUpdate,
    ) -> DbResult<(WriteOutcome, Option<ProcessingInfo>)> {
        if update.is_empty() {
            return Ok((WriteOutcome::NoOp, None));
        }

        with_retry(
            &self.retry_config,
            "update_episode_processing_flags",
            || self.update_episode_processing_flags_once(episode_id, update),
        )
        .await
    }

    async fn update_episode_processing_flags_once(
        &self,
        episode_id: &EpisodeId,
        update: &FlagUpdate,
    ) -> DbResult<(WriteOutcome, Option<ProcessingInfo>)> {
        let mut tx = self.begin_write_txn().await?;

        if !Self::try_lock(&mut tx, LockScope::Episode, episode_id.as_str()).await? {
            tx.rollback().await.ok();
            record_lock_contended("update_episode_processing_flags");
            return Ok((WriteOutcome::Skipped, None));
        }

        let mut expr = "COALESCE(processing_info, '{}'::jsonb)".to_string();
        if matches!(update.video_quoting_done, Some(true)) {
            expr = format!("jsonb_set({expr}, '{{videoQuotingDone}}', 'true', true)");
        }
        if matches!(update.video_chunking_done, Some(true)) {
            expr = format!("jsonb_set({expr}, '{{videoChunkingDone}}', 'true', true)");
        }

        let sql = format!(
            "UPDATE episodes SET processing_info = {expr}, updated_at = now() \
             WHERE episode_id = $1 RETURNING processing_info"
        );

        let row = sqlx::query(&sql)
            .bind(episode_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        match row {
            Some(row) => {
                tx.commit().await?;
                let info = processing_info_from_row(&row, "processing_info");
                Ok((WriteOutcome::Updated, Some(info)))
            }
            None => {
                tx.rollback().await.ok();
                Err(DbError::not_found(episode_id.as_str()))
            }
        }
    }

    /// Promotes the episode's `contentType` to `video` if it isn't already
    /// (spec.md §4.3 steps 6 and 13). A no-op once the episode is already
    /// `video`; never touches `processingInfo`.
    pub async fn promote_episode_to_video(&self, episode_id: &EpisodeId) -> DbResult<WriteOutcome> {
        with_retry(&self.retry_config, "promote_episode_to_video", || {
            self.promote_episode_to_video_once(episode_id)
        })
        .await
    }

    async fn promote_episode_to_video_once(&self, episode_id: &EpisodeId) -> DbResult<WriteOutcome> {
        let mut tx = self.begin_write_txn().await?;

        if !Self::try_lock(&mut tx, LockScope::Episode, episode_id.as_str()).await? {
            tx.rollback().await.ok();
            record_lock_contended("promote_episode_to_video");
            return Ok(WriteOutcome::Skipped);
        }

        let row = sqlx::query("SELECT content_type FROM episodes WHERE episode_id = $1 FOR UPDATE")
            .bind(episode_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Err(DbError::not_found(episode_id.as_str()));
        };

        let current: String = row.get("content_type");
        if ContentType::from_raw_str(&current).is_video() {
            tx.rollback().await.ok();
            return Ok(WriteOutcome::NoOp);
        }

        let result = sqlx::query("UPDATE episodes SET content_type = 'video', updated_at = now() WHERE episode_id = $1")
            .bind(episode_id.as_str())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(DbError::not_found(episode_id.as_str()));
        }

        tx.commit().await?;
        Ok(WriteOutcome::Updated)
    }

    /// Promotes a quote's `contentType` to `video` and stamps
    /// `videoMasterPlaylistPath`, touching `updatedAt`.
    pub async fn set_quote_master(&self, quote_id: &QuoteId, master_url: &str) -> DbResult<WriteOutcome> {
        with_retry(&self.retry_config, "set_quote_master", || {
            self.set_master_once("quotes", "quote_id", quote_id.as_str(), LockScope::Quote, master_url)
        })
        .await
    }

    /// Promotes a short's `contentType` to `video` and stamps
    /// `videoMasterPlaylistPath`, touching `updatedAt`.
    pub async fn set_short_master(&self, chunk_id: &ChunkId, master_url: &str) -> DbResult<WriteOutcome> {
        with_retry(&self.retry_config, "set_short_master", || {
            self.set_master_once("shorts", "chunk_id", chunk_id.as_str(), LockScope::Short, master_url)
        })
        .await
    }

    async fn set_master_once(
        &self,
        table: &'static str,
        id_column: &'static str,
        id: &str,
        scope: LockScope,
        master_url: &str,
    ) -> DbResult<WriteOutcome> {
        let mut tx = self.begin_write_txn().await?;

        if !Self::try_lock(&mut tx, scope, id).await? {
            tx.rollback().await.ok();
            record_lock_contended("set_master");
            return Ok(WriteOutcome::Skipped);
        }

        let sql = format!(
            "UPDATE {table} SET content_type = 'video', \
             additional_data = jsonb_set(COALESCE(additional_data, '{{}}'::jsonb), \
             '{{videoMasterPlaylistPath}}', to_jsonb($1::text), true), \
             updated_at = now() WHERE {id_column} = $2"
        );

        let result = sqlx::query(&sql)
            .bind(master_url)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(DbError::not_found(id));
        }

        tx.commit().await?;
        Ok(WriteOutcome::Updated)
    }

    /// Writes `videoQuotePath` and/or other owned keys from `data`, merging
    /// jsonb-style, and promotes `contentType` to `video`. Only columns that
    /// actually changed are written (minimal diff); if nothing changed the
    /// write is a no-op.
    pub async fn update_quote_additional_data(
        &self,
        quote_id: &QuoteId,
        data: &AdditionalData,
    ) -> DbResult<WriteOutcome> {
        with_retry(&self.retry_config, "update_quote_additional_data", || {
            self.update_additional_data_once(
                "quotes",
                "quote_id",
                quote_id.as_str(),
                LockScope::Quote,
                data,
            )
        })
        .await
    }

    /// Writes `videoChunkPath` and/or other owned keys from `data`; see
    /// [`Repository::update_quote_additional_data`].
    pub async fn update_short_additional_data(
        &self,
        chunk_id: &ChunkId,
        data: &AdditionalData,
    ) -> DbResult<WriteOutcome> {
        with_retry(&self.retry_config, "update_short_additional_data", || {
            self.update_additional_data_once(
                "shorts",
                "chunk_id",
                chunk_id.as_str(),
                LockScope::Short,
                data,
            )
        })
        .await
    }

    async fn update_additional_data_once(
        &self,
        table: &'static str,
        id_column: &'static str,
        id: &str,
        scope: LockScope,
        data: &AdditionalData,
    ) -> DbResult<WriteOutcome> {
        let mut tx = self.begin_write_txn().await?;

        if !Self::try_lock(&mut tx, scope, id).await? {
            tx.rollback().await.ok();
            record_lock_contended("update_additional_data");
            return Ok(WriteOutcome::Skipped);
        }

        let outcome = Self::apply_additional_data_update(&mut tx, table, id_column, id, data).await;

        match &outcome {
            Ok(_) => tx.commit().await?,
            Err(_) => {
                tx.rollback().await.ok();
            }
        }

        outcome
    }

    /// Reads, diffs, and (if anything changed) writes one row's
    /// `additional_data`/`content_type` inside an already-open, already-locked
    /// transaction. Shared by the single-row path and the batch path below so
    /// both apply the exact same minimal-diff semantics; the caller owns the
    /// lock acquisition and the commit/rollback decision.
    async fn apply_additional_data_update(
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        table: &'static str,
        id_column: &'static str,
        id: &str,
        data: &AdditionalData,
    ) -> DbResult<WriteOutcome> {
        let select_sql =
            format!("SELECT additional_data, content_type FROM {table} WHERE {id_column} = $1 FOR UPDATE");
        let row = sqlx::query(&select_sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;

        let Some(row) = row else {
            return Err(DbError::not_found(id));
        };

        let current_additional_data: Option<serde_json::Value> = row.get("additional_data");
        let current_content_type: String = row.get("content_type");

        let current_map = current_additional_data
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        let incoming_map = data.clone().into_raw();

        let changed_keys: Vec<String> = incoming_map
            .iter()
            .filter(|(k, v)| current_map.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .filter(|k| is_safe_jsonb_key(k))
            .collect();

        let content_type_changed = !ContentType::from_raw_str(&current_content_type).is_video();

        if changed_keys.is_empty() && !content_type_changed {
            return Ok(WriteOutcome::NoOp);
        }

        let mut expr = "COALESCE(additional_data, '{}'::jsonb)".to_string();
        let mut binds: Vec<String> = Vec::with_capacity(changed_keys.len());
        let mut placeholder_index = 2;
        for key in &changed_keys {
            let value = incoming_map
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            binds.push(value);
            expr = format!("jsonb_set({expr}, '{{{key}}}', to_jsonb(${placeholder_index}::text), true)");
            placeholder_index += 1;
        }

        let sql = format!(
            "UPDATE {table} SET content_type = 'video', additional_data = {expr}, updated_at = now() \
             WHERE {id_column} = ${placeholder_index}"
        );

        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        query = query.bind(id);

        let result = query.execute(&mut **tx).await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(id));
        }

        Ok(WriteOutcome::Updated)
    }

    /// Chunked batch write (spec.md §4.5): one transaction per chunk of
    /// [`RepositoryConfig::batch_chunk_size`] items. Within the chunk, each
    /// row is lock-tried individually with no wait — a contended row is
    /// tallied `skipped`, not an error, and never blocks the rest of the
    /// chunk. Only locked rows are written; before the chunk commits, the
    /// count of rows actually written is verified against an independent
    /// `updated_at >= marker` read, where `marker` is captured before any
    /// write in the chunk. A mismatch aborts the whole chunk's transaction —
    /// the caller sees no partial, unverified writes.
    pub async fn update_quotes_additional_data_batch(
        &self,
        items: &[(QuoteId, AdditionalData)],
    ) -> DbResult<BatchResult> {
        self.update_additional_data_batch("quotes", "quote_id", LockScope::Quote, items, |id| id.as_str())
            .await
    }

    /// See [`Repository::update_quotes_additional_data_batch`].
    pub async fn update_shorts_additional_data_batch(
        &self,
        items: &[(ChunkId, AdditionalData)],
    ) -> DbResult<BatchResult> {
        self.update_additional_data_batch("shorts", "chunk_id", LockScope::Short, items, |id| id.as_str())
            .await
    }

    async fn update_additional_data_batch<I>(
        &self,
        table: &'static str,
        id_column: &'static str,
        scope: LockScope,
        items: &[(I, AdditionalData)],
        id_as_str: impl Fn(&I) -> &str,
    ) -> DbResult<BatchResult> {
        let mut result = BatchResult::default();

        for chunk in items.chunks(self.config.batch_chunk_size.max(1)) {
            let marker = Utc::now();
            let mut tx = self.begin_write_txn().await?;

            let mut locked: Vec<(&str, &AdditionalData)> = Vec::with_capacity(chunk.len());
            for (id, data) in chunk {
                let id = id_as_str(id);
                if Self::try_lock(&mut tx, scope, id).await? {
                    locked.push((id, data));
                } else {
                    record_lock_contended("update_additional_data_batch");
                    result.skipped += 1;
                }
            }

            if locked.is_empty() {
                tx.rollback().await.ok();
                continue;
            }

            let mut written: Vec<&str> = Vec::with_capacity(locked.len());
            let mut chunk_err = None;
            for (id, data) in &locked {
                match Self::apply_additional_data_update(&mut tx, table, id_column, id, data).await {
                    Ok(WriteOutcome::Updated) => written.push(id),
                    Ok(WriteOutcome::NoOp) => result.no_op += 1,
                    Ok(WriteOutcome::Skipped) => unreachable!("row was already locked by this chunk"),
                    Err(DbError::NotFound(_)) => result.not_found += 1,
                    Err(e) => {
                        chunk_err = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = chunk_err {
                tx.rollback().await.ok();
                return Err(e);
            }

            if written.is_empty() {
                tx.commit().await?;
                continue;
            }

            let verify_sql =
                format!("SELECT count(*) FROM {table} WHERE {id_column} = ANY($1) AND updated_at >= $2");
            let verified_count: i64 = sqlx::query_scalar(&verify_sql)
                .bind(&written[..])
                .bind(marker)
                .fetch_one(&mut *tx)
                .await?;

            if verified_count as usize != written.len() {
                tx.rollback().await.ok();
                return Err(DbError::unexpected_row_count(
                    format!("{table} batch write"),
                    written.len() as u64,
                    verified_count.max(0) as u64,
                ));
            }

            tx.commit().await?;
            result.updated += written.len();
        }

        Ok(result)
    }
}

/// Keys interpolated into a `jsonb_set` path must be restricted to the
/// small set this system ever writes; this guards against ever building a
/// dynamic query fragment out of content we didn't choose ourselves.
fn is_safe_jsonb_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn episode_from_row(row: &sqlx::postgres::PgRow) -> Episode {
    let content_type: String = row.get("content_type");
    let additional_data: Option<serde_json::Value> = row.get("additional_data");
    let updated_at: Option<DateTime<Utc>> = row.get("updated_at");

    Episode {
        episode_id: EpisodeId(row.get::<String, _>("episode_id")),
        content_type: ContentType::from_raw_str(&content_type),
        additional_data: AdditionalData::from_raw(
            additional_data.and_then(|v| v.as_object().cloned()).unwrap_or_default(),
        ),
        processing_info: row
            .try_get::<Option<serde_json::Value>, _>("processing_info")
            .ok()
            .flatten()
            .map(|v| ProcessingInfo::from_raw(v.as_object().cloned().unwrap_or_default())),
        updated_at,
    }
}

fn processing_info_from_row(row: &sqlx::postgres::PgRow, column: &str) -> ProcessingInfo {
    let value: Option<serde_json::Value> = row.get(column);
    ProcessingInfo::from_raw(value.and_then(|v| v.as_object().cloned()).unwrap_or_default())
}

fn quote_from_row(row: &sqlx::postgres::PgRow) -> Quote {
    let context_start_ms: Option<i64> = row.get("context_start_ms");
    let context_end_ms: Option<i64> = row.get("context_end_ms");
    let quote_start_ms: Option<i64> = row.get("quote_start_ms");
    let quote_end_ms: Option<i64> = row.get("quote_end_ms");
    let content_type: String = row.get("content_type");
    let additional_data: Option<serde_json::Value> = row.get("additional_data");

    Quote {
        quote_id: QuoteId(row.get::<String, _>("quote_id")),
        episode_id: EpisodeId(row.get::<String, _>("episode_id")),
        context: match (context_start_ms, context_end_ms) {
            (Some(s), Some(e)) => Some(TimeRange::new(s, e)),
            _ => None,
        },
        quote: match (quote_start_ms, quote_end_ms) {
            (Some(s), Some(e)) => Some(TimeRange::new(s, e)),
            _ => None,
        },
        content_type: ContentType::from_raw_str(&content_type),
        additional_data: AdditionalData::from_raw(
            additional_data.and_then(|v| v.as_object().cloned()).unwrap_or_default(),
        ),
        updated_at: row.get("updated_at"),
    }
}

fn short_from_row(row: &sqlx::postgres::PgRow) -> Short {
    let start_ms: Option<i64> = row.get("start_ms");
    let end_ms: Option<i64> = row.get("end_ms");
    let content_type: String = row.get("content_type");
    let additional_data: Option<serde_json::Value> = row.get("additional_data");

    Short {
        chunk_id: ChunkId(row.get::<String, _>("chunk_id")),
        episode_id: EpisodeId(row.get::<String, _>("episode_id")),
        window: match (start_ms, end_ms) {
            (Some(s), Some(e)) => Some(TimeRange::new(s, e)),
            _ => None,
        },
        is_removed_chunk: row.get("is_removed_chunk"),
        content_type: ContentType::from_raw_str(&content_type),
        additional_data: AdditionalData::from_raw(
            additional_data.and_then(|v| v.as_object().cloned()).unwrap_or_default(),
        ),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonb_key_safety_rejects_punctuation() {
        assert!(is_safe_jsonb_key("videoMasterPlaylistPath"));
        assert!(!is_safe_jsonb_key("bad'key"));
        assert!(!is_safe_jsonb_key(""));
    }

    #[test]
    fn batch_result_tallies_not_found_separately_from_errors() {
        let mut result = BatchResult::default();
        result.record(Ok(WriteOutcome::Updated)).unwrap();
        result.record(Ok(WriteOutcome::Skipped)).unwrap();
        result.record(Err(DbError::not_found("q1"))).unwrap();
        assert_eq!(result.updated, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.not_found, 1);
    }
}
