//! S3-compatible artifact store client.

use std::path::Path;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::content_type::infer_content_type;
use crate::error::{StorageError, StorageResult};

/// Default single-PUT ceiling (`S3_SINGLE_PUT_MAX_BYTES`): objects above this
/// size use a multipart upload instead.
pub const DEFAULT_SINGLE_PUT_MAX_BYTES: u64 = 128 * 1024 * 1024;
/// Part size used once a transfer crosses the single-PUT ceiling.
pub const MULTIPART_PART_SIZE_BYTES: u64 = 64 * 1024 * 1024;

/// HEAD-verification attempts for the HLS master playlist key.
const MASTER_HEAD_VERIFY_ATTEMPTS: u32 = 3;
/// HEAD-verification attempts for a rendition playlist or segment key.
const RENDITION_HEAD_VERIFY_ATTEMPTS: u32 = 2;
const HEAD_VERIFY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Configuration for the artifact store client. Works against AWS S3 or any
/// S3-compatible endpoint (the `endpoint_url` override exists for the
/// latter; leave it unset to talk to AWS directly).
#[derive(Debug, Clone)]
pub struct ArtifactStoreConfig {
    pub endpoint_url: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub region: String,
    /// Resolved CA bundle path, if any (see [`resolve_ca_bundle_path`]).
    pub ca_bundle_path: Option<String>,
    /// `S3_SINGLE_PUT_MAX_BYTES`: objects at or below this size use a single
    /// PUT; larger ones go through the multipart path.
    pub single_put_max_bytes: u64,
}

impl ArtifactStoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("ARTIFACT_STORE_ENDPOINT_URL").ok(),
            access_key_id: std::env::var("ARTIFACT_STORE_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("ARTIFACT_STORE_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("ARTIFACT_STORE_SECRET_ACCESS_KEY").map_err(|_| {
                StorageError::config_error("ARTIFACT_STORE_SECRET_ACCESS_KEY not set")
            })?,
            bucket_name: std::env::var("ARTIFACT_STORE_BUCKET_NAME")
                .map_err(|_| StorageError::config_error("ARTIFACT_STORE_BUCKET_NAME not set"))?,
            region: std::env::var("ARTIFACT_STORE_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            ca_bundle_path: resolve_ca_bundle_path(std::env::var("ARTIFACT_STORE_CA_BUNDLE_PATH").ok()),
            single_put_max_bytes: std::env::var("S3_SINGLE_PUT_MAX_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SINGLE_PUT_MAX_BYTES),
        })
    }
}

/// Whether `key` names an HLS master playlist rather than a rendition
/// playlist or segment (spec.md §6 key layout: `.../video/hls/master.m3u8`).
fn is_master_key(key: &str) -> bool {
    key.rsplit('/').next() == Some("master.m3u8")
}

/// A CA bundle pointer that names a file which doesn't exist is a common
/// misconfiguration (a stale path baked into an image, a volume that didn't
/// mount); rather than aborting TLS setup over it, ignore the pointer and
/// fall back to the SDK's own default trust store (spec.md §4.6).
fn resolve_ca_bundle_path(raw: Option<String>) -> Option<String> {
    let path = raw?;
    if Path::new(&path).is_file() {
        Some(path)
    } else {
        warn!(path, "CA bundle path does not exist, ignoring and using default trust store");
        None
    }
}

/// S3-compatible artifact store: uploads rendition trees and clips produced
/// by the transcoder, with HEAD-based verification after each write.
#[derive(Clone)]
pub struct ArtifactStore {
    client: Client,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    single_put_max_bytes: u64,
}

impl ArtifactStore {
    /// Create a new client from explicit configuration.
    pub async fn new(config: ArtifactStoreConfig) -> StorageResult<Self> {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "artifact-store",
        );

        // rustls-tls-native-roots resolves trust via the OS store unless
        // SSL_CERT_FILE points elsewhere; this is the standard hook
        // operators use to pin a custom CA bundle.
        if let Some(path) = &config.ca_bundle_path {
            std::env::set_var("SSL_CERT_FILE", path);
        }

        let region = config.region.clone();
        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);

        if let Some(endpoint_url) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        Ok(Self {
            client,
            bucket: config.bucket_name,
            region,
            endpoint_url: config.endpoint_url,
            single_put_max_bytes: config.single_put_max_bytes,
        })
    }

    /// The public URL an uploaded `key` is reachable at: the configured
    /// endpoint (path-style) against an S3-compatible store, or the
    /// standard virtual-hosted AWS form otherwise.
    pub fn public_url(&self, key: &str) -> String {
        match &self.endpoint_url {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }

    /// Create from environment variables.
    pub async fn from_env() -> StorageResult<Self> {
        let config = ArtifactStoreConfig::from_env()?;
        Self::new(config).await
    }

    /// Upload a single file, choosing single-PUT or multipart transfer based
    /// on its size, then verify it landed via a HEAD request.
    pub async fn upload_file(&self, path: impl AsRef<Path>, key: &str) -> StorageResult<()> {
        let path = path.as_ref();
        let content_type = infer_content_type(key);
        let size = tokio::fs::metadata(path).await?.len();

        debug!(key, size, content_type, "uploading artifact");

        if size > self.single_put_max_bytes {
            self.upload_multipart(path, key, content_type, size).await?;
        } else {
            self.upload_single_put(path, key, content_type).await?;
        }

        let max_attempts = if is_master_key(key) {
            MASTER_HEAD_VERIFY_ATTEMPTS
        } else {
            RENDITION_HEAD_VERIFY_ATTEMPTS
        };
        self.verify_uploaded_with_attempts(key, size, max_attempts).await
    }

    /// Recursively upload every regular file under `local_dir`, keyed as
    /// `{key_prefix}/{relative_path}`. Used to publish an entire HLS
    /// rendition tree (renditions + master playlist) in one call.
    pub async fn upload_tree(
        &self,
        local_dir: impl AsRef<Path>,
        key_prefix: &str,
    ) -> StorageResult<Vec<String>> {
        let local_dir = local_dir.as_ref();
        let mut uploaded = Vec::new();
        let mut stack = vec![local_dir.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }

                let relative = path
                    .strip_prefix(local_dir)
                    .expect("walked entry is under local_dir")
                    .to_string_lossy()
                    .replace('\\', "/");
                let key = format!("{}/{}", key_prefix.trim_end_matches('/'), relative);

                self.upload_file(&path, &key).await?;
                uploaded.push(key);
            }
        }

        info!(key_prefix, count = uploaded.len(), "uploaded artifact tree");
        Ok(uploaded)
    }

    async fn upload_single_put(
        &self,
        path: &Path,
        key: &str,
        content_type: &str,
    ) -> StorageResult<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        Ok(())
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        key: &str,
        content_type: &str,
        size: u64,
    ) -> StorageResult<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| StorageError::upload_failed("no upload id returned"))?
            .to_string();

        let result = self
            .upload_multipart_parts(path, key, &upload_id, size)
            .await;

        match result {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| StorageError::upload_failed(e.to_string()))?;
                Ok(())
            }
            Err(e) => {
                warn!(key, "multipart upload failed, aborting");
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    async fn upload_multipart_parts(
        &self,
        path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> StorageResult<Vec<CompletedPart>> {
        let part_count = size.div_ceil(MULTIPART_PART_SIZE_BYTES).max(1);
        let mut parts = Vec::with_capacity(part_count as usize);

        for part_number in 1..=part_count {
            let offset = (part_number - 1) * MULTIPART_PART_SIZE_BYTES;
            let length = MULTIPART_PART_SIZE_BYTES.min(size - offset);

            let body = ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(aws_sdk_s3::primitives::Length::Exact(length))
                .build()
                .await
                .map_err(|e| StorageError::upload_failed(e.to_string()))?;

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number as i32)
                .body(body)
                .send()
                .await
                .map_err(|e| StorageError::upload_failed(e.to_string()))?;

            let e_tag = response
                .e_tag()
                .ok_or_else(|| StorageError::upload_failed("upload_part returned no ETag"))?
                .to_string();

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number as i32)
                    .e_tag(e_tag)
                    .build(),
            );
        }

        Ok(parts)
    }

    /// Confirm a just-uploaded object exists and has the expected size,
    /// retrying the HEAD request a few times to absorb read-after-write
    /// consistency delay. Uses the master-key attempt budget (the widest of
    /// the two spec.md §4.4 allows).
    pub async fn verify_uploaded(&self, key: &str, expected_size: u64) -> StorageResult<()> {
        self.verify_uploaded_with_attempts(key, expected_size, MASTER_HEAD_VERIFY_ATTEMPTS)
            .await
    }

    /// `verify_uploaded`, but with an explicit attempt budget: 3 for the HLS
    /// master key, 2 for a rendition playlist or segment (spec.md §4.4 step 2).
    async fn verify_uploaded_with_attempts(
        &self,
        key: &str,
        expected_size: u64,
        max_attempts: u32,
    ) -> StorageResult<()> {
        let mut last_err = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(HEAD_VERIFY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }

            match self.client.head_object().bucket(&self.bucket).key(key).send().await {
                Ok(head) => {
                    let actual = head.content_length().unwrap_or(-1);
                    if actual as u64 == expected_size {
                        return Ok(());
                    }
                    last_err = Some(StorageError::verification_failed(
                        key,
                        format!("expected {expected_size} bytes, head reported {actual}"),
                    ));
                }
                Err(e) => {
                    last_err = Some(StorageError::verification_failed(key, e.to_string()));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| StorageError::verification_failed(key, "unreachable")))
    }

    /// Download an object to a local path. Used to stage the source video
    /// before transcoding (spec.md §4.4 step 1); creates parent directories
    /// and errors if the downloaded file ends up empty.
    pub async fn download_file(&self, key: &str, dest: impl AsRef<Path>) -> StorageResult<()> {
        let dest = dest.as_ref();
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("get_object {key} failed: {e}")))?;

        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("streaming {key} failed: {e}")))?
            .into_bytes();

        if bytes.is_empty() {
            return Err(StorageError::verification_failed(key, "downloaded file is empty"));
        }

        tokio::fs::write(dest, &bytes).await?;
        debug!(key, bytes = bytes.len(), "downloaded source object");
        Ok(())
    }

    /// Check if an object exists.
    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.to_string().contains("NotFound") || e.to_string().contains("NoSuchKey") {
                    Ok(false)
                } else {
                    Err(StorageError::AwsSdk(e.to_string()))
                }
            }
        }
    }

    /// Check connectivity to the bucket (used by the worker's startup
    /// self-check).
    pub async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("artifact store connectivity check failed: {e}")))?;
        Ok(())
    }

    /// Delete every object under `prefix`. Used by pipeline error recovery
    /// to clean up a partially-uploaded rendition tree before retrying.
    pub async fn delete_prefix(&self, prefix: &str) -> StorageResult<u32> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| StorageError::AwsSdk(e.to_string()))?;

            if let Some(contents) = &response.contents {
                keys.extend(contents.iter().filter_map(|o| o.key.clone()));
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        if keys.is_empty() {
            return Ok(0);
        }

        // S3's DeleteObjects accepts at most 1000 keys per request; a long
        // episode's rendition tree (multiple HLS ladders' worth of segments)
        // can exceed that, so delete in chunks.
        const DELETE_OBJECTS_MAX_KEYS: usize = 1000;
        for batch in keys.chunks(DELETE_OBJECTS_MAX_KEYS) {
            let objects: Vec<_> = batch
                .iter()
                .map(|k| {
                    aws_sdk_s3::types::ObjectIdentifier::builder()
                        .key(k)
                        .build()
                        .expect("valid key")
                })
                .collect();

            let delete = aws_sdk_s3::types::Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::AwsSdk(e.to_string()))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| StorageError::AwsSdk(e.to_string()))?;
        }

        Ok(keys.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_threshold_is_larger_than_part_size() {
        assert!(DEFAULT_SINGLE_PUT_MAX_BYTES >= MULTIPART_PART_SIZE_BYTES);
    }

    #[test]
    fn master_key_is_distinguished_from_rendition_keys() {
        assert!(is_master_key("podcast/ep1/video/hls/master.m3u8"));
        assert!(!is_master_key("podcast/ep1/video/hls/720p/720p.m3u8"));
        assert!(!is_master_key("podcast/ep1/video/hls/720p/720p_0000.m4s"));
    }

    #[test]
    fn missing_ca_bundle_path_is_ignored_not_fatal() {
        assert_eq!(resolve_ca_bundle_path(Some("/no/such/bundle.pem".to_string())), None);
        assert_eq!(resolve_ca_bundle_path(None), None);
    }

    #[tokio::test]
    async fn existing_ca_bundle_path_is_kept() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();
        assert_eq!(resolve_ca_bundle_path(Some(path.clone())), Some(path));
    }
}
