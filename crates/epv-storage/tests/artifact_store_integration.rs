//! End-to-end exercise of `ArtifactStore` against a fake S3-compatible
//! endpoint, standing in for the object store the way `wiremock` stands in
//! for any other HTTP dependency under test.

use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use epv_storage::{ArtifactStore, ArtifactStoreConfig, DEFAULT_SINGLE_PUT_MAX_BYTES};

const FILE_BODY: &str = "hello from the transcoder\n";

async fn store_against(server: &MockServer) -> ArtifactStore {
    ArtifactStore::new(ArtifactStoreConfig {
        endpoint_url: Some(server.uri()),
        access_key_id: "test-access-key".to_string(),
        secret_access_key: "test-secret-key".to_string(),
        bucket_name: "episode-artifacts".to_string(),
        region: "us-east-1".to_string(),
        ca_bundle_path: None,
        single_put_max_bytes: DEFAULT_SINGLE_PUT_MAX_BYTES,
    })
    .await
    .expect("config is well-formed")
}

#[tokio::test]
async fn upload_file_then_verify_round_trips_through_put_and_head() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/episode-artifacts/.+"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    Mock::given(method("HEAD"))
        .and(path_regex(r"^/episode-artifacts/.+"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", FILE_BODY.len().to_string().as_str()),
        )
        .mount(&server)
        .await;

    let store = store_against(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("720p.m3u8");
    tokio::fs::write(&file_path, FILE_BODY).await.unwrap();

    store
        .upload_file(&file_path, "podcast/ep1/video/hls/720p/720p.m3u8")
        .await
        .expect("upload should succeed against the mock endpoint");
}

#[tokio::test]
async fn upload_file_surfaces_verification_mismatch() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/episode-artifacts/.+"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // HEAD reports a size that doesn't match what was uploaded — verification
    // must fail rather than silently accept a truncated object.
    Mock::given(method("HEAD"))
        .and(path_regex(r"^/episode-artifacts/.+"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-length", "1"))
        .mount(&server)
        .await;

    let store = store_against(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("master.m3u8");
    tokio::fs::write(&file_path, FILE_BODY).await.unwrap();

    let err = store
        .upload_file(&file_path, "podcast/ep1/video/hls/master.m3u8")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Verification failed"));
}

#[tokio::test]
async fn upload_tree_publishes_every_file_under_the_prefix() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/episode-artifacts/.+"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // Every file in the fixture tree is padded to the same size so one HEAD
    // mock can answer for all of them.
    Mock::given(method("HEAD"))
        .and(path_regex(r"^/episode-artifacts/.+"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", FILE_BODY.len().to_string().as_str()),
        )
        .mount(&server)
        .await;

    let store = store_against(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let rendition_dir = dir.path().join("720p");
    tokio::fs::create_dir_all(&rendition_dir).await.unwrap();
    tokio::fs::write(rendition_dir.join("720p.m3u8"), FILE_BODY)
        .await
        .unwrap();
    tokio::fs::write(rendition_dir.join("720p_0000.m4s"), FILE_BODY)
        .await
        .unwrap();
    tokio::fs::write(dir.path().join("master.m3u8"), FILE_BODY)
        .await
        .unwrap();

    let mut uploaded = store
        .upload_tree(dir.path(), "podcast/ep1/video/hls")
        .await
        .expect("tree upload should succeed");
    uploaded.sort();

    assert_eq!(
        uploaded,
        vec![
            "podcast/ep1/video/hls/720p/720p.m3u8".to_string(),
            "podcast/ep1/video/hls/720p/720p_0000.m4s".to_string(),
            "podcast/ep1/video/hls/master.m3u8".to_string(),
        ]
    );
}

#[tokio::test]
async fn check_connectivity_succeeds_when_bucket_head_responds() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path_regex(r"^/episode-artifacts/?$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = store_against(&server).await;
    store
        .check_connectivity()
        .await
        .expect("connectivity check should succeed against the mock endpoint");
}
