//! Startup self-check: verifies ffmpeg/ffprobe are on PATH and the
//! database and artifact store are reachable, without running the full
//! consume loop. Intended for container health checks and CI smoke tests.

use epv_worker::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("configuration error: {}", e))?;

    println!("worker-selfcheck: checking ffmpeg/ffprobe");
    epv_media::check_ffmpeg().map_err(|e| anyhow::anyhow!("ffmpeg not available: {}", e))?;
    epv_media::check_ffprobe().map_err(|e| anyhow::anyhow!("ffprobe not available: {}", e))?;

    println!("worker-selfcheck: checking database connectivity");
    let repository = epv_db::Repository::connect(config.repository.clone())
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to database: {}", e))?;
    repository
        .check_connectivity()
        .await
        .map_err(|e| anyhow::anyhow!("database connectivity check failed: {}", e))?;

    println!("worker-selfcheck: checking artifact store connectivity");
    let artifact_store = epv_storage::ArtifactStore::new(config.artifact_store.clone())
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize artifact store: {}", e))?;
    artifact_store
        .check_connectivity()
        .await
        .map_err(|e| anyhow::anyhow!("artifact store connectivity check failed: {}", e))?;

    println!("worker-selfcheck: ok");
    Ok(())
}
