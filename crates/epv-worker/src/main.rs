//! Episode video worker binary: wires the queue consumer, the episode
//! pipeline, task protection, and the supervisor together, then runs until
//! a signal resolves to drain or voluntary shutdown (spec.md §4.7, §6).

use std::sync::Arc;

use aws_sdk_ecs::Client as EcsClient;
use aws_sdk_sqs::Client as SqsClient;
use serde::Deserialize;
use tracing::{error, info, warn};

use epv_queue::QueueConsumer;

use epv_worker::{Config, EcsProtectionEnvironment, EpisodePipeline, Supervisor, TaskProtection, Transcoder};

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    epv_worker::logging::init_tracing();

    info!("starting epv-worker");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error, exiting");
            std::process::exit(1);
        }
    };

    let repository = match epv_db::Repository::connect(config.repository.clone()).await {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "failed to connect to database, exiting");
            std::process::exit(1);
        }
    };
    if let Err(e) = repository.check_connectivity().await {
        error!(error = %e, "database connectivity check failed, exiting");
        std::process::exit(1);
    }

    let artifact_store = match epv_storage::ArtifactStore::new(config.artifact_store.clone()).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to initialize artifact store, exiting");
            std::process::exit(1);
        }
    };
    if let Err(e) = artifact_store.check_connectivity().await {
        error!(error = %e, "artifact store connectivity check failed, exiting");
        std::process::exit(1);
    }

    if let Err(e) = epv_media::check_ffmpeg() {
        error!(error = %e, "ffmpeg not available, exiting");
        std::process::exit(1);
    }
    if let Err(e) = epv_media::check_ffprobe() {
        error!(error = %e, "ffprobe not available, exiting");
        std::process::exit(1);
    }

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let consumer = Arc::new(QueueConsumer::new(
        SqsClient::new(&aws_config),
        config.queue.clone(),
    ));

    let (ecs_cluster, ecs_task_arn) = resolve_ecs_identity(&config).await;
    let task_protection = match (ecs_cluster, ecs_task_arn) {
        (Some(cluster), Some(task_arn)) => {
            let env = EcsProtectionEnvironment::new(EcsClient::new(&aws_config), cluster, task_arn);
            let tp = Arc::new(TaskProtection::new(env, config.task_protection.clone()));
            if config.task_protection.proactive {
                tp.add_critical(epv_worker::task_protection::BASELINE_TOKEN).await;
            }
            Some(tp)
        }
        _ => {
            warn!("ECS cluster/task identity unavailable, task protection disabled");
            None
        }
    };

    let transcoder = Arc::new(Transcoder::new(
        artifact_store,
        repository.clone(),
        config.max_concurrent_processing,
        config.max_concurrent_uploads,
    ));

    let exit_code = if let Some(task_protection) = task_protection {
        let pipeline = Arc::new(EpisodePipeline::new(repository, transcoder, task_protection.clone()));

        let (extender_cancel_tx, extender_cancel_rx) = tokio::sync::watch::channel(false);
        let extender_handle = tokio::spawn(task_protection.clone().run_extender(extender_cancel_rx));

        let supervisor = Supervisor::new(
            consumer.clone(),
            task_protection,
            config.spot_eligible,
            config.strict_block_sigterm,
            config.critical_session_drain_timeout_secs,
            config.spot_drain_timeout_secs,
        );

        let exit = tokio::select! {
            result = consumer.run(pipeline.as_ref()) => {
                if let Err(e) = result {
                    warn!(error = %e, "consumer loop exited with an error");
                }
                epv_worker::SupervisorExit::Drained
            }
            exit = supervisor.watch_signals() => exit,
        };

        let _ = extender_cancel_tx.send(true);
        extender_handle.await.ok();
        exit.exit_code()
    } else {
        error!("cannot run without task protection, exiting");
        1
    };

    info!(exit_code, "epv-worker shutdown complete");
    std::process::exit(exit_code);
}

#[derive(Debug, Deserialize)]
struct EcsTaskMetadata {
    #[serde(rename = "Cluster")]
    cluster: Option<String>,
    #[serde(rename = "TaskARN")]
    task_arn: Option<String>,
}

/// Cluster/task ARN come from explicit env vars if set, otherwise from the
/// ECS task metadata endpoint (`ECS_CONTAINER_METADATA_URI_V4/task`), per
/// spec.md §5's description of these as "resolved from task metadata if
/// unset."
async fn resolve_ecs_identity(config: &Config) -> (Option<String>, Option<String>) {
    if config.ecs_cluster.is_some() && config.ecs_task_arn.is_some() {
        return (config.ecs_cluster.clone(), config.ecs_task_arn.clone());
    }

    let Ok(base_uri) = std::env::var("ECS_CONTAINER_METADATA_URI_V4") else {
        return (config.ecs_cluster.clone(), config.ecs_task_arn.clone());
    };

    let url = format!("{}/task", base_uri.trim_end_matches('/'));
    match reqwest::get(&url).await {
        Ok(response) => match response.json::<EcsTaskMetadata>().await {
            Ok(metadata) => (
                config.ecs_cluster.clone().or(metadata.cluster),
                config.ecs_task_arn.clone().or(metadata.task_arn),
            ),
            Err(e) => {
                warn!(error = %e, "failed to parse ECS task metadata response");
                (config.ecs_cluster.clone(), config.ecs_task_arn.clone())
            }
        },
        Err(e) => {
            warn!(error = %e, "failed to reach ECS task metadata endpoint");
            (config.ecs_cluster.clone(), config.ecs_task_arn.clone())
        }
    }
}
