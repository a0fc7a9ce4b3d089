//! Process-wide configuration: aggregates each crate's own `*Config::from_env`
//! plus the settings that belong to the worker binary itself (concurrency
//! limits, task-protection lease parameters, drain timeouts).

use epv_db::RepositoryConfig;
use epv_queue::QueueConfig;
use epv_storage::ArtifactStoreConfig;

use crate::error::{WorkerError, WorkerResult};
use crate::task_protection::TaskProtectionConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub repository: RepositoryConfig,
    pub artifact_store: ArtifactStoreConfig,
    pub task_protection: TaskProtectionConfig,

    /// Upper bound on episodes being transcoded at once within a process.
    /// Defaults to 2; operators on larger hosts should set
    /// `MAX_CONCURRENT_PROCESSING` to roughly half the container's CPU count.
    pub max_concurrent_processing: usize,
    /// Upper bound on in-flight uploads within a single episode's transcode.
    pub max_concurrent_uploads: usize,

    /// ECS cluster name, resolved from task metadata if unset.
    pub ecs_cluster: Option<String>,
    /// ECS task ARN, resolved from task metadata if unset.
    pub ecs_task_arn: Option<String>,

    /// Never ignore SIGTERM unless running in spot-eligible mode.
    pub strict_block_sigterm: bool,
    /// Whether this task can be reclaimed by the environment on short notice
    /// (spot / preemptible capacity). Forces SIGTERM to mean drain.
    pub spot_eligible: bool,
    /// Drain deadline under normal conditions.
    pub critical_session_drain_timeout_secs: u64,
    /// Drain deadline once a reclamation notice has actually been observed.
    pub spot_drain_timeout_secs: u64,
}

const DEFAULT_MAX_CONCURRENT_PROCESSING: usize = 2;
const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 4;
const DEFAULT_CRITICAL_SESSION_DRAIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SPOT_DRAIN_TIMEOUT_SECS: u64 = 95;

impl Config {
    pub fn from_env() -> WorkerResult<Self> {
        let queue = QueueConfig::from_env()?;
        let repository = RepositoryConfig::from_env()?;
        let artifact_store = ArtifactStoreConfig::from_env()?;
        let task_protection = TaskProtectionConfig::from_env();

        let max_concurrent_processing =
            env_parse("MAX_CONCURRENT_PROCESSING", DEFAULT_MAX_CONCURRENT_PROCESSING);
        let max_concurrent_uploads = env_parse("MAX_CONCURRENT_UPLOADS", DEFAULT_MAX_CONCURRENT_UPLOADS);

        let ecs_cluster = std::env::var("ECS_CLUSTER").ok();
        let ecs_task_arn = std::env::var("ECS_TASK_ARN").ok();

        let strict_block_sigterm = env_bool("STRICT_BLOCK_SIGTERM", false);
        let spot_eligible = env_bool("SPOT_ELIGIBLE", false);

        let critical_session_drain_timeout_secs = env_parse(
            "CRITICAL_SESSION_DRAIN_TIMEOUT_SECS",
            DEFAULT_CRITICAL_SESSION_DRAIN_TIMEOUT_SECS,
        );
        let spot_drain_timeout_secs =
            env_parse("SPOT_DRAIN_TIMEOUT_SECS", DEFAULT_SPOT_DRAIN_TIMEOUT_SECS);

        if max_concurrent_processing == 0 {
            return Err(WorkerError::config_error(
                "MAX_CONCURRENT_PROCESSING must be at least 1",
            ));
        }

        Ok(Self {
            queue,
            repository,
            artifact_store,
            task_protection,
            max_concurrent_processing,
            max_concurrent_uploads,
            ecs_cluster,
            ecs_task_arn,
            strict_block_sigterm,
            spot_eligible,
            critical_session_drain_timeout_secs,
            spot_drain_timeout_secs,
        })
    }

    /// The drain deadline the supervisor should enforce right now: the spot
    /// timeout once reclamation pressure is known, otherwise the baseline.
    pub fn drain_timeout_secs(&self, under_spot_pressure: bool) -> u64 {
        if under_spot_pressure {
            self.spot_drain_timeout_secs
        } else {
            self.critical_session_drain_timeout_secs
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "true" | "1"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_timeout_switches_on_spot_pressure() {
        let config = Config {
            queue: QueueConfig::default(),
            repository: RepositoryConfig {
                database_url: String::new(),
                max_connections: 1,
                statement_timeout_ms: 1,
                lock_timeout_ms: 1,
                batch_chunk_size: 1,
            },
            artifact_store: ArtifactStoreConfig {
                endpoint_url: None,
                access_key_id: String::new(),
                secret_access_key: String::new(),
                bucket_name: String::new(),
                region: "us-east-1".to_string(),
                ca_bundle_path: None,
                single_put_max_bytes: 1,
            },
            task_protection: TaskProtectionConfig::default(),
            max_concurrent_processing: 1,
            max_concurrent_uploads: 1,
            ecs_cluster: None,
            ecs_task_arn: None,
            strict_block_sigterm: false,
            spot_eligible: true,
            critical_session_drain_timeout_secs: 30,
            spot_drain_timeout_secs: 95,
        };

        assert_eq!(config.drain_timeout_secs(false), 30);
        assert_eq!(config.drain_timeout_secs(true), 95);
    }
}
