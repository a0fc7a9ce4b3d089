//! Refcounted task-protection coordinator (spec.md §4.1).
//!
//! Tells the managed execution environment not to terminate this process
//! while a message is mid-flight, and keeps the lease alive for as long as
//! at least one critical section is open. Modeled as a trait over the
//! environment call so the coordinator's timing logic can be unit tested
//! without ECS.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};

const DEFAULT_EXTENSION_INTERVAL_SECS: u64 = 900;
const DEFAULT_BUFFER_SECS: u64 = 300;
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
const DEFAULT_SAFETY_CAP_SECS: u64 = 2 * 60 * 60;
const DEFAULT_MIN_HOLD_SECS: u64 = 120;
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Synthetic token added at startup when `proactive` is configured
/// (`ECS_PROACTIVE_PROTECTION`).
pub const BASELINE_TOKEN: &str = "baseline_protection";

#[derive(Debug, Clone)]
pub struct TaskProtectionConfig {
    /// `E`: lease-extension interval, seconds.
    pub extension_interval_secs: u64,
    /// `B`: buffer added on top of `E` when requesting a lease, seconds.
    pub buffer_secs: u64,
    /// `C`: how often the background extender wakes, seconds.
    pub check_interval_secs: u64,
    /// Hard ceiling on continuous protection before it's treated as stuck.
    pub safety_cap_secs: u64,
    /// Minimum time protection stays enabled after the refcount drains.
    pub min_hold_secs: u64,
    /// Whether to add a baseline token at process start.
    pub proactive: bool,
}

impl Default for TaskProtectionConfig {
    fn default() -> Self {
        Self {
            extension_interval_secs: DEFAULT_EXTENSION_INTERVAL_SECS,
            buffer_secs: DEFAULT_BUFFER_SECS,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            safety_cap_secs: DEFAULT_SAFETY_CAP_SECS,
            min_hold_secs: DEFAULT_MIN_HOLD_SECS,
            proactive: true,
        }
    }
}

impl TaskProtectionConfig {
    pub fn from_env() -> Self {
        Self {
            extension_interval_secs: env_parse("TASK_PROTECTION_EXTENSION_SECS", DEFAULT_EXTENSION_INTERVAL_SECS),
            buffer_secs: env_parse("TASK_PROTECTION_BUFFER_SECS", DEFAULT_BUFFER_SECS),
            check_interval_secs: env_parse("TASK_PROTECTION_CHECK_INTERVAL_SECS", DEFAULT_CHECK_INTERVAL_SECS),
            safety_cap_secs: env_parse("TASK_PROTECTION_SAFETY_CAP_SECS", DEFAULT_SAFETY_CAP_SECS),
            min_hold_secs: env_parse("TASK_PROTECTION_MIN_HOLD_SECS", DEFAULT_MIN_HOLD_SECS),
            proactive: std::env::var("ECS_PROACTIVE_PROTECTION")
                .ok()
                .map(|s| matches!(s.to_ascii_lowercase().as_str(), "true" | "1"))
                .unwrap_or(true),
        }
    }

    /// Requested lease duration in whole minutes: `ceil((E + B) / 60)`.
    pub fn lease_minutes(&self) -> u32 {
        let total_secs = self.extension_interval_secs + self.buffer_secs;
        ((total_secs + 59) / 60).max(1) as u32
    }

    /// `B > C`: the buffer must outlast the gap between extension checks,
    /// or a slow tick could let the lease expire before it's renewed.
    pub fn gap_protection_safe(&self) -> bool {
        self.buffer_secs > self.check_interval_secs
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// The environment call the coordinator drives. A real implementation talks
/// to ECS's `UpdateTaskProtection`; tests supply a fake.
#[async_trait]
pub trait ProtectionEnvironment: Send + Sync {
    async fn set_protection(&self, enabled: bool, lease_minutes: u32) -> Result<(), String>;
}

/// Snapshot returned by `Status()`.
#[derive(Debug, Clone)]
pub struct ProtectionStatus {
    pub enabled: bool,
    pub count: usize,
    pub ids: Vec<String>,
    pub lease_expires_at: Option<Instant>,
    pub gap_protection_safe: bool,
}

struct Inner {
    tokens: HashSet<String>,
    enabled: bool,
    enabled_since: Option<Instant>,
    lease_expires_at: Option<Instant>,
    shutdown_pending: bool,
    consecutive_failures: u32,
}

impl Inner {
    fn new() -> Self {
        Self {
            tokens: HashSet::new(),
            enabled: false,
            enabled_since: None,
            lease_expires_at: None,
            shutdown_pending: false,
            consecutive_failures: 0,
        }
    }
}

pub struct TaskProtection<E: ProtectionEnvironment> {
    env: E,
    config: TaskProtectionConfig,
    inner: tokio::sync::Mutex<Inner>,
}

impl<E: ProtectionEnvironment + 'static> TaskProtection<E> {
    pub fn new(env: E, config: TaskProtectionConfig) -> Self {
        Self {
            env,
            config,
            inner: tokio::sync::Mutex::new(Inner::new()),
        }
    }

    /// Add a token; the first token in enables protection immediately.
    pub async fn add_critical(&self, id: impl Into<String>) {
        let id = id.into();
        let mut inner = self.inner.lock().await;
        let was_empty = inner.tokens.is_empty();
        inner.tokens.insert(id);
        if was_empty && !inner.enabled {
            self.enable_locked(&mut inner).await;
        }
    }

    /// Remove a token. If the refcount drains to zero and `min_hold` has
    /// already elapsed, disables immediately; otherwise the background
    /// extender disables it once `min_hold` passes.
    pub async fn remove_critical(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        inner.tokens.remove(id);
        if inner.tokens.is_empty() && inner.enabled && self.min_hold_elapsed(&inner) {
            self.disable_locked(&mut inner).await;
        }
    }

    /// Remove the baseline token (if present) and mark that voluntary
    /// shutdown may proceed once the remaining tokens drain naturally.
    pub async fn request_voluntary_shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.tokens.remove(BASELINE_TOKEN);
        inner.shutdown_pending = true;
        if inner.tokens.is_empty() && inner.enabled && self.min_hold_elapsed(&inner) {
            self.disable_locked(&mut inner).await;
        }
    }

    /// Discard all tokens and disable immediately, bypassing `min_hold`.
    /// Used by the safety-cap watchdog and by an operator-triggered abort.
    pub async fn force_disable(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        error!(reason, "force-disabling task protection");
        inner.tokens.clear();
        self.disable_locked(&mut inner).await;
    }

    pub async fn status(&self) -> ProtectionStatus {
        let inner = self.inner.lock().await;
        ProtectionStatus {
            enabled: inner.enabled,
            count: inner.tokens.len(),
            ids: inner.tokens.iter().cloned().collect(),
            lease_expires_at: inner.lease_expires_at,
            gap_protection_safe: self.config.gap_protection_safe(),
        }
    }

    fn min_hold_elapsed(&self, inner: &Inner) -> bool {
        inner
            .enabled_since
            .map(|since| since.elapsed() >= Duration::from_secs(self.config.min_hold_secs))
            .unwrap_or(true)
    }

    async fn enable_locked(&self, inner: &mut Inner) {
        match self.set_protection_with_retry(true).await {
            Ok(()) => {
                inner.enabled = true;
                inner.enabled_since = Some(Instant::now());
                inner.lease_expires_at =
                    Some(Instant::now() + Duration::from_secs(self.config.extension_interval_secs + self.config.buffer_secs));
                inner.consecutive_failures = 0;
                info!("task protection enabled");
            }
            Err(e) => {
                error!(error = %e, "failed to enable task protection after retries");
            }
        }
    }

    async fn disable_locked(&self, inner: &mut Inner) {
        match self.set_protection_with_retry(false).await {
            Ok(()) => info!("task protection disabled"),
            Err(e) => error!(error = %e, "failed to disable task protection after retries"),
        }
        inner.enabled = false;
        inner.enabled_since = None;
        inner.lease_expires_at = None;
    }

    async fn set_protection_with_retry(&self, enabled: bool) -> Result<(), String> {
        let lease_minutes = self.config.lease_minutes();
        let mut last_err = String::new();
        for attempt in 0..MAX_CONSECUTIVE_FAILURES {
            match self.env.set_protection(enabled, lease_minutes).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = e;
                    let delay = Duration::from_millis(200 * 2u64.pow(attempt));
                    warn!(attempt = attempt + 1, error = %last_err, "task protection call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_err)
    }

    /// Renew the lease once, for the background extender. No-op (but not
    /// an error) if protection isn't currently enabled or the refcount has
    /// drained and `min_hold` has elapsed, in which case it disables instead.
    /// Applies the safety cap: if protection has been continuously enabled
    /// past `safety_cap_secs`, treats the state as stuck and force-disables.
    pub async fn tick(&self) {
        let mut inner = self.inner.lock().await;

        if let Some(since) = inner.enabled_since {
            if since.elapsed() >= Duration::from_secs(self.config.safety_cap_secs) {
                error!(
                    elapsed_secs = since.elapsed().as_secs(),
                    "task protection exceeded safety cap, treating as stuck"
                );
                inner.tokens.clear();
                self.disable_locked(&mut inner).await;
                return;
            }
        }

        if inner.tokens.is_empty() {
            if inner.enabled && self.min_hold_elapsed(&inner) {
                self.disable_locked(&mut inner).await;
            }
            return;
        }

        if !inner.enabled {
            self.enable_locked(&mut inner).await;
        } else {
            match self.set_protection_with_retry(true).await {
                Ok(()) => {
                    inner.lease_expires_at = Some(
                        Instant::now()
                            + Duration::from_secs(self.config.extension_interval_secs + self.config.buffer_secs),
                    );
                    inner.consecutive_failures = 0;
                }
                Err(e) => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(error = %e, "task protection lease extension repeatedly failed");
                    }
                }
            }
        }
    }

    /// Run the background extender loop until `cancel` fires. Owned by the
    /// Supervisor; cancellable and expected to be joined on shutdown.
    pub async fn run_extender(self: std::sync::Arc<Self>, mut cancel: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.check_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Real `ProtectionEnvironment`: ECS's `UpdateTaskProtection` API.
pub struct EcsProtectionEnvironment {
    client: aws_sdk_ecs::Client,
    cluster: String,
    task_arn: String,
}

impl EcsProtectionEnvironment {
    pub fn new(client: aws_sdk_ecs::Client, cluster: impl Into<String>, task_arn: impl Into<String>) -> Self {
        Self {
            client,
            cluster: cluster.into(),
            task_arn: task_arn.into(),
        }
    }
}

#[async_trait]
impl ProtectionEnvironment for EcsProtectionEnvironment {
    async fn set_protection(&self, enabled: bool, lease_minutes: u32) -> Result<(), String> {
        self.client
            .update_task_protection()
            .cluster(&self.cluster)
            .tasks(self.task_arn.clone())
            .protection_enabled(enabled)
            .expires_in_minutes(lease_minutes as i32)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeEnvironment {
        calls: Arc<std::sync::Mutex<Vec<(bool, u32)>>>,
        fail_next: AtomicU32,
    }

    impl FakeEnvironment {
        fn new() -> Self {
            Self {
                calls: Arc::new(std::sync::Mutex::new(Vec::new())),
                fail_next: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ProtectionEnvironment for FakeEnvironment {
        async fn set_protection(&self, enabled: bool, lease_minutes: u32) -> Result<(), String> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err("simulated failure".to_string());
            }
            self.calls.lock().unwrap().push((enabled, lease_minutes));
            Ok(())
        }
    }

    fn fast_config() -> TaskProtectionConfig {
        TaskProtectionConfig {
            extension_interval_secs: 900,
            buffer_secs: 300,
            check_interval_secs: 30,
            safety_cap_secs: 7200,
            min_hold_secs: 0,
            proactive: true,
        }
    }

    #[test]
    fn lease_minutes_rounds_up() {
        let config = TaskProtectionConfig {
            extension_interval_secs: 900,
            buffer_secs: 300,
            ..fast_config()
        };
        assert_eq!(config.lease_minutes(), 20);
    }

    #[test]
    fn gap_protection_safe_requires_buffer_exceed_check_interval() {
        assert!(fast_config().gap_protection_safe());
        let unsafe_config = TaskProtectionConfig {
            buffer_secs: 10,
            check_interval_secs: 30,
            ..fast_config()
        };
        assert!(!unsafe_config.gap_protection_safe());
    }

    #[tokio::test]
    async fn first_token_enables_protection() {
        let env = FakeEnvironment::new();
        let calls = env.calls.clone();
        let tp = TaskProtection::new(env, fast_config());

        tp.add_critical("session-1").await;
        let status = tp.status().await;
        assert!(status.enabled);
        assert_eq!(status.count, 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_refcount_disables_when_min_hold_is_zero() {
        let env = FakeEnvironment::new();
        let tp = TaskProtection::new(env, fast_config());

        tp.add_critical("session-1").await;
        tp.remove_critical("session-1").await;
        let status = tp.status().await;
        assert!(!status.enabled);
        assert_eq!(status.count, 0);
    }

    #[tokio::test]
    async fn min_hold_keeps_protection_enabled_briefly_after_drain() {
        let env = FakeEnvironment::new();
        let config = TaskProtectionConfig {
            min_hold_secs: 3600,
            ..fast_config()
        };
        let tp = TaskProtection::new(env, config);

        tp.add_critical("session-1").await;
        tp.remove_critical("session-1").await;
        let status = tp.status().await;
        assert!(status.enabled, "protection should persist through min_hold");
    }

    #[tokio::test]
    async fn force_disable_clears_all_tokens() {
        let env = FakeEnvironment::new();
        let tp = TaskProtection::new(env, fast_config());

        tp.add_critical("a").await;
        tp.add_critical("b").await;
        tp.force_disable("test abort").await;

        let status = tp.status().await;
        assert!(!status.enabled);
        assert_eq!(status.count, 0);
    }

    #[tokio::test]
    async fn safety_cap_disables_even_with_open_tokens() {
        let env = FakeEnvironment::new();
        let config = TaskProtectionConfig {
            safety_cap_secs: 0,
            min_hold_secs: 3600,
            ..fast_config()
        };
        let tp = TaskProtection::new(env, config);

        tp.add_critical("stuck-session").await;
        tp.tick().await;

        let status = tp.status().await;
        assert!(!status.enabled, "safety cap should force-disable even with open tokens");
    }

    #[tokio::test]
    async fn voluntary_shutdown_removes_baseline_token() {
        let env = FakeEnvironment::new();
        let tp = TaskProtection::new(env, fast_config());

        tp.add_critical(BASELINE_TOKEN).await;
        assert_eq!(tp.status().await.count, 1);

        tp.request_voluntary_shutdown().await;
        let status = tp.status().await;
        assert_eq!(status.count, 0);
        assert!(!status.enabled);
    }
}
