//! Wires the consumer, pipeline, and task-protection extender together and
//! owns the process's relationship with the outside world: which signals
//! mean what, how long drain is allowed to take, and when the process is
//! actually allowed to exit (spec.md §4.7).

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use epv_queue::QueueConsumer;

use crate::task_protection::{ProtectionEnvironment, TaskProtection};

/// What an external signal means once policy has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    /// Stop fetching, finish the in-flight message, exit once drained. The
    /// payload is whether this drain *is* the environment's reclamation
    /// notice: a SIGTERM while spot-eligible is itself that notice, so it
    /// carries `true`; an operator-issued SIGINT/SIGHUP/SIGQUIT is a plain
    /// drain request and carries `false`.
    Drain(bool),
    /// Release baseline protection and wait for critical sessions to close
    /// naturally; exits with code 0 once they do.
    VoluntaryShutdown,
    /// Logged and otherwise ignored.
    Ignored,
}

/// Decides what a raw signal means given the process's running mode.
/// Pulled out of `Supervisor::run` so the policy table can be unit tested
/// without touching real signal handlers.
fn classify(kind: SignalKind, spot_eligible: bool, strict_block_sigterm: bool) -> SignalAction {
    if kind == SignalKind::user_defined1() {
        return SignalAction::VoluntaryShutdown;
    }
    if kind == SignalKind::terminate() {
        return if spot_eligible {
            // In spot-eligible mode SIGTERM is how the environment delivers
            // its reclamation notice (spec.md §4.7): no separate poller is
            // needed, the signal itself is the notice.
            SignalAction::Drain(true)
        } else if strict_block_sigterm {
            SignalAction::Ignored
        } else {
            SignalAction::Drain(false)
        };
    }
    if kind == SignalKind::interrupt() || kind == SignalKind::hangup() || kind == SignalKind::quit() {
        return SignalAction::Drain(false);
    }
    SignalAction::Ignored
}

pub struct Supervisor<E: ProtectionEnvironment + 'static> {
    consumer: Arc<QueueConsumer>,
    task_protection: Arc<TaskProtection<E>>,
    spot_eligible: bool,
    strict_block_sigterm: bool,
    drain_timeout_secs: u64,
    spot_drain_timeout_secs: u64,
}

impl<E: ProtectionEnvironment + 'static> Supervisor<E> {
    pub fn new(
        consumer: Arc<QueueConsumer>,
        task_protection: Arc<TaskProtection<E>>,
        spot_eligible: bool,
        strict_block_sigterm: bool,
        drain_timeout_secs: u64,
        spot_drain_timeout_secs: u64,
    ) -> Self {
        Self {
            consumer,
            task_protection,
            spot_eligible,
            strict_block_sigterm,
            drain_timeout_secs,
            spot_drain_timeout_secs,
        }
    }

    /// Runs the signal-listening side of the supervisor until one of the
    /// signals resolves to an actionable policy outcome. `run()` itself
    /// never returns a drain/shutdown outcome to its caller without having
    /// first requested drain on the consumer and waited out the watchdog.
    pub async fn watch_signals(&self) -> SupervisorExit {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return self.drain_and_exit(false).await;
            }
        };
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
        let mut sigusr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");

        loop {
            let action = tokio::select! {
                _ = sigterm.recv() => classify(SignalKind::terminate(), self.spot_eligible, self.strict_block_sigterm),
                _ = sigint.recv() => classify(SignalKind::interrupt(), self.spot_eligible, self.strict_block_sigterm),
                _ = sighup.recv() => classify(SignalKind::hangup(), self.spot_eligible, self.strict_block_sigterm),
                _ = sigquit.recv() => classify(SignalKind::quit(), self.spot_eligible, self.strict_block_sigterm),
                _ = sigusr1.recv() => classify(SignalKind::user_defined1(), self.spot_eligible, self.strict_block_sigterm),
            };

            match action {
                SignalAction::Ignored => {
                    info!("received signal, ignoring per strict-block policy");
                    continue;
                }
                SignalAction::Drain(under_spot_pressure) => {
                    info!(under_spot_pressure, "received drain signal");
                    return self.drain_and_exit(under_spot_pressure).await;
                }
                SignalAction::VoluntaryShutdown => {
                    info!("received voluntary shutdown signal");
                    return self.voluntary_shutdown_and_exit().await;
                }
            }
        }
    }

    /// Stops the consumer from fetching new messages, waits for the
    /// task-protection refcount to drain (or the watchdog to expire), and
    /// returns the process exit policy. Never exits purely because the
    /// consumer's `run()` returned.
    async fn drain_and_exit(&self, under_spot_pressure: bool) -> SupervisorExit {
        self.consumer.request_drain();
        let deadline = if under_spot_pressure {
            self.spot_drain_timeout_secs
        } else {
            self.drain_timeout_secs
        };
        self.wait_for_critical_drain(deadline).await;
        SupervisorExit::Drained
    }

    /// Releases the baseline protection token and waits naturally for
    /// remaining critical sessions, then exits 0. Distinct from plain
    /// drain: this is the only path that is guaranteed exit code 0.
    async fn voluntary_shutdown_and_exit(&self) -> SupervisorExit {
        self.consumer.request_drain();
        self.task_protection.request_voluntary_shutdown().await;
        self.wait_for_critical_drain(self.drain_timeout_secs).await;
        SupervisorExit::VoluntaryShutdown
    }

    /// Polls `TaskProtection::status().count` until zero or `deadline_secs`
    /// elapses; on expiry, logs and proceeds rather than blocking forever.
    async fn wait_for_critical_drain(&self, deadline_secs: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(deadline_secs);
        let mut poll = tokio::time::interval(Duration::from_millis(250));

        loop {
            let status = self.task_protection.status().await;
            if status.count == 0 {
                info!("critical sessions drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = status.count,
                    "drain watchdog expired with critical sessions still open, proceeding"
                );
                return;
            }
            poll.tick().await;
        }
    }
}

/// Why the supervisor stopped watching signals. Drives the process exit
/// code (spec.md §6): voluntary shutdown is the only path that guarantees
/// `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Drained,
    VoluntaryShutdown,
}

impl SupervisorExit {
    pub fn exit_code(self) -> i32 {
        match self {
            SupervisorExit::VoluntaryShutdown => 0,
            SupervisorExit::Drained => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigusr1_is_always_voluntary_shutdown() {
        assert_eq!(
            classify(SignalKind::user_defined1(), false, false),
            SignalAction::VoluntaryShutdown
        );
        assert_eq!(
            classify(SignalKind::user_defined1(), true, true),
            SignalAction::VoluntaryShutdown
        );
    }

    #[test]
    fn sigterm_drains_in_spot_mode_regardless_of_strict_block() {
        assert_eq!(
            classify(SignalKind::terminate(), true, true),
            SignalAction::Drain(true)
        );
        assert_eq!(
            classify(SignalKind::terminate(), true, false),
            SignalAction::Drain(true)
        );
    }

    #[test]
    fn sigterm_is_ignored_when_strict_blocked_outside_spot_mode() {
        assert_eq!(
            classify(SignalKind::terminate(), false, true),
            SignalAction::Ignored
        );
    }

    #[test]
    fn sigterm_drains_by_default_outside_spot_mode() {
        assert_eq!(
            classify(SignalKind::terminate(), false, false),
            SignalAction::Drain(false)
        );
    }

    #[test]
    fn sigint_sighup_sigquit_always_drain_without_spot_pressure() {
        for kind in [SignalKind::interrupt(), SignalKind::hangup(), SignalKind::quit()] {
            assert_eq!(classify(kind, false, true), SignalAction::Drain(false));
            assert_eq!(classify(kind, true, true), SignalAction::Drain(false));
        }
    }

    #[test]
    fn exit_codes_are_zero_on_both_paths() {
        assert_eq!(SupervisorExit::Drained.exit_code(), 0);
        assert_eq!(SupervisorExit::VoluntaryShutdown.exit_code(), 0);
    }
}
