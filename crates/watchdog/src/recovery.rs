use crate::service_control::CorrectiveAction;
use crate::sources::HealthProbe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    SkippedDisabled,
    SkippedRateLimited { retry_in: Duration },
    SkippedDependencyUnhealthy { latency: Duration, reason: String },
    Performed { probe_latency: Duration },
    /// The action ran and failed; it still counts against the rate limit.
    Failed { reason: String },
}

impl RecoveryOutcome {
    pub fn describe(&self) -> String {
        match self {
            Self::SkippedDisabled => "skipped: auto-recovery disabled".to_owned(),
            Self::SkippedRateLimited { retry_in } => {
                format!("skipped: rate-limited (next attempt allowed in {}s)", retry_in.as_secs())
            }
            Self::SkippedDependencyUnhealthy { latency, reason } => format!(
                "skipped: dependency unhealthy ({reason}, latency={:.2}s)",
                latency.as_secs_f64()
            ),
            Self::Performed { probe_latency } => format!(
                "performed (dependency latency={:.2}s)",
                probe_latency.as_secs_f64()
            ),
            Self::Failed { reason } => format!("failed: {reason}"),
        }
    }
}

/// Gates an automatic corrective action behind the feature flag, the
/// anti-flap interval and a live dependency probe, checked in that order.
#[derive(Debug)]
pub struct RecoveryGate {
    enabled: Arc<AtomicBool>,
    min_interval: Duration,
    latency_threshold: Duration,
    probe_timeout: Duration,
    action_timeout: Duration,
    last_recovery_at: Option<SystemTime>,
}

impl RecoveryGate {
    pub fn new(
        enabled: bool,
        min_interval: Duration,
        latency_threshold: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            min_interval,
            latency_threshold,
            probe_timeout,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            last_recovery_at: None,
        }
    }

    pub fn with_action_timeout(mut self, action_timeout: Duration) -> Self {
        self.action_timeout = action_timeout;
        self
    }

    /// Shared handle to the feature flag, flipped at run time by operators.
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn last_recovery_at(&self) -> Option<SystemTime> {
        self.last_recovery_at
    }

    pub async fn attempt_recovery(
        &mut self,
        now: SystemTime,
        probe: &dyn HealthProbe,
        action: &dyn CorrectiveAction,
        target: &str,
    ) -> RecoveryOutcome {
        if !self.is_enabled() {
            return RecoveryOutcome::SkippedDisabled;
        }

        if let Some(retry_in) = self.rate_limited_for(now) {
            return RecoveryOutcome::SkippedRateLimited { retry_in };
        }

        let report = match tokio::time::timeout(self.probe_timeout, probe.probe()).await {
            Ok(report) => report,
            Err(_) => {
                return RecoveryOutcome::SkippedDependencyUnhealthy {
                    latency: self.probe_timeout,
                    reason: "dependency probe timed out".to_owned(),
                };
            }
        };

        if !report.ok {
            return RecoveryOutcome::SkippedDependencyUnhealthy {
                latency: report.latency,
                reason: report
                    .detail
                    .unwrap_or_else(|| "dependency probe failed".to_owned()),
            };
        }

        if report.latency > self.latency_threshold {
            return RecoveryOutcome::SkippedDependencyUnhealthy {
                latency: report.latency,
                reason: format!(
                    "latency above threshold of {:.2}s",
                    self.latency_threshold.as_secs_f64()
                ),
            };
        }

        self.last_recovery_at = Some(now);
        match tokio::time::timeout(self.action_timeout, action.perform(target)).await {
            Ok(Ok(())) => {
                info!(target, "corrective action performed");
                RecoveryOutcome::Performed {
                    probe_latency: report.latency,
                }
            }
            Ok(Err(error)) => {
                warn!(target, error = %error, "corrective action failed");
                RecoveryOutcome::Failed {
                    reason: error.to_string(),
                }
            }
            Err(_) => {
                warn!(target, "corrective action timed out");
                RecoveryOutcome::Failed {
                    reason: format!("timed out after {}s", self.action_timeout.as_secs()),
                }
            }
        }
    }

    fn rate_limited_for(&self, now: SystemTime) -> Option<Duration> {
        let last = self.last_recovery_at?;
        match now.duration_since(last) {
            Ok(elapsed) if elapsed > self.min_interval => None,
            Ok(elapsed) => Some(self.min_interval.saturating_sub(elapsed)),
            Err(_) => Some(self.min_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_control::ActionError;
    use crate::sources::ProbeReport;
    use std::sync::atomic::AtomicUsize;
    use std::time::UNIX_EPOCH;

    fn at(second: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(second)
    }

    struct StaticProbe {
        ok: bool,
        latency: Duration,
        calls: AtomicUsize,
    }

    impl StaticProbe {
        fn new(ok: bool, latency_ms: u64) -> Self {
            Self {
                ok,
                latency: Duration::from_millis(latency_ms),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl HealthProbe for StaticProbe {
        async fn probe(&self) -> ProbeReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ProbeReport {
                ok: self.ok,
                latency: self.latency,
                detail: None,
            }
        }
    }

    struct HangingProbe;

    #[async_trait::async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self) -> ProbeReport {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ProbeReport {
                ok: true,
                latency: Duration::ZERO,
                detail: None,
            }
        }
    }

    #[derive(Default)]
    struct CountingAction {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CorrectiveAction for CountingAction {
        async fn perform(&self, _target: &str) -> Result<(), ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ActionError::ExitStatus("unit not found".to_owned()));
            }
            Ok(())
        }
    }

    fn gate(enabled: bool) -> RecoveryGate {
        RecoveryGate::new(
            enabled,
            Duration::from_secs(600),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn disabled_flag_wins_and_never_probes() {
        let mut gate = gate(false);
        let probe = StaticProbe::new(true, 5);
        let action = CountingAction::default();

        let outcome = gate.attempt_recovery(at(10_000), &probe, &action, "fulcrum").await;

        assert_eq!(outcome, RecoveryOutcome::SkippedDisabled);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unhealthy_dependency_skips_on_first_attempt() {
        let mut gate = gate(true);
        let probe = StaticProbe::new(false, 5);
        let action = CountingAction::default();

        let outcome = gate.attempt_recovery(at(10_000), &probe, &action, "fulcrum").await;

        assert!(matches!(outcome, RecoveryOutcome::SkippedDependencyUnhealthy { .. }));
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
        assert_eq!(gate.last_recovery_at(), None);
    }

    #[tokio::test]
    async fn slow_dependency_is_unhealthy() {
        let mut gate = gate(true);
        let probe = StaticProbe::new(true, 10_500);
        let action = CountingAction::default();

        let outcome = gate.attempt_recovery(at(10_000), &probe, &action, "fulcrum").await;

        assert!(matches!(
            outcome,
            RecoveryOutcome::SkippedDependencyUnhealthy { latency, .. } if latency == Duration::from_millis(10_500)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_is_bounded_by_timeout() {
        let mut gate = gate(true);
        let action = CountingAction::default();

        let outcome = gate
            .attempt_recovery(at(10_000), &HangingProbe, &action, "fulcrum")
            .await;

        assert!(matches!(outcome, RecoveryOutcome::SkippedDependencyUnhealthy { .. }));
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_attempt_inside_interval_is_rate_limited_without_probing() {
        let mut gate = gate(true);
        let probe = StaticProbe::new(true, 5);
        let action = CountingAction::default();

        let first = gate.attempt_recovery(at(10_000), &probe, &action, "fulcrum").await;
        assert!(matches!(first, RecoveryOutcome::Performed { .. }));

        let second = gate.attempt_recovery(at(10_600), &probe, &action, "fulcrum").await;
        assert!(matches!(second, RecoveryOutcome::SkippedRateLimited { .. }));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        let third = gate.attempt_recovery(at(10_601), &probe, &action, "fulcrum").await;
        assert!(matches!(third, RecoveryOutcome::Performed { .. }));
        assert_eq!(action.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_action_still_counts_against_interval() {
        let mut gate = gate(true);
        let probe = StaticProbe::new(true, 5);
        let action = CountingAction {
            calls: AtomicUsize::new(0),
            fail: true,
        };

        let outcome = gate.attempt_recovery(at(0), &probe, &action, "fulcrum").await;
        assert!(matches!(outcome, RecoveryOutcome::Failed { .. }));
        assert_eq!(gate.last_recovery_at(), Some(at(0)));

        let outcome = gate.attempt_recovery(at(60), &probe, &action, "fulcrum").await;
        assert!(matches!(outcome, RecoveryOutcome::SkippedRateLimited { .. }));
    }

    #[tokio::test]
    async fn runtime_flag_toggle_is_observed() {
        let mut gate = gate(false);
        let flag = gate.enabled_flag();
        let probe = StaticProbe::new(true, 5);
        let action = CountingAction::default();

        flag.store(true, Ordering::Relaxed);
        let outcome = gate.attempt_recovery(at(0), &probe, &action, "fulcrum").await;
        assert!(matches!(outcome, RecoveryOutcome::Performed { .. }));
    }
}
