use crate::{
    alerter::Notifier,
    audit::{ALERT_MARKER, AuditLog},
    collector::Collector,
    miner::{MinerReading, MinerWatch},
    models::{Alert, AlertClass, Severity, TelemetrySnapshot},
    recovery::{RecoveryGate, RecoveryOutcome},
    router::{AlertRouter, StallEvent, Suppression},
    service_control::CorrectiveAction,
    sources::{HealthProbe, MinerSource, bounded},
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Writes every alert to the audit log, then hands it to the notifier.
/// Shared by both loops.
#[derive(Clone)]
pub struct Dispatcher {
    audit: Arc<AuditLog>,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(audit: Arc<AuditLog>, notifier: Arc<dyn Notifier>) -> Self {
        Self { audit, notifier }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Returns whether the transport accepted the alert. The audit record
    /// is written either way.
    pub async fn dispatch(&self, alert: &Alert) -> bool {
        self.audit.append_at(
            alert.detected_at,
            &format!("{ALERT_MARKER} {}: {}", alert.class.label(), alert.message),
        );

        match self.notifier.send_alert(&alert.render()).await {
            Ok(()) => {
                info!(class = ?alert.class, "alert sent");
                true
            }
            Err(error) => {
                warn!(class = ?alert.class, error = %error, "failed to send alert");
                self.audit.append_at(
                    alert.detected_at,
                    &format!("[WARN] delivery of {} alert failed: {error}", alert.class.label()),
                );
                false
            }
        }
    }

    pub fn record_suppressed(&self, at: SystemTime, suppression: &Suppression) {
        self.audit.append_at(
            at,
            &format!(
                "[SUPPRESSED] {}: cooldown active, {}s remaining",
                suppression.class.label(),
                suppression.remaining.as_secs()
            ),
        );
    }
}

/// Automatic corrective action for the stalled indexer.
pub struct StallRecovery {
    pub gate: RecoveryGate,
    pub probe: Arc<dyn HealthProbe>,
    pub action: Arc<dyn CorrectiveAction>,
    pub target: String,
}

impl StallRecovery {
    pub async fn on_stall(
        &mut self,
        event: &StallEvent,
        now: SystemTime,
        dispatcher: &Dispatcher,
    ) -> RecoveryOutcome {
        let outcome = self
            .gate
            .attempt_recovery(now, self.probe.as_ref(), self.action.as_ref(), &self.target)
            .await;

        dispatcher.audit().append_at(
            now,
            &format!("[RECOVERY] {}: {}", self.target, outcome.describe()),
        );

        let announcement = match &outcome {
            RecoveryOutcome::Performed { .. } => Some((
                Severity::Info,
                format!("{} restart triggered by monitor.", self.target),
            )),
            RecoveryOutcome::SkippedDependencyUnhealthy { .. } => Some((
                Severity::Warning,
                format!("Skipping auto-restart of {}: {}.", self.target, outcome.describe()),
            )),
            RecoveryOutcome::Failed { reason } => Some((
                Severity::Critical,
                format!("Auto-restart of {} failed: {reason}", self.target),
            )),
            RecoveryOutcome::SkippedDisabled | RecoveryOutcome::SkippedRateLimited { .. } => None,
        };

        if let Some((severity, message)) = announcement {
            let alert = Alert {
                class: AlertClass::Recovery,
                severity,
                message,
                detected_at: now,
                evidence: json!({
                    "target": self.target,
                    "stalled_height": event.height,
                    "outcome": outcome.describe(),
                }),
            };
            dispatcher.dispatch(&alert).await;
        }

        outcome
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub dispatched: usize,
    pub delivered: usize,
    pub suppressed: usize,
    pub recovery: Option<RecoveryOutcome>,
}

pub async fn process_snapshot(
    router: &mut AlertRouter,
    recovery: Option<&mut StallRecovery>,
    dispatcher: &Dispatcher,
    snapshot: &TelemetrySnapshot,
) -> TickReport {
    let now = snapshot.captured_at;
    let evaluation = router.evaluate(snapshot);
    let mut report = TickReport::default();

    if let Some(line) = &evaluation.progress_line {
        dispatcher.audit().append_at(now, line);
    }

    for alert in &evaluation.alerts {
        report.dispatched += 1;
        if dispatcher.dispatch(alert).await {
            report.delivered += 1;
        }
    }

    for suppression in &evaluation.suppressed {
        dispatcher.record_suppressed(now, suppression);
        report.suppressed += 1;
    }

    if let (Some(event), Some(recovery)) = (&evaluation.stall, recovery) {
        report.recovery = Some(recovery.on_stall(event, now, dispatcher).await);
    }

    report
}

pub async fn poll_miner(source: &dyn MinerSource, timeout: Duration) -> MinerReading {
    match bounded(timeout, source.fetch()).await {
        Ok(snapshot) => MinerReading::Snapshot(snapshot),
        Err(error) => MinerReading::Unreachable {
            at: SystemTime::now(),
            error: error.to_string(),
        },
    }
}

pub async fn process_miner_reading(
    watch: &mut MinerWatch,
    dispatcher: &Dispatcher,
    reading: &MinerReading,
) -> TickReport {
    let evaluation = watch.evaluate(reading);
    let mut report = TickReport::default();

    for alert in &evaluation.alerts {
        report.dispatched += 1;
        if dispatcher.dispatch(alert).await {
            report.delivered += 1;
        }
    }
    for suppression in &evaluation.suppressed {
        dispatcher.record_suppressed(reading.observed_at(), suppression);
        report.suppressed += 1;
    }

    report
}

fn ticker(period: Duration) -> time::Interval {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub async fn run_main_loop(
    collector: Collector,
    mut router: AlertRouter,
    mut recovery: Option<StallRecovery>,
    dispatcher: Dispatcher,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(interval_seconds = interval.as_secs(), "main loop started");
    let mut ticker = ticker(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = collector.collect_snapshot(SystemTime::now()).await;
        let report = process_snapshot(&mut router, recovery.as_mut(), &dispatcher, &snapshot).await;
        debug!(
            dispatched = report.dispatched,
            delivered = report.delivered,
            suppressed = report.suppressed,
            "main tick done"
        );
    }

    info!("main loop stopped");
}

pub async fn run_miner_loop(
    source: Arc<dyn MinerSource>,
    mut watch: MinerWatch,
    dispatcher: Dispatcher,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    info!(
        endpoint = source.endpoint(),
        interval_seconds = interval.as_secs(),
        "miner loop started"
    );
    let mut ticker = ticker(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let reading = poll_miner(source.as_ref(), timeout).await;
        let report = process_miner_reading(&mut watch, &dispatcher, &reading).await;
        debug!(dispatched = report.dispatched, "miner tick done");
    }

    info!("miner loop stopped");
}
