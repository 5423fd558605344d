//! Per-tick decision engine for the main loop.
//!
//! The router owns the detectors of every main-tick signal. It never does
//! I/O: `evaluate` turns one snapshot into the alerts to dispatch, the
//! suppressions to audit and the progress record to append. Stall edges
//! are surfaced separately so the caller can run the recovery gate.

use crate::audit::progress_message;
use crate::config::MonitorConfig;
use crate::cooldown::CooldownGate;
use crate::models::{Alert, AlertClass, GatewayJob, GatewayReading, Severity, TelemetrySnapshot};
use crate::rate::{RateStats, RateTracker};
use crate::stall::{StallDetector, StallState, StallTransition};
use serde_json::json;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suppression {
    pub class: AlertClass,
    pub remaining: Duration,
}

/// The indexer just crossed the stall threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallEvent {
    pub height: u64,
    pub stalled_for: Duration,
    pub lag: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickEvaluation {
    pub alerts: Vec<Alert>,
    pub suppressed: Vec<Suppression>,
    pub progress_line: Option<String>,
    pub stall: Option<StallEvent>,
}

#[derive(Debug, Clone)]
pub struct AlertRouter {
    cpu_threshold: f64,
    ram_threshold: f64,
    temp_threshold: f64,
    gateway_no_job_duration: Duration,
    rate: RateTracker,
    stall: StallDetector,
    cooldown: CooldownGate,
    last_logged_height: Option<u64>,
    last_job: Option<GatewayJob>,
}

impl AlertRouter {
    pub fn new(config: &MonitorConfig) -> Self {
        let cooldown = CooldownGate::new(config.system_alert_cooldown)
            .with_cooldown(AlertClass::Unreachable, config.unreachable_cooldown)
            .with_cooldown(AlertClass::ServiceInactive, config.gateway_cooldown)
            .with_cooldown(AlertClass::ZeroClients, config.gateway_cooldown)
            .with_cooldown(AlertClass::NoProgress, config.gateway_cooldown);

        Self {
            cpu_threshold: config.cpu_alert_threshold,
            ram_threshold: config.ram_alert_threshold,
            temp_threshold: config.temp_alert_threshold,
            gateway_no_job_duration: config.gateway_no_job_duration,
            rate: RateTracker::new(config.rate_window_size),
            stall: StallDetector::new(config.stall_threshold),
            cooldown,
            last_logged_height: None,
            last_job: None,
        }
    }

    pub fn evaluate(&mut self, snapshot: &TelemetrySnapshot) -> TickEvaluation {
        let mut evaluation = TickEvaluation::default();

        self.evaluate_unreadable(snapshot, &mut evaluation);
        self.evaluate_heights(snapshot, &mut evaluation);
        self.evaluate_host(snapshot, &mut evaluation);
        if let Some(gateway) = &snapshot.gateway {
            self.evaluate_gateway(gateway, snapshot.captured_at, &mut evaluation);
        }

        evaluation
    }

    pub fn rate_stats(&self) -> Option<RateStats> {
        self.rate.stats()
    }

    pub fn stall_state(&self, now: SystemTime) -> StallState {
        self.stall.state(now)
    }

    /// Every source that could not be read this tick shares one alert.
    fn evaluate_unreadable(
        &mut self,
        snapshot: &TelemetrySnapshot,
        evaluation: &mut TickEvaluation,
    ) {
        let gateway_unread = snapshot
            .gateway
            .as_ref()
            .is_some_and(|gateway| gateway.active.is_none());

        let missing: Vec<&str> = [
            snapshot.node_height.is_none().then_some("node RPC"),
            snapshot.indexer_height.is_none().then_some("indexer height"),
            gateway_unread.then_some("mining gateway status"),
        ]
        .into_iter()
        .flatten()
        .collect();
        if missing.is_empty() {
            return;
        }

        self.gated(
            Alert {
                class: AlertClass::Unreachable,
                severity: Severity::Critical,
                message: format!("Could not read {}.", missing.join(" and ")),
                detected_at: snapshot.captured_at,
                evidence: json!({ "unavailable": missing }),
            },
            evaluation,
        );
    }

    fn evaluate_heights(&mut self, snapshot: &TelemetrySnapshot, evaluation: &mut TickEvaluation) {
        let now = snapshot.captured_at;

        let Some(indexer) = snapshot.indexer_height else {
            return;
        };

        // Unchanged ticks carry no new rate information.
        if self.rate.last_counter() != Some(indexer) {
            self.rate.update(indexer, now);
        }

        if let Some(node) = snapshot.node_height {
            if self.last_logged_height != Some(indexer) {
                let stats = self.rate.stats();
                evaluation.progress_line = Some(progress_message(node, indexer, stats.as_ref()));
                self.last_logged_height = Some(indexer);
            }
        }

        let lag = snapshot.node_height.map(|node| node.saturating_sub(indexer));
        if let StallTransition::EnteredStall { stalled_for } = self.stall.observe(indexer, now) {
            // Stall notification is edge-triggered and bypasses the cooldown gate.
            self.cooldown.record_fired(AlertClass::Stall, now);
            let lag_text = lag.map_or_else(|| "unknown".to_owned(), |lag| lag.to_string());
            evaluation.alerts.push(Alert {
                class: AlertClass::Stall,
                severity: Severity::Critical,
                message: format!(
                    "Indexer stall suspected: height={indexer}, stalled for {}s (> {}s), lag≈{lag_text} blocks.",
                    stalled_for.as_secs(),
                    self.stall.threshold().as_secs()
                ),
                detected_at: now,
                evidence: json!({
                    "indexer_height": indexer,
                    "lag": lag,
                    "stalled_for_seconds": stalled_for.as_secs(),
                    "threshold_seconds": self.stall.threshold().as_secs(),
                }),
            });
            evaluation.stall = Some(StallEvent {
                height: indexer,
                stalled_for,
                lag,
            });
        }
    }

    fn evaluate_host(&mut self, snapshot: &TelemetrySnapshot, evaluation: &mut TickEvaluation) {
        let checks = [
            (
                AlertClass::CpuHigh,
                snapshot.cpu_usage_percent,
                self.cpu_threshold,
                "CPU high load",
                "%",
            ),
            (
                AlertClass::RamHigh,
                snapshot.ram_usage_percent,
                self.ram_threshold,
                "RAM high usage",
                "%",
            ),
            (
                AlertClass::TempHigh,
                snapshot.temperature_celsius,
                self.temp_threshold,
                "Drive temperature high",
                "°C",
            ),
        ];

        for (class, value, threshold, label, unit) in checks {
            let Some(value) = value else {
                continue;
            };
            if value <= threshold {
                continue;
            }

            self.gated(
                Alert {
                    class,
                    severity: Severity::Warning,
                    message: format!("{label}: {value:.1}{unit} (threshold {threshold:.0}{unit})"),
                    detected_at: snapshot.captured_at,
                    evidence: json!({ "value": value, "threshold": threshold }),
                },
                evaluation,
            );
        }
    }

    fn evaluate_gateway(
        &mut self,
        gateway: &GatewayReading,
        now: SystemTime,
        evaluation: &mut TickEvaluation,
    ) {
        match gateway.active {
            Some(true) => {}
            // Already part of this tick's unreadable-sources alert.
            None => return,
            Some(false) => {
                self.gated(
                    Alert {
                        class: AlertClass::ServiceInactive,
                        severity: Severity::Critical,
                        message: "Mining gateway is not active. Check its unit status and journal."
                            .to_owned(),
                        detected_at: now,
                        evidence: json!({ "active": false }),
                    },
                    evaluation,
                );
                return;
            }
        }

        if let Some(job) = &gateway.last_job {
            self.last_job = Some(job.clone());

            if job.clients == 0 {
                let age = now.duration_since(job.announced_at).unwrap_or_default();
                self.gated(
                    Alert {
                        class: AlertClass::ZeroClients,
                        severity: Severity::Warning,
                        message: format!(
                            "Mining gateway has 0 stratum clients connected. Block: {}, last job: {}s ago.",
                            job.block,
                            age.as_secs()
                        ),
                        detected_at: now,
                        evidence: json!({ "block": job.block, "clients": job.clients }),
                    },
                    evaluation,
                );
            }
        }

        let Some(job) = &self.last_job else {
            return;
        };
        let stale_for = now.duration_since(job.announced_at).unwrap_or_default();
        if stale_for > self.gateway_no_job_duration {
            let alert = Alert {
                class: AlertClass::NoProgress,
                severity: Severity::Warning,
                message: format!(
                    "Mining gateway has announced no new job for {}s. Last block: {}.",
                    stale_for.as_secs(),
                    job.block
                ),
                detected_at: now,
                evidence: json!({
                    "block": job.block,
                    "stale_seconds": stale_for.as_secs(),
                    "threshold_seconds": self.gateway_no_job_duration.as_secs(),
                }),
            };
            self.gated(alert, evaluation);
        }
    }

    fn gated(&mut self, alert: Alert, evaluation: &mut TickEvaluation) {
        match self.cooldown.remaining(alert.class, alert.detected_at) {
            None => {
                self.cooldown.record_fired(alert.class, alert.detected_at);
                evaluation.alerts.push(alert);
            }
            Some(remaining) => evaluation.suppressed.push(Suppression {
                class: alert.class,
                remaining,
            }),
        }
    }
}
