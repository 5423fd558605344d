use crate::config::MonitorConfig;
use crate::cooldown::CooldownGate;
use crate::models::{Alert, AlertClass, MinerSnapshot, Severity};
use crate::router::Suppression;
use crate::sources::{MinerSource, SourceError};
use crate::stall::StallDetector;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, SystemTime};

/// Client for the AxeOS `/api/system/info` endpoint.
#[derive(Debug, Clone)]
pub struct MinerClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemInfo {
    hash_rate: Option<f64>,
    shares_accepted: Option<u64>,
    shares_rejected: Option<u64>,
    is_using_fallback_stratum: Option<serde_json::Value>,
    #[serde(rename = "stratumURL")]
    stratum_url: Option<String>,
    stratum_port: Option<u32>,
    #[serde(rename = "fallbackStratumURL")]
    fallback_stratum_url: Option<String>,
    fallback_stratum_port: Option<u32>,
    temp: Option<f64>,
    power: Option<f64>,
}

impl MinerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

fn pool(url: Option<String>, port: Option<u32>) -> String {
    let url = url.unwrap_or_else(|| "?".to_owned());
    match port {
        Some(port) => format!("{url}:{port}"),
        None => url,
    }
}

// Firmware versions disagree on whether this flag is a bool or 0/1.
fn fallback_flag(value: Option<&serde_json::Value>) -> Option<bool> {
    match value? {
        serde_json::Value::Bool(flag) => Some(*flag),
        serde_json::Value::Number(number) => number.as_u64().map(|flag| flag != 0),
        _ => None,
    }
}

fn into_snapshot(info: SystemInfo, captured_at: SystemTime) -> MinerSnapshot {
    MinerSnapshot {
        captured_at,
        hash_rate: info.hash_rate,
        shares_accepted: info.shares_accepted,
        shares_rejected: info.shares_rejected,
        using_fallback: fallback_flag(info.is_using_fallback_stratum.as_ref()),
        primary_pool: pool(info.stratum_url, info.stratum_port),
        fallback_pool: pool(info.fallback_stratum_url, info.fallback_stratum_port),
        temperature_celsius: info.temp,
        power_watts: info.power,
    }
}

#[async_trait::async_trait]
impl MinerSource for MinerClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self) -> Result<MinerSnapshot, SourceError> {
        let url = format!("{}/api/system/info", self.base_url);
        let info = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<SystemInfo>()
            .await?;

        Ok(into_snapshot(info, SystemTime::now()))
    }
}

/// Outcome of one miner poll.
#[derive(Debug, Clone, PartialEq)]
pub enum MinerReading {
    Snapshot(MinerSnapshot),
    Unreachable { at: SystemTime, error: String },
}

impl MinerReading {
    pub fn observed_at(&self) -> SystemTime {
        match self {
            Self::Snapshot(snapshot) => snapshot.captured_at,
            Self::Unreachable { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MinerEvaluation {
    pub alerts: Vec<Alert>,
    pub suppressed: Vec<Suppression>,
}

/// Detector state of the miner loop. Owned by that loop alone.
#[derive(Debug, Clone)]
pub struct MinerWatch {
    endpoint: String,
    min_rate: f64,
    no_progress_duration: Duration,
    cooldown: CooldownGate,
    shares: StallDetector,
}

impl MinerWatch {
    pub fn new(endpoint: &str, config: &MonitorConfig) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            min_rate: config.miner_min_rate,
            no_progress_duration: config.miner_no_progress_duration,
            cooldown: CooldownGate::new(config.miner_cooldown),
            shares: StallDetector::new(config.miner_no_progress_duration),
        }
    }

    pub fn evaluate(&mut self, reading: &MinerReading) -> MinerEvaluation {
        let mut evaluation = MinerEvaluation::default();

        let snapshot = match reading {
            MinerReading::Snapshot(snapshot) => snapshot,
            MinerReading::Unreachable { at, error } => {
                let alert = Alert {
                    class: AlertClass::Unreachable,
                    severity: Severity::Critical,
                    message: format!("Cannot reach miner at {} ({error}).", self.endpoint),
                    detected_at: *at,
                    evidence: json!({ "endpoint": self.endpoint, "error": error }),
                };
                self.gated(alert, &mut evaluation);
                return evaluation;
            }
        };
        let now = snapshot.captured_at;

        if let Some(accepted) = snapshot.shares_accepted {
            let _ = self.shares.observe(accepted, now);
        }

        if snapshot.using_fallback == Some(true) {
            let alert = Alert {
                class: AlertClass::Fallback,
                severity: Severity::Warning,
                message: format!(
                    "Miner is using the FALLBACK pool. primary={} fallback={} hr={} acc={} rej={}",
                    snapshot.primary_pool,
                    snapshot.fallback_pool,
                    display_rate(snapshot.hash_rate),
                    display(snapshot.shares_accepted),
                    display(snapshot.shares_rejected),
                ),
                detected_at: now,
                evidence: json!({
                    "primary_pool": snapshot.primary_pool,
                    "fallback_pool": snapshot.fallback_pool,
                }),
            };
            self.gated(alert, &mut evaluation);
        }

        let mut reasons = Vec::new();
        if snapshot.hash_rate.is_none_or(|rate| rate < self.min_rate) {
            reasons.push(format!(
                "hash rate below {:.0} H/s (hr={})",
                self.min_rate,
                display_rate(snapshot.hash_rate)
            ));
        }
        if self
            .shares
            .stalled_for(now)
            .is_some_and(|stalled_for| stalled_for >= self.no_progress_duration)
        {
            reasons.push(format!(
                "no accepted shares for ≥{}s",
                self.no_progress_duration.as_secs()
            ));
        }

        if !reasons.is_empty() {
            let alert = Alert {
                class: AlertClass::NoProgress,
                severity: Severity::Critical,
                message: format!(
                    "Miner not progressing ({}). fallback={} acc={} rej={} temp={}C power={}W",
                    reasons.join("; "),
                    display(snapshot.using_fallback),
                    display(snapshot.shares_accepted),
                    display(snapshot.shares_rejected),
                    display(snapshot.temperature_celsius),
                    display(snapshot.power_watts),
                ),
                detected_at: now,
                evidence: json!({
                    "reasons": reasons,
                    "hash_rate": snapshot.hash_rate,
                    "shares_accepted": snapshot.shares_accepted,
                }),
            };
            self.gated(alert, &mut evaluation);
        }

        evaluation
    }

    fn gated(&mut self, alert: Alert, evaluation: &mut MinerEvaluation) {
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

fn display<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "?".to_owned(), |value| value.to_string())
}

fn display_rate(rate: Option<f64>) -> String {
    rate.map_or_else(|| "?".to_owned(), |rate| format!("{rate:.0}H/s"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn at(second: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(second)
    }

    fn snapshot(second: u64, hash_rate: f64, accepted: u64) -> MinerReading {
        MinerReading::Snapshot(MinerSnapshot {
            captured_at: at(second),
            hash_rate: Some(hash_rate),
            shares_accepted: Some(accepted),
            shares_rejected: Some(0),
            using_fallback: Some(false),
            primary_pool: "pool.local:23334".to_owned(),
            fallback_pool: "backup.pool:3333".to_owned(),
            temperature_celsius: Some(55.0),
            power_watts: Some(14.2),
        })
    }

    fn watch() -> MinerWatch {
        MinerWatch::new("http://bitaxe.local", &MonitorConfig::default())
    }

    fn classes(evaluation: &MinerEvaluation) -> Vec<AlertClass> {
        evaluation.alerts.iter().map(|alert| alert.class).collect()
    }

    #[test]
    fn axeos_payload_is_mapped() {
        let payload = r#"{
            "hashRate": 512.4,
            "sharesAccepted": 1200,
            "sharesRejected": 3,
            "isUsingFallbackStratum": 1,
            "stratumURL": "pool.local",
            "stratumPort": 23334,
            "fallbackStratumURL": "backup.pool",
            "fallbackStratumPort": 3333,
            "temp": 58.5,
            "power": 14.9,
            "voltage": 5100
        }"#;
        let info = serde_json::from_str::<SystemInfo>(payload);
        assert!(info.is_ok());
        let info = match info {
            Ok(info) => info,
            Err(_) => return,
        };

        let snapshot = into_snapshot(info, at(0));
        assert_eq!(snapshot.using_fallback, Some(true));
        assert_eq!(snapshot.primary_pool, "pool.local:23334");
        assert_eq!(snapshot.fallback_pool, "backup.pool:3333");
        assert_eq!(snapshot.shares_accepted, Some(1_200));
    }

    #[test]
    fn healthy_miner_is_quiet() {
        let mut watch = watch();
        for tick in 0..40u64 {
            let evaluation = watch.evaluate(&snapshot(tick * 30, 500.0, 100 + tick));
            assert!(evaluation.alerts.is_empty());
        }
    }

    #[test]
    fn low_hash_rate_and_frozen_shares_merge_into_one_alert() {
        let mut watch = watch();
        assert_eq!(classes(&watch.evaluate(&snapshot(0, 500.0, 10))), vec![]);

        let evaluation = watch.evaluate(&snapshot(900, 10.0, 10));
        assert_eq!(classes(&evaluation), vec![AlertClass::NoProgress]);
        assert!(evaluation.alerts.iter().all(|alert| {
            alert.message.contains("hash rate below 50 H/s")
                && alert.message.contains("no accepted shares for ≥900s")
        }));
    }

    #[test]
    fn frozen_shares_alert_repeats_only_after_cooldown() {
        let mut watch = watch();
        let _ = watch.evaluate(&snapshot(0, 500.0, 10));

        assert!(watch.evaluate(&snapshot(899, 500.0, 10)).alerts.is_empty());
        assert_eq!(
            classes(&watch.evaluate(&snapshot(900, 500.0, 10))),
            vec![AlertClass::NoProgress]
        );

        let evaluation = watch.evaluate(&snapshot(1_000, 500.0, 10));
        assert!(evaluation.alerts.is_empty());
        assert_eq!(evaluation.suppressed.len(), 1);

        assert_eq!(
            classes(&watch.evaluate(&snapshot(1_200, 500.0, 10))),
            vec![AlertClass::NoProgress]
        );
    }

    #[test]
    fn fallback_and_unreachable_are_reported() {
        let mut watch = watch();
        let fallback = match snapshot(0, 500.0, 10) {
            MinerReading::Snapshot(snapshot) => MinerReading::Snapshot(MinerSnapshot {
                using_fallback: Some(true),
                ..snapshot
            }),
            other => other,
        };
        assert_eq!(classes(&watch.evaluate(&fallback)), vec![AlertClass::Fallback]);

        let unreachable = MinerReading::Unreachable {
            at: at(30),
            error: "connection refused".to_owned(),
        };
        let evaluation = watch.evaluate(&unreachable);
        assert_eq!(classes(&evaluation), vec![AlertClass::Unreachable]);
        assert!(
            evaluation
                .alerts
                .iter()
                .all(|alert| alert.message.contains("http://bitaxe.local"))
        );
    }
}
