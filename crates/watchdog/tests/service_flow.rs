use bitnode_watchdog::{
    alerter::{AlertError, Notifier},
    audit::AuditLog,
    config::MonitorConfig,
    miner::{MinerReading, MinerWatch},
    models::{MinerSnapshot, TelemetrySnapshot},
    recovery::{RecoveryGate, RecoveryOutcome},
    router::AlertRouter,
    service::{Dispatcher, StallRecovery, process_miner_reading, process_snapshot},
    service_control::{ActionError, CorrectiveAction},
    sources::{HealthProbe, ProbeReport},
};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};
use tempfile::NamedTempFile;

const BASE: u64 = 1_700_000_000;

#[derive(Default)]
struct MockNotifier {
    sent: Mutex<Vec<String>>,
}

impl MockNotifier {
    fn sent(&self) -> Vec<String> {
        match self.sent.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for MockNotifier {
    async fn send_alert(&self, text: &str) -> Result<(), AlertError> {
        let mut guard = match self.sent.lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(()),
        };
        guard.push(text.to_owned());
        Ok(())
    }
}

struct HealthyNode;

#[async_trait::async_trait]
impl HealthProbe for HealthyNode {
    async fn probe(&self) -> ProbeReport {
        ProbeReport {
            ok: true,
            latency: Duration::from_millis(150),
            detail: Some("blocks=200".to_owned()),
        }
    }
}

#[derive(Default)]
struct CountingRestart {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl CorrectiveAction for CountingRestart {
    async fn perform(&self, _target: &str) -> Result<(), ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn at(second: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(BASE + second)
}

fn heights(second: u64, node: u64, indexer: u64) -> TelemetrySnapshot {
    TelemetrySnapshot {
        node_height: Some(node),
        indexer_height: Some(indexer),
        ..TelemetrySnapshot::empty(at(second))
    }
}

fn audit_messages(audit: &AuditLog) -> Vec<String> {
    match audit.read_lines() {
        Ok(lines) => lines.into_iter().map(|line| line.message).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn stalled_indexer_alerts_once_per_episode_and_restarts() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };

    let audit = Arc::new(AuditLog::new(temp_file.path()));
    let notifier = Arc::new(MockNotifier::default());
    let dispatcher = Dispatcher::new(audit.clone(), notifier.clone());
    let restart = Arc::new(CountingRestart::default());

    let mut router = AlertRouter::new(&MonitorConfig::default());
    let mut recovery = StallRecovery {
        gate: RecoveryGate::new(
            true,
            Duration::from_secs(600),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ),
        probe: Arc::new(HealthyNode),
        action: restart.clone(),
        target: "fulcrum".to_owned(),
    };

    let ticks = [
        heights(0, 200, 100),
        heights(600, 200, 100),
        heights(1200, 200, 100),
        heights(1810, 200, 100),
        heights(2100, 200, 100),
        heights(2400, 200, 100),
        heights(2500, 201, 101),
        heights(4301, 201, 101),
    ];

    let mut outcomes = Vec::new();
    for tick in &ticks {
        let report = process_snapshot(&mut router, Some(&mut recovery), &dispatcher, tick).await;
        if let Some(outcome) = report.recovery {
            outcomes.push(outcome);
        }
    }

    assert_eq!(outcomes.len(), 2);
    assert!(
        outcomes
            .iter()
            .all(|outcome| matches!(outcome, RecoveryOutcome::Performed { .. }))
    );
    assert_eq!(restart.calls.load(Ordering::SeqCst), 2);

    let sent = notifier.sent();
    let stalls = sent.iter().filter(|text| text.contains("[stall]")).count();
    let recoveries = sent.iter().filter(|text| text.contains("[recovery]")).count();
    assert_eq!(stalls, 2);
    assert_eq!(recoveries, 2);
    assert!(sent.iter().any(|text| text.contains("height=100")));
    assert!(sent.iter().any(|text| text.contains("height=101")));

    let messages = audit_messages(&audit);
    let progress = messages
        .iter()
        .filter(|message| message.starts_with("Heights:"))
        .count();
    assert_eq!(progress, 2);
    assert_eq!(
        messages
            .iter()
            .filter(|message| message.starts_with("[RECOVERY] fulcrum: performed"))
            .count(),
        2
    );
}

#[tokio::test]
async fn disabled_recovery_is_audited_but_not_announced() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };

    let audit = Arc::new(AuditLog::new(temp_file.path()));
    let notifier = Arc::new(MockNotifier::default());
    let dispatcher = Dispatcher::new(audit.clone(), notifier.clone());
    let restart = Arc::new(CountingRestart::default());

    let mut router = AlertRouter::new(&MonitorConfig::default());
    let mut recovery = StallRecovery {
        gate: RecoveryGate::new(
            false,
            Duration::from_secs(600),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ),
        probe: Arc::new(HealthyNode),
        action: restart.clone(),
        target: "fulcrum".to_owned(),
    };

    for tick in [heights(0, 200, 100), heights(1900, 200, 100)] {
        process_snapshot(&mut router, Some(&mut recovery), &dispatcher, &tick).await;
    }

    assert_eq!(restart.calls.load(Ordering::SeqCst), 0);
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent.iter().all(|text| text.contains("[stall]")));

    let messages = audit_messages(&audit);
    assert!(
        messages
            .iter()
            .any(|message| message == "[RECOVERY] fulcrum: skipped: auto-recovery disabled")
    );
}

#[tokio::test]
async fn unreachable_sources_are_merged_and_then_suppressed() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };

    let audit = Arc::new(AuditLog::new(temp_file.path()));
    let notifier = Arc::new(MockNotifier::default());
    let dispatcher = Dispatcher::new(audit.clone(), notifier.clone());
    let mut router = AlertRouter::new(&MonitorConfig::default());

    let first = process_snapshot(
        &mut router,
        None,
        &dispatcher,
        &TelemetrySnapshot::empty(at(0)),
    )
    .await;
    let second = process_snapshot(
        &mut router,
        None,
        &dispatcher,
        &TelemetrySnapshot::empty(at(120)),
    )
    .await;

    assert_eq!(first.dispatched, 1);
    assert_eq!(first.delivered, 1);
    assert_eq!(second.dispatched, 0);
    assert_eq!(second.suppressed, 1);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent.iter().any(|text| text.contains("node RPC and indexer height")));

    let messages = audit_messages(&audit);
    assert!(
        messages
            .iter()
            .any(|message| message == "[SUPPRESSED] unreachable: cooldown active, 780s remaining")
    );
}

struct RejectingNotifier;

#[async_trait::async_trait]
impl Notifier for RejectingNotifier {
    async fn send_alert(&self, _text: &str) -> Result<(), AlertError> {
        Err(AlertError::Telegram(teloxide::RequestError::Io(
            std::io::Error::other("network down").into(),
        )))
    }
}

#[tokio::test]
async fn failed_delivery_keeps_the_audit_record() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };

    let audit = Arc::new(AuditLog::new(temp_file.path()));
    let dispatcher = Dispatcher::new(audit.clone(), Arc::new(RejectingNotifier));
    let mut router = AlertRouter::new(&MonitorConfig::default());

    let snapshot = TelemetrySnapshot {
        cpu_usage_percent: Some(99.0),
        ..heights(0, 200, 100)
    };
    let report = process_snapshot(&mut router, None, &dispatcher, &snapshot).await;

    assert_eq!(report.dispatched, 1);
    assert_eq!(report.delivered, 0);

    let messages = audit_messages(&audit);
    assert!(
        messages
            .iter()
            .any(|message| message.starts_with("[ALERT] cpu-high: CPU high load"))
    );
    assert!(
        messages
            .iter()
            .any(|message| message.starts_with("[WARN] delivery of cpu-high alert failed"))
    );
}

fn miner(second: u64, hash_rate: f64, accepted: u64, fallback: bool) -> MinerReading {
    MinerReading::Snapshot(MinerSnapshot {
        captured_at: at(second),
        hash_rate: Some(hash_rate),
        shares_accepted: Some(accepted),
        shares_rejected: Some(0),
        using_fallback: Some(fallback),
        primary_pool: "pool.local:3333".to_owned(),
        fallback_pool: "backup.example:3333".to_owned(),
        temperature_celsius: Some(52.0),
        power_watts: Some(14.5),
    })
}

#[tokio::test]
async fn miner_loop_reports_fallback_and_stuck_shares() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };

    let audit = Arc::new(AuditLog::new(temp_file.path()));
    let notifier = Arc::new(MockNotifier::default());
    let dispatcher = Dispatcher::new(audit.clone(), notifier.clone());
    let mut watch = MinerWatch::new("http://10.0.0.20", &MonitorConfig::default());

    let readings = [
        miner(0, 480.0, 10, false),
        miner(30, 470.0, 12, true),
        miner(60, 475.0, 12, true),
        miner(960, 460.0, 12, false),
        MinerReading::Unreachable {
            at: at(990),
            error: "connection refused".to_owned(),
        },
    ];

    for reading in &readings {
        process_miner_reading(&mut watch, &dispatcher, reading).await;
    }

    let sent = notifier.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().any(|text| text.contains("[fallback]")));
    assert!(
        sent.iter()
            .any(|text| text.contains("[no-progress]") && text.contains("no accepted shares"))
    );
    assert!(
        sent.iter()
            .any(|text| text.contains("[unreachable]") && text.contains("http://10.0.0.20"))
    );

    let messages = audit_messages(&audit);
    assert!(
        messages
            .iter()
            .any(|message| message.starts_with("[SUPPRESSED] fallback"))
    );
}
