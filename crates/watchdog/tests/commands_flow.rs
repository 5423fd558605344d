use bitnode_watchdog::{
    alerter::{AlertError, CommandInbox, MAX_MESSAGE_CHARS, Notifier},
    audit::{AuditLog, progress_message},
    collector::GatewaySources,
    commands::{Command, CommandContext, run_command_loop},
    models::{GatewayJob, UnitDiagnostics},
    regression::RegressionEstimator,
    service_control::{ActionError, CorrectiveAction},
    sources::{
        DiagnosticSource, HealthProbe, HealthSource, JobSource, Metric, MetricSource, ProbeReport,
        SourceError,
    },
};
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

const BASE: u64 = 1_700_000_000;

#[derive(Default)]
struct MockNotifier {
    sent: Mutex<Vec<String>>,
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

struct SlowNode;

#[async_trait::async_trait]
impl HealthProbe for SlowNode {
    async fn probe(&self) -> ProbeReport {
        ProbeReport {
            ok: true,
            latency: Duration::from_millis(2_500),
            detail: Some("blocks=820000".to_owned()),
        }
    }
}

struct FixedMetrics;

#[async_trait::async_trait]
impl MetricSource for FixedMetrics {
    async fn read_metric(&self, metric: Metric) -> Result<f64, SourceError> {
        match metric {
            Metric::CpuPercent => Ok(97.5),
            Metric::RamPercent => Ok(41.0),
            Metric::TemperatureCelsius => Err(SourceError::Missing),
        }
    }
}

#[derive(Default)]
struct RecordingRestart {
    targets: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl CorrectiveAction for RecordingRestart {
    async fn perform(&self, target: &str) -> Result<(), ActionError> {
        if let Ok(mut guard) = self.targets.lock() {
            guard.push(target.to_owned());
        }
        Ok(())
    }
}

struct NoisyGateway;

#[async_trait::async_trait]
impl HealthSource for NoisyGateway {
    async fn read_health(&self) -> Result<bool, SourceError> {
        Ok(true)
    }
}

#[async_trait::async_trait]
impl JobSource for NoisyGateway {
    async fn latest_job(&self) -> Result<Option<GatewayJob>, SourceError> {
        Ok(None)
    }
}

#[async_trait::async_trait]
impl DiagnosticSource for NoisyGateway {
    async fn diagnostics(&self) -> UnitDiagnostics {
        UnitDiagnostics {
            unit: "datum.service".to_owned(),
            status: "● datum.service - DATUM Gateway\n   Active: active (running)".repeat(60),
            journal: "ERROR: Stratum timeout waiting for template\n".repeat(160),
        }
    }
}

/// Replays fixed batches, then cancels the loop it feeds.
struct ScriptedInbox {
    batches: VecDeque<Vec<String>>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl CommandInbox for ScriptedInbox {
    async fn next_batch(&mut self) -> Result<Vec<String>, AlertError> {
        match self.batches.pop_front() {
            Some(batch) => Ok(batch),
            None => {
                self.cancel.cancel();
                std::future::pending().await
            }
        }
    }
}

fn at(second: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(BASE + second)
}

fn context(audit: Arc<AuditLog>, restart: Arc<RecordingRestart>) -> CommandContext {
    CommandContext {
        audit,
        node: Arc::new(SlowNode),
        metrics: Arc::new(FixedMetrics),
        gateway: None,
        miner: None,
        restart,
        indexer_unit: "fulcrum".to_owned(),
        node_unit: "bitcoind".to_owned(),
        auto_recovery: Arc::new(AtomicBool::new(false)),
        cpu_threshold: 90.0,
        ram_threshold: 90.0,
        temp_threshold: 65.0,
        read_timeout: Duration::from_secs(5),
        estimator: RegressionEstimator::default(),
    }
}

fn write_progress(audit: &AuditLog) {
    for step in 0..6u64 {
        let indexer = 1_000 + step * 600;
        audit.append_at(at(step * 600), &progress_message(20_000, indexer, None));
    }
}

#[tokio::test]
async fn eta_and_history_read_the_audit_log() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };
    let audit = Arc::new(AuditLog::new(temp_file.path()));
    write_progress(&audit);
    let context = context(audit, Arc::new(RecordingRestart::default()));

    let eta = context.handle(&Command::Eta).await;
    assert!(eta.contains("Indexer sync ETA (regression)"));
    assert!(eta.contains("Speed (regression): 1.000 blk/s"));
    assert!(eta.contains("Samples used: 6 progress points"));
    assert!(eta.contains("Current lag: 16000 blocks"));

    let history = context
        .handle(&Command::parse("/history tail 2").unwrap_or(Command::Help))
        .await;
    assert!(history.contains("indexer=4000") || history.contains("4000"));
}

#[tokio::test]
async fn eta_without_data_asks_to_wait() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };
    let context = context(
        Arc::new(AuditLog::new(temp_file.path())),
        Arc::new(RecordingRestart::default()),
    );

    let eta = context.handle(&Command::Eta).await;
    assert!(eta.starts_with("No Heights data found"));
}

#[tokio::test]
async fn autorestart_flips_the_shared_flag() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };
    let audit = Arc::new(AuditLog::new(temp_file.path()));
    let context = context(audit.clone(), Arc::new(RecordingRestart::default()));
    let flag = context.auto_recovery.clone();

    let reply = context.handle(&Command::AutoRestart(Some(true))).await;
    assert_eq!(reply, "Auto-restart is now on.");
    assert!(flag.load(Ordering::Relaxed));

    let reply = context.handle(&Command::AutoRestart(None)).await;
    assert_eq!(reply, "Auto-restart is on.");

    let lines = audit.read_lines().unwrap_or_default();
    assert!(
        lines
            .iter()
            .any(|line| line.message == "[CONFIG] auto-restart turned on via command channel")
    );
}

#[tokio::test]
async fn manual_restart_bypasses_the_gate_and_is_audited() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };
    let audit = Arc::new(AuditLog::new(temp_file.path()));
    let restart = Arc::new(RecordingRestart::default());
    let context = context(audit.clone(), restart.clone());

    let reply = context.handle(&Command::RestartNode).await;
    assert_eq!(reply, "♻️ bitcoind restart triggered.");

    let targets = match restart.targets.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => Vec::new(),
    };
    assert_eq!(targets, vec!["bitcoind".to_owned()]);

    let lines = audit.read_lines().unwrap_or_default();
    assert!(
        lines
            .iter()
            .any(|line| line.message == "[MANUAL] restart of bitcoind requested via command channel")
    );
}

#[tokio::test]
async fn status_and_rpc_check_use_live_readings() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };
    let audit = Arc::new(AuditLog::new(temp_file.path()));
    write_progress(&audit);
    let context = context(audit, Arc::new(RecordingRestart::default()));

    let status = context.handle(&Command::Status).await;
    assert!(status.contains("Heights: node=20000, indexer=4000"));
    assert!(status.contains("CPU: 97.5%"));
    assert!(status.contains("CPU: high load: 97.5%"));
    assert!(!status.contains("Drive:"));
    assert!(!status.contains("Gateway"));

    let rpc = context.handle(&Command::CheckRpc).await;
    assert_eq!(rpc, "✅ Node RPC ok. blocks=820000, latency=2.50s");
}

#[tokio::test]
async fn command_loop_answers_each_command_until_cancelled() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };
    let context = context(
        Arc::new(AuditLog::new(temp_file.path())),
        Arc::new(RecordingRestart::default()),
    );
    let notifier = Arc::new(MockNotifier::default());
    let cancel = CancellationToken::new();

    let inbox = ScriptedInbox {
        batches: VecDeque::from([
            vec!["/help".to_owned(), "good morning".to_owned()],
            vec!["/frobnicate".to_owned()],
        ]),
        cancel: cancel.clone(),
    };

    let finished = tokio::time::timeout(
        Duration::from_secs(5),
        run_command_loop(inbox, context, notifier.clone(), cancel),
    )
    .await;
    assert!(finished.is_ok());

    let sent = match notifier.sent.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => Vec::new(),
    };
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().any(|text| text.starts_with("Bitnode monitor commands:")));
    assert!(sent.iter().any(|text| text.starts_with("Unknown command /frobnicate")));
}

#[tokio::test]
async fn gateway_investigation_is_bounded_for_telegram() {
    let temp_file = match NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };
    let audit = Arc::new(AuditLog::new(temp_file.path()));

    let without_gateway = context(audit.clone(), Arc::new(RecordingRestart::default()));
    let reply = without_gateway.handle(&Command::InvestigateGateway).await;
    assert_eq!(reply, "No mining gateway is configured.");

    let gateway = Arc::new(NoisyGateway);
    let context = CommandContext {
        gateway: Some(GatewaySources {
            health: gateway.clone(),
            jobs: gateway.clone(),
            diagnostics: gateway,
        }),
        ..context(audit, Arc::new(RecordingRestart::default()))
    };

    let reply = context
        .handle(&Command::parse("/investigate_gateway").unwrap_or(Command::Help))
        .await;
    assert!(reply.starts_with("🔎 Mining gateway investigation (datum.service)"));
    assert!(reply.contains("Keywords: error:160, stratum:160, template:160, timeout:160"));
    assert!(reply.contains("== journal (tail) =="));
    assert!(reply.chars().count() <= MAX_MESSAGE_CHARS);
}
