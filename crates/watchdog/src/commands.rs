use crate::{
    alerter::{CommandInbox, MAX_MESSAGE_CHARS, Notifier, truncate_message},
    audit::AuditLog,
    collector::GatewaySources,
    regression::RegressionEstimator,
    report::{self, HistoryMode, StatusView},
    service::poll_miner,
    service_control::CorrectiveAction,
    sources::{HealthProbe, Metric, MetricSource, MinerSource, bounded},
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const INBOX_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Eta,
    History {
        mode: HistoryMode,
        count: Option<usize>,
    },
    CheckRpc,
    RestartIndexer,
    RestartNode,
    Gateway,
    InvestigateGateway,
    Miner,
    AutoRestart(Option<bool>),
    Unknown(String),
}

impl Command {
    /// `None` for text that is not a command at all.
    pub fn parse(text: &str) -> Option<Self> {
        let mut words = text.split_whitespace();
        let head = words.next()?.strip_prefix('/')?;
        // Group chats address commands as `/status@botname`.
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

        let command = match name.as_str() {
            "start" | "help" => Self::Help,
            "status" => Self::Status,
            "eta" => Self::Eta,
            "history" => {
                let mut mode = HistoryMode::default();
                let mut count = None;
                for word in words {
                    match word.to_ascii_lowercase().as_str() {
                        "head" => mode = HistoryMode::Head,
                        "tail" => mode = HistoryMode::Tail,
                        "full" => mode = HistoryMode::Full,
                        other => count = other.parse().ok().or(count),
                    }
                }
                Self::History { mode, count }
            }
            "check_rpc" => Self::CheckRpc,
            "restart_indexer" => Self::RestartIndexer,
            "restart_node" => Self::RestartNode,
            "gateway" => Self::Gateway,
            "investigate_gateway" => Self::InvestigateGateway,
            "miner" => Self::Miner,
            "autorestart" => Self::AutoRestart(match words.next() {
                Some("on") => Some(true),
                Some("off") => Some(false),
                _ => None,
            }),
            other => Self::Unknown(other.to_owned()),
        };
        Some(command)
    }
}

pub fn help_text() -> &'static str {
    "Bitnode monitor commands:\n\
     /status - current heights, services and host metrics\n\
     /eta - regression-based indexer sync ETA\n\
     /history [head|tail|full] [n] - logged progress samples\n\
     /check_rpc - probe the node RPC\n\
     /restart_indexer - restart the indexer unit\n\
     /restart_node - restart the node unit\n\
     /gateway - mining gateway status\n\
     /investigate_gateway - gateway unit status, journal tail and keyword counts\n\
     /miner - ASIC miner status\n\
     /autorestart [on|off] - show or toggle automatic indexer restarts"
}

/// Collaborators a command may touch. The auto-restart flag is the only
/// state shared with the main loop.
pub struct CommandContext {
    pub audit: Arc<AuditLog>,
    pub node: Arc<dyn HealthProbe>,
    pub metrics: Arc<dyn MetricSource>,
    pub gateway: Option<GatewaySources>,
    pub miner: Option<Arc<dyn MinerSource>>,
    pub restart: Arc<dyn CorrectiveAction>,
    pub indexer_unit: String,
    pub node_unit: String,
    pub auto_recovery: Arc<AtomicBool>,
    pub cpu_threshold: f64,
    pub ram_threshold: f64,
    pub temp_threshold: f64,
    pub read_timeout: Duration,
    pub estimator: RegressionEstimator,
}

impl CommandContext {
    pub async fn handle(&self, command: &Command) -> String {
        match command {
            Command::Help => help_text().to_owned(),
            Command::Status => self.status().await,
            Command::Eta => match self.audit.progress_samples() {
                Ok(samples) => report::render_eta(&samples, &self.estimator),
                Err(error) => format!("Could not read the audit log: {error}"),
            },
            Command::History { mode, count } => match self.audit.progress_records() {
                Ok(records) => report::render_history(&records, *mode, *count, SystemTime::now()),
                Err(error) => format!("Could not read the audit log: {error}"),
            },
            Command::CheckRpc => self.check_rpc().await,
            Command::RestartIndexer => self.manual_restart(&self.indexer_unit).await,
            Command::RestartNode => self.manual_restart(&self.node_unit).await,
            Command::Gateway => self.gateway().await,
            Command::InvestigateGateway => self.investigate_gateway().await,
            Command::Miner => match &self.miner {
                Some(miner) => {
                    let reading = poll_miner(miner.as_ref(), self.read_timeout).await;
                    report::render_miner(miner.endpoint(), &reading)
                }
                None => "No miner is configured.".to_owned(),
            },
            Command::AutoRestart(None) => format!(
                "Auto-restart is {}.",
                on_off(self.auto_recovery.load(Ordering::Relaxed))
            ),
            Command::AutoRestart(Some(enabled)) => {
                self.auto_recovery.store(*enabled, Ordering::Relaxed);
                self.audit.append(&format!(
                    "[CONFIG] auto-restart turned {} via command channel",
                    on_off(*enabled)
                ));
                format!("Auto-restart is now {}.", on_off(*enabled))
            }
            Command::Unknown(name) => {
                format!("Unknown command /{name}. Send /help for available commands.")
            }
        }
    }

    async fn status(&self) -> String {
        let read = |metric| bounded(self.read_timeout, self.metrics.read_metric(metric));
        let (cpu, ram, temperature, gateway_active) = tokio::join!(
            read(Metric::CpuPercent),
            read(Metric::RamPercent),
            read(Metric::TemperatureCelsius),
            self.gateway_active(),
        );

        let view = StatusView {
            progress_line: self
                .audit
                .last_progress_line()
                .ok()
                .flatten()
                .map(|line| line.message),
            gateway_active,
            cpu_percent: cpu.ok(),
            ram_percent: ram.ok(),
            temperature_celsius: temperature.ok(),
            disk: self.metrics.disk_usage(),
            cpu_threshold: self.cpu_threshold,
            ram_threshold: self.ram_threshold,
            temp_threshold: self.temp_threshold,
            auto_recovery: self.auto_recovery.load(Ordering::Relaxed),
            recent_alerts: self.audit.recent_alerts(3).unwrap_or_default(),
        };
        report::render_status(&view)
    }

    async fn gateway_active(&self) -> Option<Option<bool>> {
        let gateway = self.gateway.as_ref()?;
        Some(
            bounded(self.read_timeout, gateway.health.read_health())
                .await
                .ok(),
        )
    }

    async fn gateway(&self) -> String {
        let Some(gateway) = &self.gateway else {
            return "No mining gateway is configured.".to_owned();
        };
        let (active, job) = tokio::join!(
            bounded(self.read_timeout, gateway.health.read_health()),
            bounded(self.read_timeout, gateway.jobs.latest_job()),
        );
        report::render_gateway(active.ok(), job.ok().flatten().as_ref(), SystemTime::now())
    }

    async fn investigate_gateway(&self) -> String {
        let Some(gateway) = &self.gateway else {
            return "No mining gateway is configured.".to_owned();
        };
        // Status and journal are read side by side, each bounded by `read_timeout`.
        let limit = self.read_timeout * 2;
        match tokio::time::timeout(limit, gateway.diagnostics.diagnostics()).await {
            Ok(diagnostics) => {
                truncate_message(&report::render_diagnostics(&diagnostics), MAX_MESSAGE_CHARS)
            }
            Err(_) => format!(
                "❌ Gateway investigation timed out after {}s.",
                limit.as_secs()
            ),
        }
    }

    async fn check_rpc(&self) -> String {
        match tokio::time::timeout(self.read_timeout, self.node.probe()).await {
            Err(_) => format!(
                "❌ Node RPC timed out after {}s.",
                self.read_timeout.as_secs()
            ),
            Ok(report) if report.ok => format!(
                "✅ Node RPC ok. {}, latency={:.2}s",
                report.detail.as_deref().unwrap_or("no detail"),
                report.latency.as_secs_f64()
            ),
            Ok(report) => format!(
                "❌ Node RPC failed: {}",
                report.detail.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    /// Operator-initiated restarts bypass the recovery gate but are audited.
    async fn manual_restart(&self, unit: &str) -> String {
        self.audit.append(&format!(
            "[MANUAL] restart of {unit} requested via command channel"
        ));

        match self.restart.perform(unit).await {
            Ok(()) => {
                self.audit.append(&format!("[MANUAL] {unit} restart triggered"));
                format!("♻️ {unit} restart triggered.")
            }
            Err(error) => {
                self.audit
                    .append(&format!("[MANUAL] {unit} restart failed: {error}"));
                format!("❌ Failed to restart {unit}: {error}")
            }
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

pub async fn run_command_loop<I: CommandInbox>(
    mut inbox: I,
    context: CommandContext,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) {
    info!("command loop started");

    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = inbox.next_batch() => batch,
        };

        let texts = match batch {
            Ok(texts) => texts,
            Err(error) => {
                warn!(error = %error, "command poll failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(INBOX_RETRY_DELAY) => continue,
                }
            }
        };

        for text in texts {
            let Some(command) = Command::parse(&text) else {
                continue;
            };
            info!(command = ?command, "command received");

            let reply = context.handle(&command).await;
            if let Err(error) = notifier.send_alert(&reply).await {
                warn!(error = %error, "failed to send command reply");
            }
        }
    }

    info!("command loop stopped");
}
