use crate::models::{DiskUsage, GatewayJob, GatewayReading, TelemetrySnapshot, UnitDiagnostics};
use crate::sources::{
    CommandOutput, CounterSource, DiagnosticSource, HealthProbe, HealthSource, JobSource, Metric,
    MetricSource, ProbeReport, SourceError, bounded, run_command,
};
use chrono::DateTime;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use sysinfo::{Disks, System};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_INDEXER_PATTERN: &str = r"Processed height:\s*([0-9]+)";
/// How far back the indexer journal is searched for the last height line.
pub const DEFAULT_INDEXER_JOURNAL_LINES: u32 = 2000;
pub const GATEWAY_JOB_PATTERN: &str = r"Updating (?:standard|priority) stratum job for block (\d+): ([\d.]+) BTC, (\d+) txns, (\d+) bytes \(Sent to (\d+)";

/// Journal tail length of a gateway investigation.
const DIAGNOSTIC_JOURNAL_LINES: &str = "160";

/// Full-node JSON-RPC client.
#[derive(Debug, Clone)]
pub struct NodeRpc {
    client: Client,
    url: String,
    credentials: Option<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl NodeRpc {
    pub fn new(url: String, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, user: String, password: String) -> Self {
        self.credentials = Some((user, password));
        self
    }

    pub async fn call(&self, method: &str) -> Result<serde_json::Value, SourceError> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "jsonrpc": "1.0",
            "id": "bitnode-monitor",
            "method": method,
            "params": []
        }));
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        // The node answers RPC errors with a non-2xx status and a JSON body.
        let response = request.send().await?.json::<RpcResponse>().await?;

        if let Some(error) = response.error {
            return Err(SourceError::Rpc(format!("{} (code {})", error.message, error.code)));
        }
        response
            .result
            .ok_or_else(|| SourceError::Rpc(format!("{method} returned no result")))
    }

    pub async fn block_count(&self) -> Result<u64, SourceError> {
        let value = self.call("getblockcount").await?;
        value
            .as_u64()
            .ok_or_else(|| SourceError::Parse(format!("getblockcount returned {value}")))
    }
}

#[async_trait::async_trait]
impl CounterSource for NodeRpc {
    async fn read_counter(&self) -> Result<u64, SourceError> {
        self.block_count().await
    }
}

#[async_trait::async_trait]
impl HealthProbe for NodeRpc {
    async fn probe(&self) -> ProbeReport {
        let started = Instant::now();
        let result = self.call("getblockchaininfo").await;
        let latency = started.elapsed();

        match result {
            Ok(info) => ProbeReport {
                ok: true,
                latency,
                detail: info
                    .get("blocks")
                    .and_then(serde_json::Value::as_u64)
                    .map(|blocks| format!("height={blocks}")),
            },
            Err(error) => ProbeReport {
                ok: false,
                latency,
                detail: Some(error.to_string()),
            },
        }
    }
}

/// Reads a counter from the last matching line of a unit's journal.
#[derive(Debug, Clone)]
pub struct JournalCounter {
    unit: String,
    lines: u32,
    pattern: Regex,
    timeout: Duration,
}

impl JournalCounter {
    pub fn new(unit: String, pattern: &str, timeout: Duration) -> Result<Self, regex::Error> {
        Ok(Self {
            unit,
            lines: DEFAULT_INDEXER_JOURNAL_LINES,
            pattern: Regex::new(pattern)?,
            timeout,
        })
    }

    pub fn with_lines(mut self, lines: u32) -> Self {
        self.lines = lines;
        self
    }
}

/// Value of the first capture group of the last match in `text`.
pub fn last_counter_match(pattern: &Regex, text: &str) -> Option<u64> {
    pattern
        .captures_iter(text)
        .filter_map(|captures| captures.get(1)?.as_str().parse().ok())
        .last()
}

#[async_trait::async_trait]
impl CounterSource for JournalCounter {
    async fn read_counter(&self) -> Result<u64, SourceError> {
        let lines = self.lines.to_string();
        let output = run_command(
            "journalctl",
            &["-u", &self.unit, "-n", &lines, "--no-pager"],
            self.timeout,
        )
        .await?;

        if !output.success {
            return Err(SourceError::Command {
                command: format!("journalctl -u {}", self.unit),
                reason: output.stderr.trim().to_owned(),
            });
        }

        last_counter_match(&self.pattern, &output.stdout).ok_or(SourceError::Missing)
    }
}

#[derive(Debug, Clone)]
pub struct SystemdUnit {
    unit: String,
    timeout: Duration,
}

impl SystemdUnit {
    pub fn new(unit: String, timeout: Duration) -> Self {
        Self { unit, timeout }
    }
}

#[async_trait::async_trait]
impl HealthSource for SystemdUnit {
    async fn read_health(&self) -> Result<bool, SourceError> {
        // `is-active` exits non-zero for inactive units; that is still a reading.
        let output = run_command("systemctl", &["is-active", &self.unit], self.timeout).await?;
        Ok(output.stdout.trim() == "active")
    }
}

#[async_trait::async_trait]
impl DiagnosticSource for SystemdUnit {
    async fn diagnostics(&self) -> UnitDiagnostics {
        let unit = self.unit.as_str();
        let status_args = ["status", unit, "-l", "--no-pager"];
        let journal_args = ["-u", unit, "-n", DIAGNOSTIC_JOURNAL_LINES, "--no-pager", "-o", "short-iso"];
        let (status, journal) = tokio::join!(
            run_command("systemctl", &status_args, self.timeout),
            run_command("journalctl", &journal_args, self.timeout),
        );

        UnitDiagnostics {
            unit: self.unit.clone(),
            status: command_text(status),
            journal: command_text(journal),
        }
    }
}

/// `systemctl status` exits non-zero for inactive units, so the exit code
/// is ignored and both streams are kept.
fn command_text(result: Result<CommandOutput, SourceError>) -> String {
    match result {
        Ok(output) if output.stderr.trim().is_empty() => output.stdout.trim().to_owned(),
        Ok(output) => format!("{}\n{}", output.stdout.trim(), output.stderr.trim())
            .trim()
            .to_owned(),
        Err(error) => format!("unavailable: {error}"),
    }
}

/// Latest stratum job announced in the gateway's journal.
#[derive(Debug, Clone)]
pub struct GatewayJournal {
    unit: String,
    pattern: Regex,
    timeout: Duration,
}

impl GatewayJournal {
    pub fn new(unit: String, timeout: Duration) -> Result<Self, regex::Error> {
        Ok(Self {
            unit,
            pattern: Regex::new(GATEWAY_JOB_PATTERN)?,
            timeout,
        })
    }
}

/// Parses one `journalctl -o short-iso` line. Lines without a readable
/// timestamp are stamped with `fallback`.
pub fn parse_job_line(pattern: &Regex, line: &str, fallback: SystemTime) -> Option<GatewayJob> {
    let captures = pattern.captures(line)?;
    let field = |index: usize| captures.get(index).map(|value| value.as_str());

    let announced_at = line
        .split_whitespace()
        .next()
        .and_then(|token| {
            DateTime::parse_from_rfc3339(token)
                .or_else(|_| DateTime::parse_from_str(token, "%Y-%m-%dT%H:%M:%S%z"))
                .ok()
        })
        .map_or(fallback, SystemTime::from);

    Some(GatewayJob {
        block: field(1)?.parse().ok()?,
        reward_btc: field(2)?.parse().ok()?,
        txns: field(3)?.parse().ok()?,
        bytes: field(4)?.parse().ok()?,
        clients: field(5)?.parse().ok()?,
        announced_at,
    })
}

#[async_trait::async_trait]
impl JobSource for GatewayJournal {
    async fn latest_job(&self) -> Result<Option<GatewayJob>, SourceError> {
        let output = run_command(
            "journalctl",
            &["-u", &self.unit, "-n", "50", "--no-pager", "-o", "short-iso"],
            self.timeout,
        )
        .await?;

        let now = SystemTime::now();
        Ok(output
            .stdout
            .lines()
            .rev()
            .find_map(|line| parse_job_line(&self.pattern, line, now)))
    }
}

/// CPU, memory, drive temperature and disk usage of the local host.
#[derive(Debug)]
pub struct HostMetrics {
    system: Mutex<System>,
    hwmon_root: PathBuf,
    disk_mount: Option<PathBuf>,
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new(PathBuf::from("/sys/class/hwmon"), None)
    }
}

impl HostMetrics {
    pub fn new(hwmon_root: PathBuf, disk_mount: Option<PathBuf>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            hwmon_root,
            disk_mount,
        }
    }

    async fn cpu_percent(&self) -> f64 {
        let mut system = self.system.lock().await;
        system.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_usage();
        f64::from(system.global_cpu_usage())
    }

    async fn ram_percent(&self) -> Result<f64, SourceError> {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(SourceError::Missing);
        }
        Ok(system.used_memory() as f64 / total as f64 * 100.0)
    }

    fn mount_usage(&self) -> Option<DiskUsage> {
        let mount = self.disk_mount.as_deref()?;
        let disks = Disks::new_with_refreshed_list();
        let disk = disks.list().iter().find(|disk| disk.mount_point() == mount)?;

        let total_bytes = disk.total_space();
        if total_bytes == 0 {
            return None;
        }
        let free_bytes = disk.available_space();
        Some(DiskUsage {
            free_bytes,
            total_bytes,
            used_percent: total_bytes.saturating_sub(free_bytes) as f64 / total_bytes as f64
                * 100.0,
        })
    }
}

/// First readable `temp*_input` under `root`, converted from milli-°C.
pub async fn read_hwmon_temperature(root: &Path) -> Result<f64, SourceError> {
    let mut inputs = Vec::new();
    let mut chips = tokio::fs::read_dir(root).await?;
    while let Some(chip) = chips.next_entry().await? {
        let Ok(mut entries) = tokio::fs::read_dir(chip.path()).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("temp") && name.ends_with("_input") {
                inputs.push(entry.path());
            }
        }
    }
    inputs.sort();

    for input in inputs {
        let Ok(raw) = tokio::fs::read_to_string(&input).await else {
            continue;
        };
        if let Ok(millidegrees) = raw.trim().parse::<f64>() {
            return Ok(millidegrees / 1000.0);
        }
    }
    Err(SourceError::Missing)
}

#[async_trait::async_trait]
impl MetricSource for HostMetrics {
    async fn read_metric(&self, metric: Metric) -> Result<f64, SourceError> {
        match metric {
            Metric::CpuPercent => Ok(self.cpu_percent().await),
            Metric::RamPercent => self.ram_percent().await,
            Metric::TemperatureCelsius => read_hwmon_temperature(&self.hwmon_root).await,
        }
    }

    fn disk_usage(&self) -> Option<DiskUsage> {
        self.mount_usage()
    }
}

/// Gateway collaborators read as part of the main tick.
#[derive(Clone)]
pub struct GatewaySources {
    pub health: Arc<dyn HealthSource>,
    pub jobs: Arc<dyn JobSource>,
    pub diagnostics: Arc<dyn DiagnosticSource>,
}

/// Reads every main-tick source concurrently, each bounded by `read_timeout`.
#[derive(Clone)]
pub struct Collector {
    node: Arc<dyn CounterSource>,
    indexer: Arc<dyn CounterSource>,
    metrics: Arc<dyn MetricSource>,
    gateway: Option<GatewaySources>,
    read_timeout: Duration,
}

impl Collector {
    pub fn new(
        node: Arc<dyn CounterSource>,
        indexer: Arc<dyn CounterSource>,
        metrics: Arc<dyn MetricSource>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            node,
            indexer,
            metrics,
            gateway: None,
            read_timeout,
        }
    }

    pub fn with_gateway(mut self, gateway: GatewaySources) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub async fn collect_snapshot(&self, captured_at: SystemTime) -> TelemetrySnapshot {
        let limit = self.read_timeout;
        let (node, indexer, cpu, ram, temperature, gateway) = tokio::join!(
            bounded(limit, self.node.read_counter()),
            bounded(limit, self.indexer.read_counter()),
            bounded(limit, self.metrics.read_metric(Metric::CpuPercent)),
            bounded(limit, self.metrics.read_metric(Metric::RamPercent)),
            bounded(limit, self.metrics.read_metric(Metric::TemperatureCelsius)),
            self.read_gateway(),
        );

        TelemetrySnapshot {
            captured_at,
            node_height: reading("node height", node),
            indexer_height: reading("indexer height", indexer),
            cpu_usage_percent: reading("cpu usage", cpu),
            ram_usage_percent: reading("ram usage", ram),
            temperature_celsius: optional_reading("drive temperature", temperature),
            gateway,
        }
    }

    async fn read_gateway(&self) -> Option<GatewayReading> {
        let gateway = self.gateway.as_ref()?;
        let (active, last_job) = tokio::join!(
            bounded(self.read_timeout, gateway.health.read_health()),
            bounded(self.read_timeout, gateway.jobs.latest_job()),
        );

        Some(GatewayReading {
            active: reading("gateway active", active),
            last_job: reading("gateway job", last_job).flatten(),
        })
    }
}

fn reading<T>(source: &str, result: Result<T, SourceError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(source, error = %error, "source unavailable");
            None
        }
    }
}

/// Like [`reading`] but a host without the sensor is not worth a warning.
fn optional_reading<T>(source: &str, result: Result<T, SourceError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(SourceError::Missing) => None,
        Err(error) => {
            debug!(source, error = %error, "source unavailable");
            None
        }
    }
}
