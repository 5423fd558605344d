//! Collaborator contracts consumed by the router and gates.
//!
//! Every production implementation bounds its own I/O, and callers wrap
//! reads with [`bounded`] as well so a hung source can never stall a tick.

use crate::models::{DiskUsage, GatewayJob, MinerSnapshot, UnitDiagnostics};
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no reading available")]
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    CpuPercent,
    RamPercent,
    TemperatureCelsius,
}

/// Outcome of a dependency health probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub ok: bool,
    pub latency: Duration,
    pub detail: Option<String>,
}

#[async_trait::async_trait]
pub trait CounterSource: Send + Sync {
    async fn read_counter(&self) -> Result<u64, SourceError>;
}

#[async_trait::async_trait]
pub trait HealthSource: Send + Sync {
    async fn read_health(&self) -> Result<bool, SourceError>;
}

#[async_trait::async_trait]
pub trait MetricSource: Send + Sync {
    async fn read_metric(&self, metric: Metric) -> Result<f64, SourceError>;

    fn disk_usage(&self) -> Option<DiskUsage> {
        None
    }
}

#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeReport;
}

#[async_trait::async_trait]
pub trait JobSource: Send + Sync {
    async fn latest_job(&self) -> Result<Option<GatewayJob>, SourceError>;
}

/// Read on operator request only; failures are folded into the text.
#[async_trait::async_trait]
pub trait DiagnosticSource: Send + Sync {
    async fn diagnostics(&self) -> UnitDiagnostics;
}

#[async_trait::async_trait]
pub trait MinerSource: Send + Sync {
    fn endpoint(&self) -> &str;
    async fn fetch(&self) -> Result<MinerSnapshot, SourceError>;
}

pub async fn bounded<T, F>(limit: Duration, read: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    tokio::time::timeout(limit, read)
        .await
        .map_err(|_| SourceError::Timeout(limit))?
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a subprocess to completion, killing it when `limit` elapses.
pub async fn run_command(
    program: &str,
    args: &[&str],
    limit: Duration,
) -> Result<CommandOutput, SourceError> {
    let rendered = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| SourceError::Command {
            command: rendered,
            reason: error.to_string(),
        })?;

    let output = bounded(limit, async move {
        child.wait_with_output().await.map_err(SourceError::from)
    })
    .await?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
