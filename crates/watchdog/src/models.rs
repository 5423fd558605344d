use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Readings gathered by one main tick. `None` marks a source that could not
/// be read this tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub captured_at: SystemTime,
    pub node_height: Option<u64>,
    pub indexer_height: Option<u64>,
    pub cpu_usage_percent: Option<f64>,
    pub ram_usage_percent: Option<f64>,
    pub temperature_celsius: Option<f64>,
    /// Absent when no gateway is configured.
    pub gateway: Option<GatewayReading>,
}

impl TelemetrySnapshot {
    pub fn empty(captured_at: SystemTime) -> Self {
        Self {
            captured_at,
            node_height: None,
            indexer_height: None,
            cpu_usage_percent: None,
            ram_usage_percent: None,
            temperature_celsius: None,
            gateway: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayReading {
    pub active: Option<bool>,
    pub last_job: Option<GatewayJob>,
}

/// Latest stratum job announced by the mining gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayJob {
    pub block: u64,
    pub reward_btc: f64,
    pub txns: u64,
    pub bytes: u64,
    pub clients: u32,
    pub announced_at: SystemTime,
}

/// Raw unit output gathered when an operator investigates the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitDiagnostics {
    pub unit: String,
    pub status: String,
    pub journal: String,
}

/// Usage of the monitored data mount; reported, never alerted on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub used_percent: f64,
}

/// One poll of the ASIC miner's system endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerSnapshot {
    pub captured_at: SystemTime,
    pub hash_rate: Option<f64>,
    pub shares_accepted: Option<u64>,
    pub shares_rejected: Option<u64>,
    pub using_fallback: Option<bool>,
    pub primary_pool: String,
    pub fallback_pool: String,
    pub temperature_celsius: Option<f64>,
    pub power_watts: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertClass {
    Stall,
    Fallback,
    ZeroClients,
    NoProgress,
    Unreachable,
    ServiceInactive,
    CpuHigh,
    RamHigh,
    TempHigh,
    Recovery,
}

impl AlertClass {
    pub fn label(self) -> &'static str {
        match self {
            Self::Stall => "stall",
            Self::Fallback => "fallback",
            Self::ZeroClients => "zero-clients",
            Self::NoProgress => "no-progress",
            Self::Unreachable => "unreachable",
            Self::ServiceInactive => "service-inactive",
            Self::CpuHigh => "cpu-high",
            Self::RamHigh => "ram-high",
            Self::TempHigh => "temp-high",
            Self::Recovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub class: AlertClass,
    pub severity: Severity,
    pub message: String,
    pub detected_at: SystemTime,
    pub evidence: serde_json::Value,
}

impl Alert {
    /// Text sent over the messaging channel.
    pub fn render(&self) -> String {
        let marker = match self.severity {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Critical => "🚨",
        };
        format!("{marker} [{}] {}", self.class.label(), self.message)
    }
}
