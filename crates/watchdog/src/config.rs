use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub const DEFAULT_AUDIT_LOG: &str = "monitor.log";

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub stall_threshold: Duration,
    pub rate_window_size: usize,
    pub cpu_alert_threshold: f64,
    pub ram_alert_threshold: f64,
    pub temp_alert_threshold: f64,
    pub system_alert_cooldown: Duration,
    pub unreachable_cooldown: Duration,
    pub gateway_cooldown: Duration,
    pub gateway_no_job_duration: Duration,
    pub min_recovery_interval: Duration,
    pub auto_recovery_enabled: bool,
    pub dependency_latency_threshold: Duration,
    pub probe_timeout: Duration,
    pub source_timeout: Duration,

    pub miner_url: Option<String>,
    /// Hash rate in H/s below which the miner counts as not mining.
    pub miner_min_rate: f64,
    pub miner_no_progress_duration: Duration,
    pub miner_cooldown: Duration,
    pub miner_poll_interval: Duration,

    pub node_rpc_url: String,
    pub node_rpc_user: Option<String>,
    pub node_rpc_password: Option<String>,
    pub node_unit: String,
    pub indexer_unit: String,
    pub indexer_height_pattern: String,
    /// A quieter indexer needs a deeper tail, or its height reads as missing.
    pub indexer_journal_lines: u32,
    pub gateway_unit: Option<String>,

    pub audit_log_path: PathBuf,
    pub hwmon_root: PathBuf,
    pub disk_mount: Option<PathBuf>,

    pub telegram_enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<i64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(120),
            stall_threshold: Duration::from_secs(1800),
            rate_window_size: 50,
            cpu_alert_threshold: 90.0,
            ram_alert_threshold: 90.0,
            temp_alert_threshold: 65.0,
            system_alert_cooldown: Duration::from_secs(900),
            unreachable_cooldown: Duration::from_secs(900),
            gateway_cooldown: Duration::from_secs(900),
            gateway_no_job_duration: Duration::from_secs(300),
            min_recovery_interval: Duration::from_secs(600),
            auto_recovery_enabled: false,
            dependency_latency_threshold: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(30),
            source_timeout: Duration::from_secs(10),
            miner_url: None,
            miner_min_rate: 50.0,
            miner_no_progress_duration: Duration::from_secs(900),
            miner_cooldown: Duration::from_secs(300),
            miner_poll_interval: Duration::from_secs(30),
            node_rpc_url: "http://127.0.0.1:8332".to_owned(),
            node_rpc_user: None,
            node_rpc_password: None,
            node_unit: "bitcoind".to_owned(),
            indexer_unit: "fulcrum".to_owned(),
            indexer_height_pattern: crate::collector::DEFAULT_INDEXER_PATTERN.to_owned(),
            indexer_journal_lines: crate::collector::DEFAULT_INDEXER_JOURNAL_LINES,
            gateway_unit: None,
            audit_log_path: PathBuf::from(DEFAULT_AUDIT_LOG),
            hwmon_root: PathBuf::from("/sys/class/hwmon"),
            disk_mount: None,
            telegram_enabled: false,
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("rate window size must be at least 1")]
    EmptyRateWindow,
    #[error("indexer journal lines must be at least 1")]
    EmptyJournalTail,
    #[error("telegram is enabled but {0} is not set")]
    MissingTelegram(&'static str),
    #[error("invalid duration `{0}` (expected e.g. 30, 30s, 5m, 2h)")]
    InvalidDuration(String),
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("check interval"));
        }
        if self.miner_poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("miner poll interval"));
        }
        if self.source_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("source timeout"));
        }
        if self.rate_window_size == 0 {
            return Err(ConfigError::EmptyRateWindow);
        }
        if self.indexer_journal_lines == 0 {
            return Err(ConfigError::EmptyJournalTail);
        }
        if self.telegram_enabled {
            if self.telegram_bot_token.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::MissingTelegram("bot token"));
            }
            if self.telegram_chat_id.is_none() {
                return Err(ConfigError::MissingTelegram("chat id"));
            }
        }
        Ok(())
    }

    /// Bot token and chat id when Telegram delivery is enabled.
    pub fn telegram(&self) -> Option<(String, i64)> {
        if !self.telegram_enabled {
            return None;
        }
        Some((self.telegram_bot_token.clone()?, self.telegram_chat_id?))
    }
}

/// Parses `30`, `30s`, `5m` or `2h`; bare numbers are seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    let invalid = || ConfigError::InvalidDuration(raw.to_owned());

    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((index, 's')) => (trimmed.get(..index), 1),
        Some((index, 'm')) => (trimmed.get(..index), 60),
        Some((index, 'h')) => (trimmed.get(..index), 3600),
        Some(_) => (Some(trimmed), 1),
        None => return Err(invalid()),
    };

    let value: u64 = digits
        .map(str::trim)
        .ok_or_else(invalid)?
        .parse()
        .map_err(|_| invalid())?;

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}
