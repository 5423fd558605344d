use std::{
    fmt::Display,
    path::PathBuf,
    str::FromStr,
    time::{Duration, SystemTime},
};

use bitnode_watchdog::{
    audit::AuditLog,
    collector::{DEFAULT_INDEXER_JOURNAL_LINES, DEFAULT_INDEXER_PATTERN},
    config::{DEFAULT_AUDIT_LOG, MonitorConfig, parse_duration},
    regression::RegressionEstimator,
    report::{self, HistoryMode},
};
use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand};
use tracing::Level;

use crate::initializers::run_monitor;

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "bitnode-monitor",
    version,
    about = "Watchdog for a bitcoin node, its indexer, a mining gateway and an ASIC miner"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Option<Subcommand>,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "check.interval",
        default_value = "120s",
        value_name = "DURATION",
        value_parser = parse_duration,
        help = "Period of the main monitoring tick.",
        help_heading = "Monitor options",
        env = "BITNODE_CHECK_INTERVAL"
    )]
    pub check_interval: Duration,
    #[arg(
        long = "stall.threshold",
        default_value = "30m",
        value_name = "DURATION",
        value_parser = parse_duration,
        help = "How long the indexer height may stay unchanged before a stall alert.",
        help_heading = "Monitor options",
        env = "BITNODE_STALL_THRESHOLD"
    )]
    pub stall_threshold: Duration,
    #[arg(
        long = "rate.window",
        default_value_t = 50,
        value_name = "SAMPLES",
        help = "Number of recent sync-rate samples kept for the speed σ.",
        help_heading = "Monitor options",
        env = "BITNODE_RATE_WINDOW"
    )]
    pub rate_window: usize,
    #[arg(
        long = "source.timeout",
        default_value = "10s",
        value_name = "DURATION",
        value_parser = parse_duration,
        help = "Upper bound for every single source read.",
        help_heading = "Monitor options",
        env = "BITNODE_SOURCE_TIMEOUT"
    )]
    pub source_timeout: Duration,
    #[arg(
        long = "audit.log",
        default_value = DEFAULT_AUDIT_LOG,
        value_name = "FILE",
        help = "Append-only audit log, also read back for ETA and history reports.",
        help_heading = "Monitor options",
        env = "BITNODE_AUDIT_LOG"
    )]
    pub audit_log: PathBuf,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "BITNODE_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Monitor options"
    )]
    pub log_level: Level,
    #[arg(
        long = "log.color",
        default_value_t = LogColor::Auto,
        help = "Output logs with ANSI color codes.",
        long_help = "Possible values: auto, always, never",
        help_heading = "Monitor options",
        env = "BITNODE_LOG_COLOR"
    )]
    pub log_color: LogColor,

    #[arg(
        long = "node.rpc-url",
        default_value = "http://127.0.0.1:8332",
        value_name = "URL",
        help_heading = "Node options",
        env = "BITNODE_NODE_RPC_URL"
    )]
    pub node_rpc_url: String,
    #[arg(
        long = "node.rpc-user",
        value_name = "USER",
        help_heading = "Node options",
        env = "BITNODE_NODE_RPC_USER"
    )]
    pub node_rpc_user: Option<String>,
    #[arg(
        long = "node.rpc-password",
        value_name = "PASSWORD",
        help_heading = "Node options",
        env = "BITNODE_NODE_RPC_PASSWORD",
        hide_env_values = true
    )]
    pub node_rpc_password: Option<String>,
    #[arg(
        long = "node.unit",
        default_value = "bitcoind",
        value_name = "UNIT",
        help = "systemd unit of the full node.",
        help_heading = "Node options",
        env = "BITNODE_NODE_UNIT"
    )]
    pub node_unit: String,
    #[arg(
        long = "indexer.unit",
        default_value = "fulcrum",
        value_name = "UNIT",
        help = "systemd unit of the indexer; its journal provides the indexed height.",
        help_heading = "Node options",
        env = "BITNODE_INDEXER_UNIT"
    )]
    pub indexer_unit: String,
    #[arg(
        long = "indexer.pattern",
        default_value = DEFAULT_INDEXER_PATTERN,
        value_name = "REGEX",
        help = "Regex whose first capture group is the indexed height.",
        help_heading = "Node options",
        env = "BITNODE_INDEXER_PATTERN"
    )]
    pub indexer_pattern: String,
    #[arg(
        long = "indexer.journal-lines",
        default_value_t = DEFAULT_INDEXER_JOURNAL_LINES,
        value_name = "LINES",
        help = "How many recent indexer journal lines are searched for the height.",
        help_heading = "Node options",
        env = "BITNODE_INDEXER_JOURNAL_LINES"
    )]
    pub indexer_journal_lines: u32,

    #[arg(
        long = "host.cpu-threshold",
        default_value_t = 90.0,
        value_name = "PERCENT",
        help_heading = "Host options",
        env = "BITNODE_CPU_THRESHOLD"
    )]
    pub cpu_threshold: f64,
    #[arg(
        long = "host.ram-threshold",
        default_value_t = 90.0,
        value_name = "PERCENT",
        help_heading = "Host options",
        env = "BITNODE_RAM_THRESHOLD"
    )]
    pub ram_threshold: f64,
    #[arg(
        long = "host.temp-threshold",
        default_value_t = 65.0,
        value_name = "CELSIUS",
        help = "Drive temperature alert threshold.",
        help_heading = "Host options",
        env = "BITNODE_TEMP_THRESHOLD"
    )]
    pub temp_threshold: f64,
    #[arg(
        long = "host.hwmon-root",
        default_value = "/sys/class/hwmon",
        value_name = "DIR",
        help_heading = "Host options",
        env = "BITNODE_HWMON_ROOT"
    )]
    pub hwmon_root: PathBuf,
    #[arg(
        long = "host.disk-mount",
        value_name = "PATH",
        help = "Mount point whose usage is shown in /status.",
        help_heading = "Host options",
        env = "BITNODE_DISK_MOUNT"
    )]
    pub disk_mount: Option<PathBuf>,
    #[arg(
        long = "alert.cooldown",
        default_value = "15m",
        value_name = "DURATION",
        value_parser = parse_duration,
        help = "Minimum time between two alerts of the same class.",
        help_heading = "Host options",
        env = "BITNODE_ALERT_COOLDOWN"
    )]
    pub alert_cooldown: Duration,
    #[arg(
        long = "alert.unreachable-cooldown",
        default_value = "15m",
        value_name = "DURATION",
        value_parser = parse_duration,
        help_heading = "Host options",
        env = "BITNODE_UNREACHABLE_COOLDOWN"
    )]
    pub unreachable_cooldown: Duration,

    #[arg(
        long = "recovery.enabled",
        action = ArgAction::SetTrue,
        help = "Restart the indexer automatically when it stalls.",
        long_help = "Can also be toggled at run time with /autorestart.",
        help_heading = "Recovery options",
        env = "BITNODE_AUTO_RESTART"
    )]
    pub auto_restart: bool,
    #[arg(
        long = "recovery.min-interval",
        default_value = "10m",
        value_name = "DURATION",
        value_parser = parse_duration,
        help_heading = "Recovery options",
        env = "BITNODE_RECOVERY_INTERVAL"
    )]
    pub recovery_interval: Duration,
    #[arg(
        long = "recovery.latency-threshold",
        default_value = "10s",
        value_name = "DURATION",
        value_parser = parse_duration,
        help = "Node RPC latency above which the node counts as unhealthy.",
        help_heading = "Recovery options",
        env = "BITNODE_DEPENDENCY_LATENCY"
    )]
    pub dependency_latency: Duration,
    #[arg(
        long = "recovery.probe-timeout",
        default_value = "30s",
        value_name = "DURATION",
        value_parser = parse_duration,
        help_heading = "Recovery options",
        env = "BITNODE_PROBE_TIMEOUT"
    )]
    pub probe_timeout: Duration,

    #[arg(
        long = "gateway.unit",
        value_name = "UNIT",
        help = "systemd unit of the mining gateway. Gateway checks are off when unset.",
        help_heading = "Mining options",
        env = "BITNODE_GATEWAY_UNIT"
    )]
    pub gateway_unit: Option<String>,
    #[arg(
        long = "gateway.cooldown",
        default_value = "15m",
        value_name = "DURATION",
        value_parser = parse_duration,
        help_heading = "Mining options",
        env = "BITNODE_GATEWAY_COOLDOWN"
    )]
    pub gateway_cooldown: Duration,
    #[arg(
        long = "gateway.no-job",
        default_value = "5m",
        value_name = "DURATION",
        value_parser = parse_duration,
        help = "Alert when the gateway has not announced a job for this long.",
        help_heading = "Mining options",
        env = "BITNODE_GATEWAY_NO_JOB"
    )]
    pub gateway_no_job: Duration,
    #[arg(
        long = "miner.url",
        value_name = "URL",
        help = "Base URL of an AxeOS miner. The miner loop is off when unset.",
        help_heading = "Mining options",
        env = "BITNODE_MINER_URL"
    )]
    pub miner_url: Option<String>,
    #[arg(
        long = "miner.min-rate",
        default_value_t = 50.0,
        value_name = "H/S",
        help_heading = "Mining options",
        env = "BITNODE_MINER_MIN_RATE"
    )]
    pub miner_min_rate: f64,
    #[arg(
        long = "miner.no-progress",
        default_value = "15m",
        value_name = "DURATION",
        value_parser = parse_duration,
        help = "Alert when no share was accepted for this long.",
        help_heading = "Mining options",
        env = "BITNODE_MINER_NO_PROGRESS"
    )]
    pub miner_no_progress: Duration,
    #[arg(
        long = "miner.cooldown",
        default_value = "5m",
        value_name = "DURATION",
        value_parser = parse_duration,
        help_heading = "Mining options",
        env = "BITNODE_MINER_COOLDOWN"
    )]
    pub miner_cooldown: Duration,
    #[arg(
        long = "miner.poll-interval",
        default_value = "30s",
        value_name = "DURATION",
        value_parser = parse_duration,
        help_heading = "Mining options",
        env = "BITNODE_MINER_POLL_INTERVAL"
    )]
    pub miner_poll_interval: Duration,

    #[arg(
        long = "telegram",
        action = ArgAction::SetTrue,
        help = "Deliver alerts and accept commands through Telegram.",
        long_help = "Without it alerts are only written to the log and the audit file.",
        help_heading = "Telegram options",
        env = "BITNODE_TELEGRAM"
    )]
    pub telegram_enabled: bool,
    #[arg(
        long = "telegram.bot-token",
        value_name = "TOKEN",
        help_heading = "Telegram options",
        env = "BITNODE_TELEGRAM_BOT_TOKEN",
        hide_env_values = true
    )]
    pub telegram_bot_token: Option<String>,
    #[arg(
        long = "telegram.chat-id",
        value_name = "CHAT_ID",
        allow_negative_numbers = true,
        help_heading = "Telegram options",
        env = "BITNODE_TELEGRAM_CHAT_ID"
    )]
    pub telegram_chat_id: Option<i64>,
}

impl From<&Options> for MonitorConfig {
    fn from(opts: &Options) -> Self {
        Self {
            check_interval: opts.check_interval,
            stall_threshold: opts.stall_threshold,
            rate_window_size: opts.rate_window,
            cpu_alert_threshold: opts.cpu_threshold,
            ram_alert_threshold: opts.ram_threshold,
            temp_alert_threshold: opts.temp_threshold,
            system_alert_cooldown: opts.alert_cooldown,
            unreachable_cooldown: opts.unreachable_cooldown,
            gateway_cooldown: opts.gateway_cooldown,
            gateway_no_job_duration: opts.gateway_no_job,
            min_recovery_interval: opts.recovery_interval,
            auto_recovery_enabled: opts.auto_restart,
            dependency_latency_threshold: opts.dependency_latency,
            probe_timeout: opts.probe_timeout,
            source_timeout: opts.source_timeout,
            miner_url: opts.miner_url.clone(),
            miner_min_rate: opts.miner_min_rate,
            miner_no_progress_duration: opts.miner_no_progress,
            miner_cooldown: opts.miner_cooldown,
            miner_poll_interval: opts.miner_poll_interval,
            node_rpc_url: opts.node_rpc_url.clone(),
            node_rpc_user: opts.node_rpc_user.clone(),
            node_rpc_password: opts.node_rpc_password.clone(),
            node_unit: opts.node_unit.clone(),
            indexer_unit: opts.indexer_unit.clone(),
            indexer_height_pattern: opts.indexer_pattern.clone(),
            indexer_journal_lines: opts.indexer_journal_lines,
            gateway_unit: opts.gateway_unit.clone(),
            audit_log_path: opts.audit_log.clone(),
            hwmon_root: opts.hwmon_root.clone(),
            disk_mount: opts.disk_mount.clone(),
            telegram_enabled: opts.telegram_enabled,
            telegram_bot_token: opts.telegram_bot_token.clone(),
            telegram_chat_id: opts.telegram_chat_id,
        }
    }
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(name = "eta", about = "Print the regression ETA computed from the audit log")]
    Eta,
    #[command(name = "history", about = "Print logged progress samples from the audit log")]
    History {
        #[arg(
            long = "mode",
            default_value = "full",
            value_parser = parse_history_mode,
            help = "Which rows to show: head, tail or full"
        )]
        mode: HistoryMode,
        #[arg(long = "count", value_name = "ROWS", help = "Number of rows to show")]
        count: Option<usize>,
    },
}

impl Subcommand {
    pub async fn run(self, opts: &Options) -> eyre::Result<()> {
        let audit = AuditLog::new(&opts.audit_log);

        match self {
            Subcommand::Eta => {
                let samples = audit.progress_samples()?;
                println!(
                    "{}",
                    report::render_eta(&samples, &RegressionEstimator::default())
                );
            }
            Subcommand::History { mode, count } => {
                let records = audit.progress_records()?;
                println!(
                    "{}",
                    report::render_history(&records, mode, count, SystemTime::now())
                );
            }
        }
        Ok(())
    }
}

/// Runs the monitor, or one of the offline report subcommands.
pub async fn run(opts: Options, command: Option<Subcommand>) -> eyre::Result<()> {
    match command {
        Some(command) => command.run(&opts).await,
        None => run_monitor(MonitorConfig::from(&opts)).await,
    }
}

fn parse_history_mode(raw: &str) -> Result<HistoryMode, String> {
    match raw.to_lowercase().as_str() {
        "head" => Ok(HistoryMode::Head),
        "tail" => Ok(HistoryMode::Tail),
        "full" => Ok(HistoryMode::Full),
        _ => Err(format!(
            "Invalid history mode '{raw}'. Expected: head, tail, or full"
        )),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum LogColor {
    #[default]
    Auto,
    Always,
    Never,
}

impl Display for LogColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogColor::Auto => write!(f, "auto"),
            LogColor::Always => write!(f, "always"),
            LogColor::Never => write!(f, "never"),
        }
    }
}

impl FromStr for LogColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(LogColor::Auto),
            "always" => Ok(LogColor::Always),
            "never" => Ok(LogColor::Never),
            _ => Err(format!(
                "Invalid log color '{}'. Expected: auto, always, or never",
                s
            )),
        }
    }
}
