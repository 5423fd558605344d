//! Operator-facing text for the command channel and the CLI reports.

use crate::alerter::truncate_message;
use crate::audit::{ALERT_MARKER, AuditLine, ProgressRecord, TIMESTAMP_FORMAT};
use crate::miner::MinerReading;
use crate::models::{DiskUsage, GatewayJob, UnitDiagnostics};
use crate::regression::{EstimateError, ProgressSample, RegressionEstimator};
use chrono::{DateTime, Local};
use regex::Regex;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Terms worth counting in a gateway journal tail. Earlier alternatives win,
/// so `getblocktemplate` is not also counted as `template`.
const DIAGNOSTIC_KEYWORDS: &str = r"(error|warn|fail|timeout|disconnect|reconnect|rpc|gbt|getblocktemplate|template|submit|stratum|socket|i/o|io error|orphan|stale|invalid|reject)";
const DIAGNOSTIC_TOP_KEYWORDS: usize = 12;
const DIAGNOSTIC_SECTION_CHARS: usize = 1600;

pub const MAX_HISTORY_ROWS: usize = 80;
const DEFAULT_HISTORY_ROWS: usize = 10;
const MINUTE_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryMode {
    Head,
    Tail,
    #[default]
    Full,
}

fn local_minutes(at: SystemTime) -> String {
    DateTime::<Local>::from(at).format(MINUTE_FORMAT).to_string()
}

fn finish_at(start: SystemTime, after: Duration) -> String {
    start
        .checked_add(after)
        .map_or_else(|| "never".to_owned(), local_minutes)
}

fn hours(duration: Duration) -> f64 {
    duration.as_secs_f64() / 3600.0
}

fn or_na(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "N/A".to_owned(), |value| format!("{value:.precision$}"))
}

/// Regression ETA over the logged progress samples.
pub fn render_eta(samples: &[ProgressSample], estimator: &RegressionEstimator) -> String {
    if samples.is_empty() {
        return "No Heights data found in the audit log yet. Wait for a few sync cycles.".to_owned();
    }

    let (fit, projection) = match estimator.estimate(samples, None) {
        Ok(estimate) => estimate,
        Err(EstimateError::InsufficientData { samples }) => {
            return format!(
                "Not enough progress points for a regression-based ETA yet (have {samples}, need at least 5)."
            );
        }
        Err(error) => return format!("Could not fit regression-based ETA: {error}"),
    };

    if projection.remaining == 0 {
        return format!(
            "Indexer appears to be at the chain tip already (height {}, lag 0).",
            fit.last_counter
        );
    }

    let central_hours = hours(projection.central);
    let started = fit.last_observed_at;
    format!(
        "📈 Indexer sync ETA (regression)\n\n\
         Speed (regression): {:.3} blk/s\n\
         Samples used: {} progress points\n\n\
         Current indexer height: {}\n\
         Current lag: {} blocks\n\
         Approx chain tip target: {}\n\n\
         Central ETA: {:.1} h ({:.2} d)\n\
         Finish ≈ {}\n\n\
         Range (±20% speed):\n\
         {} → {}",
        projection.slope,
        projection.sample_count,
        fit.last_counter,
        projection.remaining,
        fit.last_counter.saturating_add(projection.remaining),
        central_hours,
        central_hours / 24.0,
        finish_at(started, projection.central),
        finish_at(started, projection.optimistic),
        finish_at(started, projection.pessimistic),
    )
}

/// Mean/σ of the logged EMA speeds and the resulting ETA window.
pub fn render_speed_window(records: &[ProgressRecord], now: SystemTime) -> String {
    let speeds: Vec<f64> = records.iter().filter_map(|record| record.speed).collect();
    if speeds.is_empty() {
        return "No valid speed samples yet.".to_owned();
    }

    let count = speeds.len() as f64;
    let mean = speeds.iter().sum::<f64>() / count;
    let sigma = (speeds.iter().map(|speed| (speed - mean).powi(2)).sum::<f64>() / count).sqrt();
    let lag = records.last().and_then(|record| record.lag).unwrap_or(0);

    if mean <= 0.0 || lag == 0 {
        return format!(
            "samples={}, avg_speed={mean:.3} blk/s, σ={sigma:.3}, but lag={lag} so ETA cannot be derived.",
            speeds.len()
        );
    }

    let lag = lag as f64;
    let central_h = lag / mean / 3600.0;
    let (low_h, high_h) = if sigma > 0.0 && mean > sigma {
        let slow = (mean - sigma).max(mean * 0.25);
        (lag / (mean + sigma) / 3600.0, lag / slow / 3600.0)
    } else {
        (central_h, central_h)
    };

    let finish = |h: f64| finish_at(now, Duration::try_from_secs_f64(h * 3600.0).unwrap_or(Duration::MAX));
    let span = |h: f64| format!("{h:.1} h (~{:.1} d)", h / 24.0);

    format!(
        "samples used={}, avg_speed≈{mean:.3} blk/s (σ≈{sigma:.3}).\n\
         current lag≈{lag} blocks.\n\
         Central ETA: {} → ~{}.\n\
         1σ window: {} – {} (~{} → ~{}).",
        speeds.len(),
        span(central_h),
        finish(central_h),
        span(low_h),
        span(high_h),
        finish(low_h),
        finish(high_h),
    )
}

pub fn render_history(
    records: &[ProgressRecord],
    mode: HistoryMode,
    count: Option<usize>,
    now: SystemTime,
) -> String {
    if records.is_empty() {
        return "No Heights samples in the audit log yet.".to_owned();
    }

    let total = records.len();
    let count = count.filter(|count| *count > 0).unwrap_or(DEFAULT_HISTORY_ROWS);
    let chosen: &[ProgressRecord] = match mode {
        HistoryMode::Head => records.get(..count.min(total)).unwrap_or(records),
        HistoryMode::Tail => records.get(total.saturating_sub(count)..).unwrap_or(records),
        HistoryMode::Full => records,
    };

    let (chosen, note) = if chosen.len() > MAX_HISTORY_ROWS {
        match mode {
            HistoryMode::Head => (
                chosen.get(..MAX_HISTORY_ROWS).unwrap_or(chosen),
                Some(format!("(showing first {MAX_HISTORY_ROWS} of {total} samples)")),
            ),
            HistoryMode::Tail | HistoryMode::Full => (
                chosen
                    .get(chosen.len() - MAX_HISTORY_ROWS..)
                    .unwrap_or(chosen),
                Some(format!("(showing last {MAX_HISTORY_ROWS} of {total} samples)")),
            ),
        }
    } else {
        (chosen, None)
    };

    let mut lines = vec![
        render_speed_window(records, now),
        String::new(),
        "timestamp | indexer | lag | speed blk/s | σ | ETA h".to_owned(),
    ];
    lines.extend(chosen.iter().map(|record| {
        format!(
            "{} | {} | {} | {} | {} | {}",
            record.recorded_at.format(TIMESTAMP_FORMAT),
            record.indexer,
            record
                .lag
                .map_or_else(|| "N/A".to_owned(), |lag| lag.to_string()),
            or_na(record.speed, 3),
            or_na(record.sigma, 3),
            or_na(record.eta_hours, 2),
        )
    }));
    lines.extend(note);
    lines.join("\n")
}

/// Inputs gathered for `/status`.
#[derive(Debug, Clone, Default)]
pub struct StatusView {
    pub progress_line: Option<String>,
    /// `None` when no gateway is configured, `Some(None)` when unreadable.
    pub gateway_active: Option<Option<bool>>,
    pub cpu_percent: Option<f64>,
    pub ram_percent: Option<f64>,
    pub temperature_celsius: Option<f64>,
    pub disk: Option<DiskUsage>,
    pub cpu_threshold: f64,
    pub ram_threshold: f64,
    pub temp_threshold: f64,
    pub auto_recovery: bool,
    pub recent_alerts: Vec<AuditLine>,
}

fn level_marker(value: f64, warn: f64, alert: f64) -> &'static str {
    if value > alert {
        "🔥"
    } else if value > warn {
        "⚠️"
    } else {
        "✅"
    }
}

pub fn render_status(view: &StatusView) -> String {
    let mut lines = vec!["📊 Bitnode Status".to_owned(), String::new()];

    lines.push(format!(
        "⛓ {}",
        view.progress_line
            .as_deref()
            .unwrap_or("Heights: (no data yet)")
    ));
    lines.push(String::new());

    if let Some(active) = view.gateway_active {
        lines.push(
            match active {
                Some(true) => "✅ Gateway: Active",
                Some(false) => "❌ Gateway: Inactive",
                None => "⚠️ Gateway: Unknown",
            }
            .to_owned(),
        );
        lines.push(String::new());
    }

    lines.push("💻 System Metrics:".to_owned());
    if let Some(cpu) = view.cpu_percent {
        lines.push(format!("{} CPU: {cpu:.1}%", level_marker(cpu, 70.0, view.cpu_threshold)));
    }
    if let Some(ram) = view.ram_percent {
        lines.push(format!("{} RAM: {ram:.1}%", level_marker(ram, 70.0, view.ram_threshold)));
    }
    if let Some(temp) = view.temperature_celsius {
        lines.push(format!(
            "{} Drive: {temp:.1}°C",
            level_marker(temp, view.temp_threshold - 10.0, view.temp_threshold)
        ));
    }
    if let Some(disk) = view.disk {
        let gib = |bytes: u64| bytes as f64 / 1024f64.powi(3);
        lines.push(format!(
            "{} Disk: {:.0}GB free / {:.0}GB ({:.1}% used)",
            level_marker(disk.used_percent, 80.0, 90.0),
            gib(disk.free_bytes),
            gib(disk.total_bytes),
            disk.used_percent
        ));
    }
    lines.push(format!(
        "♻️ Auto-restart: {}",
        if view.auto_recovery { "on" } else { "off" }
    ));

    let breaches = active_breaches(view);
    if !breaches.is_empty() {
        lines.push(String::new());
        lines.push("🚨 ACTIVE ALERTS:".to_owned());
        lines.extend(breaches.into_iter().map(|breach| format!("  • {breach}")));
    } else if !view.recent_alerts.is_empty() {
        lines.push(String::new());
        lines.push("📋 Recent Alerts (resolved):".to_owned());
        let skip = view.recent_alerts.len().saturating_sub(3);
        for alert in view.recent_alerts.iter().skip(skip) {
            let time = alert
                .recorded_at
                .map_or_else(|| "?".to_owned(), |at| at.format("%H:%M:%S").to_string());
            let text = alert.message.replace(ALERT_MARKER, "");
            lines.push(format!("  • {time}: {}", text.trim()));
        }
    }

    lines.join("\n")
}

fn active_breaches(view: &StatusView) -> Vec<String> {
    let mut breaches = Vec::new();
    if let Some(cpu) = view.cpu_percent.filter(|cpu| *cpu > view.cpu_threshold) {
        breaches.push(format!("CPU: high load: {cpu:.1}%"));
    }
    if let Some(ram) = view.ram_percent.filter(|ram| *ram > view.ram_threshold) {
        breaches.push(format!("RAM: high usage: {ram:.1}%"));
    }
    if let Some(temp) = view
        .temperature_celsius
        .filter(|temp| *temp > view.temp_threshold)
    {
        breaches.push(format!("Drive: temperature high: {temp:.1}°C"));
    }
    if let Some(disk) = view.disk.filter(|disk| disk.used_percent > 90.0) {
        breaches.push(format!("Disk: space low: {:.1}% used", disk.used_percent));
    }
    breaches
}

fn age(since: SystemTime, now: SystemTime) -> String {
    let secs = now.duration_since(since).unwrap_or_default().as_secs();
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{:.1}h ago", secs as f64 / 3600.0)
    }
}

pub fn render_gateway(active: Option<bool>, job: Option<&GatewayJob>, now: SystemTime) -> String {
    let state = match active {
        Some(true) => "✅ active",
        Some(false) => "❌ inactive",
        None => "⚠️ unknown",
    };
    let Some(job) = job else {
        return format!("⛏️ Mining gateway: {state}\nNo recent job data found in the gateway journal.");
    };

    format!(
        "⛏️ Mining gateway: {state}\n\
         Block: {} | Reward: {:.8} BTC\n\
         Txns: {} | Size: {:.1} KB\n\
         Clients: {} | Last job: {}",
        job.block,
        job.reward_btc,
        job.txns,
        job.bytes as f64 / 1024.0,
        job.clients,
        age(job.announced_at, now),
    )
}

/// Case-insensitive keyword frequencies, most frequent first, ties by name.
pub fn keyword_counts(text: &str) -> Vec<(String, usize)> {
    let Ok(pattern) = Regex::new(DIAGNOSTIC_KEYWORDS) else {
        return Vec::new();
    };

    let lowered = text.to_lowercase();
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for found in pattern.find_iter(&lowered) {
        *counts.entry(found.as_str()).or_default() += 1;
    }

    let mut counts: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(keyword, count)| (keyword.to_owned(), count))
        .collect();
    counts.sort_by_key(|(_, count)| Reverse(*count));
    counts
}

pub fn render_diagnostics(diagnostics: &UnitDiagnostics) -> String {
    let counts = keyword_counts(&diagnostics.journal);
    let top = if counts.is_empty() {
        "none".to_owned()
    } else {
        counts
            .iter()
            .take(DIAGNOSTIC_TOP_KEYWORDS)
            .map(|(keyword, count)| format!("{keyword}:{count}"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "🔎 Mining gateway investigation ({})
         Keywords: {top}

         == systemctl status ==
{}

         == journal (tail) ==
{}",
        diagnostics.unit,
        truncate_message(&diagnostics.status, DIAGNOSTIC_SECTION_CHARS),
        truncate_message(&diagnostics.journal, DIAGNOSTIC_SECTION_CHARS),
    )
}

pub fn render_miner(endpoint: &str, reading: &MinerReading) -> String {
    let snapshot = match reading {
        MinerReading::Snapshot(snapshot) => snapshot,
        MinerReading::Unreachable { error, .. } => {
            return format!("🚨 Miner at {endpoint} is unreachable: {error}");
        }
    };

    let pool = match snapshot.using_fallback {
        Some(true) => format!("⚠️ FALLBACK ({})", snapshot.fallback_pool),
        Some(false) => format!("primary ({})", snapshot.primary_pool),
        None => "unknown".to_owned(),
    };
    format!(
        "🟧 Miner {endpoint}\n\
         Hash rate: {} H/s\n\
         Shares: accepted={} rejected={}\n\
         Pool: {pool}\n\
         Temp: {}°C | Power: {} W",
        or_na(snapshot.hash_rate, 0),
        snapshot
            .shares_accepted
            .map_or_else(|| "N/A".to_owned(), |shares| shares.to_string()),
        snapshot
            .shares_rejected
            .map_or_else(|| "N/A".to_owned(), |shares| shares.to_string()),
        or_na(snapshot.temperature_celsius, 1),
        or_na(snapshot.power_watts, 1),
    )
}
