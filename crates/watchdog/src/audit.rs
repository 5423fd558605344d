//! Append-only audit trail.
//!
//! Every line is `[YYYY-MM-DD HH:MM:SS] message` in local time. The
//! `Heights:` lines double as the progress time series that the ETA
//! estimator re-reads, so their shape is produced and parsed here only.

use crate::rate::RateStats;
use crate::regression::ProgressSample;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{info, warn};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const PROGRESS_MARKER: &str = "Heights:";
pub const ALERT_MARKER: &str = "[ALERT]";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditLine {
    pub recorded_at: Option<NaiveDateTime>,
    pub message: String,
}

/// Parsed form of a `Heights:` line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub recorded_at: NaiveDateTime,
    pub node: Option<u64>,
    pub indexer: u64,
    pub lag: Option<u64>,
    pub speed: Option<f64>,
    pub sigma: Option<f64>,
    pub eta_hours: Option<f64>,
}

impl ProgressRecord {
    pub fn to_sample(&self) -> Option<ProgressSample> {
        Some(ProgressSample {
            observed_at: local_to_system_time(self.recorded_at)?,
            counter: self.indexer,
            lag: self.lag,
        })
    }
}

#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `message` stamped with the current local time. Never fails.
    pub fn append(&self, message: &str) {
        self.append_at(SystemTime::now(), message);
    }

    pub fn append_at(&self, at: SystemTime, message: &str) {
        info!("{message}");
        let line = format_line(at, message);

        // Blocking std write of one short line. Never hold this lock across
        // an await.
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));

        if let Err(error) = result {
            warn!(path = %self.path.display(), error = %error, "audit append failed");
        }
    }

    /// All lines in file order; a missing file reads as empty. Bytes that
    /// are not UTF-8 (a write torn mid-character) only damage their own line.
    pub fn read_lines(&self) -> Result<Vec<AuditLine>, AuditError> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        Ok(contents
            .split(|byte| *byte == b'\n')
            .map(String::from_utf8_lossy)
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_line(&line))
            .collect())
    }

    pub fn progress_records(&self) -> Result<Vec<ProgressRecord>, AuditError> {
        Ok(self
            .read_lines()?
            .iter()
            .filter_map(parse_progress_line)
            .collect())
    }

    /// Samples in chronological order. Local stamps repeat across a DST
    /// fall-back, so file order is not enough.
    pub fn progress_samples(&self) -> Result<Vec<ProgressSample>, AuditError> {
        let mut samples: Vec<ProgressSample> = self
            .progress_records()?
            .iter()
            .filter_map(ProgressRecord::to_sample)
            .collect();
        samples.sort_by_key(|sample| sample.observed_at);
        Ok(samples)
    }

    /// Most recent `Heights:` line, preferring one that carries a speed.
    pub fn last_progress_line(&self) -> Result<Option<AuditLine>, AuditError> {
        let lines: Vec<AuditLine> = self
            .read_lines()?
            .into_iter()
            .filter(|line| line.message.contains(PROGRESS_MARKER))
            .collect();

        let with_speed = lines
            .iter()
            .rev()
            .find(|line| numeric_field(&line.message, "speed~=").is_some());
        Ok(with_speed.or(lines.last()).cloned())
    }

    pub fn recent_alerts(&self, max: usize) -> Result<Vec<AuditLine>, AuditError> {
        let alerts: Vec<AuditLine> = self
            .read_lines()?
            .into_iter()
            .filter(|line| line.message.contains(ALERT_MARKER))
            .collect();
        let skip = alerts.len().saturating_sub(max);
        Ok(alerts.into_iter().skip(skip).collect())
    }
}

pub fn format_line(at: SystemTime, message: &str) -> String {
    let local: DateTime<Local> = at.into();
    format!("[{}] {message}", local.format(TIMESTAMP_FORMAT))
}

pub fn parse_line(line: &str) -> AuditLine {
    let trimmed = line.trim_end();
    let stamped = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.split_once("] "));

    match stamped {
        Some((stamp, message)) => match NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT) {
            Ok(recorded_at) => AuditLine {
                recorded_at: Some(recorded_at),
                message: message.to_owned(),
            },
            Err(_) => AuditLine {
                recorded_at: None,
                message: trimmed.to_owned(),
            },
        },
        None => AuditLine {
            recorded_at: None,
            message: trimmed.to_owned(),
        },
    }
}

/// Renders the progress record logged when the indexer height moves.
pub fn progress_message(node: u64, indexer: u64, stats: Option<&RateStats>) -> String {
    let lag = node.saturating_sub(indexer);
    let speed = stats.map_or_else(|| "N/A".to_owned(), |stats| format!("{:.3}", stats.ema));
    let sigma = stats.map_or_else(|| "N/A".to_owned(), |stats| format!("{:.3}", stats.stdev));
    let eta = match stats {
        Some(stats) if stats.ema > 0.0 => format!("{:.2} h", lag as f64 / stats.ema / 3600.0),
        _ => "N/A".to_owned(),
    };

    format!(
        "{PROGRESS_MARKER} node={node}, indexer={indexer}, lag={lag} blocks, speed~={speed} blk/s (σ={sigma}), ETA={eta}"
    )
}

pub fn parse_progress_line(line: &AuditLine) -> Option<ProgressRecord> {
    if !line.message.contains(PROGRESS_MARKER) {
        return None;
    }

    let message = line.message.as_str();
    Some(ProgressRecord {
        recorded_at: line.recorded_at?,
        node: integer_field(message, "node="),
        indexer: integer_field(message, "indexer=")?,
        lag: integer_field(message, "lag="),
        speed: numeric_field(message, "speed~="),
        sigma: numeric_field(message, "σ="),
        eta_hours: numeric_field(message, "ETA="),
    })
}

fn raw_field<'a>(message: &'a str, key: &str) -> Option<&'a str> {
    let start = message.find(key)? + key.len();
    let rest = message.get(start..)?;
    let end = rest
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map_or(rest.len(), |(index, _)| index);
    rest.get(..end).filter(|value| !value.is_empty())
}

fn integer_field(message: &str, key: &str) -> Option<u64> {
    raw_field(message, key)?.parse().ok()
}

fn numeric_field(message: &str, key: &str) -> Option<f64> {
    raw_field(message, key)?.parse().ok()
}

fn local_to_system_time(naive: NaiveDateTime) -> Option<SystemTime> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(SystemTime::from)
}
