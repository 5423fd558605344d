//! Least-squares progress estimation over logged samples.
//!
//! Samples are first reduced to genuine progress points, then fitted with
//! `counter = slope * seconds_since_first + intercept`. The projection
//! returns durations only; rendering lives in [`crate::report`].

use std::time::{Duration, SystemTime};
use thiserror::Error;

pub const MIN_FIT_SAMPLES: usize = 5;
pub const DEFAULT_BAND: f64 = 0.20;
/// Lower bound of the pessimistic slope multiplier.
const MIN_PESSIMISTIC_MULTIPLIER: f64 = 0.05;

/// One observation of a monotonic counter, optionally paired with the
/// remaining distance to its target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub observed_at: SystemTime,
    pub counter: u64,
    pub lag: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionFit {
    /// Units per second.
    pub slope: f64,
    pub intercept: f64,
    pub sample_count: usize,
    pub first_observed_at: SystemTime,
    pub last_observed_at: SystemTime,
    pub last_counter: u64,
    pub last_lag: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtaProjection {
    pub remaining: u64,
    pub slope: f64,
    pub sample_count: usize,
    pub central: Duration,
    pub optimistic: Duration,
    pub pessimistic: Duration,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimateError {
    #[error(
        "not enough progress points for a regression (have {samples}, need at least 5 over a non-zero time span)"
    )]
    InsufficientData { samples: usize },
    #[error("regression rate is not positive ({0:.6}/s); ETA would be infinite")]
    NonPositiveRate(f64),
}

/// Keeps a sample only when the counter strictly increased or the lag
/// strictly decreased relative to the last kept sample.
pub fn monotonic_progress(samples: &[ProgressSample]) -> Vec<ProgressSample> {
    let mut kept: Vec<ProgressSample> = Vec::with_capacity(samples.len());

    for sample in samples {
        let keep = match kept.last() {
            None => true,
            Some(last) => {
                let advanced = sample.counter > last.counter;
                let closer = matches!((sample.lag, last.lag), (Some(lag), Some(last_lag)) if lag < last_lag);
                advanced || closer
            }
        };

        if keep {
            kept.push(*sample);
        }
    }

    kept
}

#[derive(Debug, Clone, Copy)]
pub struct RegressionEstimator {
    min_samples: usize,
    band: f64,
}

impl Default for RegressionEstimator {
    fn default() -> Self {
        Self {
            min_samples: MIN_FIT_SAMPLES,
            band: DEFAULT_BAND,
        }
    }
}

impl RegressionEstimator {
    pub fn with_band(mut self, band: f64) -> Self {
        self.band = band.abs();
        self
    }

    /// Filters `samples` (expected in chronological order) and fits a line.
    pub fn fit(&self, samples: &[ProgressSample]) -> Result<RegressionFit, EstimateError> {
        let progress = monotonic_progress(samples);
        let insufficient = EstimateError::InsufficientData {
            samples: progress.len(),
        };

        if progress.len() < self.min_samples {
            return Err(insufficient);
        }
        let (Some(first), Some(last)) = (progress.first(), progress.last()) else {
            return Err(insufficient);
        };

        let points: Vec<(f64, f64)> = progress
            .iter()
            .map(|sample| {
                let seconds = sample
                    .observed_at
                    .duration_since(first.observed_at)
                    .map(|elapsed| elapsed.as_secs_f64())
                    .unwrap_or(0.0);
                (seconds, sample.counter as f64)
            })
            .collect();

        let count = points.len() as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / count;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / count;
        let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
        let sxy: f64 = points
            .iter()
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();

        if sxx <= 0.0 {
            return Err(insufficient);
        }

        let slope = sxy / sxx;
        if !slope.is_finite() || slope <= 0.0 {
            return Err(EstimateError::NonPositiveRate(slope));
        }

        Ok(RegressionFit {
            slope,
            intercept: mean_y - slope * mean_x,
            sample_count: progress.len(),
            first_observed_at: first.observed_at,
            last_observed_at: last.observed_at,
            last_counter: last.counter,
            last_lag: last.lag,
        })
    }

    /// Projects the time needed to cover `remaining` units at the fitted rate,
    /// with the band applied to the slope.
    pub fn project(&self, fit: &RegressionFit, remaining: u64) -> EtaProjection {
        let remaining_units = remaining as f64;
        let fast = fit.slope * (1.0 + self.band);
        let slow = fit.slope * (1.0 - self.band).max(MIN_PESSIMISTIC_MULTIPLIER);

        EtaProjection {
            remaining,
            slope: fit.slope,
            sample_count: fit.sample_count,
            central: seconds(remaining_units / fit.slope),
            optimistic: seconds(remaining_units / fast),
            pessimistic: seconds(remaining_units / slow),
        }
    }

    /// Fit plus projection using the lag of the newest kept sample, or
    /// `target - last_counter` when the samples carry no lag.
    pub fn estimate(
        &self,
        samples: &[ProgressSample],
        target: Option<u64>,
    ) -> Result<(RegressionFit, EtaProjection), EstimateError> {
        let fit = self.fit(samples)?;
        let remaining = match (fit.last_lag, target) {
            (Some(lag), _) => lag,
            (None, Some(target)) => target.saturating_sub(fit.last_counter),
            (None, None) => 0,
        };
        let projection = self.project(&fit, remaining);
        Ok((fit, projection))
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}
