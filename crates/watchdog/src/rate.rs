use std::collections::VecDeque;
use std::time::SystemTime;

/// Smoothing factor applied to each new rate sample.
pub const EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateStats {
    /// Exponentially weighted rate in units per second.
    pub ema: f64,
    /// Population standard deviation of the retained window.
    pub stdev: f64,
    pub samples: usize,
}

/// Bounded history of instantaneous rates for one monotonic counter.
#[derive(Debug, Clone)]
pub struct RateTracker {
    window: usize,
    rates: VecDeque<f64>,
    last_counter: Option<u64>,
    last_observed_at: Option<SystemTime>,
}

impl RateTracker {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            rates: VecDeque::with_capacity(window),
            last_counter: None,
            last_observed_at: None,
        }
    }

    /// Records an observation. A rate sample is appended only when time moved
    /// forward and the counter did not go backwards; the baseline always
    /// moves to the new observation.
    pub fn update(&mut self, counter: u64, now: SystemTime) {
        if let (Some(previous), Some(observed_at)) = (self.last_counter, self.last_observed_at) {
            let elapsed = now
                .duration_since(observed_at)
                .map(|elapsed| elapsed.as_secs_f64())
                .unwrap_or(0.0);

            if elapsed > 0.0 && counter >= previous {
                let delta = counter - previous;
                if self.rates.len() == self.window {
                    self.rates.pop_front();
                }
                self.rates.push_back(delta as f64 / elapsed);
            }
        }

        self.last_counter = Some(counter);
        self.last_observed_at = Some(now);
    }

    /// EMA seeded with the oldest retained sample, plus the window's
    /// population stdev. `None` until the first rate sample exists.
    pub fn stats(&self) -> Option<RateStats> {
        let mut rates = self.rates.iter().copied();
        let first = rates.next()?;
        let ema = rates.fold(first, |ema, rate| EMA_ALPHA * rate + (1.0 - EMA_ALPHA) * ema);

        let count = self.rates.len() as f64;
        let mean = self.rates.iter().sum::<f64>() / count;
        let variance = self
            .rates
            .iter()
            .map(|rate| (rate - mean).powi(2))
            .sum::<f64>()
            / count;

        Some(RateStats {
            ema,
            stdev: variance.sqrt(),
            samples: self.rates.len(),
        })
    }

    pub fn rates(&self) -> impl Iterator<Item = f64> + '_ {
        self.rates.iter().copied()
    }

    pub fn last_counter(&self) -> Option<u64> {
        self.last_counter
    }

    pub fn last_observed_at(&self) -> Option<SystemTime> {
        self.last_observed_at
    }

    pub fn window(&self) -> usize {
        self.window
    }
}
