use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallState {
    Progressing,
    StalledUnnotified,
    StalledNotified,
}

/// Result of feeding one reading to a [`StallDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallTransition {
    /// First reading; establishes the baseline.
    Baseline,
    /// Counter changed since the previous reading.
    Advanced,
    /// Counter unchanged, still inside the threshold.
    Holding { stalled_for: Duration },
    /// Counter unchanged past the threshold for the first time in this
    /// episode. The caller announces it; later readings report
    /// `StillStalled` until the counter moves.
    EnteredStall { stalled_for: Duration },
    StillStalled { stalled_for: Duration },
}

/// Edge-triggered "counter stopped moving" detector.
#[derive(Debug, Clone)]
pub struct StallDetector {
    threshold: Duration,
    last_counter: Option<u64>,
    last_change_at: Option<SystemTime>,
    notified: bool,
}

impl StallDetector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_counter: None,
            last_change_at: None,
            notified: false,
        }
    }

    pub fn observe(&mut self, counter: u64, now: SystemTime) -> StallTransition {
        let (Some(previous), Some(changed_at)) = (self.last_counter, self.last_change_at) else {
            self.reset_baseline(counter, now);
            return StallTransition::Baseline;
        };

        if counter != previous {
            self.reset_baseline(counter, now);
            return StallTransition::Advanced;
        }

        let stalled_for = now.duration_since(changed_at).unwrap_or(Duration::ZERO);
        if stalled_for <= self.threshold {
            StallTransition::Holding { stalled_for }
        } else if self.notified {
            StallTransition::StillStalled { stalled_for }
        } else {
            self.notified = true;
            StallTransition::EnteredStall { stalled_for }
        }
    }

    pub fn state(&self, now: SystemTime) -> StallState {
        match self.stalled_for(now) {
            Some(stalled_for) if stalled_for > self.threshold => {
                if self.notified {
                    StallState::StalledNotified
                } else {
                    StallState::StalledUnnotified
                }
            }
            _ => StallState::Progressing,
        }
    }

    /// Time since the counter last changed, `None` before the first reading.
    pub fn stalled_for(&self, now: SystemTime) -> Option<Duration> {
        self.last_change_at
            .map(|changed_at| now.duration_since(changed_at).unwrap_or(Duration::ZERO))
    }

    pub fn last_counter(&self) -> Option<u64> {
        self.last_counter
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    fn reset_baseline(&mut self, counter: u64, now: SystemTime) {
        self.last_counter = Some(counter);
        self.last_change_at = Some(now);
        self.notified = false;
    }
}
