use crate::models::AlertClass;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Per-class announcement throttle. The gate only suppresses: callers
/// evaluate their health predicate first and consult the gate before
/// emitting.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    default_cooldown: Duration,
    cooldowns: HashMap<AlertClass, Duration>,
    last_fired: HashMap<AlertClass, SystemTime>,
}

impl CooldownGate {
    pub fn new(default_cooldown: Duration) -> Self {
        Self {
            default_cooldown,
            cooldowns: HashMap::new(),
            last_fired: HashMap::new(),
        }
    }

    pub fn with_cooldown(mut self, class: AlertClass, cooldown: Duration) -> Self {
        self.cooldowns.insert(class, cooldown);
        self
    }

    pub fn cooldown(&self, class: AlertClass) -> Duration {
        self.cooldowns
            .get(&class)
            .copied()
            .unwrap_or(self.default_cooldown)
    }

    /// True when the class never fired or its cooldown has fully elapsed.
    /// A clock that moved backwards keeps the class suppressed.
    pub fn should_fire(&self, class: AlertClass, now: SystemTime) -> bool {
        self.remaining(class, now).is_none()
    }

    /// Time left before `class` may fire again, `None` when it may fire now.
    pub fn remaining(&self, class: AlertClass, now: SystemTime) -> Option<Duration> {
        let last_fired = self.last_fired.get(&class)?;
        let cooldown = self.cooldown(class);

        match now.duration_since(*last_fired) {
            Ok(elapsed) if elapsed >= cooldown => None,
            Ok(elapsed) => Some(cooldown - elapsed),
            Err(_) => Some(cooldown),
        }
    }

    pub fn record_fired(&mut self, class: AlertClass, now: SystemTime) {
        self.last_fired.insert(class, now);
    }

    pub fn last_fired(&self, class: AlertClass) -> Option<SystemTime> {
        self.last_fired.get(&class).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn at(second: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(second)
    }

    #[test]
    fn fires_once_then_waits_for_full_cooldown() {
        let mut gate = CooldownGate::new(Duration::from_secs(300));

        assert!(gate.should_fire(AlertClass::CpuHigh, at(1000)));
        gate.record_fired(AlertClass::CpuHigh, at(1000));

        for second in [1000, 1001, 1150, 1299] {
            assert!(!gate.should_fire(AlertClass::CpuHigh, at(second)));
        }
        assert!(gate.should_fire(AlertClass::CpuHigh, at(1300)));
    }

    #[test]
    fn classes_do_not_share_cooldowns() {
        let mut gate = CooldownGate::new(Duration::from_secs(300))
            .with_cooldown(AlertClass::ZeroClients, Duration::from_secs(900));

        gate.record_fired(AlertClass::CpuHigh, at(0));
        assert!(gate.should_fire(AlertClass::RamHigh, at(1)));
        assert!(gate.should_fire(AlertClass::ZeroClients, at(1)));

        gate.record_fired(AlertClass::ZeroClients, at(10));
        assert!(gate.should_fire(AlertClass::CpuHigh, at(300)));
        assert!(!gate.should_fire(AlertClass::ZeroClients, at(900)));
        assert!(gate.should_fire(AlertClass::ZeroClients, at(910)));
    }

    #[test]
    fn remaining_reports_time_left() {
        let mut gate = CooldownGate::new(Duration::from_secs(60));
        assert_eq!(gate.remaining(AlertClass::Unreachable, at(5)), None);

        gate.record_fired(AlertClass::Unreachable, at(100));
        assert_eq!(
            gate.remaining(AlertClass::Unreachable, at(130)),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            gate.remaining(AlertClass::Unreachable, at(50)),
            Some(Duration::from_secs(60))
        );
    }
}
