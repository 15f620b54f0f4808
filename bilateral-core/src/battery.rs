//! Battery voltage classification.

use core::fmt;
use core::time::Duration;

use crate::session::SessionTrigger;
use crate::time::Instant;

/// Voltage thresholds and sampling cadence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BatteryConfig {
    pub low_millivolts: u16,
    pub critical_millivolts: u16,
    pub sample_interval: Duration,
}

impl BatteryConfig {
    pub const DEFAULT: Self = Self {
        low_millivolts: 3_400,
        critical_millivolts: 3_300,
        sample_interval: Duration::from_secs(60),
    };

    #[must_use]
    pub const fn with_thresholds(mut self, low_millivolts: u16, critical_millivolts: u16) -> Self {
        self.low_millivolts = low_millivolts;
        self.critical_millivolts = critical_millivolts;
        self
    }

    #[must_use]
    pub const fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Classifies a voltage. Readings at a threshold fall into the lower band.
    #[must_use]
    pub const fn classify(&self, millivolts: u16) -> BatteryLevel {
        if millivolts <= self.critical_millivolts {
            BatteryLevel::Critical
        } else if millivolts <= self.low_millivolts {
            BatteryLevel::Low
        } else {
            BatteryLevel::Ok
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum BatteryLevel {
    #[default]
    Ok,
    Low,
    Critical,
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatteryLevel::Ok => "ok",
            BatteryLevel::Low => "low",
            BatteryLevel::Critical => "critical",
        })
    }
}

/// Band crossing reported by [`BatteryMonitor::record`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BatteryChange {
    pub from: BatteryLevel,
    pub to: BatteryLevel,
    pub millivolts: u16,
}

impl BatteryChange {
    /// Session trigger for this crossing.
    #[must_use]
    pub const fn trigger(&self) -> SessionTrigger {
        match self.to {
            BatteryLevel::Ok => SessionTrigger::BatteryOk,
            BatteryLevel::Low => SessionTrigger::BatteryWarning,
            BatteryLevel::Critical => SessionTrigger::BatteryCritical,
        }
    }
}

/// Tracks the latest reading and when the next one is due.
pub struct BatteryMonitor {
    config: BatteryConfig,
    level: BatteryLevel,
    last_millivolts: Option<u16>,
    next_sample: Option<Instant>,
}

impl BatteryMonitor {
    #[must_use]
    pub const fn new(config: BatteryConfig) -> Self {
        Self {
            config,
            level: BatteryLevel::Ok,
            last_millivolts: None,
            next_sample: None,
        }
    }

    #[must_use]
    pub const fn level(&self) -> BatteryLevel {
        self.level
    }

    #[must_use]
    pub const fn last_millivolts(&self) -> Option<u16> {
        self.last_millivolts
    }

    /// Folds a reading. Returns the crossing when the band changed.
    pub fn record(&mut self, millivolts: u16, now: Instant) -> Option<BatteryChange> {
        self.last_millivolts = Some(millivolts);
        self.next_sample = Some(now + self.config.sample_interval);

        let level = self.config.classify(millivolts);
        if level == self.level {
            return None;
        }

        let change = BatteryChange {
            from: self.level,
            to: level,
            millivolts,
        };
        self.level = level;
        Some(change)
    }

    /// When the platform should take the next reading.
    #[must_use]
    pub const fn next_sample(&self) -> Option<Instant> {
        self.next_sample
    }

    /// Reading is due: never sampled, or the interval elapsed.
    #[must_use]
    pub fn sample_due(&self, now: Instant) -> bool {
        self.next_sample.is_none_or(|due| now.has_reached(due))
    }
}

impl Default for BatteryMonitor {
    fn default() -> Self {
        Self::new(BatteryConfig::DEFAULT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_inclusive_downward() {
        let config = BatteryConfig::DEFAULT;
        assert_eq!(config.classify(3_401), BatteryLevel::Ok);
        assert_eq!(config.classify(3_400), BatteryLevel::Low);
        assert_eq!(config.classify(3_301), BatteryLevel::Low);
        assert_eq!(config.classify(3_300), BatteryLevel::Critical);
    }

    #[test]
    fn crossings_map_to_triggers() {
        let mut monitor = BatteryMonitor::default();
        let now = Instant::ZERO;

        assert_eq!(monitor.record(3_900, now), None);
        let low = monitor.record(3_380, now).expect("entered low");
        assert_eq!(low.trigger(), SessionTrigger::BatteryWarning);
        assert_eq!(monitor.record(3_370, now), None);

        let critical = monitor.record(3_250, now).expect("entered critical");
        assert_eq!(critical.from, BatteryLevel::Low);
        assert_eq!(critical.trigger(), SessionTrigger::BatteryCritical);

        let recovered = monitor.record(3_700, now).expect("recovered");
        assert_eq!(recovered.trigger(), SessionTrigger::BatteryOk);
        assert_eq!(monitor.last_millivolts(), Some(3_700));
    }

    #[test]
    fn sampling_follows_interval() {
        let mut monitor = BatteryMonitor::default();
        assert!(monitor.sample_due(Instant::ZERO));

        monitor.record(3_800, Instant::from_millis(1_000));
        assert!(!monitor.sample_due(Instant::from_millis(60_999)));
        assert!(monitor.sample_due(Instant::from_millis(61_000)));
    }
}
