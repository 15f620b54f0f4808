//! Round-trip statistics and adaptive lead time.

use core::time::Duration;

use crate::time::duration_micros;

const EMA_NUM: u64 = 3;
const EMA_DEN: u64 = 10;
const OUTLIER_FACTOR: u64 = 2;

/// Bounds for the interval between issuing a command and its activation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LeadTimeConfig {
    pub min: Duration,
    pub max: Duration,
    /// Multiplier applied to the smoothed RTT deviation.
    pub margin_factor: u32,
    /// Lead used until enough round trips have been measured.
    pub fallback: Duration,
    pub min_samples: u16,
}

impl LeadTimeConfig {
    pub const DEFAULT: Self = Self {
        min: Duration::from_millis(15),
        max: Duration::from_millis(50),
        margin_factor: 3,
        fallback: Duration::from_millis(50),
        min_samples: 3,
    };

    #[must_use]
    pub const fn with_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

impl Default for LeadTimeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Exponentially smoothed round-trip time and its mean absolute deviation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RttStats {
    smoothed_us: u64,
    deviation_us: u64,
    samples: u16,
    last_raw_us: u64,
}

impl RttStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            smoothed_us: 0,
            deviation_us: 0,
            samples: 0,
            last_raw_us: 0,
        }
    }

    /// Feeds one round trip. Returns `false` when it was discarded as a spike.
    pub fn observe(&mut self, round_trip: Duration) -> bool {
        let raw = duration_micros(round_trip);
        self.last_raw_us = raw;

        if self.samples == 0 {
            self.smoothed_us = raw;
            self.deviation_us = 0;
            self.samples = 1;
            return true;
        }

        if self.samples >= 3 && raw > self.smoothed_us.saturating_mul(OUTLIER_FACTOR) {
            return false;
        }

        let error = raw.abs_diff(self.smoothed_us);
        self.smoothed_us = ema(self.smoothed_us, raw);
        self.deviation_us = ema(self.deviation_us, error);
        self.samples = self.samples.saturating_add(1);
        true
    }

    #[must_use]
    pub const fn samples(&self) -> u16 {
        self.samples
    }

    #[must_use]
    pub const fn smoothed(&self) -> Duration {
        Duration::from_micros(self.smoothed_us)
    }

    #[must_use]
    pub const fn deviation(&self) -> Duration {
        Duration::from_micros(self.deviation_us)
    }

    /// Most recent raw round trip, including discarded spikes.
    #[must_use]
    pub const fn last_raw(&self) -> Duration {
        Duration::from_micros(self.last_raw_us)
    }

    /// Lead time: smoothed RTT plus the deviation margin, clamped to bounds.
    #[must_use]
    pub fn lead_time(&self, config: &LeadTimeConfig) -> Duration {
        if self.samples < config.min_samples {
            return config.fallback.clamp(config.min, config.max);
        }

        let margin = self
            .deviation_us
            .saturating_mul(u64::from(config.margin_factor));
        Duration::from_micros(self.smoothed_us.saturating_add(margin)).clamp(config.min, config.max)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

fn ema(previous: u64, sample: u64) -> u64 {
    (EMA_NUM * sample + (EMA_DEN - EMA_NUM) * previous) / EMA_DEN
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn fallback_until_enough_samples() {
        let mut stats = RttStats::new();
        stats.observe(ms(4));
        stats.observe(ms(4));

        assert_eq!(stats.lead_time(&LeadTimeConfig::DEFAULT), ms(50));
    }

    #[test]
    fn steady_link_clamps_to_minimum() {
        let mut stats = RttStats::new();
        for _ in 0..8 {
            stats.observe(ms(6));
        }

        assert_eq!(stats.smoothed(), ms(6));
        assert_eq!(stats.deviation(), Duration::ZERO);
        assert_eq!(stats.lead_time(&LeadTimeConfig::DEFAULT), ms(15));
    }

    #[test]
    fn deviation_widens_the_margin() {
        let mut stats = RttStats::new();
        for rtt in [10, 20, 10, 20, 10, 20] {
            stats.observe(ms(rtt));
        }

        let lead = stats.lead_time(&LeadTimeConfig::DEFAULT);
        let expected = stats.smoothed() + stats.deviation() * 3;
        assert_eq!(lead, expected.clamp(ms(15), ms(50)));
        assert!(lead > ms(15));
    }

    #[test]
    fn spikes_are_ignored_after_warmup() {
        let mut stats = RttStats::new();
        for _ in 0..3 {
            assert!(stats.observe(ms(8)));
        }

        assert!(!stats.observe(ms(40)));
        assert_eq!(stats.smoothed(), ms(8));
        assert_eq!(stats.last_raw(), ms(40));
        assert_eq!(stats.samples(), 3);
    }

    #[test]
    fn lead_never_exceeds_maximum() {
        let mut stats = RttStats::new();
        for rtt in [30, 60, 30, 60, 30] {
            stats.observe(ms(rtt));
        }
        assert_eq!(stats.lead_time(&LeadTimeConfig::DEFAULT), ms(50));
    }
}
