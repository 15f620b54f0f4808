//! Finger channels and per-cycle activation patterns.
//!
//! A [`Pattern`] is one macrocycle's finger order for both hands plus the
//! jittered spacing between its events. Patterns are drawn from a
//! [`PatternGenerator`] seeded with the session seed, so a device that knows
//! the seed can replay the exact same sequence for diagnostics.

use core::fmt;
use core::time::Duration;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::therapy::config::TherapyConfig;
use crate::time::duration_micros;

/// Number of actuator channels per hand.
pub const FINGER_COUNT: usize = 4;

/// Actuator channel on one hand.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Finger {
    Index,
    Middle,
    Ring,
    Pinky,
}

impl Finger {
    /// Deterministic index for lookups into per-channel tables.
    #[must_use]
    pub const fn as_index(self) -> usize {
        match self {
            Finger::Index => 0,
            Finger::Middle => 1,
            Finger::Ring => 2,
            Finger::Pinky => 3,
        }
    }

    /// Attempts to construct a [`Finger`] from a raw channel index.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Finger::Index),
            1 => Some(Finger::Middle),
            2 => Some(Finger::Ring),
            3 => Some(Finger::Pinky),
            _ => None,
        }
    }
}

impl fmt::Display for Finger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Finger::Index => "index",
            Finger::Middle => "middle",
            Finger::Ring => "ring",
            Finger::Pinky => "pinky",
        })
    }
}

/// Every channel in index order.
pub const ALL_FINGERS: [Finger; FINGER_COUNT] =
    [Finger::Index, Finger::Middle, Finger::Ring, Finger::Pinky];

/// One cycle's finger order for both sides.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pattern {
    pub left: [Finger; FINGER_COUNT],
    pub right: [Finger; FINGER_COUNT],
    /// Spacing from event `i` to event `i + 1` (the last entry paces the
    /// first event of the following cycle).
    pub intervals: [Duration; FINGER_COUNT],
}

impl Pattern {
    /// Returns the (left, right) channel pair for event `index`.
    #[must_use]
    pub fn pair(&self, index: usize) -> Option<(Finger, Finger)> {
        Some((*self.left.get(index)?, *self.right.get(index)?))
    }
}

/// Closed set of pattern algorithms.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PatternStrategy {
    /// Shuffled left order; right mirrors it or is shuffled independently.
    #[default]
    Random,
    /// Index to pinky; right mirrors it or runs in reverse.
    Sequential,
    /// Shuffled left order, always mirrored.
    Mirrored,
}

impl PatternStrategy {
    /// Wire name used by `PARAM_UPDATE:PATTERN|...`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            PatternStrategy::Random => "rndp",
            PatternStrategy::Sequential => "sequential",
            PatternStrategy::Mirrored => "mirrored",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        [
            PatternStrategy::Random,
            PatternStrategy::Sequential,
            PatternStrategy::Mirrored,
        ]
        .into_iter()
        .find(|strategy| strategy.name().eq_ignore_ascii_case(name))
    }

    /// Generates one cycle's pattern.
    pub fn generate<R: Rng>(self, rng: &mut R, config: &TherapyConfig) -> Pattern {
        let mut left = ALL_FINGERS;
        let right = match self {
            PatternStrategy::Random => {
                left.shuffle(rng);
                if config.mirror {
                    left
                } else {
                    let mut right = ALL_FINGERS;
                    right.shuffle(rng);
                    right
                }
            }
            PatternStrategy::Sequential => {
                let mut right = left;
                if !config.mirror {
                    right.reverse();
                }
                right
            }
            PatternStrategy::Mirrored => {
                left.shuffle(rng);
                left
            }
        };

        let mut intervals = [Duration::ZERO; FINGER_COUNT];
        for interval in &mut intervals {
            *interval = jittered_interval(rng, config);
        }

        Pattern {
            left,
            right,
            intervals,
        }
    }
}

impl fmt::Display for PatternStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Draws one event spacing: the nominal period shifted by a uniform offset
/// within `±period/2 × jitter%`, never below zero.
fn jittered_interval<R: Rng>(rng: &mut R, config: &TherapyConfig) -> Duration {
    let period = duration_micros(config.event_period());
    let half_span = period.saturating_mul(u64::from(config.jitter_tenths)) / 2_000;
    if half_span == 0 {
        return Duration::from_micros(period);
    }

    let span = i64::try_from(half_span).unwrap_or(i64::MAX);
    let shift = rng.random_range(-span..=span);
    Duration::from_micros(period.saturating_add_signed(shift))
}

/// Seeded source of patterns, amplitudes and frequencies for one session.
pub struct PatternGenerator {
    rng: SmallRng,
    cycles: u32,
}

impl PatternGenerator {
    /// Creates a generator from the session seed exchanged with `SEED`.
    #[must_use]
    pub fn from_seed(seed: u32) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(u64::from(seed)),
            cycles: 0,
        }
    }

    /// Draws the next cycle's pattern with the configured strategy.
    pub fn next_pattern(&mut self, config: &TherapyConfig) -> Pattern {
        self.cycles = self.cycles.wrapping_add(1);
        config.strategy.generate(&mut self.rng, config)
    }

    /// Number of patterns drawn so far.
    #[must_use]
    pub const fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Draws a burst amplitude from the configured range.
    pub fn amplitude(&mut self, config: &TherapyConfig) -> u8 {
        let range = config.amplitude;
        if range.min >= range.max {
            return range.min;
        }
        self.rng.random_range(range.min..=range.max)
    }

    /// Draws a drive frequency from the configured range.
    pub fn frequency(&mut self, config: &TherapyConfig) -> u16 {
        let range = config.frequency;
        if range.min >= range.max {
            return range.min;
        }
        self.rng.random_range(range.min..=range.max)
    }
}
