//! Monotonic microsecond timestamps.
//!
//! Every device counts microseconds since its own boot. The counters of the
//! two devices are unrelated until the clock engine measures their offset, so
//! an [`Instant`] is only ever compared with instants from the same device.
//! All elapsed-time arithmetic goes through wrapping subtraction on the
//! unsigned counter; a later instant is always the left operand.

use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;

use crate::telemetry::TelemetryInstant;

/// Half of the counter range. Deltas at or above this are treated as "before".
const HALF_RANGE: u64 = 1 << 63;

/// Microseconds since local boot on a single device.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Instant(u64);

impl Instant {
    /// Counter origin (boot).
    pub const ZERO: Self = Self(0);

    /// Builds an instant from a raw microsecond counter.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Builds an instant from a millisecond count.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.wrapping_mul(1_000))
    }

    /// Returns the raw microsecond counter.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Returns the time elapsed from `earlier` to `self`.
    ///
    /// Uses wrapping subtraction, so the result stays correct across a
    /// counter wrap as long as the true interval is shorter than half the
    /// counter range.
    #[must_use]
    pub const fn elapsed_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.wrapping_sub(earlier.0))
    }

    /// Returns `true` once `self` is at or past `deadline`.
    #[must_use]
    pub const fn has_reached(self, deadline: Self) -> bool {
        self.0.wrapping_sub(deadline.0) < HALF_RANGE
    }

    /// Signed microsecond distance from `earlier` to `self`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn signed_micros_since(self, earlier: Self) -> i64 {
        self.0.wrapping_sub(earlier.0) as i64
    }

    /// Shifts the instant by a signed microsecond amount.
    #[must_use]
    pub const fn offset_by(self, micros: i64) -> Self {
        Self(self.0.wrapping_add_signed(micros))
    }

    /// Returns the later of two instants (wrap-aware).
    #[must_use]
    pub const fn latest(self, other: Self) -> Self {
        if self.has_reached(other) { self } else { other }
    }

    /// Returns the earlier of two optional deadlines (wrap-aware).
    #[must_use]
    pub fn earliest(first: Option<Self>, second: Option<Self>) -> Option<Self> {
        match (first, second) {
            (Some(a), Some(b)) => Some(if a.has_reached(b) { b } else { a }),
            (Some(a), None) => Some(a),
            (None, other) => other,
        }
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.wrapping_add(duration_micros(rhs)))
    }
}

impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0.wrapping_sub(duration_micros(rhs)))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

impl TelemetryInstant for Instant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        if self.has_reached(earlier) {
            self.elapsed_since(earlier)
        } else {
            Duration::ZERO
        }
    }
}

/// Converts a duration to whole microseconds, saturating at `u64::MAX`.
#[must_use]
pub fn duration_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
