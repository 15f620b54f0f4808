//! Conversions between the Embassy time driver and core instants.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use bilateral_core::time::Instant;
use core::time::Duration;

/// Longest the control loop sleeps when nothing is scheduled.
pub const IDLE_WAKE: Duration = Duration::from_secs(1);

pub fn to_core(instant: embassy_time::Instant) -> Instant {
    Instant::from_micros(instant.as_micros())
}

pub fn to_embassy(instant: Instant) -> embassy_time::Instant {
    embassy_time::Instant::from_micros(instant.as_micros())
}

/// Picks the next wake-up.
///
/// `floor` holds the loop back when a deadline stays in the past because
/// the work it stands for could not be done (a failed ADC read).
pub fn wake_at(deadline: Option<Instant>, now: Instant, floor: Option<Instant>) -> Instant {
    let wake = deadline.unwrap_or(now + IDLE_WAKE);
    match floor {
        Some(floor) => wake.latest(floor),
        None => wake,
    }
}
