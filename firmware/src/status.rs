#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Shared status storage for the firmware target.
//!
//! The control task owns the [`Controller`](bilateral_core::controller::Controller);
//! everything else reads the latest session state, clock offset, battery
//! voltage and link flags from these atomics.

use core::time::Duration;

use bilateral_core::session::SessionState;
use portable_atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, Ordering};

const UNKNOWN_MV: u32 = 0;

/// Index of the current [`SessionState`].
static SESSION_STATE: AtomicU8 = AtomicU8::new(0);
/// Peer clock offset in microseconds (peer = local + offset).
static OFFSET_US: AtomicI64 = AtomicI64::new(0);
/// Whether [`OFFSET_US`] comes from a completed sync burst.
static OFFSET_VALID: AtomicBool = AtomicBool::new(false);
/// Millivolt reading of the battery (0 == unknown).
static BATTERY_MV: AtomicU32 = AtomicU32::new(UNKNOWN_MV);
/// Radio connection pin as last reported.
static PEER_LINK_UP: AtomicBool = AtomicBool::new(false);
/// Channels currently driven, one bit per finger.
static ACTIVE_MASK: AtomicU8 = AtomicU8::new(0);

/// Point-in-time copy of the shared status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub offset_us: i64,
    pub offset_valid: bool,
    pub battery_mv: Option<u16>,
    pub peer_link_up: bool,
    pub active_mask: u8,
}

/// Stores the session state.
#[allow(clippy::cast_possible_truncation)]
pub fn record_state(state: SessionState) {
    SESSION_STATE.store(state.as_index() as u8, Ordering::Relaxed);
}

/// Stores the clock offset and its validity.
pub fn record_offset(offset_us: i64, valid: bool) {
    OFFSET_US.store(offset_us, Ordering::Relaxed);
    OFFSET_VALID.store(valid, Ordering::Release);
}

/// Stores the latest millivolt reading.
pub fn record_battery(millivolts: u16) {
    BATTERY_MV.store(u32::from(millivolts), Ordering::Relaxed);
}

pub fn record_peer_link(up: bool) {
    PEER_LINK_UP.store(up, Ordering::Relaxed);
}

/// Updates one channel bit in the active mask.
pub fn record_channel(index: usize, on: bool) {
    let bit = 1u8 << index;
    if on {
        ACTIVE_MASK.fetch_or(bit, Ordering::Relaxed);
    } else {
        ACTIVE_MASK.fetch_and(!bit, Ordering::Relaxed);
    }
}

/// Returns the current session state.
pub fn state() -> SessionState {
    SessionState::from_index(usize::from(SESSION_STATE.load(Ordering::Relaxed)))
        .unwrap_or(SessionState::Idle)
}

/// Returns the most recent battery reading, if any.
#[allow(clippy::cast_possible_truncation)]
pub fn battery_mv() -> Option<u16> {
    match BATTERY_MV.load(Ordering::Relaxed) {
        UNKNOWN_MV => None,
        value => Some(value.min(u32::from(u16::MAX)) as u16),
    }
}

/// Builds a [`StatusSnapshot`] from the stored values.
pub fn snapshot() -> StatusSnapshot {
    let offset_valid = OFFSET_VALID.load(Ordering::Acquire);
    StatusSnapshot {
        state: state(),
        offset_us: OFFSET_US.load(Ordering::Relaxed),
        offset_valid,
        battery_mv: battery_mv(),
        peer_link_up: PEER_LINK_UP.load(Ordering::Relaxed),
        active_mask: ACTIVE_MASK.load(Ordering::Relaxed),
    }
}

/// Status LED behaviour.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Indicator {
    Off,
    Solid,
    Blink(Duration),
}

/// Maps a snapshot to the LED behaviour.
pub fn indicator(snapshot: &StatusSnapshot) -> Indicator {
    match snapshot.state {
        SessionState::Idle => Indicator::Off,
        SessionState::Running => Indicator::Solid,
        state if state.is_error() => Indicator::Blink(Duration::from_millis(100)),
        SessionState::Ready if snapshot.offset_valid => Indicator::Blink(Duration::from_millis(1_000)),
        _ => Indicator::Blink(Duration::from_millis(250)),
    }
}

/// LED level `elapsed` into the pattern.
pub fn indicator_level(indicator: Indicator, elapsed: Duration) -> bool {
    match indicator {
        Indicator::Off => false,
        Indicator::Solid => true,
        Indicator::Blink(half_period) => {
            let half = half_period.as_millis().max(1);
            (elapsed.as_millis() / half) % 2 == 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Peer link and channel bits are also written by other modules' tests,
    // so only the values owned here are checked.
    #[test]
    fn snapshot_reflects_recorded_values() {
        record_state(SessionState::Running);
        record_offset(-137_000, true);
        record_battery(3_712);

        let snapshot = snapshot();
        assert_eq!(snapshot.state, SessionState::Running);
        assert_eq!(snapshot.offset_us, -137_000);
        assert!(snapshot.offset_valid);
        assert_eq!(snapshot.battery_mv, Some(3_712));
    }

    fn snapshot_in(state: SessionState, offset_valid: bool) -> StatusSnapshot {
        StatusSnapshot {
            state,
            offset_us: 0,
            offset_valid,
            battery_mv: None,
            peer_link_up: true,
            active_mask: 0,
        }
    }

    #[test]
    fn indicator_distinguishes_sync_and_faults() {
        assert_eq!(indicator(&snapshot_in(SessionState::Idle, false)), Indicator::Off);
        assert_eq!(indicator(&snapshot_in(SessionState::Running, true)), Indicator::Solid);
        assert_eq!(
            indicator(&snapshot_in(SessionState::Ready, true)),
            Indicator::Blink(Duration::from_millis(1_000))
        );
        assert_eq!(
            indicator(&snapshot_in(SessionState::Ready, false)),
            Indicator::Blink(Duration::from_millis(250))
        );
        assert_eq!(
            indicator(&snapshot_in(SessionState::ConnectionLost, true)),
            Indicator::Blink(Duration::from_millis(100))
        );
    }

    #[test]
    fn blink_alternates_every_half_period() {
        let blink = Indicator::Blink(Duration::from_millis(250));
        assert!(indicator_level(blink, Duration::from_millis(0)));
        assert!(!indicator_level(blink, Duration::from_millis(260)));
        assert!(indicator_level(blink, Duration::from_millis(510)));
        assert!(!indicator_level(Indicator::Off, Duration::from_millis(510)));
    }
}
