//! Diagnostic event catalog and the fixed-capacity recorder shared by firmware
//! and host targets.
//!
//! The controller never prints. Everything worth diagnosing (state changes,
//! late activations, rejected clock samples, stale commands, link events) is
//! written here as a typed record with a monotonically increasing id. Event
//! kinds serialize to compact numeric codes so the firmware can mirror them
//! over a debug probe without formatting on the hot path.

use core::{fmt, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::battery::BatteryLevel;
use crate::pattern::Finger;
use crate::session::SessionState;

/// Identifier assigned to each recorded event.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Discriminated telemetry events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryEventKind {
    /// The session machine committed a transition into the given state.
    StateChanged(SessionState),
    /// An activation fired more than the lateness tolerance after its deadline.
    LateActivation(Finger),
    SyncCompleted,
    SyncFailed,
    SampleRejected,
    StaleCommand,
    MalformedFrame,
    KeepaliveMissed,
    ConnectionLost,
    ReconnectAttempt,
    Reconnected,
    ReconnectFailed,
    ActuatorsForcedOff,
    CycleCompleted,
    BatteryLevel,
    PhoneLost,
    PhoneRestored,
    TransportError,
    /// A well-formed command refused by the session or parameter rules.
    CommandRejected,
    Custom(u16),
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::StateChanged(state) => write!(f, "state-changed {state}"),
            TelemetryEventKind::LateActivation(finger) => write!(f, "late-activation {finger}"),
            TelemetryEventKind::SyncCompleted => f.write_str("sync-completed"),
            TelemetryEventKind::SyncFailed => f.write_str("sync-failed"),
            TelemetryEventKind::SampleRejected => f.write_str("sample-rejected"),
            TelemetryEventKind::StaleCommand => f.write_str("stale-command"),
            TelemetryEventKind::MalformedFrame => f.write_str("malformed-frame"),
            TelemetryEventKind::KeepaliveMissed => f.write_str("keepalive-missed"),
            TelemetryEventKind::ConnectionLost => f.write_str("connection-lost"),
            TelemetryEventKind::ReconnectAttempt => f.write_str("reconnect-attempt"),
            TelemetryEventKind::Reconnected => f.write_str("reconnected"),
            TelemetryEventKind::ReconnectFailed => f.write_str("reconnect-failed"),
            TelemetryEventKind::ActuatorsForcedOff => f.write_str("actuators-forced-off"),
            TelemetryEventKind::CycleCompleted => f.write_str("cycle-completed"),
            TelemetryEventKind::BatteryLevel => f.write_str("battery-level"),
            TelemetryEventKind::PhoneLost => f.write_str("phone-lost"),
            TelemetryEventKind::PhoneRestored => f.write_str("phone-restored"),
            TelemetryEventKind::TransportError => f.write_str("transport-error"),
            TelemetryEventKind::CommandRejected => f.write_str("command-rejected"),
            TelemetryEventKind::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

impl TelemetryEventKind {
    const STATE_BASE: u16 = 0x0000;
    const LATE_BASE: u16 = 0x0010;
    const SYNC_COMPLETED_CODE: u16 = 0x0020;
    const SYNC_FAILED_CODE: u16 = 0x0021;
    const SAMPLE_REJECTED_CODE: u16 = 0x0022;
    const STALE_COMMAND_CODE: u16 = 0x0023;
    const MALFORMED_FRAME_CODE: u16 = 0x0024;
    const KEEPALIVE_MISSED_CODE: u16 = 0x0025;
    const CONNECTION_LOST_CODE: u16 = 0x0026;
    const RECONNECT_ATTEMPT_CODE: u16 = 0x0027;
    const RECONNECTED_CODE: u16 = 0x0028;
    const RECONNECT_FAILED_CODE: u16 = 0x0029;
    const ACTUATORS_OFF_CODE: u16 = 0x002A;
    const CYCLE_COMPLETED_CODE: u16 = 0x002B;
    const BATTERY_LEVEL_CODE: u16 = 0x002C;
    const PHONE_LOST_CODE: u16 = 0x002D;
    const PHONE_RESTORED_CODE: u16 = 0x002E;
    const TRANSPORT_ERROR_CODE: u16 = 0x002F;
    const COMMAND_REJECTED_CODE: u16 = 0x0030;

    /// Encodes the event into a compact transport-friendly discriminant.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn to_raw(self) -> u16 {
        match self {
            TelemetryEventKind::StateChanged(state) => Self::STATE_BASE + state.as_index() as u16,
            TelemetryEventKind::LateActivation(finger) => {
                Self::LATE_BASE + finger.as_index() as u16
            }
            TelemetryEventKind::SyncCompleted => Self::SYNC_COMPLETED_CODE,
            TelemetryEventKind::SyncFailed => Self::SYNC_FAILED_CODE,
            TelemetryEventKind::SampleRejected => Self::SAMPLE_REJECTED_CODE,
            TelemetryEventKind::StaleCommand => Self::STALE_COMMAND_CODE,
            TelemetryEventKind::MalformedFrame => Self::MALFORMED_FRAME_CODE,
            TelemetryEventKind::KeepaliveMissed => Self::KEEPALIVE_MISSED_CODE,
            TelemetryEventKind::ConnectionLost => Self::CONNECTION_LOST_CODE,
            TelemetryEventKind::ReconnectAttempt => Self::RECONNECT_ATTEMPT_CODE,
            TelemetryEventKind::Reconnected => Self::RECONNECTED_CODE,
            TelemetryEventKind::ReconnectFailed => Self::RECONNECT_FAILED_CODE,
            TelemetryEventKind::ActuatorsForcedOff => Self::ACTUATORS_OFF_CODE,
            TelemetryEventKind::CycleCompleted => Self::CYCLE_COMPLETED_CODE,
            TelemetryEventKind::BatteryLevel => Self::BATTERY_LEVEL_CODE,
            TelemetryEventKind::PhoneLost => Self::PHONE_LOST_CODE,
            TelemetryEventKind::PhoneRestored => Self::PHONE_RESTORED_CODE,
            TelemetryEventKind::TransportError => Self::TRANSPORT_ERROR_CODE,
            TelemetryEventKind::CommandRejected => Self::COMMAND_REJECTED_CODE,
            TelemetryEventKind::Custom(code) => code,
        }
    }

    /// Decodes a raw discriminant, falling back to [`TelemetryEventKind::Custom`].
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        match code {
            Self::SYNC_COMPLETED_CODE => TelemetryEventKind::SyncCompleted,
            Self::SYNC_FAILED_CODE => TelemetryEventKind::SyncFailed,
            Self::SAMPLE_REJECTED_CODE => TelemetryEventKind::SampleRejected,
            Self::STALE_COMMAND_CODE => TelemetryEventKind::StaleCommand,
            Self::MALFORMED_FRAME_CODE => TelemetryEventKind::MalformedFrame,
            Self::KEEPALIVE_MISSED_CODE => TelemetryEventKind::KeepaliveMissed,
            Self::CONNECTION_LOST_CODE => TelemetryEventKind::ConnectionLost,
            Self::RECONNECT_ATTEMPT_CODE => TelemetryEventKind::ReconnectAttempt,
            Self::RECONNECTED_CODE => TelemetryEventKind::Reconnected,
            Self::RECONNECT_FAILED_CODE => TelemetryEventKind::ReconnectFailed,
            Self::ACTUATORS_OFF_CODE => TelemetryEventKind::ActuatorsForcedOff,
            Self::CYCLE_COMPLETED_CODE => TelemetryEventKind::CycleCompleted,
            Self::BATTERY_LEVEL_CODE => TelemetryEventKind::BatteryLevel,
            Self::PHONE_LOST_CODE => TelemetryEventKind::PhoneLost,
            Self::PHONE_RESTORED_CODE => TelemetryEventKind::PhoneRestored,
            Self::TRANSPORT_ERROR_CODE => TelemetryEventKind::TransportError,
            Self::COMMAND_REJECTED_CODE => TelemetryEventKind::CommandRejected,
            value if (Self::STATE_BASE..Self::LATE_BASE).contains(&value) => {
                SessionState::from_index(usize::from(value - Self::STATE_BASE))
                    .map_or(TelemetryEventKind::Custom(value), |state| {
                        TelemetryEventKind::StateChanged(state)
                    })
            }
            value if (Self::LATE_BASE..Self::SYNC_COMPLETED_CODE).contains(&value) => {
                Finger::from_index(usize::from(value - Self::LATE_BASE))
                    .map_or(TelemetryEventKind::Custom(value), |finger| {
                        TelemetryEventKind::LateActivation(finger)
                    })
            }
            other => TelemetryEventKind::Custom(other),
        }
    }
}

/// Payloads carried alongside telemetry events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TelemetryPayload {
    /// No additional metadata accompanies the event.
    None,
    /// Committed state transition.
    Transition(TransitionTelemetry),
    /// How far past its deadline an activation fired.
    Lateness(Duration),
    /// Outcome of a clock-sync burst or a rejected sample.
    Sync(SyncTelemetry),
    /// Sequence id of a rejected command and the last accepted id.
    Sequence { rejected: u32, last_accepted: u32 },
    /// Keepalive or reconnect counter.
    Link { count: u8 },
    /// Generic counter (channels forced off, cycles completed).
    Count(u32),
    /// Battery voltage classification.
    Battery { millivolts: u16, level: BatteryLevel },
}

impl TelemetryPayload {
    /// Convenience constructor when no payload data is needed.
    #[must_use]
    pub const fn none() -> Self {
        TelemetryPayload::None
    }
}

/// State transition payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransitionTelemetry {
    pub from: SessionState,
    pub to: SessionState,
    pub elapsed_since_previous: Option<Duration>,
}

/// Clock-sync payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncTelemetry {
    pub offset_us: i64,
    pub valid_samples: u8,
    pub round_trip: Option<Duration>,
}

impl SyncTelemetry {
    #[must_use]
    pub const fn new(offset_us: i64, valid_samples: u8, round_trip: Option<Duration>) -> Self {
        Self {
            offset_us,
            valid_samples,
            round_trip,
        }
    }
}

/// Trait implemented by monotonic instant wrappers used for telemetry tracking.
pub trait TelemetryInstant: Copy {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord<TInstant>
where
    TInstant: Copy,
{
    pub id: EventId,
    pub timestamp: TInstant,
    pub event: TelemetryEventKind,
    pub details: TelemetryPayload,
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord<TInstant>, CAPACITY>;

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY>
where
    TInstant: Copy,
{
    ring: TelemetryRing<TInstant, CAPACITY>,
    last_transition_at: Option<TInstant>,
    next_event_id: EventId,
    cursor: EventId,
}

impl<TInstant, const CAPACITY: usize> TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            last_transition_at: None,
            next_event_id: 0,
            cursor: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord<TInstant>> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord<TInstant>> {
        self.ring.recent()
    }

    /// Returns the number of records currently stored.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no telemetry records are stored.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Counts records of the given kind still held in the ring.
    ///
    /// Older records are overwritten once the ring is full, so over a long
    /// session this is a count over the recent window, not a lifetime total.
    pub fn count(&self, event: TelemetryEventKind) -> usize {
        self.ring
            .oldest_ordered()
            .filter(|record| record.event == event)
            .count()
    }

    /// Visits records written since the previous drain, oldest first.
    ///
    /// Used by the host and firmware log sinks to mirror new events without
    /// removing them from the ring.
    pub fn drain_new(&mut self, mut visit: impl FnMut(&TelemetryRecord<TInstant>)) {
        let cursor = self.cursor;
        for record in self.ring.oldest_ordered() {
            if record.id.wrapping_sub(cursor) < EventId::MAX / 2 {
                visit(record);
            }
        }
        self.cursor = self.next_event_id;
    }

    /// Records a committed state transition with the time spent in the old state.
    pub fn record_transition(
        &mut self,
        from: SessionState,
        to: SessionState,
        timestamp: TInstant,
    ) -> EventId {
        let elapsed = self
            .last_transition_at
            .map(|previous| timestamp.saturating_duration_since(previous));
        self.last_transition_at = Some(timestamp);

        self.record(
            TelemetryEventKind::StateChanged(to),
            TelemetryPayload::Transition(TransitionTelemetry {
                from,
                to,
                elapsed_since_previous: elapsed,
            }),
            timestamp,
        )
    }

    /// Records an activation that fired past its deadline.
    pub fn record_late_activation(
        &mut self,
        finger: Finger,
        lateness: Duration,
        timestamp: TInstant,
    ) -> EventId {
        self.record(
            TelemetryEventKind::LateActivation(finger),
            TelemetryPayload::Lateness(lateness),
            timestamp,
        )
    }

    /// Records a command dropped by the sequence gate.
    pub fn record_stale_command(
        &mut self,
        rejected: u32,
        last_accepted: u32,
        timestamp: TInstant,
    ) -> EventId {
        self.record(
            TelemetryEventKind::StaleCommand,
            TelemetryPayload::Sequence {
                rejected,
                last_accepted,
            },
            timestamp,
        )
    }

    /// Records a link event carrying a miss or attempt counter.
    pub fn record_link(&mut self, event: TelemetryEventKind, count: u8, timestamp: TInstant) -> EventId {
        self.record(event, TelemetryPayload::Link { count }, timestamp)
    }

    /// Records an arbitrary telemetry event with the supplied payload.
    pub fn record(
        &mut self,
        event: TelemetryEventKind,
        payload: TelemetryPayload,
        timestamp: TInstant,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            event,
            details: payload,
        });

        id
    }
}

impl<TInstant, const CAPACITY: usize> Default for TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Saturating conversion used for counters stored in compact payloads.
#[must_use]
pub fn truncate_count(count: usize) -> u8 {
    u8::try_from(count).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Instant;

    #[test]
    fn indexed_kinds_decode_back() {
        let late = TelemetryEventKind::LateActivation(Finger::Ring);
        assert_eq!(late.to_raw(), 0x0012);
        assert_eq!(TelemetryEventKind::from_raw(0x0012), late);

        let state = TelemetryEventKind::StateChanged(SessionState::ConnectionLost);
        assert_eq!(TelemetryEventKind::from_raw(state.to_raw()), state);

        assert_eq!(
            TelemetryEventKind::from_raw(0x0014),
            TelemetryEventKind::Custom(0x0014)
        );
        assert_eq!(
            TelemetryEventKind::from_raw(0x7F00),
            TelemetryEventKind::Custom(0x7F00)
        );
    }

    #[test]
    fn transitions_carry_elapsed_time() {
        let mut recorder = TelemetryRecorder::<Instant>::new();

        let first = recorder.record_transition(
            SessionState::Idle,
            SessionState::Ready,
            Instant::from_micros(100),
        );
        let second = recorder.record_transition(
            SessionState::Ready,
            SessionState::Running,
            Instant::from_micros(350),
        );

        assert_eq!((first, second), (0, 1));
        let record = recorder.latest().copied().expect("transition recorded");
        assert_eq!(
            record.event,
            TelemetryEventKind::StateChanged(SessionState::Running)
        );
        match record.details {
            TelemetryPayload::Transition(details) => {
                assert_eq!(details.from, SessionState::Ready);
                assert_eq!(
                    details.elapsed_since_previous,
                    Some(Duration::from_micros(250))
                );
            }
            other => panic!("expected transition payload, got {other:?}"),
        }
    }

    #[test]
    fn ring_keeps_newest_records() {
        let mut recorder = TelemetryRecorder::<Instant, 4>::new();
        for tick in 0..6u64 {
            recorder.record(
                TelemetryEventKind::KeepaliveMissed,
                TelemetryPayload::none(),
                Instant::from_millis(tick),
            );
        }

        assert_eq!(recorder.len(), 4);
        let ids: heapless::Vec<EventId, 4> = recorder.oldest_first().map(|r| r.id).collect();
        assert_eq!(ids.as_slice(), &[2, 3, 4, 5]);
    }

    #[test]
    fn count_covers_only_the_retained_window() {
        let mut recorder = TelemetryRecorder::<Instant, 4>::new();
        for tick in 0..3u64 {
            recorder.record_stale_command(1, 2, Instant::from_millis(tick));
        }
        for tick in 3..6u64 {
            recorder.record(
                TelemetryEventKind::KeepaliveMissed,
                TelemetryPayload::none(),
                Instant::from_millis(tick),
            );
        }

        assert_eq!(recorder.count(TelemetryEventKind::StaleCommand), 1);
        assert_eq!(recorder.count(TelemetryEventKind::KeepaliveMissed), 3);
    }

    #[test]
    fn drain_visits_only_new_records() {
        let mut recorder = TelemetryRecorder::<Instant, 8>::new();
        recorder.record_stale_command(5, 7, Instant::from_millis(1));

        let mut seen = 0;
        recorder.drain_new(|_| seen += 1);
        assert_eq!(seen, 1);

        recorder.record_late_activation(Finger::Index, Duration::from_millis(3), Instant::from_millis(2));
        let mut kinds: heapless::Vec<TelemetryEventKind, 4> = heapless::Vec::new();
        recorder.drain_new(|record| {
            let _ = kinds.push(record.event);
        });
        assert_eq!(
            kinds.as_slice(),
            &[TelemetryEventKind::LateActivation(Finger::Index)]
        );
        assert_eq!(recorder.count(TelemetryEventKind::StaleCommand), 1);
    }
}
