//! Scheduled actuation shared by both devices.
//!
//! The issuer stamps each `BUZZ` with an activation time in its own clock,
//! far enough ahead to cover the link latency, and arms its local channel for
//! the same instant. The receiver maps that instant through the clock offset
//! and arms its channel for the local equivalent. Both sides then fire from
//! [`Dispatcher::poll`], which the control loop calls whenever
//! [`Dispatcher::next_deadline`] comes due.

use core::fmt;
use core::time::Duration;

use crate::clock::ClockSnapshot;
use crate::pattern::{ALL_FINGERS, FINGER_COUNT, Finger};
use crate::time::Instant;

/// Activations firing later than this past their deadline count as late.
pub const LATE_THRESHOLD: Duration = Duration::from_millis(1);

/// Abstraction over the motor drivers.
pub trait Actuator {
    /// Starts driving the channel at `amplitude` percent.
    fn activate(&mut self, finger: Finger, amplitude: u8);

    /// Stops the channel.
    fn deactivate(&mut self, finger: Finger);

    /// Stops every channel.
    fn deactivate_all(&mut self) {
        for finger in ALL_FINGERS {
            self.deactivate(finger);
        }
    }

    /// Sets the drive frequency used by the next activation.
    fn set_frequency(&mut self, _finger: Finger, _hz: u16) {}
}

/// Actuator that performs no hardware interaction.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopActuator;

impl Actuator for NoopActuator {
    fn activate(&mut self, _: Finger, _: u8) {}

    fn deactivate(&mut self, _: Finger) {}
}

/// Sequence id and issue time carried by control messages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ControlStamp {
    pub sequence: u32,
    pub timestamp: Instant,
}

/// Wire form of a scheduled activation. Timestamps use the issuer's clock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BuzzCommand {
    pub sequence: u32,
    pub issued_at: Instant,
    pub finger: Finger,
    /// Percent of full drive, `0..=100`.
    pub amplitude: u8,
    pub duration: Duration,
    pub frequency_hz: u16,
    pub activate_at: Instant,
}

/// What one side of a bilateral burst should do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ActivationRequest {
    pub finger: Finger,
    pub amplitude: u8,
    pub duration: Duration,
    pub frequency_hz: u16,
}

/// Rejects sequence ids that do not strictly increase.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SequenceGate {
    last: Option<u32>,
}

impl SequenceGate {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Highest accepted sequence id.
    #[must_use]
    pub const fn last(&self) -> Option<u32> {
        self.last
    }

    /// Checks `sequence` without recording it.
    pub fn check(&self, sequence: u32) -> Result<(), DispatchError> {
        match self.last {
            Some(last) if sequence <= last => Err(DispatchError::StaleSequence { sequence, last }),
            _ => Ok(()),
        }
    }

    /// Checks and records `sequence`.
    pub fn accept(&mut self, sequence: u32) -> Result<(), DispatchError> {
        self.check(sequence)?;
        self.last = Some(sequence);
        Ok(())
    }

    /// Session start: the issuer may have restarted its counter.
    pub fn restart_at(&mut self, sequence: u32) {
        self.last = Some(sequence);
    }

    /// Session stop: later commands must still be newer than the stop.
    pub fn raise_to(&mut self, sequence: u32) {
        self.last = Some(self.last.map_or(sequence, |last| last.max(sequence)));
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Reasons a command is refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchError {
    /// Sequence id not newer than the last accepted one.
    StaleSequence { sequence: u32, last: u32 },
    /// No valid clock estimate to map the activation time.
    ClockInvalid,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::StaleSequence { sequence, last } => {
                write!(f, "stale sequence {sequence} (last accepted {last})")
            }
            DispatchError::ClockInvalid => f.write_str("clock estimate not valid"),
        }
    }
}

/// Outcome of arming a channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Armed {
    pub finger: Finger,
    /// Local activation deadline.
    pub deadline: Instant,
    /// Deadline had already passed; the channel fires on the next poll.
    pub late: bool,
}

/// Work performed by [`Dispatcher::poll`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchEvent {
    Activated {
        finger: Finger,
        /// Distance between the deadline and the actual activation.
        lateness: Duration,
        late: bool,
    },
    Released {
        finger: Finger,
    },
    ReleasedAll,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Slot {
    Pending {
        activate_at: Instant,
        amplitude: u8,
        frequency_hz: u16,
        duration: Duration,
    },
    Active {
        release_at: Instant,
    },
}

impl Slot {
    const fn deadline(&self) -> Instant {
        match *self {
            Slot::Pending { activate_at, .. } => activate_at,
            Slot::Active { release_at } => release_at,
        }
    }
}

/// Per-channel timers plus the sequence bookkeeping for both directions.
pub struct Dispatcher {
    slots: [Option<Slot>; FINGER_COUNT],
    release_all_at: Option<Instant>,
    gate: SequenceGate,
    next_outgoing: u32,
}

impl Dispatcher {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [None; FINGER_COUNT],
            release_all_at: None,
            gate: SequenceGate::new(),
            next_outgoing: 1,
        }
    }

    #[must_use]
    pub const fn gate(&self) -> &SequenceGate {
        &self.gate
    }

    /// Channels currently driven.
    #[must_use]
    pub fn active_channels(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Some(Slot::Active { .. })))
            .count()
    }

    /// Channels armed but not yet fired.
    #[must_use]
    pub fn pending_channels(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Some(Slot::Pending { .. })))
            .count()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.release_all_at.is_none() && self.slots.iter().all(Option::is_none)
    }

    /// Allocates the next outgoing sequence id.
    pub fn next_sequence(&mut self) -> u32 {
        let sequence = self.next_outgoing;
        self.next_outgoing = self.next_outgoing.wrapping_add(1).max(1);
        sequence
    }

    /// Stamps an outgoing control message.
    pub fn stamp(&mut self, now: Instant) -> ControlStamp {
        ControlStamp {
            sequence: self.next_sequence(),
            timestamp: now,
        }
    }

    /// Issuer side of a bilateral burst.
    ///
    /// Arms `local` for `now + lead` and returns the `BUZZ` for the peer
    /// carrying `remote` and the same activation instant in the local clock.
    pub fn schedule_bilateral(
        &mut self,
        local: ActivationRequest,
        remote: ActivationRequest,
        now: Instant,
        clock: &ClockSnapshot,
        lead: Duration,
        actuator: &mut impl Actuator,
    ) -> Result<BuzzCommand, DispatchError> {
        if !clock.valid {
            return Err(DispatchError::ClockInvalid);
        }

        let activate_at = now + lead;
        self.arm(local, activate_at, actuator);

        Ok(BuzzCommand {
            sequence: self.next_sequence(),
            issued_at: now,
            finger: remote.finger,
            amplitude: remote.amplitude,
            duration: remote.duration,
            frequency_hz: remote.frequency_hz,
            activate_at,
        })
    }

    /// Receiver side: validates a peer `BUZZ` and arms the local channel.
    pub fn accept_buzz(
        &mut self,
        command: &BuzzCommand,
        now: Instant,
        clock: &ClockSnapshot,
        actuator: &mut impl Actuator,
    ) -> Result<Armed, DispatchError> {
        self.gate.check(command.sequence)?;
        if !clock.valid {
            return Err(DispatchError::ClockInvalid);
        }
        self.gate.accept(command.sequence)?;

        let deadline = clock.peer_to_local(command.activate_at, now);
        let late = now.has_reached(deadline) && now.elapsed_since(deadline) > LATE_THRESHOLD;
        let request = ActivationRequest {
            finger: command.finger,
            amplitude: command.amplitude,
            duration: command.duration,
            frequency_hz: command.frequency_hz,
        };
        self.arm(request, deadline, actuator);

        Ok(Armed {
            finger: command.finger,
            deadline,
            late,
        })
    }

    /// Receiver side of `DEACTIVATE`: releases every channel at the mapped
    /// instant, or immediately when no estimate is available.
    pub fn accept_deactivate(
        &mut self,
        stamp: ControlStamp,
        now: Instant,
        clock: &ClockSnapshot,
    ) -> Result<Instant, DispatchError> {
        self.gate.accept(stamp.sequence)?;
        let at = if clock.valid {
            clock.peer_to_local(stamp.timestamp, now)
        } else {
            now
        };
        self.release_all_at = Some(Instant::earliest(self.release_all_at, Some(at)).unwrap_or(at));
        Ok(at)
    }

    /// `START_SESSION` is always honoured and restarts the gate.
    pub fn on_start(&mut self, stamp: ControlStamp) {
        self.gate.restart_at(stamp.sequence);
    }

    /// `STOP_SESSION` is always honoured.
    pub fn on_stop(&mut self, stamp: ControlStamp) {
        self.gate.raise_to(stamp.sequence);
    }

    /// Earliest instant at which [`Dispatcher::poll`] has work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .flatten()
            .map(Slot::deadline)
            .fold(self.release_all_at, |earliest, deadline| {
                Instant::earliest(earliest, Some(deadline))
            })
    }

    /// Fires at most one due timer.
    pub fn poll(&mut self, now: Instant, actuator: &mut impl Actuator) -> Option<DispatchEvent> {
        if self.release_all_at.is_some_and(|at| now.has_reached(at)) {
            self.release_all_at = None;
            self.slots = [None; FINGER_COUNT];
            actuator.deactivate_all();
            return Some(DispatchEvent::ReleasedAll);
        }

        for finger in ALL_FINGERS {
            let slot = &mut self.slots[finger.as_index()];
            match *slot {
                Some(Slot::Active { release_at }) if now.has_reached(release_at) => {
                    *slot = None;
                    actuator.deactivate(finger);
                    return Some(DispatchEvent::Released { finger });
                }
                Some(Slot::Pending {
                    activate_at,
                    amplitude,
                    frequency_hz,
                    duration,
                }) if now.has_reached(activate_at) => {
                    let lateness = now.elapsed_since(activate_at);
                    let late = lateness > LATE_THRESHOLD;
                    // A late channel still runs for its full duration.
                    let release_at = (if late { now } else { activate_at }) + duration;
                    *slot = Some(Slot::Active { release_at });
                    actuator.set_frequency(finger, frequency_hz);
                    actuator.activate(finger, amplitude);
                    return Some(DispatchEvent::Activated {
                        finger,
                        lateness,
                        late,
                    });
                }
                _ => {}
            }
        }

        None
    }

    /// Drops every timer and forces all channels off. Returns how many
    /// channels were pending or active.
    pub fn cancel_all(&mut self, actuator: &mut impl Actuator) -> usize {
        let cleared = self.slots.iter().flatten().count();
        self.slots = [None; FINGER_COUNT];
        self.release_all_at = None;
        actuator.deactivate_all();
        cleared
    }

    fn arm(&mut self, request: ActivationRequest, activate_at: Instant, actuator: &mut impl Actuator) {
        let slot = &mut self.slots[request.finger.as_index()];
        if matches!(slot, Some(Slot::Active { .. })) {
            actuator.deactivate(request.finger);
        }
        *slot = Some(Slot::Pending {
            activate_at,
            amplitude: request.amplitude,
            frequency_hz: request.frequency_hz,
            duration: request.duration,
        });
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
