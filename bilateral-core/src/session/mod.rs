//! Session lifecycle state machine.
//!
//! Every state change goes through [`SessionMachine::transition`], which
//! looks the (state, trigger) pair up in a fixed table and rejects anything
//! not listed without mutating state. The connection supervisor is the only
//! caller of [`SessionMachine::force`], which bypasses the table for safety
//! overrides. Observers run with the old and new state before the new state
//! is committed, so actuator shutdown happens before anything else can see
//! the new state.

use core::fmt;

use heapless::{HistoryBuf, OldestOrdered, Vec};

/// Maximum number of registered state-change callbacks.
pub const MAX_STATE_CALLBACKS: usize = 4;
/// Transitions retained for diagnostics.
pub const TRANSITION_HISTORY: usize = 16;

/// Lifecycle states of one device.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Ready,
    Running,
    Paused,
    Stopping,
    Error,
    LowBattery,
    CriticalBattery,
    ConnectionLost,
    PhoneDisconnected,
}

/// Every state in index order.
pub const ALL_STATES: [SessionState; 11] = [
    SessionState::Idle,
    SessionState::Connecting,
    SessionState::Ready,
    SessionState::Running,
    SessionState::Paused,
    SessionState::Stopping,
    SessionState::Error,
    SessionState::LowBattery,
    SessionState::CriticalBattery,
    SessionState::ConnectionLost,
    SessionState::PhoneDisconnected,
];

impl SessionState {
    /// Deterministic index used for compact telemetry codes.
    #[must_use]
    pub const fn as_index(self) -> usize {
        match self {
            SessionState::Idle => 0,
            SessionState::Connecting => 1,
            SessionState::Ready => 2,
            SessionState::Running => 3,
            SessionState::Paused => 4,
            SessionState::Stopping => 5,
            SessionState::Error => 6,
            SessionState::LowBattery => 7,
            SessionState::CriticalBattery => 8,
            SessionState::ConnectionLost => 9,
            SessionState::PhoneDisconnected => 10,
        }
    }

    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < ALL_STATES.len() {
            Some(ALL_STATES[index])
        } else {
            None
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Connecting => "CONNECTING",
            SessionState::Ready => "READY",
            SessionState::Running => "RUNNING",
            SessionState::Paused => "PAUSED",
            SessionState::Stopping => "STOPPING",
            SessionState::Error => "ERROR",
            SessionState::LowBattery => "LOW_BATTERY",
            SessionState::CriticalBattery => "CRITICAL_BATTERY",
            SessionState::ConnectionLost => "CONNECTION_LOST",
            SessionState::PhoneDisconnected => "PHONE_DISCONNECTED",
        }
    }

    /// A session is in progress (possibly paused or degraded).
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Running
                | SessionState::Paused
                | SessionState::LowBattery
                | SessionState::PhoneDisconnected
        )
    }

    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(
            self,
            SessionState::Error | SessionState::CriticalBattery | SessionState::ConnectionLost
        )
    }

    /// States in which therapy bursts may drive the actuators.
    #[must_use]
    pub const fn permits_actuation(self) -> bool {
        matches!(
            self,
            SessionState::Running | SessionState::LowBattery | SessionState::PhoneDisconnected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events that drive the session machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SessionTrigger {
    Connected,
    Disconnected,
    ErrorOccurred,
    StartSession,
    PauseSession,
    ResumeSession,
    StopSession,
    SessionComplete,
    Stopped,
    BatteryWarning,
    BatteryCritical,
    BatteryOk,
    ForcedShutdown,
    Reconnected,
    ReconnectFailed,
    PhoneLost,
    PhoneReconnected,
    PhoneTimeout,
    EmergencyStop,
    Reset,
}

/// Every trigger, for exhaustive table checks.
pub const ALL_TRIGGERS: [SessionTrigger; 20] = [
    SessionTrigger::Connected,
    SessionTrigger::Disconnected,
    SessionTrigger::ErrorOccurred,
    SessionTrigger::StartSession,
    SessionTrigger::PauseSession,
    SessionTrigger::ResumeSession,
    SessionTrigger::StopSession,
    SessionTrigger::SessionComplete,
    SessionTrigger::Stopped,
    SessionTrigger::BatteryWarning,
    SessionTrigger::BatteryCritical,
    SessionTrigger::BatteryOk,
    SessionTrigger::ForcedShutdown,
    SessionTrigger::Reconnected,
    SessionTrigger::ReconnectFailed,
    SessionTrigger::PhoneLost,
    SessionTrigger::PhoneReconnected,
    SessionTrigger::PhoneTimeout,
    SessionTrigger::EmergencyStop,
    SessionTrigger::Reset,
];

impl SessionTrigger {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            SessionTrigger::Connected => "CONNECTED",
            SessionTrigger::Disconnected => "DISCONNECTED",
            SessionTrigger::ErrorOccurred => "ERROR_OCCURRED",
            SessionTrigger::StartSession => "START_SESSION",
            SessionTrigger::PauseSession => "PAUSE_SESSION",
            SessionTrigger::ResumeSession => "RESUME_SESSION",
            SessionTrigger::StopSession => "STOP_SESSION",
            SessionTrigger::SessionComplete => "SESSION_COMPLETE",
            SessionTrigger::Stopped => "STOPPED",
            SessionTrigger::BatteryWarning => "BATTERY_WARNING",
            SessionTrigger::BatteryCritical => "BATTERY_CRITICAL",
            SessionTrigger::BatteryOk => "BATTERY_OK",
            SessionTrigger::ForcedShutdown => "FORCED_SHUTDOWN",
            SessionTrigger::Reconnected => "RECONNECTED",
            SessionTrigger::ReconnectFailed => "RECONNECT_FAILED",
            SessionTrigger::PhoneLost => "PHONE_LOST",
            SessionTrigger::PhoneReconnected => "PHONE_RECONNECTED",
            SessionTrigger::PhoneTimeout => "PHONE_TIMEOUT",
            SessionTrigger::EmergencyStop => "EMERGENCY_STOP",
            SessionTrigger::Reset => "RESET",
        }
    }
}

impl fmt::Display for SessionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transition table. `None` means the pair is not allowed.
#[must_use]
pub const fn next_state(from: SessionState, trigger: SessionTrigger) -> Option<SessionState> {
    use SessionState as S;
    use SessionTrigger as T;

    let to = match (from, trigger) {
        (S::Idle, T::Connected) => S::Ready,

        (S::Connecting, T::Connected) => S::Ready,
        (S::Connecting, T::ErrorOccurred) => S::Error,
        (S::Connecting, T::Disconnected) => S::Idle,

        (S::Ready, T::StartSession) => S::Running,
        (S::Ready, T::Disconnected) => S::ConnectionLost,
        (S::Ready, T::ErrorOccurred) => S::Error,

        (S::Running, T::PauseSession) => S::Paused,
        (S::Running, T::StopSession | T::SessionComplete) => S::Stopping,
        (S::Running, T::BatteryWarning) => S::LowBattery,
        (S::Running, T::Disconnected) => S::ConnectionLost,
        (S::Running, T::PhoneLost) => S::PhoneDisconnected,
        (S::Running, T::EmergencyStop) => S::Error,

        (S::Paused, T::ResumeSession) => S::Running,
        (S::Paused, T::StopSession) => S::Stopping,
        (S::Paused, T::Disconnected) => S::ConnectionLost,

        (S::LowBattery, T::BatteryOk) => S::Running,
        (S::LowBattery, T::BatteryCritical) => S::CriticalBattery,
        (S::LowBattery, T::StopSession) => S::Stopping,

        (S::CriticalBattery, T::ForcedShutdown) => S::Idle,

        (S::ConnectionLost, T::Reconnected) => S::Ready,
        (S::ConnectionLost, T::ReconnectFailed) => S::Idle,

        (S::PhoneDisconnected, T::PhoneReconnected) => S::Running,
        (S::PhoneDisconnected, T::PhoneTimeout) => S::Idle,

        (S::Stopping, T::Stopped) => S::Ready,
        (S::Stopping, T::Disconnected) => S::Idle,

        (S::Error, T::Reset | T::Disconnected) => S::Idle,

        _ => return None,
    };

    Some(to)
}

/// Repeated triggers that leave the machine where it already is.
#[must_use]
pub const fn is_repeat(state: SessionState, trigger: SessionTrigger) -> bool {
    matches!(
        (state, trigger),
        (
            SessionState::Running,
            SessionTrigger::StartSession | SessionTrigger::ResumeSession
        ) | (SessionState::Paused, SessionTrigger::PauseSession)
    )
}

/// Why the supervisor overrode the table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ForceReason {
    /// Three keepalive intervals passed without traffic.
    KeepaliveTimeout,
    /// The transport reported the link down while monitoring.
    LinkDown,
    /// A reconnect attempt found the link back up.
    Reconnected,
    /// Every reconnect attempt failed.
    ReconnectExhausted,
}

impl fmt::Display for ForceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForceReason::KeepaliveTimeout => "keepalive-timeout",
            ForceReason::LinkDown => "link-down",
            ForceReason::Reconnected => "reconnected",
            ForceReason::ReconnectExhausted => "reconnect-exhausted",
        })
    }
}

/// What caused a transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransitionCause {
    Trigger(SessionTrigger),
    Forced(ForceReason),
}

/// One committed (or about to be committed) state change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub cause: TransitionCause,
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause {
            TransitionCause::Trigger(trigger) => {
                write!(f, "{} -[{trigger}]-> {}", self.from, self.to)
            }
            TransitionCause::Forced(reason) => {
                write!(f, "{} =[{reason}]=> {}", self.from, self.to)
            }
        }
    }
}

/// Side effects attached to a transition, run before the state is committed.
pub trait StateObserver {
    fn on_transition(&mut self, transition: &StateTransition);
}

impl<F> StateObserver for F
where
    F: FnMut(&StateTransition),
{
    fn on_transition(&mut self, transition: &StateTransition) {
        self(transition);
    }
}

/// Observer that does nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopObserver;

impl StateObserver for NoopObserver {
    fn on_transition(&mut self, _: &StateTransition) {}
}

/// Registered callback signature.
pub type StateCallback = fn(&StateTransition);

/// Result of an accepted trigger.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransitionOutcome {
    Changed(StateTransition),
    /// Repeated trigger into the current state; nothing ran.
    Unchanged,
}

/// Errors reported by the session machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionError {
    /// The trigger is not listed for the current state.
    InvalidTrigger {
        state: SessionState,
        trigger: SessionTrigger,
    },
    /// [`MAX_STATE_CALLBACKS`] callbacks are already registered.
    CallbackRegistryFull,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidTrigger { state, trigger } => {
                write!(f, "cannot apply {trigger} while {state}")
            }
            SessionError::CallbackRegistryFull => f.write_str("state callback registry full"),
        }
    }
}

/// The device's single lifecycle state plus its diagnostics trail.
pub struct SessionMachine {
    state: SessionState,
    previous: Option<SessionState>,
    history: HistoryBuf<StateTransition, TRANSITION_HISTORY>,
    callbacks: Vec<StateCallback, MAX_STATE_CALLBACKS>,
}

impl SessionMachine {
    /// Creates a machine in [`SessionState::Idle`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SessionState::Idle,
            previous: None,
            history: HistoryBuf::new(),
            callbacks: Vec::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn previous_state(&self) -> Option<SessionState> {
        self.previous
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state.is_active()
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.state.is_error()
    }

    /// Returns `true` when `trigger` would be accepted in the current state.
    #[must_use]
    pub const fn can_apply(&self, trigger: SessionTrigger) -> bool {
        is_repeat(self.state, trigger) || next_state(self.state, trigger).is_some()
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> OldestOrdered<'_, StateTransition> {
        self.history.oldest_ordered()
    }

    /// Registers a callback invoked for every transition.
    pub fn on_state_change(&mut self, callback: StateCallback) -> Result<(), SessionError> {
        self.callbacks
            .push(callback)
            .map_err(|_| SessionError::CallbackRegistryFull)
    }

    /// Applies a trigger through the transition table.
    pub fn transition(
        &mut self,
        trigger: SessionTrigger,
        observer: &mut impl StateObserver,
    ) -> Result<TransitionOutcome, SessionError> {
        if is_repeat(self.state, trigger) {
            return Ok(TransitionOutcome::Unchanged);
        }

        let to = next_state(self.state, trigger).ok_or(SessionError::InvalidTrigger {
            state: self.state,
            trigger,
        })?;

        let transition = StateTransition {
            from: self.state,
            to,
            cause: TransitionCause::Trigger(trigger),
        };
        self.commit(transition, observer);
        Ok(TransitionOutcome::Changed(transition))
    }

    /// Safety override used by the connection supervisor.
    ///
    /// Returns `None` when the machine is already in `state`.
    pub fn force(
        &mut self,
        state: SessionState,
        reason: ForceReason,
        observer: &mut impl StateObserver,
    ) -> Option<StateTransition> {
        if self.state == state {
            return None;
        }

        let transition = StateTransition {
            from: self.state,
            to: state,
            cause: TransitionCause::Forced(reason),
        };
        self.commit(transition, observer);
        Some(transition)
    }

    /// Returns to [`SessionState::Idle`] and clears the history without
    /// notifying observers. Registered callbacks are kept.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.previous = None;
        self.history = HistoryBuf::new();
    }

    fn commit(&mut self, transition: StateTransition, observer: &mut impl StateObserver) {
        observer.on_transition(&transition);
        for callback in &self.callbacks {
            callback(&transition);
        }

        self.previous = Some(self.state);
        self.state = transition.to;
        self.history.write(transition);
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn machine_in(state: SessionState) -> SessionMachine {
        let mut machine = SessionMachine::new();
        if state != SessionState::Idle {
            machine.force(state, ForceReason::LinkDown, &mut NoopObserver);
        }
        machine
    }

    #[test]
    fn listed_pairs_reach_their_targets() {
        let cases = [
            (SessionState::Idle, SessionTrigger::Connected, SessionState::Ready),
            (SessionState::Ready, SessionTrigger::StartSession, SessionState::Running),
            (SessionState::Running, SessionTrigger::SessionComplete, SessionState::Stopping),
            (SessionState::Running, SessionTrigger::PhoneLost, SessionState::PhoneDisconnected),
            (SessionState::LowBattery, SessionTrigger::BatteryCritical, SessionState::CriticalBattery),
            (SessionState::CriticalBattery, SessionTrigger::ForcedShutdown, SessionState::Idle),
            (SessionState::ConnectionLost, SessionTrigger::Reconnected, SessionState::Ready),
            (SessionState::Stopping, SessionTrigger::Stopped, SessionState::Ready),
            (SessionState::Error, SessionTrigger::Disconnected, SessionState::Idle),
        ];

        for (from, trigger, to) in cases {
            let mut machine = machine_in(from);
            let outcome = machine
                .transition(trigger, &mut NoopObserver)
                .expect("listed transition");
            assert!(matches!(outcome, TransitionOutcome::Changed(t) if t.to == to));
            assert_eq!(machine.state(), to);
            assert_eq!(machine.previous_state(), Some(from));
        }
    }

    #[test]
    fn unlisted_pairs_are_rejected_without_mutation() {
        for state in ALL_STATES {
            for trigger in ALL_TRIGGERS {
                if next_state(state, trigger).is_some() || is_repeat(state, trigger) {
                    continue;
                }

                let mut machine = machine_in(state);
                let before = machine.history().count();
                let result = machine.transition(trigger, &mut NoopObserver);

                assert_eq!(
                    result,
                    Err(SessionError::InvalidTrigger { state, trigger }),
                    "{state} + {trigger}"
                );
                assert_eq!(machine.state(), state);
                assert_eq!(machine.history().count(), before);
            }
        }
    }

    #[test]
    fn repeated_triggers_are_quiet_successes() {
        let mut calls = 0;
        let mut counting = |_: &StateTransition| calls += 1;

        let mut running = machine_in(SessionState::Running);
        assert_eq!(
            running.transition(SessionTrigger::StartSession, &mut counting),
            Ok(TransitionOutcome::Unchanged)
        );
        assert_eq!(
            running.transition(SessionTrigger::ResumeSession, &mut counting),
            Ok(TransitionOutcome::Unchanged)
        );

        let mut paused = machine_in(SessionState::Paused);
        assert_eq!(
            paused.transition(SessionTrigger::PauseSession, &mut counting),
            Ok(TransitionOutcome::Unchanged)
        );

        assert_eq!(calls, 0);
        assert_eq!(running.state(), SessionState::Running);
        assert_eq!(paused.state(), SessionState::Paused);
    }

    #[test]
    fn observer_runs_before_commit() {
        let mut machine = machine_in(SessionState::Running);
        let mut seen: Option<StateTransition> = None;
        let mut observer = |t: &StateTransition| seen = Some(*t);

        machine
            .transition(SessionTrigger::Disconnected, &mut observer)
            .expect("running can disconnect");

        let seen = seen.expect("observer invoked");
        assert_eq!(seen.from, SessionState::Running);
        assert_eq!(seen.to, SessionState::ConnectionLost);
        assert_eq!(machine.state(), SessionState::ConnectionLost);
        assert!(machine.is_error());
    }

    static CALLBACK_HITS: AtomicUsize = AtomicUsize::new(0);

    fn count_hit(_: &StateTransition) {
        CALLBACK_HITS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn registered_callbacks_are_bounded() {
        let mut machine = SessionMachine::new();
        for _ in 0..MAX_STATE_CALLBACKS {
            machine.on_state_change(count_hit).expect("slot available");
        }
        assert_eq!(
            machine.on_state_change(count_hit),
            Err(SessionError::CallbackRegistryFull)
        );

        let before = CALLBACK_HITS.load(Ordering::Relaxed);
        machine
            .transition(SessionTrigger::Connected, &mut NoopObserver)
            .expect("idle connects");
        assert_eq!(
            CALLBACK_HITS.load(Ordering::Relaxed) - before,
            MAX_STATE_CALLBACKS
        );
    }

    #[test]
    fn force_records_reason_and_skips_same_state() {
        let mut machine = machine_in(SessionState::Running);
        let forced = machine
            .force(SessionState::ConnectionLost, ForceReason::KeepaliveTimeout, &mut NoopObserver)
            .expect("state changed");

        assert_eq!(
            forced.cause,
            TransitionCause::Forced(ForceReason::KeepaliveTimeout)
        );
        assert!(
            machine
                .force(SessionState::ConnectionLost, ForceReason::LinkDown, &mut NoopObserver)
                .is_none()
        );
    }

    #[test]
    fn history_is_bounded_and_reset_clears_it() {
        let mut machine = SessionMachine::new();
        for _ in 0..TRANSITION_HISTORY {
            machine
                .transition(SessionTrigger::Connected, &mut NoopObserver)
                .expect("connect");
            machine
                .transition(SessionTrigger::Disconnected, &mut NoopObserver)
                .expect("disconnect");
            machine
                .transition(SessionTrigger::ReconnectFailed, &mut NoopObserver)
                .expect("give up");
        }

        assert_eq!(machine.history().count(), TRANSITION_HISTORY);
        machine.reset();
        assert_eq!(machine.history().count(), 0);
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn classification_helpers() {
        assert!(SessionState::LowBattery.is_active());
        assert!(!SessionState::Ready.is_active());
        assert!(SessionState::CriticalBattery.is_error());
        assert!(SessionState::PhoneDisconnected.permits_actuation());
        assert!(!SessionState::Paused.permits_actuation());
        assert_eq!(SessionState::from_index(9), Some(SessionState::ConnectionLost));
        assert_eq!(SessionState::from_index(11), None);
    }
}
