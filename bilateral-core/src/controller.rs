//! Application context for one device.
//!
//! A [`Controller`] owns every component of the device and is driven by a
//! single cooperative loop: the platform feeds received bytes through
//! [`Controller::on_receive`], reports link changes through
//! [`Controller::on_connected`] / [`Controller::on_disconnected`], and calls
//! [`Controller::poll`] whenever [`Controller::next_deadline`] comes due or new
//! bytes arrived. Each poll runs the connection supervisor first so command
//! timers can never starve it.

use core::fmt;

use crate::battery::{BatteryLevel, BatteryMonitor};
use crate::clock::{ClockSnapshot, ClockSync, SampleRejection, SyncError, SyncEvent};
use crate::codec::framing::FrameAssembler;
use crate::codec::{self, EncodeError, Message};
use crate::config::{ControllerConfig, DeviceRole};
use crate::connection::{ConnectionHealth, ConnectionSupervisor, SafetyOverride, SupervisorEvent};
use crate::dispatcher::{Actuator, DispatchError, DispatchEvent, Dispatcher};
use crate::phone::PhoneLinkMonitor;
use crate::session::{
    ForceReason, SessionError, SessionMachine, SessionState, SessionTrigger, StateCallback,
    StateObserver, StateTransition, TransitionOutcome,
};
use crate::telemetry::{SyncTelemetry, TelemetryEventKind, TelemetryPayload, TelemetryRecorder, truncate_count};
use crate::therapy::config::{ParamError, ParamUpdate};
use crate::therapy::{BilateralBurst, TherapyConfig, TherapyEvent, TherapyExecutor, TherapyProgress};
use crate::time::Instant;

/// Telemetry ring used by the controller.
pub type Telemetry = TelemetryRecorder<Instant>;

/// Error surfaced when a frame cannot be handed to the link.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportError {
    /// Outbound queue has reached its capacity.
    QueueFull,
    /// Link is down.
    Disconnected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::QueueFull => f.write_str("outbound queue full"),
            TransportError::Disconnected => f.write_str("link disconnected"),
        }
    }
}

/// Outbound half of the link to the peer device.
pub trait Transport {
    /// Queues one encoded frame, terminator included, without blocking.
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Errors returned by controller operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ControllerError {
    Session(SessionError),
    Dispatch(DispatchError),
    Param(ParamError),
    Encode(EncodeError),
    Transport(TransportError),
    /// Operation reserved for the primary device.
    NotPrimary,
    /// The secondary has not reported `READY` yet.
    PeerNotReady,
    /// `BUZZ` arrived while the session does not allow actuation.
    ActuationBlocked(SessionState),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Session(err) => write!(f, "session: {err}"),
            ControllerError::Dispatch(err) => write!(f, "dispatch: {err}"),
            ControllerError::Param(err) => write!(f, "parameters: {err}"),
            ControllerError::Encode(err) => write!(f, "encode: {err}"),
            ControllerError::Transport(err) => write!(f, "transport: {err}"),
            ControllerError::NotPrimary => f.write_str("only the primary device can do this"),
            ControllerError::PeerNotReady => f.write_str("peer has not reported ready"),
            ControllerError::ActuationBlocked(state) => {
                write!(f, "actuation not allowed while {state}")
            }
        }
    }
}

impl From<SessionError> for ControllerError {
    fn from(err: SessionError) -> Self {
        ControllerError::Session(err)
    }
}

impl From<DispatchError> for ControllerError {
    fn from(err: DispatchError) -> Self {
        ControllerError::Dispatch(err)
    }
}

impl From<ParamError> for ControllerError {
    fn from(err: ParamError) -> Self {
        ControllerError::Param(err)
    }
}

impl From<EncodeError> for ControllerError {
    fn from(err: EncodeError) -> Self {
        ControllerError::Encode(err)
    }
}

impl From<TransportError> for ControllerError {
    fn from(err: TransportError) -> Self {
        ControllerError::Transport(err)
    }
}

/// Runs before every committed transition: records it and shuts the
/// actuators down when the new state does not allow actuation.
struct ActuationGuard<'a, A: Actuator> {
    dispatcher: &'a mut Dispatcher,
    actuator: &'a mut A,
    telemetry: &'a mut Telemetry,
    now: Instant,
}

impl<A: Actuator> StateObserver for ActuationGuard<'_, A> {
    fn on_transition(&mut self, transition: &StateTransition) {
        if !transition.to.permits_actuation() {
            let cleared = self.dispatcher.cancel_all(self.actuator);
            if cleared > 0 {
                self.telemetry.record(
                    TelemetryEventKind::ActuatorsForcedOff,
                    TelemetryPayload::Count(u32::try_from(cleared).unwrap_or(u32::MAX)),
                    self.now,
                );
            }
        }
        self.telemetry
            .record_transition(transition.from, transition.to, self.now);
    }
}

/// The parts of the controller the supervisor may override.
struct SafetyContext<'a, A: Actuator> {
    machine: &'a mut SessionMachine,
    dispatcher: &'a mut Dispatcher,
    actuator: &'a mut A,
    telemetry: &'a mut Telemetry,
    clock: &'a mut ClockSync,
    executor: &'a mut TherapyExecutor,
    phone: &'a mut PhoneLinkMonitor,
    now: Instant,
}

impl<A: Actuator> SafetyContext<'_, A> {
    fn end_session(&mut self) {
        self.executor.stop();
        self.phone.reset();
    }
}

impl<A: Actuator> SafetyOverride for SafetyContext<'_, A> {
    fn shutdown_actuators(&mut self) -> usize {
        self.dispatcher.cancel_all(self.actuator)
    }

    fn connection_lost(&mut self, reason: ForceReason, now: Instant) {
        self.end_session();
        if reason == ForceReason::KeepaliveTimeout {
            // Pings double as reconnect probes on a link that went quiet.
            self.clock.resume_maintenance(now);
        } else {
            self.clock.suspend();
        }

        let mut guard = ActuationGuard {
            dispatcher: self.dispatcher,
            actuator: self.actuator,
            telemetry: self.telemetry,
            now: self.now,
        };
        let refused = self
            .machine
            .transition(SessionTrigger::Disconnected, &mut guard)
            .is_err();
        if refused && self.machine.is_active() {
            self.machine
                .force(SessionState::ConnectionLost, reason, &mut guard);
        }
    }

    fn force_state(&mut self, state: SessionState, reason: ForceReason) {
        self.end_session();
        let mut guard = ActuationGuard {
            dispatcher: self.dispatcher,
            actuator: self.actuator,
            telemetry: self.telemetry,
            now: self.now,
        };
        self.machine.force(state, reason, &mut guard);
    }

    fn rearm_clock(&mut self, now: Instant) {
        self.clock.resume_maintenance(now);
    }

    fn invalidate_clock(&mut self) {
        self.clock.invalidate();
    }
}

/// One device of the bilateral pair.
pub struct Controller<A: Actuator, T: Transport> {
    config: ControllerConfig,
    machine: SessionMachine,
    clock: ClockSync,
    dispatcher: Dispatcher,
    executor: TherapyExecutor,
    supervisor: ConnectionSupervisor,
    battery: BatteryMonitor,
    phone: PhoneLinkMonitor,
    telemetry: Telemetry,
    assembler: FrameAssembler,
    actuator: A,
    transport: T,
    therapy: TherapyConfig,
    session_seed: Option<u32>,
    peer_ready: bool,
    seed_acknowledged: bool,
    peer_battery: Option<u16>,
}

impl<A: Actuator, T: Transport> Controller<A, T> {
    #[must_use]
    pub fn new(config: ControllerConfig, actuator: A, transport: T) -> Self {
        Self {
            config,
            machine: SessionMachine::new(),
            clock: ClockSync::new(config.sync, config.lead),
            dispatcher: Dispatcher::new(),
            executor: TherapyExecutor::new(),
            supervisor: ConnectionSupervisor::new(config.supervisor),
            battery: BatteryMonitor::new(config.battery),
            phone: PhoneLinkMonitor::new(config.phone),
            telemetry: Telemetry::new(),
            assembler: FrameAssembler::new(),
            actuator,
            transport,
            therapy: config.therapy,
            session_seed: None,
            peer_ready: false,
            seed_acknowledged: false,
            peer_battery: None,
        }
    }

    #[must_use]
    pub const fn role(&self) -> DeviceRole {
        self.config.role
    }

    #[must_use]
    pub const fn current_state(&self) -> SessionState {
        self.machine.state()
    }

    /// `(offset µs, valid)` from the current clock snapshot.
    #[must_use]
    pub fn current_offset(&self) -> (i64, bool) {
        self.clock.current_offset()
    }

    #[must_use]
    pub fn clock_snapshot(&self) -> ClockSnapshot {
        self.clock.snapshot()
    }

    /// Registers a callback run on every state change.
    pub fn on_state_change(&mut self, callback: StateCallback) -> Result<(), SessionError> {
        self.machine.on_state_change(callback)
    }

    #[must_use]
    pub const fn session(&self) -> &SessionMachine {
        &self.machine
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub const fn clock(&self) -> &ClockSync {
        &self.clock
    }

    #[must_use]
    pub const fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut Telemetry {
        &mut self.telemetry
    }

    #[must_use]
    pub const fn actuator(&self) -> &A {
        &self.actuator
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Whether the transport currently counts as connected.
    #[must_use]
    pub const fn link_up(&self) -> bool {
        self.supervisor.link_up()
    }

    #[must_use]
    pub const fn connection_health(&self) -> ConnectionHealth {
        self.supervisor.health()
    }

    /// Profile used by the next session.
    #[must_use]
    pub const fn therapy_config(&self) -> &TherapyConfig {
        &self.therapy
    }

    #[must_use]
    pub fn progress(&self, now: Instant) -> TherapyProgress {
        self.executor.progress(now)
    }

    #[must_use]
    pub const fn session_seed(&self) -> Option<u32> {
        self.session_seed
    }

    #[must_use]
    pub const fn peer_ready(&self) -> bool {
        self.peer_ready
    }

    #[must_use]
    pub const fn seed_acknowledged(&self) -> bool {
        self.seed_acknowledged
    }

    #[must_use]
    pub const fn peer_battery(&self) -> Option<u16> {
        self.peer_battery
    }

    #[must_use]
    pub const fn battery_level(&self) -> BatteryLevel {
        self.battery.level()
    }

    /// Whether the platform should take a battery reading now.
    #[must_use]
    pub fn battery_sample_due(&self, now: Instant) -> bool {
        self.battery.sample_due(now)
    }

    /// Queues received bytes. Frames are decoded on the next poll.
    pub fn on_receive(&mut self, bytes: &[u8]) -> usize {
        self.assembler.push_bytes(bytes)
    }

    /// Link to the peer came up.
    pub fn on_connected(&mut self, now: Instant) {
        self.supervisor.on_connected(now);
        // The reconnect sequence owns the way out of CONNECTION_LOST.
        if self.machine.state() != SessionState::ConnectionLost {
            self.apply_logged(SessionTrigger::Connected, now);
            self.clock.begin_sync(now);
        }
    }

    /// Link to the peer went down.
    pub fn on_disconnected(&mut self, now: Instant) {
        self.assembler.clear();
        let (supervisor, mut safety) = self.split(now);
        if let Some(event) = supervisor.on_link_down(now, &mut safety) {
            self.after_supervisor(event, now);
        }
    }

    /// Earliest instant at which [`Controller::poll`] has timed work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.supervisor.next_deadline(),
            self.clock.next_deadline(),
            self.dispatcher.next_deadline(),
            self.executor.next_deadline(),
            self.phone.deadline(),
            self.battery.next_sample(),
        ]
        .into_iter()
        .fold(None, Instant::earliest)
    }

    /// Runs one loop iteration.
    pub fn poll(&mut self, now: Instant) {
        self.poll_supervisor(now);
        self.drain_frames(now);
        self.poll_clock(now);
        self.poll_phone(now);
        self.poll_therapy(now);
        self.poll_dispatcher(now);
    }

    /// Starts a session on both devices (primary only).
    pub fn start_session(&mut self, now: Instant, seed: u32) -> Result<(), ControllerError> {
        self.require_primary()?;
        if !self.peer_ready {
            return Err(ControllerError::PeerNotReady);
        }
        if !self.clock.snapshot().valid {
            return Err(DispatchError::ClockInvalid.into());
        }
        if self.apply(SessionTrigger::StartSession, now)? == TransitionOutcome::Unchanged {
            return Ok(());
        }

        self.session_seed = Some(seed);
        self.seed_acknowledged = false;
        self.executor.start(now, seed, self.therapy);
        self.send(&Message::Seed(seed))?;
        let stamp = self.dispatcher.stamp(now);
        self.send(&Message::StartSession(stamp))
    }

    pub fn pause_session(&mut self, now: Instant) -> Result<(), ControllerError> {
        self.require_primary()?;
        if self.apply(SessionTrigger::PauseSession, now)? == TransitionOutcome::Unchanged {
            return Ok(());
        }
        self.send(&Message::PauseSession)
    }

    pub fn resume_session(&mut self, now: Instant) -> Result<(), ControllerError> {
        self.require_primary()?;
        if self.apply(SessionTrigger::ResumeSession, now)? == TransitionOutcome::Unchanged {
            return Ok(());
        }
        self.send(&Message::ResumeSession)
    }

    pub fn stop_session(&mut self, now: Instant) -> Result<(), ControllerError> {
        self.require_primary()?;
        self.apply(SessionTrigger::StopSession, now)?;
        let stamp = self.dispatcher.stamp(now);
        self.send(&Message::StopSession(stamp))
    }

    /// Forces every channel off on both devices, ends the peer's session and
    /// enters `ERROR` when running. Local actuators are released even if the
    /// peer is unreachable.
    pub fn emergency_stop(&mut self, now: Instant) -> Result<(), ControllerError> {
        let cleared = self.dispatcher.cancel_all(&mut self.actuator);
        self.executor.stop();
        self.telemetry.record(
            TelemetryEventKind::ActuatorsForcedOff,
            TelemetryPayload::Count(u32::try_from(cleared).unwrap_or(u32::MAX)),
            now,
        );

        let stamp = self.dispatcher.stamp(now);
        let mut sent = self.send(&Message::Deactivate(stamp));
        if self.machine.is_active() {
            // The peer leaves its session too instead of idling in RUNNING.
            let stamp = self.dispatcher.stamp(now);
            sent = sent.and(self.send(&Message::StopSession(stamp)));
        }
        if self.machine.can_apply(SessionTrigger::EmergencyStop) {
            self.apply(SessionTrigger::EmergencyStop, now)?;
        }
        sent
    }

    /// Leaves `ERROR`.
    pub fn reset(&mut self, now: Instant) -> Result<(), ControllerError> {
        self.apply(SessionTrigger::Reset, now)?;
        Ok(())
    }

    /// Replaces the profile for the next session. The primary forwards the
    /// update so both devices hold the same profile.
    pub fn update_parameters(&mut self, updates: &[ParamUpdate]) -> Result<(), ControllerError> {
        self.apply_parameters(updates)?;
        if self.config.role == DeviceRole::Primary {
            let forwarded = heapless::Vec::from_slice(updates)
                .map_err(|_| EncodeError::FrameTooLong)?;
            self.send(&Message::ParamUpdate(forwarded))?;
        }
        Ok(())
    }

    pub fn request_peer_battery(&mut self) -> Result<(), ControllerError> {
        self.send(&Message::GetBattery)
    }

    /// Folds a battery reading taken by the platform.
    pub fn on_battery_sample(&mut self, millivolts: u16, now: Instant) {
        let Some(change) = self.battery.record(millivolts, now) else {
            return;
        };
        self.telemetry.record(
            TelemetryEventKind::BatteryLevel,
            TelemetryPayload::Battery {
                millivolts,
                level: change.to,
            },
            now,
        );

        if !self.machine.is_active() {
            return;
        }
        if change.to == BatteryLevel::Critical && self.machine.state() == SessionState::Running {
            self.apply_logged(SessionTrigger::BatteryWarning, now);
        }
        let ended = matches!(
            self.apply_logged(change.trigger(), now),
            Some(TransitionOutcome::Changed(transition)) if transition.to == SessionState::CriticalBattery
        );
        if ended {
            self.end_peer_session(now);
        }
    }

    /// Companion app link dropped.
    pub fn on_phone_lost(&mut self, now: Instant) {
        if let Some(trigger) = self.phone.lost(now) {
            self.telemetry
                .record(TelemetryEventKind::PhoneLost, TelemetryPayload::none(), now);
            if let Err(err) = self.apply(trigger, now) {
                self.phone.reset();
                self.record_error(&err.into(), now);
            }
        }
    }

    /// Companion app link came back.
    pub fn on_phone_restored(&mut self, now: Instant) {
        if let Some(trigger) = self.phone.restored() {
            self.telemetry
                .record(TelemetryEventKind::PhoneRestored, TelemetryPayload::none(), now);
            self.apply_logged(trigger, now);
        }
    }

    fn split(&mut self, now: Instant) -> (&mut ConnectionSupervisor, SafetyContext<'_, A>) {
        (
            &mut self.supervisor,
            SafetyContext {
                machine: &mut self.machine,
                dispatcher: &mut self.dispatcher,
                actuator: &mut self.actuator,
                telemetry: &mut self.telemetry,
                clock: &mut self.clock,
                executor: &mut self.executor,
                phone: &mut self.phone,
                now,
            },
        )
    }

    /// Applies a trigger through the table and runs its follow-up work.
    fn apply(
        &mut self,
        trigger: SessionTrigger,
        now: Instant,
    ) -> Result<TransitionOutcome, SessionError> {
        let mut guard = ActuationGuard {
            dispatcher: &mut self.dispatcher,
            actuator: &mut self.actuator,
            telemetry: &mut self.telemetry,
            now,
        };
        let outcome = self.machine.transition(trigger, &mut guard)?;
        if let TransitionOutcome::Changed(transition) = outcome {
            self.follow_up(transition, now);
        }
        Ok(outcome)
    }

    /// Applies a trigger from inside the loop, where a refusal only gets
    /// recorded.
    fn apply_logged(&mut self, trigger: SessionTrigger, now: Instant) -> Option<TransitionOutcome> {
        match self.apply(trigger, now) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                self.record_error(&err.into(), now);
                None
            }
        }
    }

    fn follow_up(&mut self, transition: StateTransition, now: Instant) {
        match transition.to {
            SessionState::Paused => self.executor.pause(now),
            SessionState::Running if transition.from == SessionState::Paused => {
                self.executor.resume(now);
            }
            SessionState::Stopping => {
                self.executor.stop();
                self.phone.reset();
                // Timers were cancelled synchronously, so stopping is complete.
                self.apply_logged(SessionTrigger::Stopped, now);
            }
            SessionState::CriticalBattery => {
                self.executor.stop();
                self.apply_logged(SessionTrigger::ForcedShutdown, now);
            }
            SessionState::Idle
            | SessionState::Ready
            | SessionState::Error
            | SessionState::ConnectionLost => {
                self.executor.stop();
                self.phone.reset();
            }
            _ => {}
        }
    }

    fn require_primary(&self) -> Result<(), ControllerError> {
        if self.config.role == DeviceRole::Primary {
            Ok(())
        } else {
            Err(ControllerError::NotPrimary)
        }
    }

    fn apply_parameters(&mut self, updates: &[ParamUpdate]) -> Result<(), ControllerError> {
        if self.machine.is_active() {
            return Err(ParamError::SessionActive.into());
        }
        self.therapy = self.therapy.apply(updates)?;
        Ok(())
    }

    fn send(&mut self, message: &Message) -> Result<(), ControllerError> {
        let frame = codec::encode(message)?;
        self.transport.send(&frame)?;
        Ok(())
    }

    /// Sends from inside the loop, where a failure only gets recorded.
    fn send_logged(&mut self, message: &Message, now: Instant) {
        if let Err(err) = self.send(message) {
            self.record_error(&err, now);
        }
    }

    /// Tells the secondary that the primary's session ended on its own.
    fn end_peer_session(&mut self, now: Instant) {
        if self.config.role == DeviceRole::Primary {
            let stamp = self.dispatcher.stamp(now);
            self.send_logged(&Message::StopSession(stamp), now);
        }
    }

    fn record_error(&mut self, err: &ControllerError, now: Instant) {
        match *err {
            ControllerError::Dispatch(DispatchError::StaleSequence { sequence, last }) => {
                self.telemetry.record_stale_command(sequence, last, now);
            }
            ControllerError::Transport(_) | ControllerError::Encode(_) => {
                self.telemetry.record(
                    TelemetryEventKind::TransportError,
                    TelemetryPayload::none(),
                    now,
                );
            }
            _ => {
                self.telemetry.record(
                    TelemetryEventKind::CommandRejected,
                    TelemetryPayload::none(),
                    now,
                );
            }
        }
    }

    fn poll_supervisor(&mut self, now: Instant) {
        loop {
            let (supervisor, mut safety) = self.split(now);
            let Some(event) = supervisor.poll(now, &mut safety) else {
                break;
            };
            self.after_supervisor(event, now);
        }
    }

    fn after_supervisor(&mut self, event: SupervisorEvent, now: Instant) {
        match event {
            SupervisorEvent::KeepaliveMissed { misses } => {
                self.telemetry
                    .record_link(TelemetryEventKind::KeepaliveMissed, misses, now);
            }
            SupervisorEvent::ConnectionLost { forced_off } => {
                self.peer_ready = false;
                self.telemetry.record(
                    TelemetryEventKind::ConnectionLost,
                    TelemetryPayload::Count(u32::try_from(forced_off).unwrap_or(u32::MAX)),
                    now,
                );
            }
            SupervisorEvent::ReconnectAttempt { attempt } => {
                self.telemetry
                    .record_link(TelemetryEventKind::ReconnectAttempt, attempt, now);
            }
            SupervisorEvent::Reconnected { attempt } => {
                self.telemetry
                    .record_link(TelemetryEventKind::Reconnected, attempt, now);
                if self.config.role == DeviceRole::Secondary && self.clock.snapshot().valid {
                    self.send_logged(&Message::Ready, now);
                }
            }
            SupervisorEvent::ReconnectFailed { attempts } => {
                self.peer_ready = false;
                self.telemetry
                    .record_link(TelemetryEventKind::ReconnectFailed, attempts, now);
            }
        }
    }

    fn drain_frames(&mut self, now: Instant) {
        while let Some(frame) = self.assembler.next_frame() {
            let handled = frame
                .map_err(|_| ())
                .and_then(|body| codec::decode(&body).map_err(|_| ()));
            match handled {
                Ok(message) => {
                    if let Err(err) = self.handle_message(message, now) {
                        self.record_error(&err, now);
                    }
                }
                Err(()) => {
                    self.telemetry.record(
                        TelemetryEventKind::MalformedFrame,
                        TelemetryPayload::none(),
                        now,
                    );
                }
            }
        }
    }

    fn handle_message(&mut self, message: Message, now: Instant) -> Result<(), ControllerError> {
        if message.is_keepalive() {
            self.supervisor.observe_keepalive(now);
        }

        match message {
            Message::Ping(ping) => self.send(&Message::Pong(crate::clock::answer(ping, now, now))),
            Message::Pong(pong) => {
                if let Err(rejection) = self.clock.on_pong(pong, now) {
                    let round_trip = match rejection {
                        SampleRejection::RoundTripTooLong(rtt) => Some(rtt),
                        SampleRejection::UnknownSequence(_) => None,
                    };
                    self.telemetry.record(
                        TelemetryEventKind::SampleRejected,
                        TelemetryPayload::Sync(SyncTelemetry::new(0, 0, round_trip)),
                        now,
                    );
                }
                Ok(())
            }
            Message::Ready => {
                self.peer_ready = true;
                Ok(())
            }
            Message::StartSession(stamp) => {
                self.dispatcher.on_start(stamp);
                self.apply(SessionTrigger::StartSession, now)?;
                Ok(())
            }
            Message::StopSession(stamp) => {
                self.dispatcher.on_stop(stamp);
                self.apply(SessionTrigger::StopSession, now)?;
                Ok(())
            }
            Message::PauseSession => {
                self.apply(SessionTrigger::PauseSession, now)?;
                Ok(())
            }
            Message::ResumeSession => {
                self.apply(SessionTrigger::ResumeSession, now)?;
                Ok(())
            }
            Message::Buzz(command) => {
                let state = self.machine.state();
                if !state.permits_actuation() {
                    return Err(ControllerError::ActuationBlocked(state));
                }
                let snapshot = self.clock.snapshot();
                self.dispatcher
                    .accept_buzz(&command, now, &snapshot, &mut self.actuator)?;
                Ok(())
            }
            Message::Deactivate(stamp) => {
                let snapshot = self.clock.snapshot();
                self.dispatcher.accept_deactivate(stamp, now, &snapshot)?;
                Ok(())
            }
            Message::ParamUpdate(updates) => self.apply_parameters(&updates),
            Message::Seed(seed) => {
                self.session_seed = Some(seed);
                self.send(&Message::SeedAck)
            }
            Message::SeedAck => {
                self.seed_acknowledged = true;
                Ok(())
            }
            Message::GetBattery => match self.battery.last_millivolts() {
                Some(millivolts) => self.send(&Message::BatteryResponse { millivolts }),
                None => Ok(()),
            },
            Message::BatteryResponse { millivolts } => {
                self.peer_battery = Some(millivolts);
                Ok(())
            }
        }
    }

    fn poll_clock(&mut self, now: Instant) {
        while let Some(event) = self.clock.poll(now) {
            match event {
                SyncEvent::SendPing(ping) => self.send_logged(&Message::Ping(ping), now),
                SyncEvent::BurstComplete(snapshot) => {
                    let round_trip = self.clock.round_trip().smoothed();
                    self.telemetry.record(
                        TelemetryEventKind::SyncCompleted,
                        TelemetryPayload::Sync(SyncTelemetry::new(
                            snapshot.offset_us,
                            truncate_count(usize::from(snapshot.samples)),
                            Some(round_trip),
                        )),
                        now,
                    );
                    if self.config.role == DeviceRole::Secondary {
                        self.send_logged(&Message::Ready, now);
                    }
                }
                SyncEvent::BurstFailed(SyncError::InsufficientSamples { valid, .. }) => {
                    self.telemetry.record(
                        TelemetryEventKind::SyncFailed,
                        TelemetryPayload::Sync(SyncTelemetry::new(0, valid, None)),
                        now,
                    );
                    let probing = matches!(
                        self.supervisor.health(),
                        ConnectionHealth::Reconnecting { .. }
                    );
                    if self.supervisor.link_up() || probing {
                        self.clock.begin_sync(now);
                    }
                }
            }
        }
    }

    fn poll_phone(&mut self, now: Instant) {
        if let Some(trigger) = self.phone.poll(now)
            && self.apply(trigger, now).is_ok()
        {
            self.end_peer_session(now);
        }
    }

    fn poll_therapy(&mut self, now: Instant) {
        while let Some(event) = self.executor.poll(now) {
            match event {
                TherapyEvent::Burst(burst) => self.issue_burst(burst, now),
                TherapyEvent::CycleComplete { cycles } => {
                    self.telemetry.record(
                        TelemetryEventKind::CycleCompleted,
                        TelemetryPayload::Count(cycles),
                        now,
                    );
                }
                TherapyEvent::SessionComplete(_) => {
                    if self.apply(SessionTrigger::SessionComplete, now).is_ok() {
                        self.end_peer_session(now);
                    }
                }
            }
        }
    }

    fn issue_burst(&mut self, burst: BilateralBurst, now: Instant) {
        let snapshot = self.clock.snapshot();
        let lead = self.clock.lead_time();
        match self.dispatcher.schedule_bilateral(
            burst.local,
            burst.remote,
            now,
            &snapshot,
            lead,
            &mut self.actuator,
        ) {
            Ok(command) => self.send_logged(&Message::Buzz(command), now),
            Err(err) => self.record_error(&err.into(), now),
        }
    }

    fn poll_dispatcher(&mut self, now: Instant) {
        while let Some(event) = self.dispatcher.poll(now, &mut self.actuator) {
            if let DispatchEvent::Activated {
                finger,
                lateness,
                late: true,
            } = event
            {
                self.telemetry.record_late_activation(finger, lateness, now);
            }
        }
    }
}
