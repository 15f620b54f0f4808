use core::time::Duration;

use bilateral_core::codec::{self, Message};
use bilateral_core::config::{ControllerConfig, DeviceRole};
use bilateral_core::controller::{Controller, Transport, TransportError};
use bilateral_core::dispatcher::Actuator;
use bilateral_core::pattern::{FINGER_COUNT, Finger};
use bilateral_core::session::SessionState;
use bilateral_core::telemetry::TelemetryEventKind;
use bilateral_core::therapy::TherapyConfig;
use bilateral_core::time::Instant;

/// Secondary clock runs this far ahead of the primary's.
const SKEW: Duration = Duration::from_millis(137);
const TICK: Duration = Duration::from_millis(1);

#[derive(Default)]
struct Outbox {
    frames: Vec<Vec<u8>>,
}

impl Transport for Outbox {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.frames.push(frame.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct Motors {
    on: [bool; FINGER_COUNT],
    activations: Vec<Finger>,
}

impl Actuator for Motors {
    fn activate(&mut self, finger: Finger, _amplitude: u8) {
        self.on[finger.as_index()] = true;
        self.activations.push(finger);
    }

    fn deactivate(&mut self, finger: Finger) {
        self.on[finger.as_index()] = false;
    }
}

type Device = Controller<Motors, Outbox>;

/// Two controllers joined by a link with one tick of latency each way.
struct Pair {
    primary: Device,
    secondary: Device,
    now: Instant,
    linked: bool,
    primary_fired: Vec<(Instant, Finger)>,
    secondary_fired: Vec<(Instant, Finger)>,
}

impl Pair {
    fn new(therapy: TherapyConfig) -> Self {
        let config = |role| ControllerConfig::for_role(role).with_therapy(therapy);
        Self {
            primary: Controller::new(config(DeviceRole::Primary), Motors::default(), Outbox::default()),
            secondary: Controller::new(
                config(DeviceRole::Secondary),
                Motors::default(),
                Outbox::default(),
            ),
            now: Instant::ZERO,
            linked: false,
            primary_fired: Vec::new(),
            secondary_fired: Vec::new(),
        }
    }

    fn secondary_now(&self) -> Instant {
        self.now + SKEW
    }

    fn connect(&mut self) {
        self.linked = true;
        self.primary.on_connected(self.now);
        let now = self.secondary_now();
        self.secondary.on_connected(now);
    }

    fn tick(&mut self) {
        let before = self.primary.actuator().activations.len();
        self.primary.poll(self.now);
        for finger in &self.primary.actuator().activations[before..] {
            self.primary_fired.push((self.now, *finger));
        }

        let before = self.secondary.actuator().activations.len();
        let secondary_now = self.secondary_now();
        self.secondary.poll(secondary_now);
        for finger in &self.secondary.actuator().activations[before..] {
            // Reported in primary time.
            self.secondary_fired.push((self.now, *finger));
        }

        let to_secondary = core::mem::take(&mut self.primary.transport_mut().frames);
        let to_primary = core::mem::take(&mut self.secondary.transport_mut().frames);
        if self.linked {
            for frame in to_secondary {
                self.secondary.on_receive(&frame);
            }
            for frame in to_primary {
                self.primary.on_receive(&frame);
            }
        }

        self.now = self.now + TICK;
    }

    fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Self) -> bool) {
        let end = self.now + limit;
        while !done(self) {
            assert!(!self.now.has_reached(end), "condition not met within {limit:?}");
            self.tick();
        }
    }

    fn run_for(&mut self, span: Duration) {
        let end = self.now + span;
        while !self.now.has_reached(end) {
            self.tick();
        }
    }

    fn synced_and_ready(therapy: TherapyConfig) -> Self {
        let mut pair = Self::new(therapy);
        pair.connect();
        pair.run_until(Duration::from_secs(1), |pair| pair.primary.peer_ready());
        pair
    }
}

fn short_session() -> TherapyConfig {
    TherapyConfig::DEFAULT
        .with_jitter_tenths(0)
        .with_session_duration(Duration::from_secs(2))
}

#[test]
fn both_sides_estimate_the_skew() {
    let pair = Pair::synced_and_ready(short_session());

    let (primary_offset, primary_valid) = pair.primary.current_offset();
    let (secondary_offset, secondary_valid) = pair.secondary.current_offset();
    let skew = i64::try_from(SKEW.as_micros()).expect("small skew");

    assert!(primary_valid && secondary_valid);
    assert_eq!(primary_offset, skew);
    assert_eq!(secondary_offset, -skew);
    assert_eq!(pair.primary.telemetry().count(TelemetryEventKind::SyncCompleted), 1);
}

#[test]
fn session_runs_on_both_devices_in_lockstep() {
    let mut pair = Pair::synced_and_ready(short_session());
    let now = pair.now;
    pair.primary.start_session(now, 42).expect("session starts");
    assert_eq!(pair.primary.current_state(), SessionState::Running);

    pair.run_until(Duration::from_millis(10), |pair| {
        pair.secondary.current_state() == SessionState::Running
    });
    assert_eq!(pair.secondary.session_seed(), Some(42));

    pair.run_until(Duration::from_secs(3), |pair| {
        pair.primary.current_state() == SessionState::Ready
            && pair.secondary.current_state() == SessionState::Ready
    });

    assert!(pair.primary.seed_acknowledged());
    assert_eq!(pair.primary.progress(pair.now).cycles, 3);
    assert_eq!(pair.primary_fired.len(), 12);
    assert_eq!(pair.secondary_fired.len(), 12);
    for (local, remote) in pair.primary_fired.iter().zip(&pair.secondary_fired) {
        let gap = if local.0.has_reached(remote.0) {
            local.0.elapsed_since(remote.0)
        } else {
            remote.0.elapsed_since(local.0)
        };
        assert!(gap <= TICK, "activations {local:?} and {remote:?} drifted apart");
    }
    assert_eq!(pair.secondary.telemetry().count(TelemetryEventKind::LateActivation(Finger::Index)), 0);
    assert!(!pair.secondary.actuator().on.iter().any(|on| *on));
}

#[test]
fn mirrored_session_uses_the_same_finger_on_both_hands() {
    let mut pair = Pair::synced_and_ready(short_session().with_mirror(true));
    let now = pair.now;
    pair.primary.start_session(now, 3).expect("session starts");
    pair.run_for(Duration::from_millis(600));

    let local = pair.primary_fired.iter().map(|(_, finger)| *finger);
    let remote = pair.secondary_fired.iter().map(|(_, finger)| *finger);
    assert!(local.eq(remote));
}

#[test]
fn disconnect_while_running_forces_channels_off() {
    let mut pair = Pair::synced_and_ready(short_session());
    let now = pair.now;
    pair.primary.start_session(now, 8).expect("session starts");
    pair.run_until(Duration::from_millis(100), |pair| {
        pair.secondary.actuator().on.iter().any(|on| *on)
    });

    pair.linked = false;
    let now = pair.secondary_now();
    pair.secondary.on_disconnected(now);

    assert_eq!(pair.secondary.current_state(), SessionState::ConnectionLost);
    assert!(!pair.secondary.actuator().on.iter().any(|on| *on));
    assert!(pair.secondary.dispatcher().is_idle());
    assert_eq!(pair.secondary.telemetry().count(TelemetryEventKind::ConnectionLost), 1);
}

#[test]
fn silent_link_is_declared_lost_after_three_intervals() {
    let mut device = Controller::new(
        ControllerConfig::for_role(DeviceRole::Secondary),
        Motors::default(),
        Outbox::default(),
    );
    device.on_connected(Instant::ZERO);

    for at in [2_000, 4_000, 5_999] {
        device.poll(Instant::from_millis(at));
        assert_eq!(device.current_state(), SessionState::Ready);
    }
    assert_eq!(device.telemetry().count(TelemetryEventKind::KeepaliveMissed), 2);

    device.poll(Instant::from_millis(6_000));
    assert_eq!(device.current_state(), SessionState::ConnectionLost);

    // Three reconnect checks two seconds apart, then the device gives up.
    for at in [8_000, 10_000] {
        device.poll(Instant::from_millis(at));
        assert_eq!(device.current_state(), SessionState::ConnectionLost);
    }
    device.poll(Instant::from_millis(12_000));
    assert_eq!(device.current_state(), SessionState::Idle);
    assert!(!device.clock_snapshot().valid);
    assert_eq!(device.telemetry().count(TelemetryEventKind::ReconnectFailed), 1);
}

#[test]
fn link_returning_within_the_window_restores_ready() {
    let mut pair = Pair::synced_and_ready(short_session());
    pair.linked = false;
    let now = pair.secondary_now();
    pair.secondary.on_disconnected(now);
    let now = pair.now;
    pair.primary.on_disconnected(now);
    assert!(!pair.primary.peer_ready());

    pair.run_for(Duration::from_millis(500));
    pair.connect();
    pair.run_until(Duration::from_secs(3), |pair| {
        pair.primary.current_state() == SessionState::Ready
            && pair.secondary.current_state() == SessionState::Ready
            && pair.primary.peer_ready()
    });
    assert_eq!(pair.secondary.telemetry().count(TelemetryEventKind::Reconnected), 1);
}

#[test]
fn replayed_buzz_is_dropped_as_stale() {
    let mut pair = Pair::synced_and_ready(short_session());
    let now = pair.now;
    pair.primary.start_session(now, 11).expect("session starts");
    pair.tick();
    pair.tick();

    // Catch the next BUZZ on its way to the secondary.
    let replay = loop {
        pair.primary.poll(pair.now);
        let frames = core::mem::take(&mut pair.primary.transport_mut().frames);
        let buzz = frames.iter().find(|frame| {
            matches!(
                codec::decode(&frame[..frame.len() - 1]),
                Ok(Message::Buzz(_))
            )
        });
        let buzz = buzz.cloned();
        for frame in frames {
            pair.secondary.on_receive(&frame);
        }
        if let Some(buzz) = buzz {
            break buzz;
        }
        pair.now = pair.now + TICK;
    };

    pair.secondary.on_receive(&replay);
    let now = pair.secondary_now();
    pair.secondary.poll(now);

    assert_eq!(pair.secondary.telemetry().count(TelemetryEventKind::StaleCommand), 1);
    assert_eq!(pair.secondary.current_state(), SessionState::Running);
}

#[test]
fn emergency_stop_reaches_the_peer() {
    let mut pair = Pair::synced_and_ready(short_session());
    let now = pair.now;
    pair.primary.start_session(now, 5).expect("session starts");
    pair.run_until(Duration::from_millis(100), |pair| {
        pair.secondary.actuator().on.iter().any(|on| *on)
    });

    let now = pair.now;
    pair.primary.emergency_stop(now).expect("link is up");
    assert_eq!(pair.primary.current_state(), SessionState::Error);
    pair.tick();
    pair.tick();

    assert!(!pair.secondary.actuator().on.iter().any(|on| *on));
    assert!(pair.secondary.dispatcher().is_idle());
    assert_eq!(pair.secondary.current_state(), SessionState::Ready);

    let now = pair.now;
    pair.primary.reset(now).expect("error state resets");
    assert_eq!(pair.primary.current_state(), SessionState::Idle);
}

#[test]
fn silent_link_recovers_when_traffic_resumes() {
    let mut pair = Pair::synced_and_ready(short_session());

    // Frames stop flowing but neither transport reports a drop.
    pair.linked = false;
    pair.run_for(Duration::from_millis(6_500));
    assert_eq!(pair.primary.current_state(), SessionState::ConnectionLost);
    assert_eq!(pair.secondary.current_state(), SessionState::ConnectionLost);

    pair.linked = true;
    pair.run_until(Duration::from_secs(4), |pair| {
        pair.primary.current_state() == SessionState::Ready
            && pair.secondary.current_state() == SessionState::Ready
            && pair.primary.peer_ready()
    });

    for device in [&pair.primary, &pair.secondary] {
        assert_eq!(device.telemetry().count(TelemetryEventKind::Reconnected), 1);
        assert_eq!(device.telemetry().count(TelemetryEventKind::ReconnectFailed), 0);
        assert!(device.clock_snapshot().valid);
    }
}

#[test]
fn pause_and_resume_hold_both_devices_in_step() {
    let mut pair = Pair::synced_and_ready(short_session());
    let started = pair.now;
    pair.primary.start_session(started, 21).expect("session starts");
    pair.run_until(Duration::from_secs(1), |pair| {
        pair.primary_fired.len() >= 2 && pair.secondary_fired.len() >= 2
    });

    let now = pair.now;
    pair.primary.pause_session(now).expect("running session pauses");
    assert_eq!(pair.primary.current_state(), SessionState::Paused);
    pair.tick();
    pair.tick();
    assert_eq!(pair.secondary.current_state(), SessionState::Paused);
    assert!(!pair.primary.actuator().on.iter().any(|on| *on));
    assert!(!pair.secondary.actuator().on.iter().any(|on| *on));
    assert!(pair.secondary.dispatcher().is_idle());

    let fired = (pair.primary_fired.len(), pair.secondary_fired.len());
    let remaining = pair.primary.progress(pair.now).remaining;
    pair.run_for(Duration::from_secs(1));
    assert_eq!((pair.primary_fired.len(), pair.secondary_fired.len()), fired);
    assert_eq!(pair.primary.progress(pair.now).remaining, remaining);
    assert_eq!(pair.secondary.current_state(), SessionState::Paused);

    let now = pair.now;
    pair.primary.resume_session(now).expect("paused session resumes");
    assert_eq!(pair.primary.progress(now).remaining, remaining);
    pair.run_until(Duration::from_millis(10), |pair| {
        pair.secondary.current_state() == SessionState::Running
    });

    pair.run_until(Duration::from_secs(3), |pair| {
        pair.primary.current_state() == SessionState::Ready
            && pair.secondary.current_state() == SessionState::Ready
    });

    // Two seconds of therapy plus one second paused.
    assert!(pair.now.elapsed_since(started) >= Duration::from_secs(3));
    assert_eq!(pair.primary_fired.len(), pair.secondary_fired.len());
    assert!(pair.primary_fired.len() > fired.0);

    let progress = pair.primary.progress(pair.now);
    let bursts = u32::try_from(pair.primary_fired.len()).expect("few bursts");
    assert_eq!(progress.activations, bursts * 2);
    assert_eq!(progress.cycles, bursts / 4);
    assert!(progress.cycles >= 3);
    assert_eq!(pair.secondary.telemetry().count(TelemetryEventKind::CommandRejected), 0);
}
