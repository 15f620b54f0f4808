use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use bilateral_core::battery::BatteryConfig;
use bilateral_core::codec::{self, Message};
use bilateral_core::config::{ControllerConfig, DeviceRole};
use bilateral_core::controller::{Controller, Transport, TransportError};
use bilateral_core::dispatcher::Actuator;
use bilateral_core::pattern::{FINGER_COUNT, Finger};
use bilateral_core::session::SessionState;
use bilateral_core::telemetry::{TelemetryEventKind, TelemetryPayload, TelemetryRecord};
use bilateral_core::therapy::TherapyConfig;
use bilateral_core::time::Instant;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const TICK: Duration = Duration::from_millis(1);
const BATTERY_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);
const HEALTHY_MILLIVOLTS: u16 = 3_950;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scenario {
    /// Full session from sync to completion.
    Session,
    /// Link drops mid-session and comes back inside the reconnect window.
    Outage,
    /// Emergency stop mid-session, then reset.
    Emergency,
    /// Primary battery drains through the low and critical thresholds.
    Battery,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::Session,
        Scenario::Outage,
        Scenario::Emergency,
        Scenario::Battery,
    ];

    pub fn log_path(self) -> &'static str {
        match self {
            Scenario::Session => "transcripts/emulator-session.log",
            Scenario::Outage => "transcripts/emulator-outage.log",
            Scenario::Emergency => "transcripts/emulator-emergency.log",
            Scenario::Battery => "transcripts/emulator-battery.log",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            Scenario::Session => "Bilateral emulator session transcript",
            Scenario::Outage => "Bilateral emulator link outage transcript",
            Scenario::Emergency => "Bilateral emulator emergency stop transcript",
            Scenario::Battery => "Bilateral emulator battery drain transcript",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.tag().eq_ignore_ascii_case(tag))
            .ok_or_else(|| format!("Unknown scenario `{tag}`"))
    }

    pub fn tag(self) -> &'static str {
        match self {
            Scenario::Session => "session",
            Scenario::Outage => "outage",
            Scenario::Emergency => "emergency",
            Scenario::Battery => "battery",
        }
    }
}

/// Simulated radio link between the two devices.
#[derive(Clone, Copy, Debug)]
pub struct LinkModel {
    /// One-way delivery delay.
    pub latency: Duration,
    /// Percentage of frames dropped in each direction.
    pub loss_percent: u8,
    /// Secondary clock offset from the primary at start.
    pub skew: Duration,
    /// Secondary clock rate error in parts per million.
    pub drift_ppm: i32,
}

impl LinkModel {
    pub const DEFAULT: Self = Self {
        latency: Duration::from_millis(4),
        loss_percent: 0,
        skew: Duration::from_millis(250),
        drift_ppm: 20,
    };
}

impl Default for LinkModel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RunOptions {
    pub link: LinkModel,
    pub session: Duration,
    pub outage: Duration,
    pub seed: u64,
    /// Also log every activation and control frame.
    pub verbose: bool,
}

impl RunOptions {
    pub const DEFAULT: Self = Self {
        link: LinkModel::DEFAULT,
        session: Duration::from_secs(20),
        outage: Duration::from_secs(3),
        seed: 0x5EED,
        verbose: false,
    };
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranscriptRole {
    Host,
    Primary,
    Secondary,
    Link,
}

impl TranscriptRole {
    pub fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Primary => "PRI <",
            TranscriptRole::Secondary => "SEC <",
            TranscriptRole::Link => "LINK ",
        }
    }
}

/// One transcript entry, also handed to the console.
#[derive(Clone, Debug)]
pub struct TranscriptLine {
    pub elapsed: Duration,
    pub role: TranscriptRole,
    pub text: String,
}

#[derive(Default)]
struct SimTransport {
    outbox: Vec<Vec<u8>>,
}

impl Transport for SimTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.outbox.push(frame.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct SimActuator {
    active: [bool; FINGER_COUNT],
    fired: Vec<(Finger, u8)>,
}

impl Actuator for SimActuator {
    fn activate(&mut self, finger: Finger, amplitude: u8) {
        self.active[finger.as_index()] = true;
        self.fired.push((finger, amplitude));
    }

    fn deactivate(&mut self, finger: Finger) {
        self.active[finger.as_index()] = false;
    }
}

type Device = Controller<SimActuator, SimTransport>;

struct InFlight {
    deliver_at: Instant,
    frame: Vec<u8>,
}

#[derive(Default)]
struct Wire {
    queue: VecDeque<InFlight>,
}

impl Wire {
    fn due(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while self
            .queue
            .front()
            .is_some_and(|flight| now.has_reached(flight.deliver_at))
        {
            if let Some(flight) = self.queue.pop_front() {
                frames.push(flight.frame);
            }
        }
        frames
    }
}

/// Outcome of one scenario run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub scenario: Scenario,
    pub elapsed: Duration,
    pub primary_state: SessionState,
    pub secondary_state: SessionState,
    pub primary_activations: usize,
    pub secondary_activations: usize,
    /// Largest distance between a secondary activation and the nearest
    /// primary activation, in simulation time.
    pub max_gap: Option<Duration>,
    pub frames_sent: usize,
    pub frames_dropped: usize,
    pub offset_us: i64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} finished after {}: primary={} secondary={} activations={}/{} frames={} dropped={} offset={}us",
            self.scenario.tag(),
            format_duration_short(self.elapsed),
            self.primary_state,
            self.secondary_state,
            self.primary_activations,
            self.secondary_activations,
            self.frames_sent,
            self.frames_dropped,
            self.offset_us,
        )?;
        if let Some(gap) = self.max_gap {
            write!(f, " max-gap={}us", gap.as_micros())?;
        }
        Ok(())
    }
}

pub struct Session {
    scenario: Scenario,
    options: RunOptions,
    primary: Device,
    secondary: Device,
    to_primary: Wire,
    to_secondary: Wire,
    rng: SmallRng,
    now: Instant,
    linked: bool,
    primary_fired: Vec<Instant>,
    secondary_fired: Vec<Instant>,
    frames_sent: usize,
    frames_dropped: usize,
    last_buzz: Option<Vec<u8>>,
    transcript: TranscriptLogger,
    pending: Vec<TranscriptLine>,
}

impl Session {
    pub fn new(scenario: Scenario, options: RunOptions) -> io::Result<Self> {
        let transcript = TranscriptLogger::new(scenario, &options)?;
        let therapy = TherapyConfig::DEFAULT.with_session_duration(options.session);
        let battery = BatteryConfig::DEFAULT.with_sample_interval(BATTERY_SAMPLE_INTERVAL);
        let config = |role| {
            ControllerConfig::for_role(role)
                .with_therapy(therapy)
                .with_battery(battery)
        };

        Ok(Self {
            scenario,
            options,
            primary: Controller::new(
                config(DeviceRole::Primary),
                SimActuator::default(),
                SimTransport::default(),
            ),
            secondary: Controller::new(
                config(DeviceRole::Secondary),
                SimActuator::default(),
                SimTransport::default(),
            ),
            to_primary: Wire::default(),
            to_secondary: Wire::default(),
            rng: SmallRng::seed_from_u64(options.seed),
            now: Instant::ZERO,
            linked: false,
            primary_fired: Vec::new(),
            secondary_fired: Vec::new(),
            frames_sent: 0,
            frames_dropped: 0,
            last_buzz: None,
            transcript,
            pending: Vec::new(),
        })
    }

    /// Runs the scenario, handing every transcript line to `echo`.
    pub fn run(&mut self, mut echo: impl FnMut(&TranscriptLine)) -> io::Result<RunSummary> {
        match self.scenario {
            Scenario::Session => self.script_session(&mut echo)?,
            Scenario::Outage => self.script_outage(&mut echo)?,
            Scenario::Emergency => self.script_emergency(&mut echo)?,
            Scenario::Battery => self.script_battery(&mut echo)?,
        }

        let summary = self.summary();
        self.host(&format!("summary {summary}"));
        self.flush(&mut echo)?;
        Ok(summary)
    }

    fn script_session(&mut self, echo: &mut impl FnMut(&TranscriptLine)) -> io::Result<()> {
        self.connect();
        self.await_peer(echo)?;
        self.start(echo)?;

        let halfway = self.now + self.options.session / 2;
        self.run_until(echo, self.options.session, |session| {
            session.now.has_reached(halfway)
        })?;
        self.replay_last_buzz();

        self.run_until(echo, self.options.session + Duration::from_secs(5), |session| {
            session.primary.current_state() == SessionState::Ready
                && session.secondary.current_state() == SessionState::Ready
        })?;
        self.run_for(echo, Duration::from_millis(500))
    }

    fn script_outage(&mut self, echo: &mut impl FnMut(&TranscriptLine)) -> io::Result<()> {
        self.connect();
        self.await_peer(echo)?;
        self.start(echo)?;
        self.run_for(echo, Duration::from_secs(1))?;

        self.disconnect();
        self.run_for(echo, self.options.outage)?;
        self.connect();

        self.run_until(echo, Duration::from_secs(12), |session| {
            let settled = |state: SessionState| !state.is_error();
            settled(session.primary.current_state())
                && settled(session.secondary.current_state())
        })?;
        if self.primary.current_state() == SessionState::Ready {
            self.await_peer(echo)?;
            self.start(echo)?;
            self.run_for(echo, Duration::from_secs(1))?;
            self.stop(echo)?;
        }
        self.run_for(echo, Duration::from_millis(500))
    }

    fn script_emergency(&mut self, echo: &mut impl FnMut(&TranscriptLine)) -> io::Result<()> {
        self.connect();
        self.await_peer(echo)?;
        self.start(echo)?;
        self.run_for(echo, Duration::from_millis(800))?;

        self.host("emergency_stop");
        let now = self.now;
        let result = self.primary.emergency_stop(now);
        self.host_result(result);
        self.run_for(echo, Duration::from_millis(100))?;

        self.host("reset");
        let now = self.now;
        let result = self.primary.reset(now);
        self.host_result(result);
        self.run_for(echo, Duration::from_millis(500))
    }

    fn script_battery(&mut self, echo: &mut impl FnMut(&TranscriptLine)) -> io::Result<()> {
        self.connect();
        self.await_peer(echo)?;
        self.start(echo)?;
        self.run_until(echo, Duration::from_secs(10), |session| {
            session.primary.current_state() == SessionState::Idle
        })?;
        self.run_for(echo, Duration::from_millis(500))
    }

    fn start(&mut self, echo: &mut impl FnMut(&TranscriptLine)) -> io::Result<()> {
        let seed = self.rng.random::<u32>();
        self.host(&format!("start_session seed={seed}"));
        let now = self.now;
        let result = self.primary.start_session(now, seed);
        self.host_result(result);
        self.flush(echo)
    }

    fn stop(&mut self, echo: &mut impl FnMut(&TranscriptLine)) -> io::Result<()> {
        self.host("stop_session");
        let now = self.now;
        let result = self.primary.stop_session(now);
        self.host_result(result);
        self.flush(echo)
    }

    fn await_peer(&mut self, echo: &mut impl FnMut(&TranscriptLine)) -> io::Result<()> {
        self.run_until(echo, Duration::from_secs(5), |session| {
            session.primary.peer_ready()
        })
    }

    fn connect(&mut self) {
        self.host("link up");
        self.linked = true;
        let now = self.now;
        self.primary.on_connected(now);
        let now = self.secondary_clock();
        self.secondary.on_connected(now);
    }

    fn disconnect(&mut self) {
        self.host("link down");
        self.linked = false;
        self.to_primary.queue.clear();
        self.to_secondary.queue.clear();
        let now = self.now;
        self.primary.on_disconnected(now);
        let now = self.secondary_clock();
        self.secondary.on_disconnected(now);
    }

    /// Sends the most recent `BUZZ` again; the secondary must drop it.
    fn replay_last_buzz(&mut self) {
        let Some(frame) = self.last_buzz.clone() else {
            return;
        };
        self.host("replaying last BUZZ frame");
        self.to_secondary.queue.push_back(InFlight {
            deliver_at: self.now,
            frame,
        });
    }

    fn host(&mut self, text: &str) {
        self.note(TranscriptRole::Host, text.to_string());
    }

    fn host_result<E: fmt::Display>(&mut self, result: Result<(), E>) {
        match result {
            Ok(()) => self.host("OK"),
            Err(err) => self.host(&format!("ERR {err}")),
        }
    }

    fn note(&mut self, role: TranscriptRole, text: String) {
        self.pending.push(TranscriptLine {
            elapsed: Duration::from_micros(self.now.as_micros()),
            role,
            text,
        });
    }

    fn flush(&mut self, echo: &mut impl FnMut(&TranscriptLine)) -> io::Result<()> {
        for line in self.pending.drain(..) {
            self.transcript.append(&line)?;
            echo(&line);
        }
        Ok(())
    }

    fn run_for(&mut self, echo: &mut impl FnMut(&TranscriptLine), span: Duration) -> io::Result<()> {
        let end = self.now + span;
        while !self.now.has_reached(end) {
            self.tick();
            self.flush(echo)?;
        }
        Ok(())
    }

    fn run_until(
        &mut self,
        echo: &mut impl FnMut(&TranscriptLine),
        limit: Duration,
        mut done: impl FnMut(&Self) -> bool,
    ) -> io::Result<()> {
        let end = self.now + limit;
        while !done(self) {
            if self.now.has_reached(end) {
                self.host(&format!(
                    "gave up waiting after {}",
                    format_duration_short(limit)
                ));
                break;
            }
            self.tick();
            self.flush(echo)?;
        }
        self.flush(echo)
    }

    fn secondary_clock(&self) -> Instant {
        let elapsed = i64::try_from(self.now.as_micros()).unwrap_or(i64::MAX);
        let drift = elapsed.saturating_mul(i64::from(self.options.link.drift_ppm)) / 1_000_000;
        (self.now + self.options.link.skew).offset_by(drift)
    }

    fn primary_battery(&self) -> u16 {
        if self.scenario != Scenario::Battery {
            return HEALTHY_MILLIVOLTS;
        }
        // 3450 mV draining 60 mV/s: low after ~0.8 s, critical after ~2.5 s.
        let drained = self.now.as_micros() * 60 / 1_000_000;
        u16::try_from(3_450_u64.saturating_sub(drained)).unwrap_or(0)
    }

    fn tick(&mut self) {
        let now = self.now;
        let secondary_now = self.secondary_clock();

        for frame in self.to_primary.due(now) {
            self.primary.on_receive(&frame);
        }
        for frame in self.to_secondary.due(now) {
            self.secondary.on_receive(&frame);
        }

        if self.primary.battery_sample_due(now) {
            let millivolts = self.primary_battery();
            self.primary.on_battery_sample(millivolts, now);
        }
        if self.secondary.battery_sample_due(secondary_now) {
            self.secondary
                .on_battery_sample(HEALTHY_MILLIVOLTS, secondary_now);
        }

        let before = self.primary.actuator().fired.len();
        self.primary.poll(now);
        self.collect_fired(DeviceRole::Primary, before);

        let before = self.secondary.actuator().fired.len();
        self.secondary.poll(secondary_now);
        self.collect_fired(DeviceRole::Secondary, before);

        self.route(DeviceRole::Primary);
        self.route(DeviceRole::Secondary);
        self.collect_telemetry();

        self.now = self.now + TICK;
    }

    fn collect_fired(&mut self, role: DeviceRole, before: usize) {
        let (device, fired, tag) = match role {
            DeviceRole::Primary => (&self.primary, &mut self.primary_fired, TranscriptRole::Primary),
            DeviceRole::Secondary => (
                &self.secondary,
                &mut self.secondary_fired,
                TranscriptRole::Secondary,
            ),
        };
        let fresh = &device.actuator().fired[before..];
        fired.extend(fresh.iter().map(|_| self.now));
        if self.options.verbose {
            let lines: Vec<String> = fresh
                .iter()
                .map(|(finger, amplitude)| format!("buzz {finger} {amplitude}%"))
                .collect();
            for line in lines {
                self.note(tag, line);
            }
        }
    }

    fn route(&mut self, from: DeviceRole) {
        let frames = match from {
            DeviceRole::Primary => std::mem::take(&mut self.primary.transport_mut().outbox),
            DeviceRole::Secondary => std::mem::take(&mut self.secondary.transport_mut().outbox),
        };

        for frame in frames {
            self.frames_sent += 1;
            let message = frame
                .split_last()
                .and_then(|(_, body)| codec::decode(body).ok());
            if from == DeviceRole::Primary && matches!(message, Some(Message::Buzz(_))) {
                self.last_buzz = Some(frame.clone());
            }
            if self.options.verbose
                && let Some(message) = message.as_ref().filter(|message| !message.is_keepalive())
            {
                let arrow = match from {
                    DeviceRole::Primary => "PRI -> SEC",
                    DeviceRole::Secondary => "SEC -> PRI",
                };
                self.note(TranscriptRole::Link, format!("{arrow} {message}"));
            }

            if !self.linked {
                continue;
            }
            if self.rng.random_range(0..100_u8) < self.options.link.loss_percent {
                self.frames_dropped += 1;
                continue;
            }

            let flight = InFlight {
                deliver_at: self.now + self.options.link.latency,
                frame,
            };
            match from {
                DeviceRole::Primary => self.to_secondary.queue.push_back(flight),
                DeviceRole::Secondary => self.to_primary.queue.push_back(flight),
            }
        }
    }

    fn collect_telemetry(&mut self) {
        let mut lines = Vec::new();
        self.primary.telemetry_mut().drain_new(|record| {
            lines.push((TranscriptRole::Primary, describe_record(record)));
        });
        self.secondary.telemetry_mut().drain_new(|record| {
            lines.push((TranscriptRole::Secondary, describe_record(record)));
        });
        for (role, text) in lines {
            self.note(role, text);
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            scenario: self.scenario,
            elapsed: Duration::from_micros(self.now.as_micros()),
            primary_state: self.primary.current_state(),
            secondary_state: self.secondary.current_state(),
            primary_activations: self.primary_fired.len(),
            secondary_activations: self.secondary_fired.len(),
            max_gap: max_gap(&self.primary_fired, &self.secondary_fired),
            frames_sent: self.frames_sent,
            frames_dropped: self.frames_dropped,
            offset_us: self.secondary.current_offset().0,
        }
    }
}

/// Largest distance from a secondary activation to the nearest primary one.
fn max_gap(primary: &[Instant], secondary: &[Instant]) -> Option<Duration> {
    secondary
        .iter()
        .filter_map(|at| {
            let split = primary.partition_point(|candidate| !candidate.has_reached(*at));
            let after = primary.get(split).map(|next| next.elapsed_since(*at));
            let before = split
                .checked_sub(1)
                .and_then(|index| primary.get(index))
                .map(|previous| at.elapsed_since(*previous));
            match (before, after) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (gap, None) | (None, gap) => gap,
            }
        })
        .max()
}

fn describe_record(record: &TelemetryRecord<Instant>) -> String {
    match (record.event, record.details) {
        (TelemetryEventKind::StateChanged(_), TelemetryPayload::Transition(transition)) => {
            format!("state {} -> {}", transition.from, transition.to)
        }
        (event, TelemetryPayload::None) => event.to_string(),
        (event, TelemetryPayload::Transition(transition)) => format!("{event} {}", transition.to),
        (event, TelemetryPayload::Lateness(lateness)) => {
            format!("{event} by {}us", lateness.as_micros())
        }
        (event, TelemetryPayload::Sync(sync)) => {
            let mut text = format!(
                "{event} offset={}us samples={}",
                sync.offset_us, sync.valid_samples
            );
            if let Some(round_trip) = sync.round_trip {
                text.push_str(&format!(" rtt={}us", round_trip.as_micros()));
            }
            text
        }
        (
            event,
            TelemetryPayload::Sequence {
                rejected,
                last_accepted,
            },
        ) => format!("{event} seq={rejected} last={last_accepted}"),
        (event, TelemetryPayload::Link { count }) => format!("{event} ({count})"),
        (event, TelemetryPayload::Count(count)) => format!("{event} {count}"),
        (event, TelemetryPayload::Battery { millivolts, level }) => {
            format!("{event} {millivolts}mV {level}")
        }
    }
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(scenario: Scenario, options: &RunOptions) -> io::Result<Self> {
        let path = Path::new(scenario.log_path());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };

        logger.write_header(scenario, options)?;
        Ok(logger)
    }

    fn write_header(&mut self, scenario: Scenario, options: &RunOptions) -> io::Result<()> {
        let link = options.link;
        writeln!(self.writer, "# {}", scenario.header())?;
        writeln!(
            self.writer,
            "# Timestamps are primary-clock milliseconds since start"
        )?;
        writeln!(
            self.writer,
            "# latency={} loss={}% skew={} drift={}ppm seed={:#x}",
            format_duration_short(link.latency),
            link.loss_percent,
            format_duration_short(link.skew),
            link.drift_ppm,
            options.seed,
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append(&mut self, line: &TranscriptLine) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            line.elapsed.as_millis(),
            line.role.prefix(),
            line.text
        )?;
        self.writer.flush()
    }
}

pub fn format_duration_short(duration: Duration) -> String {
    if duration.as_secs() == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.3}s", duration.as_secs_f64())
    }
}
