//! Four-timestamp clock synchronization.
//!
//! Each device pings its peer; the peer stamps receive (T2) and reply (T3)
//! times with its own clock and the local side stamps send (T1) and receive
//! (T4). An initial burst seeds the offset estimate from the median of the
//! samples whose round trip passes the quality threshold. A periodic
//! maintenance ping then keeps the estimate current with a slow moving average
//! and tracks crystal drift. The same pings double as the keepalive traffic
//! watched by the connection supervisor.
//!
//! Offsets are signed microseconds, positive when the peer clock is ahead:
//! `peer = local + offset`.

use core::cell::Cell;
use core::fmt;
use core::time::Duration;

use heapless::Vec;

use crate::time::{Instant, duration_micros};

pub mod latency;

pub use latency::{LeadTimeConfig, RttStats};

/// Upper bound on exchanges in one burst.
pub const MAX_BURST_EXCHANGES: usize = 16;
/// Unanswered pings kept for matching late replies.
pub const MAX_OUTSTANDING: usize = MAX_BURST_EXCHANGES;

#[allow(clippy::cast_possible_truncation)]
const BURST_LIMIT: u8 = MAX_BURST_EXCHANGES as u8;

const OFFSET_EMA_NUM: i64 = 1;
const OFFSET_EMA_DEN: i64 = 10;
const DRIFT_EMA_NUM: i64 = 3;
const DRIFT_EMA_DEN: i64 = 10;
const DRIFT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Outbound sync request (`PING:seq|T1`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ping {
    pub sequence: u32,
    pub sent_at: Instant,
}

/// Sync reply (`PONG:seq|0|T2|T3`), stamped with the responder's clock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pong {
    pub sequence: u32,
    pub received_at: Instant,
    pub replied_at: Instant,
}

/// Builds the reply to a peer's ping.
#[must_use]
pub const fn answer(ping: Ping, received_at: Instant, replied_at: Instant) -> Pong {
    Pong {
        sequence: ping.sequence,
        received_at,
        replied_at,
    }
}

/// One completed exchange.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClockSample {
    pub sequence: u32,
    pub t1: Instant,
    pub t2: Instant,
    pub t3: Instant,
    pub t4: Instant,
    pub round_trip: Duration,
    pub offset_us: i64,
}

impl ClockSample {
    /// Derives RTT `(T4−T1)−(T3−T2)` and offset `((T2−T1)+(T3−T4))/2`.
    #[must_use]
    pub fn from_exchange(sequence: u32, t1: Instant, t2: Instant, t3: Instant, t4: Instant) -> Self {
        let outbound = t2.signed_micros_since(t1);
        let inbound = t3.signed_micros_since(t4);
        let round_trip = t4
            .elapsed_since(t1)
            .saturating_sub(t3.elapsed_since(t2));

        Self {
            sequence,
            t1,
            t2,
            t3,
            t4,
            round_trip,
            offset_us: (outbound + inbound) / 2,
        }
    }
}

/// Immutable view of the current offset belief.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ClockSnapshot {
    pub offset_us: i64,
    pub valid: bool,
    pub samples: u16,
    /// Offset change rate in parts per billion (ns of offset per s).
    pub drift_ppb: i64,
    pub updated_at: Option<Instant>,
}

impl ClockSnapshot {
    pub const INVALID: Self = Self {
        offset_us: 0,
        valid: false,
        samples: 0,
        drift_ppb: 0,
        updated_at: None,
    };

    /// Offset extrapolated to `now` with the drift estimate.
    #[must_use]
    pub fn corrected_offset(&self, now: Instant) -> i64 {
        let Some(updated_at) = self.updated_at else {
            return self.offset_us;
        };
        if !now.has_reached(updated_at) {
            return self.offset_us;
        }

        let elapsed = i64::try_from(duration_micros(now.elapsed_since(updated_at)))
            .unwrap_or(i64::MAX);
        let correction = i128::from(self.drift_ppb) * i128::from(elapsed) / 1_000_000_000;
        self.offset_us
            .saturating_add(i64::try_from(correction).unwrap_or(0))
    }

    /// Maps a peer timestamp onto the local clock.
    #[must_use]
    pub fn peer_to_local(&self, peer: Instant, now: Instant) -> Instant {
        peer.offset_by(self.corrected_offset(now).wrapping_neg())
    }

    /// Maps a local timestamp onto the peer clock.
    #[must_use]
    pub fn local_to_peer(&self, local: Instant, now: Instant) -> Instant {
        local.offset_by(self.corrected_offset(now))
    }
}

/// Single-writer cell holding the published snapshot.
///
/// Readers always get a whole snapshot; the writer replaces it in one store.
#[derive(Debug, Default)]
pub struct SharedEstimate(Cell<ClockSnapshot>);

impl SharedEstimate {
    #[must_use]
    pub const fn new() -> Self {
        Self(Cell::new(ClockSnapshot::INVALID))
    }

    #[must_use]
    pub fn load(&self) -> ClockSnapshot {
        self.0.get()
    }

    pub fn store(&self, snapshot: ClockSnapshot) {
        self.0.set(snapshot);
    }
}

/// Tunables for the sync burst and maintenance cadence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SyncConfig {
    pub exchanges: u8,
    pub spacing: Duration,
    pub rtt_threshold: Duration,
    pub min_valid: u8,
    pub maintenance_interval: Duration,
}

impl SyncConfig {
    pub const DEFAULT: Self = Self {
        exchanges: 10,
        spacing: Duration::from_millis(15),
        rtt_threshold: Duration::from_millis(30),
        min_valid: 5,
        maintenance_interval: Duration::from_millis(500),
    };

    /// Sets the burst length, clamped to [`MAX_BURST_EXCHANGES`].
    #[must_use]
    pub const fn with_exchanges(mut self, exchanges: u8) -> Self {
        self.exchanges = if exchanges > BURST_LIMIT {
            BURST_LIMIT
        } else {
            exchanges
        };
        self
    }

    #[must_use]
    pub const fn with_rtt_threshold(mut self, threshold: Duration) -> Self {
        self.rtt_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Why a burst did not produce an estimate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncError {
    InsufficientSamples { valid: u8, required: u8 },
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::InsufficientSamples { valid, required } => {
                write!(f, "only {valid} of {required} required sync samples")
            }
        }
    }
}

/// Why a reply was not folded into the estimate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SampleRejection {
    /// No outstanding ping carries this sequence id.
    UnknownSequence(u32),
    /// Round trip above the quality threshold.
    RoundTripTooLong(Duration),
}

impl fmt::Display for SampleRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleRejection::UnknownSequence(sequence) => {
                write!(f, "no outstanding ping {sequence}")
            }
            SampleRejection::RoundTripTooLong(rtt) => write!(f, "round trip {rtt:?} too long"),
        }
    }
}

/// Work requested by [`ClockSync::poll`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncEvent {
    SendPing(Ping),
    BurstComplete(ClockSnapshot),
    BurstFailed(SyncError),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Outstanding {
    sequence: u32,
    sent_at: Instant,
}

#[derive(Clone, Debug)]
struct Burst {
    sent: u8,
    answered: u8,
    next_send: Instant,
    deadline: Option<Instant>,
    offsets: Vec<i64, MAX_BURST_EXCHANGES>,
}

#[derive(Clone, Debug)]
enum Phase {
    Idle,
    Burst(Burst),
    Maintaining { next_ping: Instant },
}

/// Phase of the engine, for status reporting.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncPhase {
    Idle,
    Burst,
    Maintaining,
}

/// Clock synchronization engine for one device.
pub struct ClockSync {
    config: SyncConfig,
    lead: LeadTimeConfig,
    phase: Phase,
    outstanding: Vec<Outstanding, MAX_OUTSTANDING>,
    next_sequence: u32,
    estimate: SharedEstimate,
    rtt: RttStats,
    last_raw: Option<(i64, Instant)>,
}

impl ClockSync {
    #[must_use]
    pub const fn new(config: SyncConfig, lead: LeadTimeConfig) -> Self {
        Self {
            // The fields are public, so the builder clamp can be bypassed.
            config: config.with_exchanges(config.exchanges),
            lead,
            phase: Phase::Idle,
            outstanding: Vec::new(),
            next_sequence: 1,
            estimate: SharedEstimate::new(),
            rtt: RttStats::new(),
            last_raw: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        match self.phase {
            Phase::Idle => SyncPhase::Idle,
            Phase::Burst(_) => SyncPhase::Burst,
            Phase::Maintaining { .. } => SyncPhase::Maintaining,
        }
    }

    /// Current published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ClockSnapshot {
        self.estimate.load()
    }

    /// `(offset, valid)` pair read from one snapshot.
    #[must_use]
    pub fn current_offset(&self) -> (i64, bool) {
        let snapshot = self.estimate.load();
        (snapshot.offset_us, snapshot.valid)
    }

    #[must_use]
    pub const fn round_trip(&self) -> &RttStats {
        &self.rtt
    }

    /// Adaptive lead time for scheduled commands.
    #[must_use]
    pub fn lead_time(&self) -> Duration {
        self.rtt.lead_time(&self.lead)
    }

    /// Starts a fresh burst. The first ping goes out on the next poll.
    pub fn begin_sync(&mut self, now: Instant) {
        self.outstanding.clear();
        self.phase = Phase::Burst(Burst {
            sent: 0,
            answered: 0,
            next_send: now,
            deadline: None,
            offsets: Vec::new(),
        });
    }

    /// Resumes maintenance pings after a reconnect, re-running the burst if
    /// the estimate was lost.
    pub fn resume_maintenance(&mut self, now: Instant) {
        if self.estimate.load().valid {
            self.outstanding.clear();
            self.phase = Phase::Maintaining { next_ping: now };
        } else {
            self.begin_sync(now);
        }
    }

    /// Stops exchanging pings but keeps the estimate, e.g. while the link is
    /// down and reconnect attempts are pending.
    pub fn suspend(&mut self) {
        self.phase = Phase::Idle;
        self.outstanding.clear();
    }

    /// Drops the estimate and stops all exchanges.
    pub fn invalidate(&mut self) {
        self.phase = Phase::Idle;
        self.outstanding.clear();
        self.estimate.store(ClockSnapshot::INVALID);
        self.rtt.reset();
        self.last_raw = None;
    }

    /// Earliest instant at which [`ClockSync::poll`] has work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Burst(burst) => {
                let send = (burst.sent < self.config.exchanges).then_some(burst.next_send);
                Instant::earliest(send, burst.deadline)
            }
            Phase::Maintaining { next_ping } => Some(*next_ping),
        }
    }

    /// Advances the burst or maintenance schedule.
    pub fn poll(&mut self, now: Instant) -> Option<SyncEvent> {
        let config = self.config;
        match &mut self.phase {
            Phase::Idle => None,
            Phase::Maintaining { next_ping } => {
                if !now.has_reached(*next_ping) {
                    return None;
                }
                *next_ping = now + config.maintenance_interval;
                Some(SyncEvent::SendPing(self.issue_ping(now)))
            }
            Phase::Burst(burst) => {
                let exhausted = burst.sent >= config.exchanges;
                let all_answered = exhausted && burst.answered >= config.exchanges;
                let timed_out = burst.deadline.is_some_and(|deadline| now.has_reached(deadline));
                if all_answered || timed_out {
                    return Some(self.finish_burst(now));
                }

                if exhausted || !now.has_reached(burst.next_send) {
                    return None;
                }

                burst.sent += 1;
                burst.next_send = now + config.spacing;
                if burst.sent >= config.exchanges {
                    burst.deadline = Some(now + config.rtt_threshold);
                }
                Some(SyncEvent::SendPing(self.issue_ping(now)))
            }
        }
    }

    /// Folds a reply received at `t4` into the estimate.
    pub fn on_pong(&mut self, pong: Pong, t4: Instant) -> Result<ClockSample, SampleRejection> {
        let position = self
            .outstanding
            .iter()
            .position(|entry| entry.sequence == pong.sequence)
            .ok_or(SampleRejection::UnknownSequence(pong.sequence))?;
        let request = self.outstanding.remove(position);

        let sample = ClockSample::from_exchange(
            pong.sequence,
            request.sent_at,
            pong.received_at,
            pong.replied_at,
            t4,
        );

        if let Phase::Burst(burst) = &mut self.phase {
            burst.answered = burst.answered.saturating_add(1);
        }

        if sample.round_trip > self.config.rtt_threshold {
            return Err(SampleRejection::RoundTripTooLong(sample.round_trip));
        }

        self.rtt.observe(sample.round_trip);

        match &mut self.phase {
            Phase::Burst(burst) => {
                // Capacity equals the clamped burst length and each reply
                // retires its outstanding ping, so this cannot overflow.
                let _ = burst.offsets.push(sample.offset_us);
            }
            Phase::Maintaining { .. } => self.fold_maintenance(sample.offset_us, t4),
            Phase::Idle => {}
        }

        Ok(sample)
    }

    fn issue_ping(&mut self, now: Instant) -> Ping {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);

        if self.outstanding.is_full() {
            self.outstanding.remove(0);
        }
        let _ = self.outstanding.push(Outstanding {
            sequence,
            sent_at: now,
        });

        Ping {
            sequence,
            sent_at: now,
        }
    }

    fn finish_burst(&mut self, now: Instant) -> SyncEvent {
        let Phase::Burst(burst) = core::mem::replace(&mut self.phase, Phase::Idle) else {
            return SyncEvent::BurstFailed(SyncError::InsufficientSamples {
                valid: 0,
                required: self.config.min_valid,
            });
        };
        self.outstanding.clear();

        let mut offsets = burst.offsets;
        let valid = u8::try_from(offsets.len()).unwrap_or(u8::MAX);
        if valid < self.config.min_valid {
            return SyncEvent::BurstFailed(SyncError::InsufficientSamples {
                valid,
                required: self.config.min_valid,
            });
        }

        let offset_us = median(&mut offsets);
        let snapshot = ClockSnapshot {
            offset_us,
            valid: true,
            samples: u16::from(valid),
            drift_ppb: 0,
            updated_at: Some(now),
        };
        self.estimate.store(snapshot);
        self.last_raw = Some((offset_us, now));
        self.phase = Phase::Maintaining {
            next_ping: now + self.config.maintenance_interval,
        };

        SyncEvent::BurstComplete(snapshot)
    }

    fn fold_maintenance(&mut self, raw_offset: i64, now: Instant) {
        let previous = self.estimate.load();
        if !previous.valid {
            return;
        }

        let mut drift_ppb = previous.drift_ppb;
        if let Some((last_offset, last_at)) = self.last_raw {
            let elapsed = now.elapsed_since(last_at);
            if now.has_reached(last_at) && elapsed >= DRIFT_MIN_INTERVAL {
                let elapsed_us = i128::from(duration_micros(elapsed));
                let delta = i128::from(raw_offset - last_offset);
                let measured = i64::try_from(delta * 1_000_000_000 / elapsed_us).unwrap_or(0);
                drift_ppb += (measured - drift_ppb) * DRIFT_EMA_NUM / DRIFT_EMA_DEN;
            }
        }
        self.last_raw = Some((raw_offset, now));

        let offset_us = previous.offset_us
            + (raw_offset - previous.offset_us) * OFFSET_EMA_NUM / OFFSET_EMA_DEN;
        self.estimate.store(ClockSnapshot {
            offset_us,
            valid: true,
            samples: previous.samples.saturating_add(1),
            drift_ppb,
            updated_at: Some(now),
        });
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new(SyncConfig::DEFAULT, LeadTimeConfig::DEFAULT)
    }
}

/// Median of the slice; even counts average the two middle values.
fn median(values: &mut [i64]) -> i64 {
    values.sort_unstable();
    let mid = values.len() / 2;
    match values.len() {
        0 => 0,
        len if len % 2 == 1 => values[mid],
        _ => (values[mid - 1] + values[mid]) / 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_AHEAD_US: i64 = 2_500;

    /// Runs one full burst against a simulated peer whose clock leads by
    /// [`PEER_AHEAD_US`]. `rtt_for` picks the round trip of exchange `i`.
    fn run_burst(sync: &mut ClockSync, rtt_for: impl Fn(usize) -> u64) -> SyncEvent {
        let mut now = Instant::from_millis(1_000);
        sync.begin_sync(now);
        let mut exchange = 0;

        loop {
            match sync.poll(now) {
                Some(SyncEvent::SendPing(ping)) => {
                    let rtt = rtt_for(exchange);
                    exchange += 1;
                    let t2 = ping.sent_at.offset_by(PEER_AHEAD_US) + Duration::from_micros(rtt / 2);
                    let t3 = t2 + Duration::from_micros(50);
                    let t4 = ping.sent_at + Duration::from_micros(rtt + 50);
                    let pong = answer(ping, t2, t3);
                    let _ = sync.on_pong(pong, t4);
                }
                Some(done) => return done,
                None => {}
            }
            now = sync.next_deadline().expect("burst always has a deadline");
        }
    }

    #[test]
    fn worked_example_offset_and_rtt() {
        let sample = ClockSample::from_exchange(
            1,
            Instant::from_micros(1_000),
            Instant::from_micros(1_500),
            Instant::from_micros(1_600),
            Instant::from_micros(1_100),
        );

        assert_eq!(sample.offset_us, 500);
        assert_eq!(sample.round_trip, Duration::ZERO);
    }

    #[test]
    fn offset_formula_holds_for_negative_offsets() {
        let sample = ClockSample::from_exchange(
            9,
            Instant::from_micros(10_000),
            Instant::from_micros(7_400),
            Instant::from_micros(7_500),
            Instant::from_micros(10_300),
        );

        // ((7400 - 10000) + (7500 - 10300)) / 2
        assert_eq!(sample.offset_us, -2_700);
        assert_eq!(sample.round_trip, Duration::from_micros(200));
    }

    #[test]
    fn clean_burst_seeds_a_valid_estimate() {
        let mut sync = ClockSync::default();
        let event = run_burst(&mut sync, |_| 4_000);

        let snapshot = match event {
            SyncEvent::BurstComplete(snapshot) => snapshot,
            other => panic!("expected completion, got {other:?}"),
        };
        assert!(snapshot.valid);
        assert_eq!(snapshot.samples, 10);
        assert_eq!(snapshot.offset_us, PEER_AHEAD_US);
        assert_eq!(sync.current_offset(), (PEER_AHEAD_US, true));
        assert_eq!(sync.phase(), SyncPhase::Maintaining);
    }

    #[test]
    fn six_slow_of_ten_fails_the_burst() {
        let mut sync = ClockSync::default();
        let event = run_burst(&mut sync, |i| if i < 6 { 45_000 } else { 5_000 });

        assert_eq!(
            event,
            SyncEvent::BurstFailed(SyncError::InsufficientSamples {
                valid: 4,
                required: 5
            })
        );
        assert_eq!(sync.current_offset(), (0, false));
        assert_eq!(sync.phase(), SyncPhase::Idle);
    }

    #[test]
    fn unanswered_burst_times_out_after_last_send() {
        let mut sync = ClockSync::default();
        let start = Instant::from_millis(0);
        sync.begin_sync(start);

        let mut now = start;
        let mut pings = 0;
        // Walk the schedule without answering.
        loop {
            match sync.poll(now) {
                Some(SyncEvent::SendPing(_)) => pings += 1,
                Some(SyncEvent::BurstFailed(_)) => break,
                other => panic!("unexpected {other:?}"),
            }
            now = sync.next_deadline().expect("burst pending");
        }

        assert_eq!(pings, 10);
        // Last ping at 9 * 15 ms, failure 30 ms later.
        assert_eq!(now, Instant::from_millis(135 + 30));
    }

    #[test]
    fn median_of_even_count_averages_the_middle() {
        let mut values = [40, 10, 30, 20];
        assert_eq!(median(&mut values), 25);
        let mut odd = [7, -3, 5];
        assert_eq!(median(&mut odd), 5);
    }

    #[test]
    fn unknown_replies_are_ignored() {
        let mut sync = ClockSync::default();
        sync.begin_sync(Instant::ZERO);

        let stray = Pong {
            sequence: 999,
            received_at: Instant::from_micros(10),
            replied_at: Instant::from_micros(20),
        };
        assert_eq!(
            sync.on_pong(stray, Instant::from_micros(30)),
            Err(SampleRejection::UnknownSequence(999))
        );
    }

    #[test]
    fn maintenance_moves_estimate_by_a_tenth() {
        let mut sync = ClockSync::default();
        run_burst(&mut sync, |_| 4_000);

        let now = sync.next_deadline().expect("maintenance scheduled");
        let Some(SyncEvent::SendPing(ping)) = sync.poll(now) else {
            panic!("maintenance ping expected");
        };

        // Peer now appears 1 ms further ahead.
        let t2 = ping.sent_at.offset_by(PEER_AHEAD_US + 1_000) + Duration::from_micros(2_000);
        let t3 = t2 + Duration::from_micros(100);
        let t4 = ping.sent_at + Duration::from_micros(4_100);
        let sample = sync.on_pong(answer(ping, t2, t3), t4).expect("good sample");

        assert_eq!(sample.offset_us, PEER_AHEAD_US + 1_000);
        let snapshot = sync.snapshot();
        assert_eq!(snapshot.offset_us, PEER_AHEAD_US + 100);
        assert_eq!(snapshot.samples, 11);
        assert!(snapshot.drift_ppb > 0);
    }

    #[test]
    fn snapshot_maps_between_clocks() {
        let snapshot = ClockSnapshot {
            offset_us: 3_000,
            valid: true,
            samples: 5,
            drift_ppb: 0,
            updated_at: Some(Instant::ZERO),
        };
        let now = Instant::from_millis(10);

        let peer = Instant::from_micros(53_000);
        assert_eq!(snapshot.peer_to_local(peer, now), Instant::from_micros(50_000));
        assert_eq!(
            snapshot.local_to_peer(Instant::from_micros(50_000), now),
            peer
        );
    }

    #[test]
    fn drift_extrapolates_the_offset() {
        let snapshot = ClockSnapshot {
            offset_us: 1_000,
            valid: true,
            samples: 5,
            drift_ppb: 20_000,
            updated_at: Some(Instant::ZERO),
        };

        // 20 ppm over 10 s is 200 us.
        assert_eq!(snapshot.corrected_offset(Instant::from_millis(10_000)), 1_200);
    }

    #[test]
    fn oversized_bursts_are_clamped() {
        let config = SyncConfig::DEFAULT.with_exchanges(40);
        assert_eq!(usize::from(config.exchanges), MAX_BURST_EXCHANGES);

        let mut raw = SyncConfig::DEFAULT;
        raw.exchanges = 200;
        let mut sync = ClockSync::new(raw, LeadTimeConfig::default());
        assert_eq!(usize::from(sync.config().exchanges), MAX_BURST_EXCHANGES);

        let SyncEvent::BurstComplete(snapshot) = run_burst(&mut sync, |_| 4_000) else {
            panic!("clean burst completes");
        };
        assert_eq!(usize::from(snapshot.samples), MAX_BURST_EXCHANGES);
    }

    #[test]
    fn invalidate_drops_the_estimate() {
        let mut sync = ClockSync::default();
        run_burst(&mut sync, |_| 4_000);
        sync.invalidate();

        assert_eq!(sync.current_offset(), (0, false));
        assert_eq!(sync.next_deadline(), None);

        sync.resume_maintenance(Instant::from_millis(5_000));
        assert_eq!(sync.phase(), SyncPhase::Burst);
    }
}
