//! Macrocycle executor.
//!
//! The primary device walks through one pattern per cycle. Each event pairs
//! a local channel (`left[i]`) with a remote channel (`right[i]`) and is
//! handed to the dispatcher as a bilateral burst; events are spaced by the
//! pattern's jittered intervals. Session time only runs while not paused.

use core::fmt;
use core::time::Duration;

use crate::dispatcher::ActivationRequest;
use crate::pattern::{FINGER_COUNT, Pattern, PatternGenerator};
use crate::time::Instant;

pub mod config;

pub use config::TherapyConfig;

/// One event of a cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BilateralBurst {
    pub local: ActivationRequest,
    pub remote: ActivationRequest,
    /// Cycle number, starting at 1.
    pub cycle: u32,
    /// Event index within the cycle.
    pub event: u8,
}

/// Work produced by [`TherapyExecutor::poll`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TherapyEvent {
    Burst(BilateralBurst),
    CycleComplete { cycles: u32 },
    SessionComplete(TherapyProgress),
}

/// Session counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TherapyProgress {
    pub cycles: u32,
    pub activations: u32,
    pub remaining: Duration,
}

impl fmt::Display for TherapyProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cycles, {} activations, {}s remaining",
            self.cycles,
            self.activations,
            self.remaining.as_secs()
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Pacing {
    Idle,
    Running { next_event: Instant, ends_at: Instant },
    Paused { remaining: Duration },
}

pub struct TherapyExecutor {
    config: TherapyConfig,
    generator: PatternGenerator,
    pattern: Option<Pattern>,
    event_index: usize,
    pacing: Pacing,
    cycle_finished: bool,
    cycles: u32,
    activations: u32,
}

impl TherapyExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: TherapyConfig::DEFAULT,
            generator: PatternGenerator::from_seed(0),
            pattern: None,
            event_index: 0,
            pacing: Pacing::Idle,
            cycle_finished: false,
            cycles: 0,
            activations: 0,
        }
    }

    /// Profile of the running (or last) session.
    #[must_use]
    pub const fn config(&self) -> &TherapyConfig {
        &self.config
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.pacing, Pacing::Running { .. })
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        matches!(self.pacing, Pacing::Paused { .. })
    }

    /// Begins a session. The first event is due immediately.
    pub fn start(&mut self, now: Instant, seed: u32, config: TherapyConfig) {
        self.config = config;
        self.generator = PatternGenerator::from_seed(seed);
        self.pattern = None;
        self.event_index = 0;
        self.cycle_finished = false;
        self.cycles = 0;
        self.activations = 0;
        self.pacing = Pacing::Running {
            next_event: now,
            ends_at: now + config.session_duration,
        };
    }

    /// Halts pacing and freezes the session clock.
    pub fn pause(&mut self, now: Instant) {
        if let Pacing::Running { ends_at, .. } = self.pacing {
            let remaining = if now.has_reached(ends_at) {
                Duration::ZERO
            } else {
                ends_at.elapsed_since(now)
            };
            self.pacing = Pacing::Paused { remaining };
        }
    }

    /// Continues with the next event of the current cycle.
    pub fn resume(&mut self, now: Instant) {
        if let Pacing::Paused { remaining } = self.pacing {
            self.pacing = Pacing::Running {
                next_event: now,
                ends_at: now + remaining,
            };
        }
    }

    /// Ends the session. Counters stay readable until the next start.
    pub fn stop(&mut self) {
        self.pacing = Pacing::Idle;
        self.pattern = None;
        self.cycle_finished = false;
    }

    #[must_use]
    pub fn progress(&self, now: Instant) -> TherapyProgress {
        let remaining = match self.pacing {
            Pacing::Idle => Duration::ZERO,
            Pacing::Paused { remaining } => remaining,
            Pacing::Running { ends_at, .. } if now.has_reached(ends_at) => Duration::ZERO,
            Pacing::Running { ends_at, .. } => ends_at.elapsed_since(now),
        };
        TherapyProgress {
            cycles: self.cycles,
            activations: self.activations,
            remaining,
        }
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.pacing {
            Pacing::Running {
                next_event,
                ends_at,
            } => Instant::earliest(Some(next_event), Some(ends_at)),
            Pacing::Idle | Pacing::Paused { .. } => None,
        }
    }

    /// Produces at most one event.
    pub fn poll(&mut self, now: Instant) -> Option<TherapyEvent> {
        let Pacing::Running {
            next_event,
            ends_at,
        } = self.pacing
        else {
            return None;
        };

        if core::mem::take(&mut self.cycle_finished) {
            return Some(TherapyEvent::CycleComplete {
                cycles: self.cycles,
            });
        }

        if now.has_reached(ends_at) {
            let progress = self.progress(now);
            self.stop();
            return Some(TherapyEvent::SessionComplete(progress));
        }

        if !now.has_reached(next_event) {
            return None;
        }

        let config = self.config;
        let pattern = match self.pattern {
            Some(pattern) => pattern,
            None => {
                let pattern = self.generator.next_pattern(&config);
                self.pattern = Some(pattern);
                pattern
            }
        };
        let (left, right) = pattern.pair(self.event_index)?;
        let amplitude = self.generator.amplitude(&config);
        let frequency_hz = self.generator.frequency(&config);
        let request = |finger| ActivationRequest {
            finger,
            amplitude,
            duration: config.burst_duration,
            frequency_hz,
        };
        let burst = BilateralBurst {
            local: request(left),
            remote: request(right),
            cycle: self.cycles + 1,
            event: u8::try_from(self.event_index).unwrap_or(u8::MAX),
        };

        self.pacing = Pacing::Running {
            next_event: next_event + pattern.intervals[self.event_index],
            ends_at,
        };
        self.activations = self.activations.saturating_add(2);
        self.event_index += 1;

        let events_per_cycle = usize::from(config.bursts_per_cycle).clamp(1, FINGER_COUNT);
        if self.event_index >= events_per_cycle {
            self.event_index = 0;
            self.pattern = None;
            self.cycles = self.cycles.saturating_add(1);
            self.cycle_finished = true;
        }

        Some(TherapyEvent::Burst(burst))
    }
}

impl Default for TherapyExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Finger;

    fn steady_config() -> TherapyConfig {
        TherapyConfig::DEFAULT
            .with_jitter_tenths(0)
            .with_session_duration(Duration::from_secs(2))
    }

    fn drain(executor: &mut TherapyExecutor, now: Instant) -> heapless::Vec<TherapyEvent, 8> {
        let mut events = heapless::Vec::new();
        while let Some(event) = executor.poll(now) {
            events.push(event).expect("event buffer");
        }
        events
    }

    #[test]
    fn events_pair_left_and_right_and_follow_the_period() {
        let mut executor = TherapyExecutor::new();
        executor.start(Instant::ZERO, 7, steady_config().with_mirror(false));

        let mut bursts: heapless::Vec<BilateralBurst, 4> = heapless::Vec::new();
        let mut now = Instant::ZERO;
        for _ in 0..4 {
            for event in drain(&mut executor, now) {
                if let TherapyEvent::Burst(burst) = event {
                    bursts.push(burst).expect("one cycle");
                }
            }
            assert_eq!(executor.next_deadline(), Some(now + Duration::from_millis(167)));
            now = now + Duration::from_millis(167);
        }

        let mut left = bursts.iter().map(|burst| burst.local.finger.as_index()).collect::<heapless::Vec<_, 4>>();
        left.sort_unstable();
        assert_eq!(left.as_slice(), &[0, 1, 2, 3]);
        assert!(bursts.iter().all(|burst| burst.cycle == 1));
        assert_eq!(bursts[0].local.duration, Duration::from_millis(100));
        assert_eq!(bursts[0].remote.amplitude, 100);
        assert_eq!(bursts[0].remote.frequency_hz, 250);
    }

    #[test]
    fn cycle_completion_is_reported_after_last_event() {
        let mut executor = TherapyExecutor::new();
        executor.start(Instant::ZERO, 1, steady_config());

        let mut now = Instant::ZERO;
        let mut completed = None;
        for _ in 0..4 {
            for event in drain(&mut executor, now) {
                if let TherapyEvent::CycleComplete { cycles } = event {
                    completed = Some(cycles);
                }
            }
            now = now + Duration::from_millis(167);
        }

        assert_eq!(completed, Some(1));
        assert_eq!(executor.progress(now).activations, 8);
    }

    #[test]
    fn session_completes_after_duration() {
        let mut executor = TherapyExecutor::new();
        executor.start(Instant::ZERO, 3, steady_config());

        let mut now = Instant::ZERO;
        let mut finished = None;
        while finished.is_none() {
            for event in drain(&mut executor, now) {
                if let TherapyEvent::SessionComplete(progress) = event {
                    finished = Some((now, progress));
                }
            }
            now = executor.next_deadline().unwrap_or(now);
        }

        let (at, progress) = finished.expect("session ended");
        assert_eq!(at, Instant::from_millis(2_000));
        assert_eq!(progress.cycles, 3);
        assert_eq!(progress.activations, 24);
        assert!(!executor.is_running());
        assert_eq!(executor.poll(at), None);
    }

    #[test]
    fn pause_freezes_session_clock() {
        let mut executor = TherapyExecutor::new();
        executor.start(Instant::ZERO, 5, steady_config());
        drain(&mut executor, Instant::ZERO);

        executor.pause(Instant::from_millis(500));
        assert!(executor.is_paused());
        assert_eq!(executor.poll(Instant::from_millis(5_000)), None);
        assert_eq!(executor.next_deadline(), None);

        executor.resume(Instant::from_millis(10_000));
        let events = drain(&mut executor, Instant::from_millis(10_000));
        assert!(matches!(
            events.first(),
            Some(TherapyEvent::Burst(BilateralBurst { event: 1, .. }))
        ));
        assert_eq!(
            executor.progress(Instant::from_millis(10_000)).remaining,
            Duration::from_millis(1_500)
        );
    }

    #[test]
    fn same_seed_gives_same_fingers() {
        let mut first = TherapyExecutor::new();
        let mut second = TherapyExecutor::new();
        first.start(Instant::ZERO, 99, TherapyConfig::DEFAULT);
        second.start(Instant::from_millis(40), 99, TherapyConfig::DEFAULT);

        let a = first.poll(Instant::ZERO);
        let b = second.poll(Instant::from_millis(40));
        let finger = |event: Option<TherapyEvent>| match event {
            Some(TherapyEvent::Burst(burst)) => Some((burst.local.finger, burst.remote.finger)),
            _ => None::<(Finger, Finger)>,
        };
        assert!(finger(a).is_some());
        assert_eq!(finger(a), finger(b));
    }
}
