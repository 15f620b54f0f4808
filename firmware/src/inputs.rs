//! Debouncing for the status pins and the session button.
//!
//! All inputs are sampled on a fixed tick by the inputs task. A level only
//! counts once it has been stable for [`STABLE_SAMPLES`] ticks.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use core::time::Duration;

/// Sampling period of the inputs task.
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(10);
/// Consecutive equal samples required before a level change is reported.
pub const STABLE_SAMPLES: u8 = 3;
/// Holding the button this long triggers an emergency stop.
pub const EMERGENCY_HOLD: Duration = Duration::from_secs(1);

/// Debounced digital level.
#[derive(Copy, Clone, Debug)]
pub struct Debounced {
    stable: bool,
    candidate: bool,
    streak: u8,
}

impl Debounced {
    pub const fn new(initial: bool) -> Self {
        Self {
            stable: initial,
            candidate: initial,
            streak: 0,
        }
    }

    pub const fn level(&self) -> bool {
        self.stable
    }

    /// Feeds one raw sample. Returns the new level when it changed.
    pub fn update(&mut self, raw: bool) -> Option<bool> {
        if raw == self.stable {
            self.streak = 0;
            self.candidate = raw;
            return None;
        }
        if raw == self.candidate {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.candidate = raw;
            self.streak = 1;
        }
        if self.streak >= STABLE_SAMPLES {
            self.stable = raw;
            self.streak = 0;
            return Some(raw);
        }
        None
    }
}

/// What a button gesture asks for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ButtonAction {
    /// Short press: start a session, or stop the running one.
    Toggle,
    /// Long hold: emergency stop, reported while the button is still down.
    Emergency,
}

/// Turns debounced button levels into gestures.
#[derive(Copy, Clone, Debug)]
pub struct ButtonTracker {
    input: Debounced,
    held: Duration,
    fired: bool,
}

impl ButtonTracker {
    pub const fn new() -> Self {
        Self {
            input: Debounced::new(false),
            held: Duration::ZERO,
            fired: false,
        }
    }

    /// Feeds one raw sample (`true` while pressed).
    pub fn update(&mut self, pressed: bool) -> Option<ButtonAction> {
        let change = self.input.update(pressed);
        match change {
            Some(true) => {
                self.held = Duration::ZERO;
                self.fired = false;
                None
            }
            Some(false) => {
                let was_short = !self.fired;
                self.fired = false;
                was_short.then_some(ButtonAction::Toggle)
            }
            None if self.input.level() && !self.fired => {
                self.held += SAMPLE_PERIOD;
                if self.held >= EMERGENCY_HOLD {
                    self.fired = true;
                    Some(ButtonAction::Emergency)
                } else {
                    None
                }
            }
            None => None,
        }
    }
}

impl Default for ButtonTracker {
    fn default() -> Self {
        Self::new()
    }
}
