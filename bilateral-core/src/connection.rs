//! Connection health supervision.
//!
//! Keepalive traffic (the clock pings and their replies) is expected every
//! interval. After `missed_limit` silent intervals the supervisor shuts the
//! actuators down, moves the session to `CONNECTION_LOST` and starts a
//! bounded series of reconnect checks. It is the only component allowed to
//! override the session table, and it reaches the rest of the controller only
//! through [`SafetyOverride`].

use core::fmt;
use core::time::Duration;

use crate::session::{ForceReason, SessionState};
use crate::time::{Instant, duration_micros};

/// Keepalive and reconnect tunables.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SupervisorConfig {
    pub keepalive_interval: Duration,
    pub missed_limit: u8,
    pub reconnect_attempts: u8,
    pub reconnect_interval: Duration,
}

impl SupervisorConfig {
    pub const DEFAULT: Self = Self {
        keepalive_interval: Duration::from_secs(2),
        missed_limit: 3,
        reconnect_attempts: 3,
        reconnect_interval: Duration::from_secs(2),
    };

    #[must_use]
    pub const fn with_keepalive(mut self, interval: Duration, missed_limit: u8) -> Self {
        self.keepalive_interval = interval;
        self.missed_limit = missed_limit;
        self
    }

    #[must_use]
    pub const fn with_reconnect(mut self, attempts: u8, interval: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_interval = interval;
        self
    }

    /// Silence after which the connection is declared lost.
    #[must_use]
    pub fn loss_timeout(&self) -> Duration {
        self.keepalive_interval * u32::from(self.missed_limit)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Safety actions the supervisor may take on the rest of the controller.
pub trait SafetyOverride {
    /// Forces every channel off and drops pending timers. Returns how many
    /// channels were pending or active.
    fn shutdown_actuators(&mut self) -> usize;

    /// Moves the session into connection loss: through the table when the
    /// current state lists a disconnect, otherwise by force.
    ///
    /// After a keepalive timeout the clock keeps probing the peer so a silent
    /// link that recovers is noticed; after a reported link drop it stops.
    fn connection_lost(&mut self, reason: ForceReason, now: Instant);

    fn force_state(&mut self, state: SessionState, reason: ForceReason);

    /// Restarts clock maintenance after the link came back.
    fn rearm_clock(&mut self, now: Instant);

    /// Drops the clock estimate after reconnecting failed.
    fn invalidate_clock(&mut self);
}

/// What [`ConnectionSupervisor::poll`] did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SupervisorEvent {
    KeepaliveMissed { misses: u8 },
    ConnectionLost { forced_off: usize },
    ReconnectAttempt { attempt: u8 },
    Reconnected { attempt: u8 },
    ReconnectFailed { attempts: u8 },
}

impl fmt::Display for SupervisorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorEvent::KeepaliveMissed { misses } => write!(f, "keepalive missed ({misses})"),
            SupervisorEvent::ConnectionLost { forced_off } => {
                write!(f, "connection lost, {forced_off} channels forced off")
            }
            SupervisorEvent::ReconnectAttempt { attempt } => {
                write!(f, "reconnect attempt {attempt} failed")
            }
            SupervisorEvent::Reconnected { attempt } => {
                write!(f, "reconnected on attempt {attempt}")
            }
            SupervisorEvent::ReconnectFailed { attempts } => {
                write!(f, "gave up after {attempts} reconnect attempts")
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    /// Not connected and not trying.
    Dormant,
    Monitoring {
        last_keepalive: Instant,
        misses: u8,
    },
    Reconnecting {
        attempts: u8,
        next_attempt: Instant,
    },
}

/// Health of the bilateral link.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionHealth {
    Dormant,
    Healthy { last_keepalive: Instant, misses: u8 },
    Reconnecting { attempts: u8 },
}

pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    phase: Phase,
    link_up: bool,
}

impl ConnectionSupervisor {
    #[must_use]
    pub const fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            phase: Phase::Dormant,
            link_up: false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    #[must_use]
    pub const fn link_up(&self) -> bool {
        self.link_up
    }

    #[must_use]
    pub const fn health(&self) -> ConnectionHealth {
        match self.phase {
            Phase::Dormant => ConnectionHealth::Dormant,
            Phase::Monitoring {
                last_keepalive,
                misses,
            } => ConnectionHealth::Healthy {
                last_keepalive,
                misses,
            },
            Phase::Reconnecting { attempts, .. } => ConnectionHealth::Reconnecting { attempts },
        }
    }

    /// Transport reported the link up. Starts monitoring unless a reconnect
    /// sequence is running; that sequence picks the flag up at its next check.
    pub fn on_connected(&mut self, now: Instant) {
        self.link_up = true;
        if self.phase == Phase::Dormant {
            self.phase = Phase::Monitoring {
                last_keepalive: now,
                misses: 0,
            };
        }
    }

    /// Transport reported the link down.
    pub fn on_link_down(
        &mut self,
        now: Instant,
        safety: &mut impl SafetyOverride,
    ) -> Option<SupervisorEvent> {
        self.link_up = false;
        match self.phase {
            Phase::Monitoring { .. } => Some(self.declare_lost(now, ForceReason::LinkDown, safety)),
            Phase::Dormant | Phase::Reconnecting { .. } => None,
        }
    }

    /// Keepalive traffic arrived. While reconnecting this proves the link is
    /// back even if the transport never reported it down, and the next
    /// reconnect check restores the session.
    pub fn observe_keepalive(&mut self, now: Instant) {
        match self.phase {
            Phase::Monitoring { .. } => {
                self.phase = Phase::Monitoring {
                    last_keepalive: now,
                    misses: 0,
                };
            }
            Phase::Reconnecting { .. } => self.link_up = true,
            Phase::Dormant => {}
        }
    }

    /// Stops supervision, e.g. when the controller resets.
    pub fn stop(&mut self) {
        self.phase = Phase::Dormant;
    }

    /// Next instant at which [`ConnectionSupervisor::poll`] has work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Dormant => None,
            Phase::Monitoring {
                last_keepalive,
                misses,
            } => Some(last_keepalive + self.config.keepalive_interval * (u32::from(misses) + 1)),
            Phase::Reconnecting { next_attempt, .. } => Some(next_attempt),
        }
    }

    /// Checks keepalive freshness and drives reconnect attempts.
    pub fn poll(&mut self, now: Instant, safety: &mut impl SafetyOverride) -> Option<SupervisorEvent> {
        match self.phase {
            Phase::Dormant => None,
            Phase::Monitoring {
                last_keepalive,
                misses,
            } => {
                if !now.has_reached(last_keepalive) {
                    return None;
                }
                let missed = self.intervals_missed(now.elapsed_since(last_keepalive));
                if missed >= self.config.missed_limit {
                    return Some(self.declare_lost(now, ForceReason::KeepaliveTimeout, safety));
                }
                if missed > misses {
                    self.phase = Phase::Monitoring {
                        last_keepalive,
                        misses: missed,
                    };
                    return Some(SupervisorEvent::KeepaliveMissed { misses: missed });
                }
                None
            }
            Phase::Reconnecting {
                attempts,
                next_attempt,
            } => {
                if !now.has_reached(next_attempt) {
                    return None;
                }
                let attempt = attempts.saturating_add(1);

                if self.link_up {
                    safety.rearm_clock(now);
                    safety.force_state(SessionState::Ready, ForceReason::Reconnected);
                    self.phase = Phase::Monitoring {
                        last_keepalive: now,
                        misses: 0,
                    };
                    return Some(SupervisorEvent::Reconnected { attempt });
                }

                if attempt >= self.config.reconnect_attempts {
                    safety.invalidate_clock();
                    safety.force_state(SessionState::Idle, ForceReason::ReconnectExhausted);
                    self.phase = Phase::Dormant;
                    return Some(SupervisorEvent::ReconnectFailed { attempts: attempt });
                }

                self.phase = Phase::Reconnecting {
                    attempts: attempt,
                    next_attempt: next_attempt + self.config.reconnect_interval,
                };
                Some(SupervisorEvent::ReconnectAttempt { attempt })
            }
        }
    }

    fn intervals_missed(&self, silence: Duration) -> u8 {
        let interval = duration_micros(self.config.keepalive_interval).max(1);
        u8::try_from(duration_micros(silence) / interval).unwrap_or(u8::MAX)
    }

    fn declare_lost(
        &mut self,
        now: Instant,
        reason: ForceReason,
        safety: &mut impl SafetyOverride,
    ) -> SupervisorEvent {
        // A silent link counts as down until traffic or the transport says
        // otherwise.
        self.link_up = false;
        let forced_off = safety.shutdown_actuators();
        safety.connection_lost(reason, now);
        self.phase = Phase::Reconnecting {
            attempts: 0,
            next_attempt: now + self.config.reconnect_interval,
        };
        SupervisorEvent::ConnectionLost { forced_off }
    }
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::DEFAULT)
    }
}
