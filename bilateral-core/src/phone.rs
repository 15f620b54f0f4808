//! Companion-app link tracking.
//!
//! Losing the phone does not stop therapy; the bilateral link carries on.
//! The session only ends if the phone stays away past the timeout.

use core::time::Duration;

use crate::session::SessionTrigger;
use crate::time::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhoneLinkConfig {
    pub reconnect_timeout: Duration,
}

impl PhoneLinkConfig {
    pub const DEFAULT: Self = Self {
        reconnect_timeout: Duration::from_secs(30),
    };

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }
}

impl Default for PhoneLinkConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

pub struct PhoneLinkMonitor {
    config: PhoneLinkConfig,
    lost_at: Option<Instant>,
}

impl PhoneLinkMonitor {
    #[must_use]
    pub const fn new(config: PhoneLinkConfig) -> Self {
        Self {
            config,
            lost_at: None,
        }
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.lost_at.is_none()
    }

    /// Phone dropped. Returns the trigger on the first report only.
    pub fn lost(&mut self, now: Instant) -> Option<SessionTrigger> {
        if self.lost_at.is_some() {
            return None;
        }
        self.lost_at = Some(now);
        Some(SessionTrigger::PhoneLost)
    }

    /// Phone came back before the timeout.
    pub fn restored(&mut self) -> Option<SessionTrigger> {
        self.lost_at.take().map(|_| SessionTrigger::PhoneReconnected)
    }

    /// Instant at which the absence turns into a timeout.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.lost_at.map(|lost| lost + self.config.reconnect_timeout)
    }

    /// Reports the timeout once it has passed.
    pub fn poll(&mut self, now: Instant) -> Option<SessionTrigger> {
        let deadline = self.deadline()?;
        if !now.has_reached(deadline) {
            return None;
        }
        self.lost_at = None;
        Some(SessionTrigger::PhoneTimeout)
    }

    pub fn reset(&mut self) {
        self.lost_at = None;
    }
}

impl Default for PhoneLinkMonitor {
    fn default() -> Self {
        Self::new(PhoneLinkConfig::DEFAULT)
    }
}
