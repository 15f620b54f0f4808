//! Controller-wide configuration.

use crate::battery::BatteryConfig;
use crate::clock::{LeadTimeConfig, SyncConfig};
use crate::connection::SupervisorConfig;
use crate::phone::PhoneLinkConfig;
use crate::therapy::TherapyConfig;

/// Which side of the pair this device plays.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DeviceRole {
    /// Runs the therapy executor and issues commands.
    #[default]
    Primary,
    /// Follows the primary's commands.
    Secondary,
}

impl DeviceRole {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            DeviceRole::Primary => "PRIMARY",
            DeviceRole::Secondary => "SECONDARY",
        }
    }
}

impl core::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to construct a [`Controller`](crate::controller::Controller).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ControllerConfig {
    pub role: DeviceRole,
    pub sync: SyncConfig,
    pub lead: LeadTimeConfig,
    pub supervisor: SupervisorConfig,
    pub battery: BatteryConfig,
    pub phone: PhoneLinkConfig,
    pub therapy: TherapyConfig,
}

impl ControllerConfig {
    pub const DEFAULT: Self = Self::for_role(DeviceRole::Primary);

    #[must_use]
    pub const fn for_role(role: DeviceRole) -> Self {
        Self {
            role,
            sync: SyncConfig::DEFAULT,
            lead: LeadTimeConfig::DEFAULT,
            supervisor: SupervisorConfig::DEFAULT,
            battery: BatteryConfig::DEFAULT,
            phone: PhoneLinkConfig::DEFAULT,
            therapy: TherapyConfig::DEFAULT,
        }
    }

    #[must_use]
    pub const fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    #[must_use]
    pub const fn with_lead(mut self, lead: LeadTimeConfig) -> Self {
        self.lead = lead;
        self
    }

    #[must_use]
    pub const fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    #[must_use]
    pub const fn with_battery(mut self, battery: BatteryConfig) -> Self {
        self.battery = battery;
        self
    }

    #[must_use]
    pub const fn with_phone(mut self, phone: PhoneLinkConfig) -> Self {
        self.phone = phone;
        self
    }

    #[must_use]
    pub const fn with_therapy(mut self, therapy: TherapyConfig) -> Self {
        self.therapy = therapy;
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
