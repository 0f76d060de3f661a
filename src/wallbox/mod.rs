pub mod cion;
pub mod ev11;
pub mod poller;

use crate::host::StatePublisher;

pub const DEFAULT_MIN_CHARGING_CURRENT: u32 = 6;
pub const DEFAULT_MAX_CHARGING_CURRENT: u32 = 32;

/// Charging current bounds in amps, as last reported by the wallbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrentLimits {
    pub min: u32,
    pub max: u32,
}

impl Default for CurrentLimits {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_CHARGING_CURRENT,
            max: DEFAULT_MAX_CHARGING_CURRENT,
        }
    }
}

impl CurrentLimits {
    pub fn contains(&self, amps: u32) -> bool {
        (self.min..=self.max).contains(&amps)
    }

    pub fn publish(&self, states: &mut StatePublisher) {
        states.set_range("maxChargingCurrent", self.min, self.max);
    }
}
