use crate::codec::{FieldSpec, Value};
use crate::descriptor::{Fields, FixedMap, ModelDescriptor};
use crate::facade::Action;
use crate::host::StatePublisher;
use crate::prelude::*;
use crate::wallbox::poller::{FixedMapPoller, Watchdog};
use crate::wallbox::CurrentLimits;

use {
    num_enum::{FromPrimitive, IntoPrimitive},
    std::sync::Arc,
    std::time::Duration,
};

// Register maps {{{
pub static IDENTITY: FixedMap = FixedMap {
    start: 100,
    descriptor: ModelDescriptor {
        id: 0,
        name: "EV11 identity",
        length: Some(12),
        fields: &[
            FieldSpec::ascii("SerialNumber", 0, 8),
            FieldSpec::ascii("FirmwareRevision", 8, 4),
        ],
    },
};

pub static STATUS: FixedMap = FixedMap {
    start: 200,
    descriptor: ModelDescriptor {
        id: 0,
        name: "EV11 status",
        length: Some(9),
        fields: &[
            FieldSpec::enum16("ChargingState", 0),
            FieldSpec::enum16("ChargingRelayState", 1),
            FieldSpec::uint("MaxChargingCurrentDip", 2, 1, None),
            FieldSpec::uint("ActualChargingCurrent", 3, 1, None),
            FieldSpec::int("Temperature", 4, 1, None),
            FieldSpec::uint("PowerMeter0", 5, 2, None),
            FieldSpec::enum16("Error", 7),
            FieldSpec::uint("PhaseAutoSwitch", 8, 1, None),
        ],
    },
};

pub static CONTROL: FixedMap = FixedMap {
    start: 300,
    descriptor: ModelDescriptor {
        id: 0,
        name: "EV11 control",
        length: Some(2),
        fields: &[
            FieldSpec::uint("Heartbeat", 0, 1, None),
            FieldSpec::uint("ChargingCurrent", 1, 1, None),
        ],
    },
};

pub const HEARTBEAT_VALUE: u16 = 1;
/// Set in the charging current word to ask for three phase charging.
pub const THREE_PHASE_FLAG: u16 = 1 << 15;
// }}}

/// IEC 61851 control pilot state as the EV11 reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ChargingState {
    A1 = 0,
    A2 = 1,
    B1 = 2,
    B2 = 3,
    C1 = 4,
    C2 = 5,
    Error = 6,
    #[num_enum(catch_all)]
    Unknown(u16),
}

impl ChargingState {
    pub fn is_plugged_in(self) -> bool {
        matches!(self, Self::B1 | Self::B2 | Self::C1 | Self::C2)
    }

    pub fn is_charging(self) -> bool {
        self == Self::C2
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum RelayState {
    NoCharging = 0,
    SinglePhase = 1,
    ThreePhase = 2,
    #[num_enum(catch_all)]
    Unknown(u16),
}

pub fn error_text(code: u16) -> String {
    let text = match code {
        0 => "No error",
        1 => "Overheating, charging continues once cooled down",
        2 => "DC fault current sensor tripped",
        3 => "Charging requested with ventilation",
        4 => "CP signal fault, state E or F",
        5 => "CP signal bypassed",
        6 => "CP signal diode missing",
        7 => "DC fault current sensor calibrating",
        8 => "DC fault current sensor communication error",
        9 => "DC fault current sensor error",
        _ => return format!("Unknown error ({})", code),
    };
    text.to_string()
}

/// PC Electric EV11.3 wallbox on Modbus TCP.
#[derive(Debug)]
pub struct Ev11 {
    thing_id: ThingId,
    poller: FixedMapPoller,
    states: StatePublisher,
    limits: CurrentLimits,
    power: bool,
    max_charging_current: u32,
    desired_phase_count: u8,
    phase_auto_switch: Option<bool>,
    online: bool,
    identity_pending: bool,
}

impl Ev11 {
    pub fn new(
        thing_id: ThingId,
        connection: Arc<Connection>,
        watchdog_interval: Duration,
        sender: crate::host::Sender,
    ) -> Self {
        let watchdog = Watchdog::new(CONTROL.start, HEARTBEAT_VALUE, watchdog_interval);
        let limits = CurrentLimits::default();

        Self {
            states: StatePublisher::new(thing_id.clone(), sender),
            thing_id,
            poller: FixedMapPoller::new(connection, Some(watchdog)),
            max_charging_current: limits.min,
            limits,
            power: false,
            desired_phase_count: 3,
            phase_auto_switch: None,
            online: false,
            identity_pending: true,
        }
    }

    pub fn thing_id(&self) -> &ThingId {
        &self.thing_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        self.poller.connection()
    }

    pub fn limits(&self) -> CurrentLimits {
        self.limits
    }

    pub fn is_powered(&self) -> bool {
        self.power
    }

    pub fn max_charging_current(&self) -> u32 {
        self.max_charging_current
    }

    pub fn set_watchdog_interval(&mut self, interval: Duration) {
        if let Some(watchdog) = self.poller.watchdog_mut() {
            watchdog.set_interval(interval);
        }
    }

    pub fn on_reachable_changed(&mut self, reachable: bool) {
        self.states.set("connected", reachable);

        if !reachable {
            self.online = false;
            if let Some(watchdog) = self.poller.watchdog_mut() {
                watchdog.disarm();
            }
            return;
        }
        if self.online {
            return;
        }

        info!("{}: wallbox reachable, initializing", self.thing_id);
        self.online = true;
        self.identity_pending = true;
        if let Some(watchdog) = self.poller.watchdog_mut() {
            watchdog.arm();
        }
        self.limits = CurrentLimits::default();
        self.limits.publish(&mut self.states);
    }

    pub async fn update(&mut self) -> Result<(), ThingError> {
        let mut maps = vec![&STATUS];
        if self.identity_pending {
            maps.push(&IDENTITY);
        }

        let blocks = self.poller.poll(&maps).await.map_err(|e| {
            debug!("{}: update failed: {}", self.thing_id, e);
            ThingError::from(e)
        })?;

        if let Some(block) = blocks.get(1) {
            let fields = Fields::new(&self.thing_id, &IDENTITY.descriptor, block);
            if let Some(firmware) = fields.text("FirmwareRevision") {
                self.states.set("firmwareVersion", firmware);
            }
            if let Some(serial) = fields.text("SerialNumber") {
                self.states.set("serialNumber", serial);
            }
            self.identity_pending = false;
        }

        let Some(block) = blocks.first() else {
            return Err(ThingError::HardwareFailure);
        };
        let fields = Fields::new(&self.thing_id, &STATUS.descriptor, block);

        if let Some(code) = fields.code("ChargingState") {
            let state = ChargingState::from(code as u16);
            trace!("{}: charging state {:?}", self.thing_id, state);
            self.states.set("pluggedIn", state.is_plugged_in());
            self.states.set("charging", state.is_charging());
        }

        if let Some(auto) = fields.code("PhaseAutoSwitch").map(|v| v != 0) {
            if self.phase_auto_switch != Some(auto) {
                self.phase_auto_switch = Some(auto);
                if auto {
                    self.states.set_range("desiredPhaseCount", 1u32, 3u32);
                } else {
                    self.desired_phase_count = 3;
                    self.states.set_range("desiredPhaseCount", 3u32, 3u32);
                }
            }
            if !auto {
                self.states.set("phaseCount", 3u32);
            }
        }
        self.states.set("desiredPhaseCount", u32::from(self.desired_phase_count));

        if let Some(code) = fields.code("ChargingRelayState") {
            match RelayState::from(code as u16) {
                RelayState::SinglePhase => self.states.set("phaseCount", 1u32),
                RelayState::ThreePhase => self.states.set("phaseCount", 3u32),
                _ => {}
            }
        }

        if let Some(ma) = fields.code("MaxChargingCurrentDip") {
            let max = ma / 1000;
            if max < self.limits.min || max > crate::wallbox::DEFAULT_MAX_CHARGING_CURRENT {
                warn!("{}: ignoring implausible maximum current {} mA", self.thing_id, ma);
            } else if max != self.limits.max {
                self.limits.max = max;
                self.limits.publish(&mut self.states);
            }
        }

        if let Some(ma) = fields.number("ActualChargingCurrent") {
            self.states.set("chargingCurrent", ma / 1000.0);
        }
        if let Some(v) = fields.number("Temperature") {
            self.states.set("temperature", v);
        }
        if let Some(wh) = fields.number("PowerMeter0") {
            self.states.set("sessionEnergy", wh / 1000.0);
        }
        if let Some(code) = fields.code("Error") {
            self.states.set("error", error_text(code as u16));
        }

        self.states.set("power", self.power);
        self.states.set("maxChargingCurrent", self.max_charging_current);
        Ok(())
    }

    pub async fn execute(&mut self, action: Action) -> Result<(), ThingError> {
        if !self.connection().is_reachable() {
            warn!("{}: cannot execute {:?}, wallbox not reachable", self.thing_id, action);
            return Err(ThingError::HardwareNotAvailable);
        }

        match action {
            Action::Power(on) => {
                let amps = if on { self.max_charging_current } else { 0 };
                self.write_charging_current(amps).await?;
                self.power = on;
                self.states.set("power", on);
            }
            Action::MaxChargingCurrent(amps) => {
                if !self.limits.contains(amps) {
                    warn!("{}: {} A is outside {:?}", self.thing_id, amps, self.limits);
                    return Err(ThingError::InvalidParameter);
                }
                if self.power {
                    self.write_charging_current(amps).await?;
                }
                self.max_charging_current = amps;
                self.states.set("maxChargingCurrent", amps);
            }
            Action::DesiredPhaseCount(count) => {
                if count != 1 && count != 3 {
                    return Err(ThingError::InvalidParameter);
                }
                if count == 1 && self.phase_auto_switch == Some(false) {
                    warn!("{}: single phase charging needs phase auto switching", self.thing_id);
                    return Err(ThingError::InvalidParameter);
                }
                self.desired_phase_count = count;
                self.states.set("desiredPhaseCount", u32::from(count));
            }
            Action::GridCharging(_) => return Err(ThingError::UnsupportedFeature),
        }

        Ok(())
    }

    /// Charging current word: milliamps, bit 15 selecting three phases.
    pub fn charging_current_word(&self, amps: u32) -> u16 {
        if amps == 0 {
            return 0;
        }
        let mut word = (amps * 1000).min(u32::from(THREE_PHASE_FLAG - 1)) as u16;
        if self.desired_phase_count == 3 {
            word |= THREE_PHASE_FLAG;
        }
        word
    }

    async fn write_charging_current(&self, amps: u32) -> Result<(), ThingError> {
        let word = self.charging_current_word(amps);
        debug!("{}: charging current {} A (0x{:04x})", self.thing_id, amps, word);
        self.poller
            .write(&CONTROL, "ChargingCurrent", &Value::Unsigned(u64::from(word)))
            .await
    }
}
