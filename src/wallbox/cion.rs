use crate::codec::{FieldSpec, Value};
use crate::descriptor::{Fields, FixedMap, ModelDescriptor};
use crate::facade::Action;
use crate::host::StatePublisher;
use crate::prelude::*;
use crate::wallbox::poller::FixedMapPoller;
use crate::wallbox::{CurrentLimits, DEFAULT_MAX_CHARGING_CURRENT};

use std::sync::Arc;

// Register maps {{{
pub static CONTROL: FixedMap = FixedMap {
    start: 100,
    descriptor: ModelDescriptor {
        id: 0,
        name: "CION control",
        length: Some(2),
        fields: &[
            FieldSpec::uint("ChargingEnabled", 0, 1, None),
            FieldSpec::uint("ChargingCurrentSetpoint", 1, 1, None),
        ],
    },
};

pub static STATUS: FixedMap = FixedMap {
    start: 121,
    descriptor: ModelDescriptor {
        id: 0,
        name: "CION status",
        length: Some(12),
        fields: &[
            FieldSpec::uint("CpSignalState", 0, 1, None),
            FieldSpec::bits16("StatusBits", 1),
            FieldSpec::uint("ChargingDuration", 2, 2, None),
            FieldSpec::uint("PluggedInDuration", 4, 2, None),
            FieldSpec::uint("CurrentChargingCurrentE3", 6, 1, None),
            FieldSpec::uint("MaxChargingCurrentE3", 7, 1, None),
            FieldSpec::float("GridVoltage", 8),
            FieldSpec::float("U1Voltage", 10),
        ],
    },
};

pub static LIMITS: FixedMap = FixedMap {
    start: 507,
    descriptor: ModelDescriptor {
        id: 0,
        name: "CION limits",
        length: Some(1),
        fields: &[FieldSpec::uint("MinChargingCurrent", 0, 1, None)],
    },
};

pub static IDENTITY: FixedMap = FixedMap {
    start: 700,
    descriptor: ModelDescriptor {
        id: 0,
        name: "CION identity",
        length: Some(5),
        fields: &[
            FieldSpec::ascii("FirmwareVersion", 0, 4),
            FieldSpec::bits16("DipSwitches", 4),
        ],
    },
};
// }}}

// Control pilot states, reported as ASCII 'A' to 'D'.
const CP_NOT_CONNECTED: u32 = 65;
const CP_CONNECTED: u32 = 66;
const CP_CHARGING: u32 = 67;
const CP_CHARGING_VENTILATED: u32 = 68;

/// Schrack CION wallbox on Modbus RTU.
#[derive(Debug)]
pub struct Cion {
    thing_id: ThingId,
    poller: FixedMapPoller,
    states: StatePublisher,
    limits: CurrentLimits,
    power: bool,
    max_charging_current: u32,
    online: bool,
    identity_pending: bool,
}

impl Cion {
    pub fn new(thing_id: ThingId, connection: Arc<Connection>, sender: crate::host::Sender) -> Self {
        let limits = CurrentLimits::default();
        Self {
            states: StatePublisher::new(thing_id.clone(), sender),
            thing_id,
            poller: FixedMapPoller::new(connection, None),
            max_charging_current: limits.min,
            limits,
            power: false,
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

    pub fn on_reachable_changed(&mut self, reachable: bool) {
        self.states.set("connected", reachable);

        if !reachable {
            self.online = false;
            return;
        }
        if self.online {
            return;
        }

        self.online = true;
        self.identity_pending = true;
        self.limits = CurrentLimits::default();
        self.limits.publish(&mut self.states);
    }

    pub async fn update(&mut self) -> Result<(), ThingError> {
        let mut maps = vec![&CONTROL, &STATUS, &LIMITS];
        if self.identity_pending {
            maps.push(&IDENTITY);
        }

        let blocks = match self.poller.poll(&maps).await {
            Ok(blocks) => blocks,
            Err(TransactionError::Timeout(after)) => {
                // the serial adapter rarely recovers without reopening the port
                warn!("{}: no reply within {:?}, reconnecting", self.thing_id, after);
                self.connection().disconnect().await;
                return Err(ThingError::HardwareFailure);
            }
            Err(e) => {
                debug!("{}: update failed: {}", self.thing_id, e);
                return Err(e.into());
            }
        };
        let [control, status, limits, ..] = blocks.as_slice() else {
            return Err(ThingError::HardwareFailure);
        };

        let mut limits_changed = false;

        let fields = Fields::new(&self.thing_id, &LIMITS.descriptor, limits);
        if let Some(min) = fields.code("MinChargingCurrent") {
            if min > DEFAULT_MAX_CHARGING_CURRENT {
                warn!("{}: ignoring implausible minimum current {} A", self.thing_id, min);
            } else if min != self.limits.min {
                self.limits.min = min;
                limits_changed = true;
            }
        }

        let fields = Fields::new(&self.thing_id, &STATUS.descriptor, status);
        if let Some(max) = fields.code("MaxChargingCurrentE3") {
            if max != 0 && max != self.limits.max {
                self.limits.max = max;
                limits_changed = true;
            }
        }
        if limits_changed {
            self.limits.publish(&mut self.states);
        }

        match fields.code("CpSignalState") {
            Some(cp) if (CP_NOT_CONNECTED..=CP_CHARGING_VENTILATED).contains(&cp) => {
                self.states.set("pluggedIn", cp >= CP_CONNECTED);
                self.states.set("charging", cp >= CP_CHARGING);
            }
            Some(cp) => debug!("{}: ignoring CP signal state {}", self.thing_id, cp),
            None => {}
        }
        if let Some(seconds) = fields.code("ChargingDuration") {
            self.states.set("chargingTime", seconds / 60);
        }
        if let Some(v) = fields.number("GridVoltage") {
            trace!("{}: grid voltage {} V", self.thing_id, v);
        }
        if let Some(bits) = fields.code("StatusBits") {
            trace!("{}: status bits {:016b}", self.thing_id, bits);
        }
        let current = fields.code("CurrentChargingCurrentE3");

        let fields = Fields::new(&self.thing_id, &CONTROL.descriptor, control);
        let enabled = fields.code("ChargingEnabled");
        let setpoint = fields.code("ChargingCurrentSetpoint");
        match (enabled, setpoint, current) {
            (Some(1), Some(setpoint), Some(current)) if setpoint > 0 => {
                self.power = true;
                if current > 0 {
                    self.max_charging_current = current;
                }
            }
            (Some(_), Some(_), _) => self.power = false,
            _ => {}
        }
        self.states.set("power", self.power);
        self.states.set("maxChargingCurrent", self.max_charging_current);

        if let Some(block) = blocks.get(3) {
            let fields = Fields::new(&self.thing_id, &IDENTITY.descriptor, block);
            if let Some(firmware) = fields.text("FirmwareVersion") {
                self.states.set("firmwareVersion", firmware);
            }
            if let Some(bits) = fields.code("DipSwitches") {
                debug!("{}: DIP switches {:016b}", self.thing_id, bits);
            }
            self.identity_pending = false;
        }

        Ok(())
    }

    pub async fn execute(&mut self, action: Action) -> Result<(), ThingError> {
        if !self.connection().is_reachable() {
            warn!("{}: cannot execute {:?}, wallbox not reachable", self.thing_id, action);
            return Err(ThingError::HardwareNotAvailable);
        }

        match action {
            Action::Power(on) => {
                if let Err(e) = self.write("ChargingEnabled", u16::from(on)).await {
                    warn!("{}: enabling charging failed: {:?}", self.thing_id, e);
                }
                let setpoint = if on { self.max_charging_current } else { 0 };
                self.write("ChargingCurrentSetpoint", setpoint as u16).await?;
                self.power = on;
                self.states.set("power", on);
            }
            Action::MaxChargingCurrent(amps) => {
                if !self.limits.contains(amps) {
                    warn!("{}: {} A is outside {:?}", self.thing_id, amps, self.limits);
                    return Err(ThingError::InvalidParameter);
                }
                if self.power {
                    self.write("ChargingCurrentSetpoint", amps as u16).await?;
                }
                self.max_charging_current = amps;
                self.states.set("maxChargingCurrent", amps);
            }
            // the wallbox cannot switch phases; this records how it is wired
            Action::DesiredPhaseCount(count) => {
                if count != 1 && count != 3 {
                    return Err(ThingError::InvalidParameter);
                }
                self.states.set("phaseCount", u32::from(count));
            }
            Action::GridCharging(_) => return Err(ThingError::UnsupportedFeature),
        }

        Ok(())
    }

    async fn write(&self, field: &str, word: u16) -> Result<(), ThingError> {
        debug!("{}: {} = {}", self.thing_id, field, word);
        self.poller
            .write(&CONTROL, field, &Value::Unsigned(u64::from(word)))
            .await
    }
}
