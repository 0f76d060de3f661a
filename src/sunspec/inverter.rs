use crate::host::StatePublisher;
use crate::prelude::*;
use crate::sunspec::discovery::DiscoveredModel;
use crate::sunspec::models::{ModelKind, Phases};
use crate::descriptor::Fields;
use crate::sunspec::ModelBlock;

use num_enum::{FromPrimitive, IntoPrimitive};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum OperatingState {
    Off = 1,
    Sleeping = 2,
    Starting = 3,
    Mppt = 4,
    Throttled = 5,
    ShuttingDown = 6,
    Fault = 7,
    Standby = 8,
    #[num_enum(catch_all)]
    Unknown(u16),
}

impl std::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "Off"),
            Self::Sleeping => write!(f, "Sleeping"),
            Self::Starting => write!(f, "Starting"),
            Self::Mppt => write!(f, "MPPT"),
            Self::Throttled => write!(f, "Throttled"),
            Self::ShuttingDown => write!(f, "Shutting down"),
            Self::Fault => write!(f, "Fault"),
            Self::Standby => write!(f, "Standby"),
            Self::Unknown(code) => write!(f, "Unknown ({})", code),
        }
    }
}

const PHASE_CURRENTS: [(&str, &str); 3] = [
    ("AphA", "phaseACurrent"),
    ("AphB", "phaseBCurrent"),
    ("AphC", "phaseCCurrent"),
];

const PHASE_VOLTAGES: [(&str, &str); 3] = [
    ("PhVphA", "voltagePhaseA"),
    ("PhVphB", "voltagePhaseB"),
    ("PhVphC", "voltagePhaseC"),
];

pub fn phase_count(phases: Phases) -> usize {
    match phases {
        Phases::Single => 1,
        Phases::Split => 2,
        Phases::Three => 3,
    }
}

/// SunSpec inverter, models 101-103 and 111-113.
#[derive(Debug)]
pub struct Inverter {
    thing_id: ThingId,
    block: ModelBlock,
    phases: Phases,
    states: StatePublisher,
}

impl Inverter {
    pub fn new(
        thing_id: ThingId,
        connection: Arc<Connection>,
        model: DiscoveredModel,
        sender: crate::host::Sender,
    ) -> Result<Self, ThingError> {
        let ModelKind::Inverter(phases) = model.id.kind() else {
            warn!("{}: model {:?} is not an inverter", thing_id, model.id);
            return Err(ThingError::InvalidParameter);
        };
        let block = ModelBlock::new(connection, model).map_err(|_| ThingError::InvalidParameter)?;

        Ok(Self {
            states: StatePublisher::new(thing_id.clone(), sender),
            thing_id,
            block,
            phases,
        })
    }

    pub fn thing_id(&self) -> &ThingId {
        &self.thing_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        self.block.connection()
    }

    pub fn model(&self) -> &DiscoveredModel {
        self.block.model()
    }

    pub fn states(&self) -> &StatePublisher {
        &self.states
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.states.set("connected", connected);
    }

    pub async fn update(&mut self) -> Result<(), ThingError> {
        let block = self.block.read().await.map_err(|e| {
            debug!("{}: read failed: {}", self.thing_id, e);
            ThingError::from(e)
        })?;
        let fields = Fields::new(&self.thing_id, self.block.descriptor(), &block);

        if let Some(v) = fields.number("A") {
            self.states.set("totalCurrent", v);
        }
        for &(field, state) in PHASE_CURRENTS.iter().take(phase_count(self.phases)) {
            if let Some(v) = fields.number(field) {
                self.states.set(state, v);
            }
        }
        for &(field, state) in PHASE_VOLTAGES.iter().take(phase_count(self.phases)) {
            if let Some(v) = fields.number(field) {
                self.states.set(state, v);
            }
        }
        if let Some(v) = fields.number("W") {
            self.states.set("currentPower", v);
        }
        if let Some(v) = fields.number("Hz") {
            self.states.set("frequency", v);
        }
        if let Some(v) = fields.number("WH") {
            self.states.set("totalEnergyProduced", v / 1000.0);
        }
        if let Some(v) = fields.number("DCW") {
            self.states.set("dcPower", v);
        }
        if let Some(v) = fields.number("TmpCab") {
            self.states.set("cabinetTemperature", v);
        }
        if let Some(code) = fields.code("St") {
            let state = OperatingState::from(code as u16);
            self.states.set("operatingState", state.to_string());
        }
        if let Some(bits) = fields.code("Evt1") {
            self.states.set("events", bits);
        }

        Ok(())
    }
}
