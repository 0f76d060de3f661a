use crate::host::StatePublisher;
use crate::prelude::*;
use crate::sunspec::discovery::DiscoveredModel;
use crate::sunspec::inverter::phase_count;
use crate::sunspec::models::{ModelKind, Phases};
use crate::descriptor::Fields;
use crate::sunspec::ModelBlock;

use std::sync::Arc;

const PER_PHASE: [(&str, &str); 9] = [
    ("AphA", "currentPhaseA"),
    ("AphB", "currentPhaseB"),
    ("AphC", "currentPhaseC"),
    ("PhVphA", "voltagePhaseA"),
    ("PhVphB", "voltagePhaseB"),
    ("PhVphC", "voltagePhaseC"),
    ("WphA", "currentPowerPhaseA"),
    ("WphB", "currentPowerPhaseB"),
    ("WphC", "currentPowerPhaseC"),
];

/// SunSpec meter, models 201-204 and 211-214.
#[derive(Debug)]
pub struct Meter {
    thing_id: ThingId,
    block: ModelBlock,
    phases: Phases,
    states: StatePublisher,
}

impl Meter {
    pub fn new(
        thing_id: ThingId,
        connection: Arc<Connection>,
        model: DiscoveredModel,
        sender: crate::host::Sender,
    ) -> Result<Self, ThingError> {
        let ModelKind::Meter(phases) = model.id.kind() else {
            warn!("{}: model {:?} is not a meter", thing_id, model.id);
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

    pub fn set_connected(&mut self, connected: bool) {
        self.states.set("connected", connected);
    }

    pub async fn update(&mut self) -> Result<(), ThingError> {
        let block = self.block.read().await.map_err(|e| {
            debug!("{}: read failed: {}", self.thing_id, e);
            ThingError::from(e)
        })?;
        let fields = Fields::new(&self.thing_id, self.block.descriptor(), &block);
        let phases = phase_count(self.phases);

        if let Some(v) = fields.number("A") {
            self.states.set("totalCurrent", v);
        }
        if let Some(v) = fields.number("W") {
            self.states.set("currentPower", v);
        }
        if let Some(v) = fields.number("Hz") {
            self.states.set("frequency", v);
        }
        for chunk in PER_PHASE.chunks(3) {
            for &(field, state) in chunk.iter().take(phases) {
                if let Some(v) = fields.number(field) {
                    self.states.set(state, v);
                }
            }
        }
        if let Some(v) = fields.number("TotWhExp") {
            self.states.set("totalEnergyProduced", v / 1000.0);
        }
        if let Some(v) = fields.number("TotWhImp") {
            self.states.set("totalEnergyConsumed", v / 1000.0);
        }
        if let Some(bits) = fields.code("Evt") {
            self.states.set("events", bits);
        }

        Ok(())
    }
}
