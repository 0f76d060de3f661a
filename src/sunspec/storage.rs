use crate::codec::Value;
use crate::host::StatePublisher;
use crate::prelude::*;
use crate::sunspec::discovery::DiscoveredModel;
use crate::sunspec::models::ModelKind;
use crate::descriptor::Fields;
use crate::sunspec::ModelBlock;

use num_enum::{FromPrimitive, IntoPrimitive};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ChargeStatus {
    Off = 1,
    Empty = 2,
    Discharging = 3,
    Charging = 4,
    Full = 5,
    Holding = 6,
    Testing = 7,
    #[num_enum(catch_all)]
    Unknown(u16),
}

impl std::fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "Off"),
            Self::Empty => write!(f, "Empty"),
            Self::Discharging => write!(f, "Discharging"),
            Self::Charging => write!(f, "Charging"),
            Self::Full => write!(f, "Full"),
            Self::Holding => write!(f, "Holding"),
            Self::Testing => write!(f, "Testing"),
            Self::Unknown(code) => write!(f, "Unknown ({})", code),
        }
    }
}

// ChaGriSet values
const CHARGE_FROM_PV: u16 = 0;
const CHARGE_FROM_GRID: u16 = 1;

/// SunSpec basic storage controls, model 124.
#[derive(Debug)]
pub struct Storage {
    thing_id: ThingId,
    block: ModelBlock,
    states: StatePublisher,
}

impl Storage {
    pub fn new(
        thing_id: ThingId,
        connection: Arc<Connection>,
        model: DiscoveredModel,
        sender: crate::host::Sender,
    ) -> Result<Self, ThingError> {
        if model.id.kind() != ModelKind::Storage {
            warn!("{}: model {:?} is not a storage model", thing_id, model.id);
            return Err(ThingError::InvalidParameter);
        }
        let block = ModelBlock::new(connection, model).map_err(|_| ThingError::InvalidParameter)?;

        Ok(Self {
            states: StatePublisher::new(thing_id.clone(), sender),
            thing_id,
            block,
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

        if let Some(v) = fields.number("ChaState") {
            self.states.set("batteryLevel", v);
        }
        if let Some(v) = fields.number("InBatV") {
            self.states.set("batteryVoltage", v);
        }
        if let Some(code) = fields.code("ChaSt") {
            let status = ChargeStatus::from(code as u16);
            self.states.set("chargingState", status.to_string());
        }
        if let Some(code) = fields.code("ChaGriSet") {
            self.states.set("gridCharging", code == u32::from(CHARGE_FROM_GRID));
        }

        Ok(())
    }

    pub async fn set_grid_charging(&mut self, enabled: bool) -> Result<(), ThingError> {
        let value = if enabled { CHARGE_FROM_GRID } else { CHARGE_FROM_PV };
        info!("{}: grid charging {}", self.thing_id, if enabled { "on" } else { "off" });

        self.block.write("ChaGriSet", &Value::Enum(value)).await?;
        self.states.set("gridCharging", enabled);
        Ok(())
    }
}
