use crate::prelude::*;
use crate::sunspec::discovery::DiscoveredModel;
use crate::sunspec::inverter::Inverter;
use crate::sunspec::meter::Meter;
use crate::sunspec::models::ModelKind;
use crate::sunspec::storage::Storage;
use crate::wallbox::cion::Cion;
use crate::wallbox::ev11::Ev11;

use {enum_dispatch::enum_dispatch, serde::Deserialize, std::sync::Arc};

/// Actions the host can ask a thing to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "camelCase")]
pub enum Action {
    Power(bool),
    MaxChargingCurrent(u32),
    DesiredPhaseCount(u8),
    GridCharging(bool),
}

#[enum_dispatch]
pub trait DeviceInfo {
    fn thing_id(&self) -> &ThingId;
    fn connection(&self) -> &Arc<Connection>;
    fn on_reachable_changed(&mut self, reachable: bool);
}

impl DeviceInfo for Inverter {
    fn thing_id(&self) -> &ThingId {
        Inverter::thing_id(self)
    }

    fn connection(&self) -> &Arc<Connection> {
        Inverter::connection(self)
    }

    fn on_reachable_changed(&mut self, reachable: bool) {
        self.set_connected(reachable);
    }
}

impl DeviceInfo for Meter {
    fn thing_id(&self) -> &ThingId {
        Meter::thing_id(self)
    }

    fn connection(&self) -> &Arc<Connection> {
        Meter::connection(self)
    }

    fn on_reachable_changed(&mut self, reachable: bool) {
        self.set_connected(reachable);
    }
}

impl DeviceInfo for Storage {
    fn thing_id(&self) -> &ThingId {
        Storage::thing_id(self)
    }

    fn connection(&self) -> &Arc<Connection> {
        Storage::connection(self)
    }

    fn on_reachable_changed(&mut self, reachable: bool) {
        self.set_connected(reachable);
    }
}

impl DeviceInfo for Ev11 {
    fn thing_id(&self) -> &ThingId {
        Ev11::thing_id(self)
    }

    fn connection(&self) -> &Arc<Connection> {
        Ev11::connection(self)
    }

    fn on_reachable_changed(&mut self, reachable: bool) {
        Ev11::on_reachable_changed(self, reachable)
    }
}

impl DeviceInfo for Cion {
    fn thing_id(&self) -> &ThingId {
        Cion::thing_id(self)
    }

    fn connection(&self) -> &Arc<Connection> {
        Cion::connection(self)
    }

    fn on_reachable_changed(&mut self, reachable: bool) {
        Cion::on_reachable_changed(self, reachable)
    }
}

/// A polled device facade: one per model block or wallbox.
#[enum_dispatch(DeviceInfo)]
#[derive(Debug)]
pub enum Facade {
    Inverter,
    Meter,
    Storage,
    Ev11,
    Cion,
}

impl Facade {
    /// Picks the facade matching a discovered model's kind.
    pub fn for_model(
        thing_id: ThingId,
        connection: Arc<Connection>,
        model: DiscoveredModel,
        sender: crate::host::Sender,
    ) -> Result<Self, ThingError> {
        let facade = match model.id.kind() {
            ModelKind::Inverter(_) => Inverter::new(thing_id, connection, model, sender)?.into(),
            ModelKind::Meter(_) => Meter::new(thing_id, connection, model, sender)?.into(),
            ModelKind::Storage => Storage::new(thing_id, connection, model, sender)?.into(),
            ModelKind::Common => {
                warn!("{}: the common model has no facade", thing_id);
                return Err(ThingError::InvalidParameter);
            }
        };
        Ok(facade)
    }

    pub async fn update(&mut self) -> Result<(), ThingError> {
        match self {
            Self::Inverter(f) => f.update().await,
            Self::Meter(f) => f.update().await,
            Self::Storage(f) => f.update().await,
            Self::Ev11(f) => f.update().await,
            Self::Cion(f) => f.update().await,
        }
    }

    pub async fn execute(&mut self, action: Action) -> Result<(), ThingError> {
        match (self, action) {
            (Self::Storage(f), Action::GridCharging(enabled)) => f.set_grid_charging(enabled).await,
            (Self::Ev11(f), action) => f.execute(action).await,
            (Self::Cion(f), action) => f.execute(action).await,
            (facade, action) => {
                debug!("{}: {:?} is not supported", facade.thing_id(), action);
                Err(ThingError::UnsupportedFeature)
            }
        }
    }

    /// The SunSpec model this facade reads, if any.
    pub fn model(&self) -> Option<&DiscoveredModel> {
        match self {
            Self::Inverter(f) => Some(f.model()),
            Self::Meter(f) => Some(f.model()),
            Self::Storage(f) => Some(f.model()),
            Self::Ev11(_) | Self::Cion(_) => None,
        }
    }
}
