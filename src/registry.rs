use crate::facade::{DeviceInfo, Facade};
use crate::network::MonitorHandle;
use crate::prelude::*;
use crate::sunspec::discovery::{CommonInfo, DiscoveredModel};

use {
    std::collections::HashMap,
    std::sync::Arc,
    tokio::task::JoinHandle,
};

struct Monitor {
    handle: MonitorHandle,
    forwarder: JoinHandle<()>,
}

/// What `Registry::remove` handed back for the caller to shut down.
#[derive(Default)]
pub struct Removed {
    /// No facade uses these any more; close them.
    pub connections: Vec<Arc<Connection>>,
    pub monitor: Option<MonitorHandle>,
}

/// Everything one plugin owns, keyed by thing id.
#[derive(Default)]
pub struct Registry {
    things: HashMap<ThingId, Thing>,
    connections: HashMap<ThingId, Arc<Connection>>,
    facades: HashMap<ThingId, Facade>,
    models: HashMap<ThingId, Vec<DiscoveredModel>>,
    common: HashMap<ThingId, CommonInfo>,
    monitors: HashMap<ThingId, Monitor>,
    reconnects: HashMap<ThingId, JoinHandle<()>>,
    // removed from their owner but still read by a facade
    detached: Vec<Arc<Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.things.is_empty()
    }

    // Things {{{
    pub fn add_thing(&mut self, thing: Thing) {
        self.things.insert(thing.id.clone(), thing);
    }

    pub fn thing(&self, id: &ThingId) -> Option<&Thing> {
        self.things.get(id)
    }

    pub fn things(&self) -> impl Iterator<Item = &Thing> {
        self.things.values()
    }

    pub fn children(&self, parent: &ThingId) -> Vec<ThingId> {
        self.things
            .values()
            .filter(|t| t.parent.as_ref() == Some(parent))
            .map(|t| t.id.clone())
            .collect()
    }
    // }}}

    // Connections {{{
    pub fn insert_connection(&mut self, owner: ThingId, connection: Arc<Connection>) {
        self.connections.insert(owner, connection);
    }

    pub fn connection(&self, owner: &ThingId) -> Option<&Arc<Connection>> {
        self.connections.get(owner)
    }

    pub fn connections(&self) -> impl Iterator<Item = (&ThingId, &Arc<Connection>)> {
        self.connections.iter()
    }

    /// The thing owning `connection`.
    pub fn owner_of(&self, connection: &ThingId) -> Option<&ThingId> {
        self.connections
            .iter()
            .find(|(_, c)| c.id() == connection)
            .map(|(owner, _)| owner)
    }

    /// Replaces a pending reconnect for `owner`, aborting the old one.
    pub fn set_reconnect(&mut self, owner: ThingId, task: JoinHandle<()>) {
        if let Some(previous) = self.reconnects.insert(owner, task) {
            previous.abort();
        }
    }

    pub fn cancel_reconnect(&mut self, owner: &ThingId) {
        if let Some(task) = self.reconnects.remove(owner) {
            task.abort();
        }
    }

    pub fn reconnect_pending(&self, owner: &ThingId) -> bool {
        self.reconnects.get(owner).is_some_and(|t| !t.is_finished())
    }
    // }}}

    // Facades {{{
    pub fn insert_facade(&mut self, facade: Facade) {
        self.facades.insert(facade.thing_id().clone(), facade);
    }

    pub fn facade_mut(&mut self, id: &ThingId) -> Option<&mut Facade> {
        self.facades.get_mut(id)
    }

    pub fn facades_mut(&mut self) -> impl Iterator<Item = &mut Facade> {
        self.facades.values_mut()
    }

    pub fn has_facade(&self, id: &ThingId) -> bool {
        self.facades.contains_key(id)
    }
    // }}}

    // Discovery results {{{
    pub fn set_models(&mut self, owner: ThingId, models: Vec<DiscoveredModel>) {
        self.models.insert(owner, models);
    }

    pub fn models(&self, owner: &ThingId) -> Option<&[DiscoveredModel]> {
        self.models.get(owner).map(Vec::as_slice)
    }

    pub fn set_common(&mut self, owner: ThingId, common: CommonInfo) {
        self.common.insert(owner, common);
    }

    pub fn common(&self, owner: &ThingId) -> Option<&CommonInfo> {
        self.common.get(owner)
    }

    /// A child already exists for the model at `start` under `parent`.
    pub fn has_child_for(&self, parent: &ThingId, model_id: u16, start: u16) -> bool {
        self.things.values().any(|t| {
            t.parent.as_ref() == Some(parent)
                && matches!(t.params, ThingParams::SunSpecModel { model_id: m, start: s, .. } if m == model_id && s == start)
        })
    }
    // }}}

    // Monitors {{{
    pub fn set_monitor(&mut self, id: ThingId, handle: MonitorHandle, forwarder: JoinHandle<()>) {
        if let Some(previous) = self.monitors.insert(id, Monitor { handle, forwarder }) {
            previous.forwarder.abort();
        }
    }

    pub fn monitor(&self, id: &ThingId) -> Option<&MonitorHandle> {
        self.monitors.get(id).map(|m| &m.handle)
    }
    // }}}

    /// Forgets `id`. Connections come back only once no facade reads them,
    /// so a parent's connection outlives it until its last child is removed.
    pub fn remove(&mut self, id: &ThingId) -> Removed {
        let mut removed = Removed::default();

        self.things.remove(id);
        self.facades.remove(id);
        self.models.remove(id);
        self.common.remove(id);
        if let Some(task) = self.reconnects.remove(id) {
            task.abort();
        }
        if let Some(monitor) = self.monitors.remove(id) {
            monitor.forwarder.abort();
            removed.monitor = Some(monitor.handle);
        }
        if let Some(connection) = self.connections.remove(id) {
            self.detached.push(connection);
        }

        let (unused, used): (Vec<_>, Vec<_>) = self
            .detached
            .drain(..)
            .partition(|c| !self.facades.values().any(|f| Arc::ptr_eq(f.connection(), c)));
        self.detached = used;
        removed.connections = unused;

        removed
    }
}
