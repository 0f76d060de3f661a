use crate::channels::respond;
use crate::codec::RegisterBlock;
use crate::config::PluginSettings;
use crate::connection::TransactionSettings;
use crate::descriptor::Fields;
use crate::facade::{Action, DeviceInfo, Facade};
use crate::host::{Family, StatePublisher};
use crate::network::{NetworkDiscovery, NetworkMonitor};
use crate::prelude::*;
use crate::registry::{Registry, Removed};
use crate::scheduler::PollScheduler;
use crate::setup::{PendingSetup, SetupEvent, SetupReceiver, SetupSender, SetupState};
use crate::sunspec::discovery::{self, DiscoveryResult};
use crate::sunspec::models::{ModelKind, Phases};
use crate::transport::{Link, ModbusTransport, Transport};
use crate::wallbox::{cion::Cion, ev11, ev11::Ev11};

use {
    futures::future::join_all,
    std::collections::HashMap,
    std::sync::Arc,
    std::time::Duration,
    tokio_util::sync::CancellationToken,
};

const MODBUS_PORT: u16 = 502;
const DEFAULT_SLAVE_ID: u8 = 1;

/// What the host tells plugins.
#[derive(Clone, Debug)]
pub enum ChannelData {
    SetupThing(Thing, bool),
    PostSetup(ThingId),
    AbortSetup(ThingId),
    ThingRemoved(ThingId),
    ExecuteAction(ThingId, Action, Responder<std::result::Result<(), ThingError>>),
    DiscoverThings(ThingClass, Responder<std::result::Result<Vec<ThingDescriptor>, ThingError>>),
    ConfigurationChanged(Family, PluginSettings),
    Shutdown,
}

// TransportFactory {{{
/// Builds the link for a connection thing.
pub trait TransportFactory: Send + Sync {
    fn create(&self, thing: &Thing) -> std::result::Result<Box<dyn Transport>, ThingError>;
}

pub struct ModbusTransportFactory;

impl TransportFactory for ModbusTransportFactory {
    fn create(&self, thing: &Thing) -> std::result::Result<Box<dyn Transport>, ThingError> {
        let (link, slave) = match &thing.params {
            ThingParams::SunSpecConnection {
                address,
                port,
                slave_id,
                ..
            } => (
                Link::Tcp {
                    host: address.clone(),
                    port: *port,
                    nodelay: true,
                },
                *slave_id,
            ),
            ThingParams::Ev11 { address, .. } => (
                Link::Tcp {
                    host: address.clone(),
                    port: MODBUS_PORT,
                    nodelay: true,
                },
                DEFAULT_SLAVE_ID,
            ),
            ThingParams::Cion {
                serial_port,
                slave_id,
                baud_rate,
                parity,
                data_bits,
                stop_bits,
            } => (
                Link::Rtu {
                    path: serial_port.clone(),
                    baud_rate: *baud_rate,
                    parity: *parity,
                    data_bits: *data_bits,
                    stop_bits: *stop_bits,
                },
                *slave_id,
            ),
            ThingParams::SunSpecModel { .. } => {
                warn!("{}: model things share their parent's connection", thing.id);
                return Err(ThingError::InvalidParameter);
            }
        };

        Ok(Box::new(ModbusTransport::new(link, slave)))
    }
} // }}}

/// Runs every thing of one device family: setup, polling, actions and
/// reconnects, all from a single task.
pub struct Plugin {
    family: Family,
    channels: Channels,
    factory: Arc<dyn TransportFactory>,
    discovery: Arc<dyn NetworkDiscovery>,
    monitor: Arc<dyn NetworkMonitor>,
    settings: PluginSettings,

    registry: Registry,
    setups: HashMap<ThingId, PendingSetup>,
    connection_states: HashMap<ThingId, StatePublisher>,
    scheduler: PollScheduler,
    shutdown: CancellationToken,

    receiver: broadcast::Receiver<ChannelData>,
    events: broadcast::Sender<ConnectionEvent>,
    setup_tx: SetupSender,
    setup_rx: SetupReceiver,
    monitor_tx: mpsc::UnboundedSender<(ThingId, bool)>,
    monitor_rx: mpsc::UnboundedReceiver<(ThingId, bool)>,
}

impl Plugin {
    pub fn new(
        family: Family,
        config: &ConfigWrapper,
        channels: Channels,
        factory: Arc<dyn TransportFactory>,
        discovery: Arc<dyn NetworkDiscovery>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Self {
        let settings = config.settings(family);
        let (setup_tx, setup_rx) = mpsc::unbounded_channel();
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();

        Self {
            family,
            receiver: channels.to_plugin.subscribe(),
            channels,
            factory,
            discovery,
            monitor,
            scheduler: PollScheduler::new(settings.update_interval),
            settings,
            registry: Registry::new(),
            setups: HashMap::new(),
            connection_states: HashMap::new(),
            shutdown: CancellationToken::new(),
            events: broadcast::channel(256).0,
            setup_tx,
            setup_rx,
            monitor_tx,
            monitor_rx,
        }
    }

    pub async fn start(mut self) -> Result<()> {
        let mut events = self.events.subscribe();

        info!("{:?} plugin started", self.family);

        loop {
            tokio::select! {
                _ = self.scheduler.tick() => self.poll().await,
                message = self.receiver.recv() => match message {
                    Ok(ChannelData::Shutdown) => break,
                    Ok(data) => self.handle(data).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("{:?} plugin lagged by {} messages", self.family, n),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Ok(event) = events.recv() => self.on_connection_event(event).await,
                Some(event) = self.setup_rx.recv() => self.on_setup_event(event).await,
                Some((id, reachable)) = self.monitor_rx.recv() => self.on_monitor_event(id, reachable).await,
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn stop(&mut self) {
        info!("{:?} plugin stopping", self.family);
        self.shutdown.cancel();
        self.scheduler.stop();

        for (_, mut setup) in self.setups.drain() {
            setup.abort();
        }
        let ids: Vec<ThingId> = self.registry.things().map(|t| t.id.clone()).collect();
        for id in ids {
            let removed = self.registry.remove(&id);
            self.release(removed).await;
        }
    }

    fn owns(&self, id: &ThingId) -> bool {
        self.registry.thing(id).is_some() || self.setups.contains_key(id)
    }

    fn notify(&self, data: crate::host::ChannelData) {
        if let Err(e) = self.channels.from_plugin.send(data) {
            debug!("nobody listening: {}", e);
        }
    }

    fn host_sender(&self) -> crate::host::Sender {
        self.channels.from_plugin.clone()
    }

    async fn handle(&mut self, data: ChannelData) {
        match data {
            ChannelData::SetupThing(thing, initial) if thing.class.family() == self.family => {
                debug!("{}: setting up ({})", thing.id, if initial { "initial" } else { "new" });
                self.setup_thing(thing);
            }
            ChannelData::PostSetup(id) if self.owns(&id) => self.post_setup(&id),
            ChannelData::AbortSetup(id) if self.owns(&id) => self.abort_setup(&id).await,
            ChannelData::ThingRemoved(id) if self.owns(&id) => self.remove_thing(&id).await,
            ChannelData::ExecuteAction(id, action, responder) if self.owns(&id) => {
                let result = self.execute(&id, action).await;
                respond(&responder, result);
                self.notify(crate::host::ChannelData::ActionFinished(id, result));
            }
            ChannelData::DiscoverThings(class, responder) if class.family() == self.family => {
                self.discover_things(class, responder);
            }
            ChannelData::ConfigurationChanged(family, settings) if family == self.family => {
                self.apply_settings(settings);
            }
            _ => {}
        }
    }

    // Setup {{{
    fn setup_thing(&mut self, thing: Thing) {
        if self.owns(&thing.id) {
            warn!("{}: already set up", thing.id);
            return;
        }

        if let ThingParams::SunSpecModel { .. } = thing.params {
            self.setup_child(thing);
            return;
        }

        let transport = match self.factory.create(&thing) {
            Ok(transport) => transport,
            Err(e) => {
                self.notify(crate::host::ChannelData::SetupFinished(thing.id, Err(e)));
                return;
            }
        };
        let id = thing.id.clone();
        let connection = Connection::new(id.clone(), transport, self.settings.transaction(), self.events.clone());

        match thing.class {
            ThingClass::Ev11 => {
                let facade = Ev11::new(id.clone(), connection.clone(), self.settings.watchdog_interval, self.host_sender());
                self.registry.insert_facade(facade.into());
            }
            ThingClass::Cion => {
                let facade = Cion::new(id.clone(), connection.clone(), self.host_sender());
                self.registry.insert_facade(facade.into());
            }
            _ => {
                self.connection_states
                    .insert(id.clone(), StatePublisher::new(id.clone(), self.host_sender()));
            }
        }

        if let Some(mac) = thing.params.mac() {
            let handle = self.monitor.register(mac);
            let forwarder = handle.forward(id.clone(), self.monitor_tx.clone());
            self.registry.set_monitor(id.clone(), handle, forwarder);
        }

        self.registry.add_thing(thing.clone());
        self.registry.insert_connection(id.clone(), connection.clone());

        let mut setup = PendingSetup::new(thing);
        setup.set_deadline(self.settings.setup_timeout, self.setup_tx.clone());
        if self.registry.monitor(&id).map_or(true, |m| m.is_reachable()) {
            Self::start_connect(&mut setup, connection, Duration::ZERO, self.setup_tx.clone());
        } else {
            info!("{}: not on the network yet, waiting for it", id);
        }
        self.setups.insert(id, setup);
    }

    /// Connects after `delay` in the background and reports back as `Connected`.
    fn start_connect(setup: &mut PendingSetup, connection: Arc<Connection>, delay: Duration, tx: SetupSender) {
        let (cancel, id) = (setup.cancel_token(), setup.thing().id.clone());
        setup.set_task(tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = async {
                    tokio::time::sleep(delay).await;
                    connection.connect().await
                } => result,
            };
            let _ = tx.send(SetupEvent::Connected(id, result));
        }));
    }

    fn setup_child(&mut self, thing: Thing) {
        let Some(parent) = thing.parent.clone() else {
            warn!("{}: model thing without parent", thing.id);
            self.notify(crate::host::ChannelData::SetupFinished(thing.id, Err(ThingError::InvalidParameter)));
            return;
        };

        if self.setups.contains_key(&parent) || self.registry.models(&parent).is_none() {
            debug!("{}: waiting for {} to finish setting up", thing.id, parent);
            let setup = PendingSetup::waiting_for(thing, parent);
            self.setups.insert(setup.thing().id.clone(), setup);
            return;
        }

        let id = thing.id.clone();
        let result = self.finish_child(thing);
        self.notify(crate::host::ChannelData::SetupFinished(id, result));
    }

    fn finish_child(&mut self, thing: Thing) -> std::result::Result<(), ThingError> {
        let ThingParams::SunSpecModel { model_id, start, .. } = thing.params else {
            return Err(ThingError::InvalidParameter);
        };
        let Some(parent) = thing.parent.as_ref() else {
            return Err(ThingError::InvalidParameter);
        };

        let model = self
            .registry
            .models(parent)
            .and_then(|models| models.iter().find(|m| m.is(model_id, start)))
            .cloned();
        let (Some(model), Some(connection)) = (model, self.registry.connection(parent).cloned()) else {
            warn!("{}: model {} at {} is gone from {}", thing.id, model_id, start, parent);
            return Err(ThingError::HardwareNotAvailable);
        };

        let mut facade = Facade::for_model(thing.id.clone(), connection.clone(), model, self.host_sender())?;
        facade.on_reachable_changed(connection.is_reachable());

        info!("{}: set up", thing.id);
        self.registry.add_thing(thing);
        self.registry.insert_facade(facade);
        Ok(())
    }

    async fn on_setup_event(&mut self, event: SetupEvent) {
        let id = event.thing_id().clone();

        let Some(setup) = self.setups.get_mut(&id).filter(|s| !s.is_cancelled()) else {
            match event {
                SetupEvent::Discovered(id, Ok(result)) if self.registry.connection(&id).is_some() => {
                    self.rediscovered(&id, result)
                }
                _ => debug!("{}: dropping late setup result", id),
            }
            return;
        };

        match event {
            // with a monitor the device may still be booting, keep trying until the deadline
            SetupEvent::Connected(_, Err(e)) if self.registry.monitor(&id).is_some() => {
                let Some(connection) = self.registry.connection(&id).cloned() else {
                    return;
                };
                if self.registry.monitor(&id).is_some_and(|m| m.is_reachable()) {
                    let delay = self.settings.reconnect_delay;
                    info!("{}: cannot connect yet: {}, retrying in {:?}", id, e, delay);
                    Self::start_connect(setup, connection, delay, self.setup_tx.clone());
                } else {
                    info!("{}: cannot connect: {}, waiting for the device", id, e);
                    setup.park();
                }
            }
            SetupEvent::Connected(_, Err(e)) => {
                warn!("{}: cannot connect: {}", id, e);
                self.fail_setup(&id, ThingError::HardwareNotAvailable).await;
            }
            SetupEvent::Connected(_, Ok(())) if setup.thing().class.is_connection() => {
                let base_register = match setup.thing().params {
                    ThingParams::SunSpecConnection { base_register, .. } => base_register,
                    _ => discovery::DEFAULT_BASE_REGISTER,
                };
                if let Err(e) = setup.advance(SetupState::Discovering) {
                    error!("{}", e);
                    return;
                }
                let Some(connection) = self.registry.connection(&id).cloned() else {
                    return;
                };

                let (cancel, tx) = (setup.cancel_token(), self.setup_tx.clone());
                setup.set_task(tokio::spawn(async move {
                    let result = discovery::discover(&connection, base_register, &cancel).await;
                    if !cancel.is_cancelled() {
                        let _ = tx.send(SetupEvent::Discovered(connection.id().clone(), result));
                    }
                }));
            }
            SetupEvent::Connected(_, Ok(())) => {
                if let Err(e) = setup.advance(SetupState::Complete) {
                    error!("{}", e);
                }
                self.setups.remove(&id);
                info!("{}: set up", id);
                self.notify(crate::host::ChannelData::SetupFinished(id, Ok(())));
            }
            SetupEvent::Discovered(_, Err(e)) => {
                warn!("{}: discovery failed: {}", id, e);
                self.fail_setup(&id, ThingError::from(e)).await;
            }
            SetupEvent::Discovered(_, Ok(result)) => {
                if let Err(e) = setup.advance(SetupState::InstantiatingChildren) {
                    error!("{}", e);
                    return;
                }
                info!(
                    "{}: {} {} with {} models",
                    id,
                    result.common.manufacturer,
                    result.common.model,
                    result.models.len()
                );

                self.registry.set_models(id.clone(), result.models.clone());
                self.registry.set_common(id.clone(), result.common.clone());
                self.notify(crate::host::ChannelData::SetupFinished(id.clone(), Ok(())));
                self.publish_common(&id, &result);
                self.announce_children(&id);

                if let Some(mut setup) = self.setups.remove(&id) {
                    if let Err(e) = setup.advance(SetupState::Complete) {
                        error!("{}", e);
                    }
                }
                self.resume_children(&id);
            }
            SetupEvent::Reachable(_, true) => {
                if setup.state() != SetupState::WaitingReachable || setup.is_busy() {
                    return;
                }
                let Some(connection) = self.registry.connection(&id).cloned() else {
                    return;
                };
                if !connection.is_reachable() {
                    info!("{}: on the network, connecting", id);
                    Self::start_connect(setup, connection, Duration::ZERO, self.setup_tx.clone());
                }
            }
            SetupEvent::Reachable(_, false) => {
                if setup.state() == SetupState::WaitingReachable {
                    debug!("{}: gone from the network before connecting", id);
                    setup.park();
                }
            }
            SetupEvent::TimedOut(_) => {
                warn!("{}: not set up within {:?}", id, self.settings.setup_timeout);
                self.fail_setup(&id, ThingError::HardwareNotAvailable).await;
            }
        }
    }

    async fn fail_setup(&mut self, id: &ThingId, error: ThingError) {
        if let Some(mut setup) = self.setups.remove(id) {
            if let Err(e) = setup.advance(SetupState::Failed(error)) {
                debug!("{}", e);
            }
            setup.abort();
        }

        let removed = self.registry.remove(id);
        self.connection_states.remove(id);
        self.release(removed).await;
        self.notify(crate::host::ChannelData::SetupFinished(id.clone(), Err(error)));

        // children waiting on this thing cannot find their model now
        let waiting: Vec<ThingId> = self
            .setups
            .iter()
            .filter(|(_, s)| s.parent() == Some(id))
            .map(|(child, _)| child.clone())
            .collect();
        for child in waiting {
            if let Some(mut setup) = self.setups.remove(&child) {
                let _ = setup.advance(SetupState::Failed(ThingError::HardwareNotAvailable));
            }
            self.notify(crate::host::ChannelData::SetupFinished(child, Err(ThingError::HardwareNotAvailable)));
        }
    }

    fn resume_children(&mut self, parent: &ThingId) {
        let waiting: Vec<ThingId> = self
            .setups
            .iter()
            .filter(|(_, s)| s.parent() == Some(parent))
            .map(|(child, _)| child.clone())
            .collect();

        for child in waiting {
            let Some(mut setup) = self.setups.remove(&child) else {
                continue;
            };
            let result = self.finish_child(setup.thing().clone());
            let state = match result {
                Ok(()) => SetupState::Complete,
                Err(e) => SetupState::Failed(e),
            };
            if let Err(e) = setup.advance(state) {
                debug!("{}", e);
            }
            self.notify(crate::host::ChannelData::SetupFinished(child, result));
        }
    }

    async fn abort_setup(&mut self, id: &ThingId) {
        let Some(mut setup) = self.setups.remove(id) else {
            return;
        };
        info!("{}: setup aborted in {:?}", id, setup.state());
        setup.abort();

        let removed = self.registry.remove(id);
        self.connection_states.remove(id);
        self.release(removed).await;
    }

    fn post_setup(&mut self, id: &ThingId) {
        debug!("{}: post setup", id);
        self.scheduler.set_period(self.settings.update_interval);
        self.scheduler.start();
    }
    // }}}

    // Children {{{
    fn publish_common(&mut self, id: &ThingId, result: &DiscoveryResult) {
        let Some(states) = self.connection_states.get_mut(id) else {
            return;
        };
        let connected = self.registry.connection(id).is_some_and(|c| c.is_reachable());

        states.set("connected", connected);
        states.set("manufacturer", result.common.manufacturer.as_str());
        states.set("deviceModel", result.common.model.as_str());
        states.set("version", result.common.version.as_str());
        states.set("serialNumber", result.common.serial_number.as_str());
    }

    /// Offers a child thing for every model no child exists for yet.
    fn announce_children(&self, parent: &ThingId) {
        let Some(models) = self.registry.models(parent) else {
            return;
        };
        let device = self.registry.common(parent).map(|c| c.model.clone()).unwrap_or_default();

        let descriptors: Vec<ThingDescriptor> = models
            .iter()
            .filter_map(|model| {
                let (class, kind) = match model.id.kind() {
                    ModelKind::Common => return None,
                    ModelKind::Inverter(Phases::Single) => (ThingClass::SunSpecSinglePhaseInverter, "Single Phase Inverter"),
                    ModelKind::Inverter(Phases::Split) => (ThingClass::SunSpecSplitPhaseInverter, "Split Phase Inverter"),
                    ModelKind::Inverter(Phases::Three) => (ThingClass::SunSpecThreePhaseInverter, "Three Phase Inverter"),
                    ModelKind::Meter(Phases::Single) => (ThingClass::SunSpecSinglePhaseMeter, "Single Phase Meter"),
                    ModelKind::Meter(Phases::Split) => (ThingClass::SunSpecSplitPhaseMeter, "Split Phase Meter"),
                    ModelKind::Meter(Phases::Three) => (ThingClass::SunSpecThreePhaseMeter, "Three Phase Meter"),
                    ModelKind::Storage => (ThingClass::SunSpecStorage, "Storage"),
                };
                let model_id = u16::from(model.id);
                if self.child_known(parent, model_id, model.start) {
                    return None;
                }

                Some(ThingDescriptor {
                    class,
                    title: format!("{} {}", device, kind).trim().to_string(),
                    description: format!("SunSpec model {} at register {}", model_id, model.start),
                    parent_id: Some(parent.clone()),
                    params: ThingParams::SunSpecModel {
                        model_id,
                        start: model.start,
                        length: model.length,
                    },
                    thing_id: None,
                })
            })
            .collect();

        if !descriptors.is_empty() {
            info!("{}: offering {} new model things", parent, descriptors.len());
            self.notify(crate::host::ChannelData::AutoThingsAppeared(descriptors));
        }
    }

    fn child_known(&self, parent: &ThingId, model_id: u16, start: u16) -> bool {
        self.registry.has_child_for(parent, model_id, start)
            || self.setups.values().any(|s| {
                s.parent() == Some(parent)
                    && matches!(s.thing().params, ThingParams::SunSpecModel { model_id: m, start: s, .. } if m == model_id && s == start)
            })
    }

    /// Models found again after a reconnect. Known models stay as they are,
    /// only new ones are added and offered.
    fn rediscovered(&mut self, id: &ThingId, result: DiscoveryResult) {
        let mut models = self.registry.models(id).map(<[_]>::to_vec).unwrap_or_default();
        let before = models.len();
        for model in result.models.iter() {
            if !models.iter().any(|m| m.is(model.id.into(), model.start)) {
                models.push(model.clone());
            }
        }
        debug!("{}: rediscovered, {} new models", id, models.len() - before);

        self.registry.set_models(id.clone(), models);
        self.registry.set_common(id.clone(), result.common.clone());
        self.publish_common(id, &result);
        self.announce_children(id);
        self.resume_children(id);
    }
    // }}}

    // Polling and actions {{{
    async fn poll(&mut self) {
        let updates: Vec<_> = self
            .registry
            .facades_mut()
            .filter(|f| f.connection().is_reachable())
            .map(|f| async move {
                let result = f.update().await;
                (f.thing_id().clone(), result)
            })
            .collect();

        for (id, result) in join_all(updates).await {
            if let Err(e) = result {
                debug!("{}: update failed: {:?}", id, e);
            }
        }
    }

    async fn execute(&mut self, id: &ThingId, action: Action) -> std::result::Result<(), ThingError> {
        let Some(facade) = self.registry.facade_mut(id) else {
            warn!("{}: no device to execute {:?} on", id, action);
            return Err(ThingError::ThingNotFound);
        };

        info!("{}: executing {:?}", id, action);
        facade.execute(action).await
    }

    fn apply_settings(&mut self, settings: PluginSettings) {
        info!("{:?} plugin settings changed", self.family);

        self.scheduler.set_period(settings.update_interval);
        for (_, connection) in self.registry.connections() {
            connection.set_settings(settings.transaction());
        }
        for facade in self.registry.facades_mut() {
            if let Facade::Ev11(ev11) = facade {
                ev11.set_watchdog_interval(settings.watchdog_interval);
            }
        }
        self.settings = settings;
    }
    // }}}

    // Connection lifecycle {{{
    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        let ConnectionEvent::ReachableChanged(id, reachable) = event;
        let Some(connection) = self.registry.connection(&id).cloned() else {
            return;
        };

        for facade in self.registry.facades_mut() {
            if Arc::ptr_eq(facade.connection(), &connection) {
                facade.on_reachable_changed(reachable);
            }
        }
        if let Some(states) = self.connection_states.get_mut(&id) {
            states.set("connected", reachable);
        }

        // setup deals with its own connection
        if self.setups.contains_key(&id) {
            return;
        }

        if reachable {
            self.registry.cancel_reconnect(&id);
            if let Some(ThingParams::SunSpecConnection { base_register, .. }) =
                self.registry.thing(&id).map(|t| t.params.clone())
            {
                self.rediscover(connection, base_register);
            }
            return;
        }

        if connection.is_closed() {
            return;
        }
        if self.registry.monitor(&id).is_some_and(|m| !m.is_reachable()) {
            info!("{}: device gone from the network, waiting for it", id);
            return;
        }
        info!("{}: connection lost, reconnecting in {:?}", id, self.settings.reconnect_delay);
        let task = tokio::spawn(connection.reconnect_after(self.settings.reconnect_delay));
        self.registry.set_reconnect(id, task);
    }

    fn rediscover(&self, connection: Arc<Connection>, base_register: u16) {
        let (cancel, tx) = (self.shutdown.child_token(), self.setup_tx.clone());
        tokio::spawn(async move {
            let result = discovery::discover(&connection, base_register, &cancel).await;
            let _ = tx.send(SetupEvent::Discovered(connection.id().clone(), result));
        });
    }

    async fn on_monitor_event(&mut self, id: ThingId, reachable: bool) {
        if self.setups.contains_key(&id) {
            self.on_setup_event(SetupEvent::Reachable(id, reachable)).await;
            return;
        }

        let Some(connection) = self.registry.connection(&id).cloned() else {
            return;
        };

        if reachable {
            if !connection.is_reachable() && !self.registry.reconnect_pending(&id) {
                info!("{}: device is back on the network", id);
                let task = tokio::spawn(connection.reconnect_after(self.settings.reconnect_delay));
                self.registry.set_reconnect(id, task);
            }
        } else {
            self.registry.cancel_reconnect(&id);
            if connection.is_reachable() {
                connection.disconnect().await;
            }
        }
    }

    async fn remove_thing(&mut self, id: &ThingId) {
        info!("{}: removed", id);
        if let Some(mut setup) = self.setups.remove(id) {
            setup.abort();
        }

        let mut removed = vec![self.registry.remove(id)];
        for child in self.registry.children(id) {
            removed.push(self.registry.remove(&child));
        }
        self.connection_states.remove(id);
        for removed in removed {
            self.release(removed).await;
        }

        if self.registry.is_empty() {
            self.scheduler.stop();
        }
    }

    async fn release(&self, removed: Removed) {
        if let Some(handle) = removed.monitor {
            self.monitor.unregister(handle.mac());
        }
        for connection in removed.connections {
            connection.close().await;
        }
    }
    // }}}

    // Discovery {{{
    fn discover_things(
        &self,
        class: ThingClass,
        responder: Responder<std::result::Result<Vec<ThingDescriptor>, ThingError>>,
    ) {
        let known: Vec<(String, ThingId)> = self
            .registry
            .things()
            .filter_map(|t| t.params.mac().map(|mac| (mac.to_lowercase(), t.id.clone())))
            .collect();
        let discovery = self.discovery.clone();
        let identifier = Ev11Identifier {
            factory: self.factory.clone(),
            settings: TransactionSettings {
                timeout: self.settings.timeout,
                retries: 0,
            },
            cancel: self.shutdown.child_token(),
        };

        tokio::spawn(async move {
            let devices = match class {
                ThingClass::SunSpecConnection | ThingClass::SolarEdgeConnection | ThingClass::Ev11 => {
                    discovery.discover().await.map_err(|e| {
                        warn!("network discovery failed: {}", e);
                        ThingError::HardwareNotAvailable
                    })
                }
                _ => Err(ThingError::UnsupportedFeature),
            };

            let result = match devices {
                Ok(devices) if class == ThingClass::Ev11 => Ok(identifier.identify_all(devices, &known).await),
                Ok(devices) => Ok(network_descriptors(class, &devices, &known)),
                Err(e) => Err(e),
            };
            if let Ok(found) = &result {
                info!("discovery found {} {:?} things", found.len(), class);
            }
            respond(&responder, result);
        });
    }
    // }}}
}

fn existing(known: &[(String, ThingId)], mac: &str) -> Option<ThingId> {
    let mac = mac.to_lowercase();
    known
        .iter()
        .find(|(candidate, _)| !mac.is_empty() && *candidate == mac)
        .map(|(_, id)| id.clone())
}

/// Offers SunSpec connections straight from the network inventory. Nothing is
/// read from the devices; SolarEdge only keeps devices whose MAC vendor says so.
fn network_descriptors(
    class: ThingClass,
    devices: &[crate::config::NetworkDevice],
    known: &[(String, ThingId)],
) -> Vec<ThingDescriptor> {
    devices
        .iter()
        .filter_map(|device| {
            let title = match (class, device.hostname.is_empty()) {
                (ThingClass::SolarEdgeConnection, _) if !device.manufacturer.to_lowercase().contains("solaredge") => {
                    return None;
                }
                (ThingClass::SolarEdgeConnection, true) => format!("SolarEdge ({})", device.address),
                (_, true) => device.address.clone(),
                (_, false) => format!("{} ({})", device.address, device.hostname),
            };
            let description = if device.manufacturer.is_empty() {
                device.mac.clone()
            } else {
                format!("{} ({})", device.mac, device.manufacturer)
            };

            Some(ThingDescriptor {
                class,
                title,
                description,
                parent_id: None,
                thing_id: existing(known, &device.mac),
                params: ThingParams::SunSpecConnection {
                    address: device.address.clone(),
                    port: MODBUS_PORT,
                    slave_id: DEFAULT_SLAVE_ID,
                    mac: (!device.mac.is_empty()).then(|| device.mac.clone()),
                    base_register: discovery::DEFAULT_BASE_REGISTER,
                },
            })
        })
        .collect()
}

/// Reads the identity block of each network device to find EV11 wallboxes.
struct Ev11Identifier {
    factory: Arc<dyn TransportFactory>,
    settings: TransactionSettings,
    cancel: CancellationToken,
}

impl Ev11Identifier {
    async fn identify_all(
        &self,
        devices: Vec<crate::config::NetworkDevice>,
        known: &[(String, ThingId)],
    ) -> Vec<ThingDescriptor> {
        let mut found = Vec::new();
        for device in devices {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(mut descriptor) = self.identify(&device).await {
                descriptor.thing_id = existing(known, &device.mac);
                found.push(descriptor);
            }
        }
        found
    }

    async fn identify(&self, device: &crate::config::NetworkDevice) -> Option<ThingDescriptor> {
        let thing = Thing {
            id: ThingId::new(format!("discovery/{}", device.address)),
            class: ThingClass::Ev11,
            name: device.address.clone(),
            parent: None,
            params: ThingParams::Ev11 {
                address: device.address.clone(),
                mac: (!device.mac.is_empty()).then(|| device.mac.clone()),
                serial_number: None,
            },
        };

        let transport = self.factory.create(&thing).ok()?;
        let connection = Connection::new(thing.id.clone(), transport, self.settings, broadcast::channel(16).0);
        if let Err(e) = connection.connect().await {
            debug!("{}: not answering: {}", device.address, e);
            return None;
        }

        let block = connection
            .read_registers(ev11::IDENTITY.start, ev11::IDENTITY.len())
            .await
            .map_err(|e| debug!("{}: not an EV11: {}", device.address, e));
        connection.close().await;
        let block: RegisterBlock = block.ok()?;

        let fields = Fields::new(&thing.id, &ev11::IDENTITY.descriptor, &block);
        let serial = fields.text("SerialNumber")?;
        let firmware = fields.text("FirmwareRevision").unwrap_or_default();

        let mut params = thing.params;
        if let ThingParams::Ev11 { serial_number, .. } = &mut params {
            *serial_number = Some(serial.clone());
        }

        Some(ThingDescriptor {
            class: ThingClass::Ev11,
            title: format!("PCE EV11.3 ({})", serial),
            description: format!("Version: {} - {}", firmware, device.address),
            parent_id: None,
            thing_id: None,
            params,
        })
    }
}
