pub mod channels;   // host <-> plugin message channels
pub mod codec;      // register word codec
pub mod config;     // configuration file
pub mod connection; // one Modbus link, reachability and retries
pub mod descriptor; // register layouts
pub mod error;      // error types
pub mod facade;     // per-device facades and actions
pub mod host;       // things, states and the local host
pub mod network;    // network discovery and reachability monitor
pub mod options;    // command line options
pub mod plugin;     // per-family plugin loop
pub mod prelude;    // common imports
pub mod registry;   // things, connections and facades of a plugin
pub mod scheduler;  // poll timer
pub mod setup;      // thing setup state machine
pub mod sunspec;    // SunSpec discovery and models
pub mod transport;  // tokio-modbus TCP and RTU links
pub mod wallbox;    // fixed-map wallboxes

use crate::host::{Family, LocalHost};
use crate::network::{NetworkDiscovery, NetworkMonitor, StaticDiscovery, TcpProbeMonitor};
use crate::plugin::{ModbusTransportFactory, Plugin, TransportFactory};
use crate::prelude::*;

use std::sync::Arc;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Starts one plugin per device family plus the local host, and runs
/// until `shutdown_rx` fires.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, config: Arc<ConfigWrapper>) -> Result<()> {
    info!("energy-bridge {} starting", CARGO_PKG_VERSION);

    let channels = Channels::new();
    let network = config.network();
    let factory: Arc<dyn TransportFactory> = Arc::new(ModbusTransportFactory);
    let discovery: Arc<dyn NetworkDiscovery> = Arc::new(StaticDiscovery::new(&network));
    let monitor: Arc<dyn NetworkMonitor> = Arc::new(TcpProbeMonitor::new(&network));

    let mut handles = Vec::new();
    for family in [Family::SunSpec, Family::PcElectric, Family::Schrack] {
        let plugin = Plugin::new(
            family,
            &config,
            channels.clone(),
            factory.clone(),
            discovery.clone(),
            monitor.clone(),
        );
        handles.push(tokio::spawn(async move {
            if let Err(e) = plugin.start().await {
                error!("{:?} plugin failed: {}", family, e);
            }
        }));
    }

    let host = LocalHost::new(channels.clone());
    let things = config.things();
    info!("{} things configured", things.len());
    handles.push(tokio::spawn(async move {
        if let Err(e) = host.start(things).await {
            error!("host failed: {}", e);
        }
    }));

    let _ = shutdown_rx.recv().await;
    info!("shutting down");

    let _ = channels.to_plugin.send(crate::plugin::ChannelData::Shutdown);
    let _ = channels.from_plugin.send(crate::host::ChannelData::Shutdown);

    for handle in handles {
        if let Err(e) = handle.await {
            error!("task failed: {}", e);
        }
    }

    info!("shutdown complete");
    Ok(())
}
