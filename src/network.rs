use crate::config::{Network, NetworkDevice};
use crate::prelude::*;

use {
    async_trait::async_trait,
    std::collections::HashMap,
    std::sync::Mutex,
    std::time::Duration,
    tokio::net::TcpStream,
    tokio::sync::watch,
    tokio::task::JoinHandle,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Finds devices on the local network, for offering TCP things to the host.
#[async_trait]
pub trait NetworkDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<NetworkDevice>>;
}

/// Tells whether a device, known by MAC address, answers on the network.
pub trait NetworkMonitor: Send + Sync {
    fn register(&self, mac: &str) -> MonitorHandle;
    fn unregister(&self, mac: &str);
}

#[derive(Clone, Debug)]
pub struct MonitorHandle {
    mac: String,
    reachable: watch::Receiver<bool>,
}

impl MonitorHandle {
    pub fn new(mac: &str, reachable: watch::Receiver<bool>) -> Self {
        Self {
            mac: mac.to_string(),
            reachable,
        }
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn is_reachable(&self) -> bool {
        *self.reachable.borrow()
    }

    /// Relays every reachability change for `thing_id` until either end goes away.
    pub fn forward(&self, thing_id: ThingId, tx: mpsc::UnboundedSender<(ThingId, bool)>) -> JoinHandle<()> {
        let mut reachable = self.reachable.clone();
        tokio::spawn(async move {
            while reachable.changed().await.is_ok() {
                let value = *reachable.borrow_and_update();
                if tx.send((thing_id.clone(), value)).is_err() {
                    break;
                }
            }
        })
    }
}

// StaticDiscovery {{{
/// Devices listed in the configuration file.
pub struct StaticDiscovery {
    devices: Vec<NetworkDevice>,
}

impl StaticDiscovery {
    pub fn new(network: &Network) -> Self {
        Self {
            devices: network.devices.clone(),
        }
    }
}

#[async_trait]
impl NetworkDiscovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<NetworkDevice>> {
        Ok(self.devices.clone())
    }
} // }}}

// TcpProbeMonitor {{{
/// One polling task per MAC, shared by every thing registered on it.
struct Watch {
    task: JoinHandle<()>,
    reachable: watch::Receiver<bool>,
    users: usize,
}

/// Declares a device reachable while it accepts TCP connections on the probe port.
pub struct TcpProbeMonitor {
    addresses: HashMap<String, String>,
    port: u16,
    interval: Duration,
    watches: Mutex<HashMap<String, Watch>>,
}

impl TcpProbeMonitor {
    pub fn new(network: &Network) -> Self {
        Self {
            addresses: network
                .devices
                .iter()
                .map(|d| (d.mac.to_lowercase(), d.address.clone()))
                .collect(),
            port: network.probe_port,
            interval: network.probe_interval,
            watches: Mutex::new(HashMap::new()),
        }
    }

    async fn accepts(address: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((address, port))).await,
            Ok(Ok(_))
        )
    }

    fn spawn(&self, mac: &str, address: String) -> Watch {
        let (tx, rx) = watch::channel(true);
        let (port, interval, name) = (self.port, self.interval, mac.to_string());

        let task = tokio::spawn(async move {
            loop {
                let reachable = Self::accepts(&address, port).await;
                tx.send_if_modified(|current| {
                    if *current == reachable {
                        return false;
                    }
                    info!("{} ({}) is {}", name, address, if reachable { "reachable" } else { "gone" });
                    *current = reachable;
                    true
                });
                tokio::time::sleep(interval).await;
            }
        });

        Watch {
            task,
            reachable: rx,
            users: 0,
        }
    }
}

impl NetworkMonitor for TcpProbeMonitor {
    fn register(&self, mac: &str) -> MonitorHandle {
        let key = mac.to_lowercase();
        let Some(address) = self.addresses.get(&key).cloned() else {
            debug!("{}: no address known, assuming reachable", mac);
            return MonitorHandle::new(mac, watch::channel(true).1);
        };

        let mut watches = self.watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let watch = watches.entry(key).or_insert_with(|| self.spawn(mac, address));
        watch.users += 1;
        MonitorHandle::new(mac, watch.reachable.clone())
    }

    fn unregister(&self, mac: &str) {
        let key = mac.to_lowercase();
        let mut watches = self.watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(watch) = watches.get_mut(&key) else {
            return;
        };
        watch.users = watch.users.saturating_sub(1);
        if watch.users == 0 {
            if let Some(watch) = watches.remove(&key) {
                watch.task.abort();
            }
        }
    }
} // }}}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const MAC: &str = "00:27:02:aa:bb:cc";

    fn monitor(port: u16) -> TcpProbeMonitor {
        TcpProbeMonitor::new(&Network {
            probe_interval: Duration::from_millis(50),
            probe_port: port,
            devices: vec![NetworkDevice {
                address: "127.0.0.1".to_string(),
                mac: MAC.to_string(),
                hostname: String::new(),
                manufacturer: String::new(),
            }],
        })
    }

    #[tokio::test]
    async fn shared_mac_keeps_watching_after_one_thing_leaves() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let monitor = monitor(listener.local_addr().unwrap().port());

        let _first = monitor.register(MAC);
        let second = monitor.register(&MAC.to_uppercase());
        monitor.unregister(MAC);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _forward = second.forward(ThingId::from("meter"), tx);
        drop(listener);

        let change = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(change, Some((ThingId::from("meter"), false)));
        assert!(!second.is_reachable());
    }

    #[tokio::test]
    async fn last_unregister_stops_watching() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let monitor = monitor(listener.local_addr().unwrap().port());

        let handle = monitor.register(MAC);
        monitor.register(MAC);
        monitor.unregister(MAC);
        monitor.unregister(MAC);
        assert!(monitor.watches.lock().unwrap().is_empty());

        let (tx, _rx) = mpsc::unbounded_channel();
        let forward = handle.forward(ThingId::from("meter"), tx);
        tokio::time::timeout(Duration::from_secs(10), forward).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_mac_is_always_reachable() {
        let monitor = monitor(1);
        assert!(monitor.register("00:00:00:00:00:01").is_reachable());
        assert!(monitor.watches.lock().unwrap().is_empty());
    }
}
