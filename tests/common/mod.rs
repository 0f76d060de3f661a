#![allow(dead_code)]

use energy_bridge::connection::TransactionSettings;
use energy_bridge::network::{MonitorHandle, NetworkMonitor};
use energy_bridge::plugin::TransportFactory;
use energy_bridge::prelude::*;
use energy_bridge::transport::Transport;

use {
    async_trait::async_trait,
    std::collections::{HashMap, VecDeque},
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tokio::sync::watch,
};

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Connect,
    Disconnect,
    Read(u16, u16),
    Write(u16, Vec<u16>),
}

#[derive(Default)]
struct DeviceState {
    registers: HashMap<u16, u16>,
    log: Vec<Op>,
    connect_error: Option<TransactionError>,
    failures: VecDeque<TransactionError>,
    // reads touching these raise an illegal data address exception
    missing: Vec<std::ops::Range<u32>>,
    read_delay: Duration,
}

/// A scripted Modbus slave: a register image plus a log of every request.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub fn set(&self, start: u16, words: &[u16]) {
        let mut state = self.state();
        for (i, word) in words.iter().enumerate() {
            state.registers.insert(start + i as u16, *word);
        }
    }

    pub fn set_ascii(&self, start: u16, text: &str, words: u16) {
        self.set(start, &energy_bridge::codec::pack_ascii(text, words));
    }

    pub fn get(&self, address: u16) -> u16 {
        self.state().registers.get(&address).copied().unwrap_or(0)
    }

    pub fn missing(&self, range: std::ops::Range<u32>) {
        self.state().missing.push(range);
    }

    pub fn fail_connect(&self, error: Option<TransactionError>) {
        self.state().connect_error = error;
    }

    pub fn fail_next(&self, error: TransactionError) {
        self.state().failures.push_back(error);
    }

    pub fn delay_reads(&self, delay: Duration) {
        self.state().read_delay = delay;
    }

    pub fn log(&self) -> Vec<Op> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Reads and writes only.
    pub fn transactions(&self) -> Vec<Op> {
        self.log()
            .into_iter()
            .filter(|op| matches!(op, Op::Read(..) | Op::Write(..)))
            .collect()
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.log()
            .into_iter()
            .filter_map(|op| match op {
                Op::Write(start, words) => Some((start, words)),
                _ => None,
            })
            .collect()
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(MockTransport { device: self.clone() })
    }
}

pub struct MockTransport {
    device: MockDevice,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransactionError> {
        let mut state = self.device.state();
        state.log.push(Op::Connect);
        match state.connect_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransactionError> {
        self.device.state().log.push(Op::Disconnect);
        Ok(())
    }

    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransactionError> {
        let delay = {
            let mut state = self.device.state();
            state.log.push(Op::Read(start, count));
            state.read_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.device.state();
        if let Some(e) = state.failures.pop_front() {
            return Err(e);
        }
        let range = u32::from(start)..u32::from(start) + u32::from(count);
        if state.missing.iter().any(|m| m.start < range.end && range.start < m.end) {
            return Err(TransactionError::ProtocolError(2));
        }
        Ok((0..count)
            .map(|i| state.registers.get(&(start + i)).copied().unwrap_or(0))
            .collect())
    }

    async fn write_multiple_registers(&mut self, start: u16, words: &[u16]) -> Result<(), TransactionError> {
        let mut state = self.device.state();
        state.log.push(Op::Write(start, words.to_vec()));
        if let Some(e) = state.failures.pop_front() {
            return Err(e);
        }
        for (i, word) in words.iter().enumerate() {
            state.registers.insert(start + i as u16, *word);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Hands out mock devices by thing id.
#[derive(Clone, Default)]
pub struct MockFactory {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
}

impl MockFactory {
    pub fn add(&self, id: &str, device: MockDevice) {
        self.devices.lock().unwrap().insert(id.to_string(), device);
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, thing: &Thing) -> Result<Box<dyn Transport>, ThingError> {
        self.devices
            .lock()
            .unwrap()
            .get(thing.id.as_str())
            .map(MockDevice::transport)
            .ok_or(ThingError::HardwareNotAvailable)
    }
}

/// Reachability the test flips by hand.
#[derive(Default)]
pub struct MockMonitor {
    devices: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl MockMonitor {
    /// Also works before anything registers `mac`, for devices that start out gone.
    pub fn set_reachable(&self, mac: &str, reachable: bool) {
        self.devices
            .lock()
            .unwrap()
            .entry(mac.to_string())
            .or_insert_with(|| watch::channel(reachable).0)
            .send_replace(reachable);
    }
}

impl NetworkMonitor for MockMonitor {
    fn register(&self, mac: &str) -> MonitorHandle {
        let mut devices = self.devices.lock().unwrap();
        let tx = devices
            .entry(mac.to_string())
            .or_insert_with(|| watch::channel(true).0);
        MonitorHandle::new(mac, tx.subscribe())
    }

    fn unregister(&self, mac: &str) {
        self.devices.lock().unwrap().remove(mac);
    }
}

pub fn settings() -> TransactionSettings {
    TransactionSettings {
        timeout: Duration::from_millis(500),
        retries: 2,
    }
}

pub fn connection(device: &MockDevice) -> (Arc<Connection>, broadcast::Receiver<ConnectionEvent>) {
    let (tx, rx) = broadcast::channel(64);
    (Connection::new(ThingId::new("test/device"), device.transport(), settings(), tx), rx)
}

pub async fn connected(device: &MockDevice) -> Arc<Connection> {
    let (connection, _) = connection(device);
    connection.connect().await.unwrap();
    device.clear_log();
    connection
}

/// Marker, common model, then one three phase inverter and the end marker.
pub fn sunspec_device() -> MockDevice {
    let device = MockDevice::new();
    device.set(40000, &[0x5375, 0x6e53]);
    device.set(40002, &[1, 66]);
    device.set_ascii(40004, "SolarEdge", 16);
    device.set_ascii(40020, "SE10K", 16);
    device.set_ascii(40044, "4.12", 8);
    device.set_ascii(40052, "7F123456", 16);
    device.set(40068, &[1]);
    device.set(40070, &[103, 50]);
    device.set(40122, &[0xFFFF, 0]);
    device
}

/// Drains everything plugins have sent to the host so far.
pub fn drain(rx: &mut energy_bridge::host::Receiver) -> Vec<energy_bridge::host::ChannelData> {
    let mut out = Vec::new();
    while let Ok(data) = rx.try_recv() {
        out.push(data);
    }
    out
}
