use crate::codec::{RegisterBlock, Value};
use crate::descriptor::FixedMap;
use crate::prelude::*;

use {
    std::sync::Arc,
    std::time::Duration,
    tokio::time::Instant,
};

// Watchdog {{{
/// Keeps a device from falling back to its offline behaviour by rewriting a
/// heartbeat register. Due right after arming, then once per interval.
#[derive(Clone, Debug)]
pub struct Watchdog {
    address: u16,
    value: u16,
    interval: Duration,
    due: Option<Instant>,
}

impl Watchdog {
    pub fn new(address: u16, value: u16, interval: Duration) -> Self {
        Self {
            address,
            value,
            interval,
            due: None,
        }
    }

    pub fn arm(&mut self) {
        self.due = Some(Instant::now());
    }

    pub fn disarm(&mut self) {
        self.due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }

    pub fn is_due(&self) -> bool {
        matches!(self.due, Some(due) if Instant::now() >= due)
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    fn written(&mut self) {
        self.due = Some(Instant::now() + self.interval);
    }
} // }}}

/// Reads fixed register maps from devices that cannot describe themselves,
/// writing the heartbeat first whenever it is due.
#[derive(Debug)]
pub struct FixedMapPoller {
    connection: Arc<Connection>,
    watchdog: Option<Watchdog>,
}

impl FixedMapPoller {
    pub fn new(connection: Arc<Connection>, watchdog: Option<Watchdog>) -> Self {
        Self { connection, watchdog }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn watchdog_mut(&mut self) -> Option<&mut Watchdog> {
        self.watchdog.as_mut()
    }

    /// One read per map, in order. Nothing goes on the wire while the
    /// connection is down.
    pub async fn poll(&mut self, maps: &[&'static FixedMap]) -> Result<Vec<RegisterBlock>, TransactionError> {
        if !self.connection.is_reachable() {
            return Err(TransactionError::NotConnected);
        }

        if let Some(watchdog) = self.watchdog.as_mut().filter(|w| w.is_due()) {
            match self
                .connection
                .write_registers(watchdog.address, &[watchdog.value])
                .await
            {
                Ok(()) => debug!("{}: heartbeat written", self.connection.name()),
                Err(e) => warn!("{}: writing heartbeat failed: {}", self.connection.name(), e),
            }
            watchdog.written();
        }

        let mut blocks = Vec::with_capacity(maps.len());
        for map in maps {
            blocks.push(self.connection.read_registers(map.start, map.len()).await?);
        }
        Ok(blocks)
    }

    pub async fn write(&self, map: &FixedMap, field: &str, value: &Value) -> Result<(), ThingError> {
        let address = map.address(field).map_err(|e| {
            error!("{}: {}", self.connection.name(), e);
            ThingError::HardwareFailure
        })?;
        let words = map.descriptor.encode(field, value, 0).map_err(|e| {
            warn!("{}: {}", self.connection.name(), e);
            ThingError::InvalidParameter
        })?;

        self.connection.write_registers(address, &words).await.map_err(|e| {
            warn!("{}: writing {} failed: {}", self.connection.name(), field, e);
            ThingError::from(e)
        })
    }
}
