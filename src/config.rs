use crate::host::Family;
use crate::prelude::*;
use crate::transport::Parity;

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    #[serde(default)]
    pub sunspec: SunSpec,

    #[serde(default)]
    pub pcelectric: PcElectric,

    #[serde(default)]
    pub pce: Pce,

    #[serde(default)]
    pub network: Network,
}

// PluginSettings {{{
/// Settings every plugin family carries. Durations are seconds for intervals
/// and milliseconds for link timings.
#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct PluginSettings {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_update_interval")]
    pub update_interval: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "Config::default_timeout")]
    pub timeout: Duration,

    #[serde(default = "Config::default_number_of_retries")]
    pub number_of_retries: u32,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_watchdog_interval")]
    pub watchdog_interval: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "Config::default_reconnect_delay")]
    pub reconnect_delay: Duration,

    /// How long a setup may wait for its device before it fails.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_setup_timeout")]
    pub setup_timeout: Duration,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            update_interval: Config::default_update_interval(),
            timeout: Config::default_timeout(),
            number_of_retries: Config::default_number_of_retries(),
            watchdog_interval: Config::default_watchdog_interval(),
            reconnect_delay: Config::default_reconnect_delay(),
            setup_timeout: Config::default_setup_timeout(),
        }
    }
}

impl PluginSettings {
    pub fn transaction(&self) -> crate::connection::TransactionSettings {
        crate::connection::TransactionSettings {
            timeout: self.timeout,
            retries: self.number_of_retries,
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.update_interval.is_zero() {
            bail!("{}.update_interval must be greater than 0", section);
        }
        if self.timeout.is_zero() {
            bail!("{}.timeout must be greater than 0", section);
        }
        if self.watchdog_interval.is_zero() {
            bail!("{}.watchdog_interval must be greater than 0", section);
        }
        if self.setup_timeout.is_zero() {
            bail!("{}.setup_timeout must be greater than 0", section);
        }
        Ok(())
    }

    fn log(&self) {
        info!("    Update Interval: {}s", self.update_interval.as_secs());
        info!("    Timeout: {}ms", self.timeout.as_millis());
        info!("    Retries: {}", self.number_of_retries);
        info!("    Watchdog Interval: {}s", self.watchdog_interval.as_secs());
        info!("    Reconnect Delay: {}ms", self.reconnect_delay.as_millis());
        info!("    Setup Timeout: {}s", self.setup_timeout.as_secs());
    }
} // }}}

// SunSpec {{{
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SunSpec {
    #[serde(flatten)]
    pub settings: PluginSettings,

    #[serde(default = "Vec::new")]
    pub connections: Vec<SunSpecConnection>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SunSpecConnection {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub name: String,
    pub host: String,
    #[serde(default = "Config::default_modbus_port")]
    pub port: u16,
    #[serde(default = "Config::default_slave_id")]
    pub slave_id: u8,
    pub mac: Option<String>,
    #[serde(default = "ThingParams::default_base_register")]
    pub base_register: u16,
    #[serde(default)]
    pub solaredge: bool,
}

impl SunSpecConnection {
    pub fn thing(&self) -> Thing {
        Thing {
            id: ThingId::new(format!("sunspec/{}", self.name)),
            class: if self.solaredge {
                ThingClass::SolarEdgeConnection
            } else {
                ThingClass::SunSpecConnection
            },
            name: self.name.clone(),
            parent: None,
            params: ThingParams::SunSpecConnection {
                address: self.host.clone(),
                port: self.port,
                slave_id: self.slave_id,
                mac: self.mac.clone(),
                base_register: self.base_register,
            },
        }
    }
} // }}}

// PcElectric {{{
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PcElectric {
    #[serde(flatten)]
    pub settings: PluginSettings,

    #[serde(default = "Vec::new")]
    pub wallboxes: Vec<Ev11>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Ev11 {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub name: String,
    pub host: String,
    pub mac: Option<String>,
    pub serial_number: Option<String>,
}

impl Ev11 {
    pub fn thing(&self) -> Thing {
        Thing {
            id: ThingId::new(format!("ev11/{}", self.name)),
            class: ThingClass::Ev11,
            name: self.name.clone(),
            parent: None,
            params: ThingParams::Ev11 {
                address: self.host.clone(),
                mac: self.mac.clone(),
                serial_number: self.serial_number.clone(),
            },
        }
    }
} // }}}

// Pce {{{
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Pce {
    #[serde(flatten)]
    pub settings: PluginSettings,

    #[serde(default = "Vec::new")]
    pub wallboxes: Vec<Cion>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Cion {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub name: String,
    pub serial_port: String,
    #[serde(default = "Config::default_slave_id")]
    pub slave_id: u8,
    #[serde(default = "ThingParams::default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "ThingParams::default_parity")]
    pub parity: Parity,
    #[serde(default = "ThingParams::default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "ThingParams::default_stop_bits")]
    pub stop_bits: u8,
}

impl Cion {
    pub fn thing(&self) -> Thing {
        Thing {
            id: ThingId::new(format!("cion/{}", self.name)),
            class: ThingClass::Cion,
            name: self.name.clone(),
            parent: None,
            params: ThingParams::Cion {
                serial_port: self.serial_port.clone(),
                slave_id: self.slave_id,
                baud_rate: self.baud_rate,
                parity: self.parity,
                data_bits: self.data_bits,
                stop_bits: self.stop_bits,
            },
        }
    }
} // }}}

// Network {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Network {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_probe_interval")]
    pub probe_interval: Duration,

    #[serde(default = "Config::default_modbus_port")]
    pub probe_port: u16,

    #[serde(default = "Vec::new")]
    pub devices: Vec<NetworkDevice>,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            probe_interval: Config::default_probe_interval(),
            probe_port: Config::default_modbus_port(),
            devices: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct NetworkDevice {
    pub address: String,
    pub mac: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub manufacturer: String,
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn sunspec(&self) -> SunSpec {
        self.lock().sunspec.clone()
    }

    pub fn pcelectric(&self) -> PcElectric {
        self.lock().pcelectric.clone()
    }

    pub fn pce(&self) -> Pce {
        self.lock().pce.clone()
    }

    pub fn network(&self) -> Network {
        self.lock().network.clone()
    }

    pub fn settings(&self, family: Family) -> PluginSettings {
        let config = self.lock();
        match family {
            Family::SunSpec => config.sunspec.settings,
            Family::PcElectric => config.pcelectric.settings,
            Family::Schrack => config.pce.settings,
        }
    }

    pub fn set_settings(&self, family: Family, settings: PluginSettings) {
        let mut config = self.lock();
        match family {
            Family::SunSpec => config.sunspec.settings = settings,
            Family::PcElectric => config.pcelectric.settings = settings,
            Family::Schrack => config.pce.settings = settings,
        }
    }

    /// Every enabled thing in the file, in section order.
    pub fn things(&self) -> Vec<Thing> {
        let config = self.lock();

        let sunspec = config
            .sunspec
            .connections
            .iter()
            .filter(|c| c.enabled)
            .map(SunSpecConnection::thing);
        let ev11 = config.pcelectric.wallboxes.iter().filter(|w| w.enabled).map(Ev11::thing);
        let cion = config.pce.wallboxes.iter().filter(|w| w.enabled).map(Cion::thing);

        sunspec.chain(ev11).chain(cion).collect()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        let config: Self = serde_yaml::from_str(&content)?;

        info!("Configuration loaded successfully:");
        info!("  SunSpec: {} connections", config.sunspec.connections.len());
        config.sunspec.settings.log();
        for (i, c) in config.sunspec.connections.iter().enumerate() {
            info!("    Connection[{}]:", i);
            info!("      Enabled: {}", c.enabled);
            info!("      Name: {}", c.name);
            info!("      Host: {}:{}", c.host, c.port);
            info!("      Slave ID: {}", c.slave_id);
            info!("      MAC: {}", c.mac.as_deref().unwrap_or(""));
            info!("      Base Register: {}", c.base_register);
            info!("      SolarEdge: {}", c.solaredge);
        }

        info!("  PC Electric: {} wallboxes", config.pcelectric.wallboxes.len());
        config.pcelectric.settings.log();
        for (i, w) in config.pcelectric.wallboxes.iter().enumerate() {
            info!("    Wallbox[{}]:", i);
            info!("      Enabled: {}", w.enabled);
            info!("      Name: {}", w.name);
            info!("      Host: {}", w.host);
            info!("      MAC: {}", w.mac.as_deref().unwrap_or(""));
        }

        info!("  Schrack: {} wallboxes", config.pce.wallboxes.len());
        config.pce.settings.log();
        for (i, w) in config.pce.wallboxes.iter().enumerate() {
            info!("    Wallbox[{}]:", i);
            info!("      Enabled: {}", w.enabled);
            info!("      Name: {}", w.name);
            info!("      Port: {} ({} baud)", w.serial_port, w.baud_rate);
            info!("      Slave ID: {}", w.slave_id);
        }

        info!("  Network: {} known devices", config.network.devices.len());
        info!("    Probe Interval: {}s", config.network.probe_interval.as_secs());
        info!("  Log Level: {}", config.loglevel);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.sunspec.settings.validate("sunspec")?;
        self.pcelectric.settings.validate("pcelectric")?;
        self.pce.settings.validate("pce")?;

        for (i, c) in self.sunspec.connections.iter().enumerate() {
            if c.host.is_empty() {
                bail!("sunspec.connections[{}].host cannot be empty", i);
            }
            if c.port == 0 {
                bail!("sunspec.connections[{}].port must be between 1 and 65535", i);
            }
            Self::validate_slave_id(c.slave_id, "sunspec.connections", i)?;
        }

        for (i, w) in self.pcelectric.wallboxes.iter().enumerate() {
            if w.host.is_empty() {
                bail!("pcelectric.wallboxes[{}].host cannot be empty", i);
            }
        }

        for (i, w) in self.pce.wallboxes.iter().enumerate() {
            if w.serial_port.is_empty() {
                bail!("pce.wallboxes[{}].serial_port cannot be empty", i);
            }
            Self::validate_slave_id(w.slave_id, "pce.wallboxes", i)?;
            if !(5..=8).contains(&w.data_bits) || !(1..=2).contains(&w.stop_bits) {
                bail!("pce.wallboxes[{}] has an invalid serial frame", i);
            }
        }

        if self.network.probe_interval.is_zero() {
            bail!("network.probe_interval must be greater than 0");
        }

        let mut names: Vec<String> = self
            .sunspec
            .connections
            .iter()
            .map(|c| format!("sunspec/{}", c.name))
            .chain(self.pcelectric.wallboxes.iter().map(|w| format!("ev11/{}", w.name)))
            .chain(self.pce.wallboxes.iter().map(|w| format!("cion/{}", w.name)))
            .collect();
        names.sort();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            bail!("duplicate name {}", pair[0]);
        }

        Ok(())
    }

    fn validate_slave_id(slave_id: u8, section: &str, index: usize) -> Result<()> {
        if !(1..=247).contains(&slave_id) {
            bail!("{}[{}].slave_id must be between 1 and 247", section, index);
        }
        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_modbus_port() -> u16 {
        502
    }

    fn default_slave_id() -> u8 {
        1
    }

    fn default_update_interval() -> Duration {
        Duration::from_secs(5)
    }

    fn default_timeout() -> Duration {
        Duration::from_millis(1000)
    }

    fn default_number_of_retries() -> u32 {
        2
    }

    fn default_watchdog_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_delay() -> Duration {
        Duration::from_millis(2000)
    }

    fn default_setup_timeout() -> Duration {
        Duration::from_secs(300)
    }

    fn default_probe_interval() -> Duration {
        Duration::from_secs(30)
    }
}
