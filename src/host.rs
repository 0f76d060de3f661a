use crate::prelude::*;
use crate::transport::Parity;

use {
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
};

// ThingId {{{
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThingId(String);

impl ThingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of a model child, stable across rediscovery of the same block.
    pub fn child(parent: &ThingId, model_id: u16, start: u16) -> Self {
        Self(format!("{}/{}@{}", parent.0, model_id, start))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThingId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ThingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ThingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
} // }}}

// ThingClass {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThingClass {
    SunSpecConnection,
    SolarEdgeConnection,
    SunSpecSinglePhaseInverter,
    SunSpecSplitPhaseInverter,
    SunSpecThreePhaseInverter,
    SunSpecSinglePhaseMeter,
    SunSpecSplitPhaseMeter,
    SunSpecThreePhaseMeter,
    SunSpecStorage,
    Ev11,
    Cion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    SunSpec,
    PcElectric,
    Schrack,
}

impl ThingClass {
    pub fn family(self) -> Family {
        match self {
            Self::Ev11 => Family::PcElectric,
            Self::Cion => Family::Schrack,
            _ => Family::SunSpec,
        }
    }

    pub fn is_connection(self) -> bool {
        matches!(self, Self::SunSpecConnection | Self::SolarEdgeConnection)
    }
} // }}}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ThingParams {
    SunSpecConnection {
        address: String,
        port: u16,
        slave_id: u8,
        #[serde(default)]
        mac: Option<String>,
        #[serde(default = "ThingParams::default_base_register")]
        base_register: u16,
    },
    /// A model block on a SunSpec connection.
    SunSpecModel { model_id: u16, start: u16, length: u16 },
    Ev11 {
        address: String,
        #[serde(default)]
        mac: Option<String>,
        #[serde(default)]
        serial_number: Option<String>,
    },
    Cion {
        serial_port: String,
        slave_id: u8,
        #[serde(default = "ThingParams::default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "ThingParams::default_parity")]
        parity: Parity,
        #[serde(default = "ThingParams::default_data_bits")]
        data_bits: u8,
        #[serde(default = "ThingParams::default_stop_bits")]
        stop_bits: u8,
    },
}

impl ThingParams {
    pub fn default_base_register() -> u16 {
        40000
    }

    pub fn default_baud_rate() -> u32 {
        57600
    }

    pub fn default_parity() -> Parity {
        Parity::None
    }

    pub fn default_data_bits() -> u8 {
        8
    }

    pub fn default_stop_bits() -> u8 {
        1
    }

    pub fn mac(&self) -> Option<&str> {
        match self {
            Self::SunSpecConnection { mac, .. } | Self::Ev11 { mac, .. } => mac.as_deref(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Thing {
    pub id: ThingId,
    pub class: ThingClass,
    pub name: String,
    pub parent: Option<ThingId>,
    pub params: ThingParams,
}

/// A thing offered to the host, either from discovery or as an auto child.
#[derive(Clone, Debug, PartialEq)]
pub struct ThingDescriptor {
    pub class: ThingClass,
    pub title: String,
    pub description: String,
    pub parent_id: Option<ThingId>,
    pub params: ThingParams,
    /// Set when the descriptor matches a thing the host already has.
    pub thing_id: Option<ThingId>,
}

impl ThingDescriptor {
    pub fn into_thing(self, id: ThingId) -> Thing {
        Thing {
            id,
            class: self.class,
            name: self.title,
            parent: self.parent_id,
            params: self.params,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for StateValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// What plugins tell the host.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelData {
    StateChanged(ThingId, &'static str, StateValue),
    StateRangeChanged(ThingId, &'static str, StateValue, StateValue),
    AutoThingsAppeared(Vec<ThingDescriptor>),
    SetupFinished(ThingId, std::result::Result<(), ThingError>),
    ActionFinished(ThingId, std::result::Result<(), ThingError>),
    Shutdown,
}
pub type Sender = broadcast::Sender<ChannelData>;
pub type Receiver = broadcast::Receiver<ChannelData>;

// StatePublisher {{{
/// Forwards state values to the host, dropping repeats of the last value.
#[derive(Clone, Debug)]
pub struct StatePublisher {
    thing_id: ThingId,
    sender: Sender,
    last: HashMap<&'static str, StateValue>,
}

impl StatePublisher {
    pub fn new(thing_id: ThingId, sender: Sender) -> Self {
        Self {
            thing_id,
            sender,
            last: HashMap::new(),
        }
    }

    pub fn thing_id(&self) -> &ThingId {
        &self.thing_id
    }

    pub fn set(&mut self, name: &'static str, value: impl Into<StateValue>) {
        let value = value.into();
        if self.last.get(name) == Some(&value) {
            return;
        }

        self.last.insert(name, value.clone());
        let _ = self
            .sender
            .send(ChannelData::StateChanged(self.thing_id.clone(), name, value));
    }

    pub fn set_range(&mut self, name: &'static str, min: impl Into<StateValue>, max: impl Into<StateValue>) {
        let _ = self.sender.send(ChannelData::StateRangeChanged(
            self.thing_id.clone(),
            name,
            min.into(),
            max.into(),
        ));
    }

    pub fn get(&self, name: &str) -> Option<&StateValue> {
        self.last.get(name)
    }
} // }}}

// LocalHost {{{
/// Stand-in for a home automation host: logs every state change as JSON
/// and accepts every auto thing a plugin offers.
pub struct LocalHost {
    channels: Channels,
    things: HashMap<ThingId, Thing>,
}

impl LocalHost {
    pub fn new(channels: Channels) -> Self {
        Self {
            channels,
            things: HashMap::new(),
        }
    }

    pub async fn start(mut self, things: Vec<Thing>) -> Result<()> {
        let mut receiver = self.channels.from_plugin.subscribe();

        for thing in things {
            self.add(thing, true)?;
        }

        loop {
            match receiver.recv().await {
                Ok(ChannelData::StateChanged(id, name, value)) => {
                    let line = serde_json::json!({
                        "time": chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
                        "thing": id,
                        "state": name,
                        "value": value,
                    });
                    info!("{}", line);
                }
                Ok(ChannelData::StateRangeChanged(id, name, min, max)) => {
                    debug!("{}: {} range {:?}..={:?}", id, name, min, max);
                }
                Ok(ChannelData::AutoThingsAppeared(descriptors)) => {
                    for descriptor in descriptors {
                        let id = match (&descriptor.thing_id, &descriptor.params) {
                            (Some(id), _) => id.clone(),
                            (None, ThingParams::SunSpecModel { model_id, start, .. }) => {
                                let parent = descriptor
                                    .parent_id
                                    .clone()
                                    .ok_or_else(|| anyhow!("model thing without parent"))?;
                                ThingId::child(&parent, *model_id, *start)
                            }
                            (None, _) => ThingId::new(descriptor.title.clone()),
                        };
                        if self.things.contains_key(&id) {
                            continue;
                        }
                        info!("accepting auto thing {} ({})", descriptor.title, id);
                        self.add(descriptor.into_thing(id), false)?;
                    }
                }
                Ok(ChannelData::SetupFinished(id, Ok(()))) => {
                    info!("{}: setup finished", id);
                    self.send(crate::plugin::ChannelData::PostSetup(id))?;
                }
                Ok(ChannelData::SetupFinished(id, Err(e))) => {
                    warn!("{}: setup failed: {}", id, e);
                }
                Ok(ChannelData::ActionFinished(id, result)) => {
                    info!("{}: action finished: {:?}", id, result);
                }
                Ok(ChannelData::Shutdown) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("host lagged by {} messages", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        Ok(())
    }

    fn add(&mut self, thing: Thing, initial: bool) -> Result<()> {
        self.things.insert(thing.id.clone(), thing.clone());
        self.send(crate::plugin::ChannelData::SetupThing(thing, initial))
    }

    fn send(&self, data: crate::plugin::ChannelData) -> Result<()> {
        self.channels
            .to_plugin
            .send(data)
            .map_err(|err| anyhow!("send(): {}", err))?;
        Ok(())
    }
} // }}}
