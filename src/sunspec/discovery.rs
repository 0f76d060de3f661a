use crate::codec::RegisterBlock;
use crate::descriptor::ModelDescriptor;
use crate::prelude::*;
use crate::sunspec::models::{self, ModelId, END_MARKER, SUNSPEC_MARKER};

use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_REGISTER: u16 = 40000;
const ALTERNATE_BASE_REGISTER: u16 = 50000;

const HEADER_WORDS: u32 = 2;
const REGISTER_SPACE: u32 = 0x1_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkerState {
    Idle,
    ReadingBaseRegister,
    ReadingModelHeader,
    ReadingModelBody,
    Advancing,
    Done,
    Failed,
}

/// A model block found on a connection. `start` is the first body word,
/// right after the two header words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredModel {
    pub id: ModelId,
    pub start: u16,
    pub length: u16,
    pub parent: ThingId,
}

impl DiscoveredModel {
    pub fn descriptor(&self) -> Result<&'static ModelDescriptor, CodecError> {
        models::lookup(self.id.into())
    }

    pub fn is(&self, model_id: u16, start: u16) -> bool {
        u16::from(self.id) == model_id && self.start == start
    }
}

/// Identity strings from the common model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommonInfo {
    pub manufacturer: String,
    pub model: String,
    pub options: String,
    pub version: String,
    pub serial_number: String,
    pub device_address: u16,
}

impl CommonInfo {
    pub fn decode(block: &RegisterBlock) -> Result<Self, CodecError> {
        let common = models::lookup(ModelId::Common.into())?;

        Ok(Self {
            manufacturer: common.text(block, "Mn")?,
            model: common.text(block, "Md")?,
            options: common.text(block, "Opt")?,
            version: common.text(block, "Vr")?,
            serial_number: common.text(block, "SN")?,
            device_address: common
                .decode(block, "DA")?
                .as_u32()
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(0),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryResult {
    pub base_register: u16,
    pub common: CommonInfo,
    pub models: Vec<DiscoveredModel>,
}

/// Walks the SunSpec model chain of one connection.
pub struct Walker<'a> {
    connection: &'a Connection,
    base_register: u16,
    state: WalkerState,
}

impl<'a> Walker<'a> {
    pub fn new(connection: &'a Connection, base_register: u16) -> Self {
        Self {
            connection,
            base_register,
            state: WalkerState::Idle,
        }
    }

    pub fn state(&self) -> WalkerState {
        self.state
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<DiscoveryResult, DiscoveryError> {
        let result = self.walk(cancel).await;
        self.state = match result {
            Ok(_) => WalkerState::Done,
            Err(_) => WalkerState::Failed,
        };
        result
    }

    async fn walk(&mut self, cancel: &CancellationToken) -> Result<DiscoveryResult, DiscoveryError> {
        self.state = WalkerState::ReadingBaseRegister;
        let base_register = self.find_marker(cancel).await?;
        debug!("{}: SunSpec marker at {}", self.connection.name(), base_register);

        let mut common = None;
        let mut models = Vec::new();
        let mut address = u32::from(base_register) + HEADER_WORDS;

        loop {
            Self::check(cancel)?;
            self.state = WalkerState::ReadingModelHeader;

            if address + HEADER_WORDS > REGISTER_SPACE {
                return Err(DiscoveryError::HeaderOutOfRange {
                    address,
                    id: 0,
                    length: 0,
                });
            }
            let header = self.read(address as u16, HEADER_WORDS as u16).await?;
            let (id, length) = (header.words()[0], header.words()[1]);

            if id == END_MARKER || length == 0 {
                debug!("{}: end marker at {}", self.connection.name(), address);
                break;
            }

            let start = address + HEADER_WORDS;
            if start + u32::from(length) > REGISTER_SPACE {
                return Err(DiscoveryError::HeaderOutOfRange { address, id, length });
            }
            let start = start as u16;

            match ModelId::try_from(id) {
                Ok(ModelId::Common) if common.is_none() => {
                    self.state = WalkerState::ReadingModelBody;
                    let body = self.read(start, length).await?;
                    let info = CommonInfo::decode(&body)?;
                    info!(
                        "{}: {} {} version {} serial {}",
                        self.connection.name(),
                        info.manufacturer,
                        info.model,
                        info.version,
                        info.serial_number
                    );
                    common = Some(info);
                    models.push(self.model(ModelId::Common, start, length));
                }
                Ok(model_id) => {
                    if common.is_none() {
                        warn!("{}: model {} precedes the common model", self.connection.name(), id);
                    }
                    let needed = models::lookup(id)?.word_length();
                    if length < needed {
                        warn!(
                            "{}: model {} at {} has length {}, need {}; skipping",
                            self.connection.name(),
                            id,
                            start,
                            length,
                            needed
                        );
                    } else {
                        debug!("{}: model {} at {} ({} words)", self.connection.name(), id, start, length);
                        models.push(self.model(model_id, start, length));
                    }
                }
                Err(_) => {
                    debug!("{}: skipping unknown model {} at {}", self.connection.name(), id, start);
                }
            }

            self.state = WalkerState::Advancing;
            address = u32::from(start) + u32::from(length);
        }

        Ok(DiscoveryResult {
            base_register,
            common: common.unwrap_or_default(),
            models,
        })
    }

    async fn find_marker(&mut self, cancel: &CancellationToken) -> Result<u16, DiscoveryError> {
        let mut candidates = vec![self.base_register];
        if self.base_register == DEFAULT_BASE_REGISTER {
            candidates.push(ALTERNATE_BASE_REGISTER);
        }

        for base in candidates {
            Self::check(cancel)?;
            match self.read(base, 2).await {
                Ok(block) if block.words() == SUNSPEC_MARKER => return Ok(base),
                Ok(block) => debug!("{}: no marker at {}: {:04x?}", self.connection.name(), base, block.words()),
                // devices without a map at this base answer with an exception
                Err(DiscoveryError::Transaction(TransactionError::ProtocolError(code))) => {
                    debug!("{}: exception {:#04x} reading {}", self.connection.name(), code, base)
                }
                Err(err) => return Err(err),
            }
        }

        Err(DiscoveryError::NoSunSpecMarkerFound(self.base_register))
    }

    async fn read(&self, start: u16, count: u16) -> Result<RegisterBlock, DiscoveryError> {
        Ok(self.connection.read_registers(start, count).await?)
    }

    fn model(&self, id: ModelId, start: u16, length: u16) -> DiscoveredModel {
        DiscoveredModel {
            id,
            start,
            length,
            parent: self.connection.id().clone(),
        }
    }

    fn check(cancel: &CancellationToken) -> Result<(), DiscoveryError> {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        Ok(())
    }
}

pub async fn discover(
    connection: &Connection,
    base_register: u16,
    cancel: &CancellationToken,
) -> Result<DiscoveryResult, DiscoveryError> {
    Walker::new(connection, base_register).run(cancel).await
}
