pub mod discovery;
pub mod inverter;
pub mod meter;
pub mod models;
pub mod storage;

use crate::codec::RegisterBlock;
use crate::descriptor::ModelDescriptor;
use crate::prelude::*;
use crate::sunspec::discovery::DiscoveredModel;

use std::sync::Arc;

/// One discovered model block bound to the connection it lives on.
#[derive(Debug)]
pub struct ModelBlock {
    connection: Arc<Connection>,
    model: DiscoveredModel,
    descriptor: &'static ModelDescriptor,
}

impl ModelBlock {
    pub fn new(connection: Arc<Connection>, model: DiscoveredModel) -> Result<Self, CodecError> {
        let descriptor = model.descriptor()?;
        Ok(Self {
            connection,
            model,
            descriptor,
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn model(&self) -> &DiscoveredModel {
        &self.model
    }

    pub fn descriptor(&self) -> &'static ModelDescriptor {
        self.descriptor
    }

    pub async fn read(&self) -> Result<RegisterBlock, TransactionError> {
        self.connection
            .read_registers(self.model.start, self.model.length)
            .await
    }

    pub async fn write(&self, field: &str, value: &crate::codec::Value) -> Result<(), ThingError> {
        let spec = self.descriptor.field(field).map_err(|e| {
            warn!("{}: {}", self.connection.name(), e);
            ThingError::HardwareFailure
        })?;
        let words = self.descriptor.encode(field, value, 0).map_err(|e| {
            warn!("{}: {}", self.connection.name(), e);
            ThingError::InvalidParameter
        })?;

        self.connection
            .write_registers(self.model.start + spec.offset, &words)
            .await
            .map_err(|e| {
                warn!("{}: writing {} failed: {}", self.connection.name(), field, e);
                ThingError::from(e)
            })
    }
}
