use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failures turning register words into values and back.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("block at {start} has {available} words, {field} needs {needed}")]
    MalformedBlock {
        field: &'static str,
        start: u16,
        needed: usize,
        available: usize,
    },
    #[error("{value} does not fit in {field} ({words} words)")]
    ValueOutOfRange {
        field: &'static str,
        value: String,
        words: u16,
    },
    #[error("{field} cannot be decoded from {count} words")]
    UnsupportedWidth { field: &'static str, count: u16 },
    #[error("no field named {0}")]
    UnknownField(String),
    #[error("unknown model id {0}")]
    NotFound(u16),
}

/// Outcome of a single Modbus transaction that did not succeed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("not connected")]
    NotConnected,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("modbus exception {0:#04x}")]
    ProtocolError(u8),
    #[error("link lost: {0}")]
    LinkLost(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

impl TransactionError {
    /// Timeouts and exception replies are worth another attempt, the rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ProtocolError(_))
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DiscoveryError {
    #[error("no SunSpec marker at {0} or its alternate base")]
    NoSunSpecMarkerFound(u16),
    #[error("model {id} at {address} with length {length} runs past the register space")]
    HeaderOutOfRange { address: u32, id: u16, length: u16 },
    #[error("common model: {0}")]
    Common(#[from] CodecError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("discovery cancelled")]
    Cancelled,
}

/// Errors reported back to the host for setups and actions.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize)]
pub enum ThingError {
    #[error("hardware not available")]
    HardwareNotAvailable,
    #[error("hardware failure")]
    HardwareFailure,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("unsupported feature")]
    UnsupportedFeature,
    #[error("setup failed")]
    SetupFailed,
    #[error("thing not found")]
    ThingNotFound,
}

impl From<TransactionError> for ThingError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::NotConnected | TransactionError::TransportUnavailable(_) => {
                Self::HardwareNotAvailable
            }
            _ => Self::HardwareFailure,
        }
    }
}

impl From<DiscoveryError> for ThingError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Transaction(TransactionError::TransportUnavailable(_)) => {
                Self::HardwareNotAvailable
            }
            _ => Self::HardwareFailure,
        }
    }
}
