pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use tokio::sync::{broadcast, mpsc, oneshot};

pub use crate::channels::{Channels, Responder};
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::connection::{Connection, ConnectionEvent};
pub use crate::error::{CodecError, DiscoveryError, ThingError, TransactionError};
pub use crate::host::{StateValue, Thing, ThingClass, ThingDescriptor, ThingId, ThingParams};
pub use crate::options::Options;
