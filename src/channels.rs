use crate::prelude::*;

use std::sync::{Arc, Mutex};

/// A one-shot reply slot that can travel inside a broadcast message.
pub type Responder<T> = Arc<Mutex<Option<oneshot::Sender<T>>>>;

pub fn responder<T>() -> (Responder<T>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

/// Sends `value` through `responder` unless someone already answered.
pub fn respond<T>(responder: &Responder<T>, value: T) {
    let sender = responder
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();

    if let Some(sender) = sender {
        if sender.send(value).is_err() {
            debug!("responder dropped before reply");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channels {
    pub to_plugin: broadcast::Sender<crate::plugin::ChannelData>,
    pub from_plugin: broadcast::Sender<crate::host::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            to_plugin: Self::channel(),
            from_plugin: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
