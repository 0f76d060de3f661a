use crate::codec::{RegisterBlock, MAX_READ_WORDS};
use crate::prelude::*;
use crate::transport::Transport;

use {
    std::sync::atomic::{AtomicBool, Ordering},
    std::sync::{Arc, Mutex, MutexGuard},
    std::time::Duration,
    tokio_util::sync::CancellationToken,
};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    ReachableChanged(ThingId, bool),
}

/// Per-transaction limits, adjustable while running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionSettings {
    pub timeout: Duration,
    pub retries: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub transactions: u64,
    pub failures: u64,
    pub retries: u64,
    pub connects: u64,
    pub disconnects: u64,
}

impl ConnectionStats {
    pub fn print_summary(&self, name: &str) {
        info!("Connection statistics for {}:", name);
        info!("  Transactions: {}", self.transactions);
        info!("  Failures: {}", self.failures);
        info!("  Retries: {}", self.retries);
        info!("  Connects: {}", self.connects);
        info!("  Disconnects: {}", self.disconnects);
    }
}

enum Request<'a> {
    Read { start: u16, count: u16 },
    Write { start: u16, words: &'a [u16] },
}

/// One Modbus link to one unit. Transactions are serialized on the link;
/// a disconnect fails whatever is in flight with `NotConnected`.
pub struct Connection {
    id: ThingId,
    name: String,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    reachable: AtomicBool,
    closed: AtomicBool,
    session: Mutex<CancellationToken>,
    settings: Mutex<TransactionSettings>,
    stats: Mutex<ConnectionStats>,
    last_error: Mutex<Option<TransactionError>>,
    events: broadcast::Sender<ConnectionEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connection {
    pub fn new(
        id: ThingId,
        transport: Box<dyn Transport>,
        settings: TransactionSettings,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Arc<Self> {
        let name = transport.describe();
        let session = CancellationToken::new();
        session.cancel();

        Arc::new(Self {
            id,
            name,
            transport: tokio::sync::Mutex::new(transport),
            reachable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            session: Mutex::new(session),
            settings: Mutex::new(settings),
            stats: Mutex::new(ConnectionStats::default()),
            last_error: Mutex::new(None),
            events,
        })
    }

    pub fn id(&self) -> &ThingId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> TransactionSettings {
        *lock(&self.settings)
    }

    pub fn set_settings(&self, settings: TransactionSettings) {
        debug!("{}: timeout {:?}, {} retries", self.name, settings.timeout, settings.retries);
        *lock(&self.settings) = settings;
    }

    pub fn stats(&self) -> ConnectionStats {
        *lock(&self.stats)
    }

    pub fn last_error(&self) -> Option<TransactionError> {
        lock(&self.last_error).clone()
    }

    pub async fn connect(&self) -> Result<(), TransactionError> {
        if self.is_closed() {
            return Err(TransactionError::NotConnected);
        }
        if self.is_reachable() {
            return Ok(());
        }

        info!("{}: connecting", self.name);

        let mut transport = self.transport.lock().await;
        let timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let result = match tokio::time::timeout(timeout, transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(TransactionError::TransportUnavailable(format!(
                "connect timed out after {}s",
                CONNECT_TIMEOUT_SECS
            ))),
        };
        drop(transport);

        if let Err(err) = result {
            warn!("{}: connect failed: {}", self.name, err);
            *lock(&self.last_error) = Some(err.clone());
            return Err(err);
        }

        // a close() that raced the connect wins
        if self.is_closed() {
            let _ = self.transport.lock().await.disconnect().await;
            return Err(TransactionError::NotConnected);
        }

        lock(&self.stats).connects += 1;
        *lock(&self.session) = CancellationToken::new();
        self.set_reachable(true);
        Ok(())
    }

    /// Drops the link. In-flight requests complete with `NotConnected`.
    pub async fn disconnect(&self) {
        self.mark_unreachable();

        let mut transport = self.transport.lock().await;
        if let Err(e) = transport.disconnect().await {
            debug!("{}: disconnect: {}", self.name, e);
        }
    }

    /// Disconnects for good; later connect attempts are refused.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.disconnect().await;
        self.stats().print_summary(&self.name);
    }

    /// Waits `delay`, then tries to connect, repeating until connected or closed.
    pub async fn reconnect_after(self: Arc<Self>, delay: Duration) {
        loop {
            tokio::time::sleep(delay).await;

            if self.is_closed() || self.is_reachable() {
                return;
            }

            match self.connect().await {
                Ok(()) => return,
                Err(e) => info!("{}: reconnecting in {:?} ({})", self.name, delay, e),
            }
        }
    }

    pub async fn read_registers(&self, start: u16, count: u16) -> Result<RegisterBlock, TransactionError> {
        let session = self.session()?;
        let mut transport = self.transport.lock().await;

        let mut words = Vec::with_capacity(usize::from(count));
        let mut offset = 0u16;
        while offset < count {
            let chunk = (count - offset).min(MAX_READ_WORDS);
            let address = start
                .checked_add(offset)
                .ok_or(TransactionError::ProtocolError(ILLEGAL_DATA_ADDRESS))?;

            let request = Request::Read {
                start: address,
                count: chunk,
            };
            let part = self.execute(&mut **transport, &session, &request).await?;
            if part.len() != usize::from(chunk) {
                warn!("{}: asked for {} words at {}, got {}", self.name, chunk, address, part.len());
                return Err(TransactionError::LinkLost(format!("short reply at {}", address)));
            }
            words.extend(part);
            offset += chunk;
        }

        Ok(RegisterBlock::new(start, words))
    }

    pub async fn write_registers(&self, start: u16, words: &[u16]) -> Result<(), TransactionError> {
        let session = self.session()?;
        let mut transport = self.transport.lock().await;

        let request = Request::Write { start, words };
        self.execute(&mut **transport, &session, &request).await?;
        Ok(())
    }

    fn session(&self) -> Result<CancellationToken, TransactionError> {
        if !self.is_reachable() {
            return Err(TransactionError::NotConnected);
        }
        Ok(lock(&self.session).clone())
    }

    async fn execute(
        &self,
        transport: &mut dyn Transport,
        session: &CancellationToken,
        request: &Request<'_>,
    ) -> Result<Vec<u16>, TransactionError> {
        let settings = self.settings();
        let mut attempt = 0;

        loop {
            let op = async {
                match request {
                    Request::Read { start, count } => transport.read_holding_registers(*start, *count).await,
                    Request::Write { start, words } => {
                        transport.write_multiple_registers(*start, words).await.map(|_| Vec::new())
                    }
                }
            };

            let result = tokio::select! {
                biased;
                _ = session.cancelled() => Err(TransactionError::NotConnected),
                r = tokio::time::timeout(settings.timeout, op) => {
                    r.unwrap_or(Err(TransactionError::Timeout(settings.timeout)))
                }
            };

            match result {
                Ok(words) => {
                    lock(&self.stats).transactions += 1;
                    return Ok(words);
                }
                Err(err) if err.is_retryable() && attempt < settings.retries => {
                    attempt += 1;
                    lock(&self.stats).retries += 1;
                    debug!("{}: {}, retry {}/{}", self.name, err, attempt, settings.retries);
                }
                Err(err) => {
                    lock(&self.stats).failures += 1;
                    *lock(&self.last_error) = Some(err.clone());
                    if let TransactionError::LinkLost(reason) = &err {
                        warn!("{}: link lost: {}", self.name, reason);
                        self.mark_unreachable();
                    }
                    return Err(err);
                }
            }
        }
    }

    fn mark_unreachable(&self) {
        lock(&self.session).cancel();
        if self.is_reachable() {
            lock(&self.stats).disconnects += 1;
        }
        self.set_reachable(false);
    }

    fn set_reachable(&self, reachable: bool) {
        if self.reachable.swap(reachable, Ordering::SeqCst) == reachable {
            return;
        }

        info!(
            "{}: {}",
            self.name,
            if reachable { "reachable" } else { "not reachable" }
        );
        let _ = self
            .events
            .send(ConnectionEvent::ReachableChanged(self.id.clone(), reachable));
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("reachable", &self.is_reachable())
            .finish()
    }
}
