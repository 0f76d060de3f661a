use crate::prelude::*;
use crate::sunspec::discovery::DiscoveryResult;

use {std::time::Duration, tokio::task::JoinHandle, tokio_util::sync::CancellationToken};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupState {
    WaitingReachable,
    Discovering,
    InstantiatingChildren,
    Complete,
    Aborted,
    Failed(ThingError),
}

impl SetupState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Failed(_))
    }

    fn can_advance_to(self, next: SetupState) -> bool {
        use SetupState::*;

        match (self, next) {
            (WaitingReachable, Discovering) => true,
            (Discovering, InstantiatingChildren) | (Discovering, Complete) => true,
            (InstantiatingChildren, Complete) => true,
            // wallboxes have nothing to discover
            (WaitingReachable, Complete) => true,
            (current, Aborted) | (current, Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Results of the background steps of a setup, sent back to the plugin loop.
#[derive(Debug)]
pub enum SetupEvent {
    Connected(ThingId, std::result::Result<(), TransactionError>),
    Discovered(ThingId, std::result::Result<DiscoveryResult, DiscoveryError>),
    /// The network monitor saw the device come or go.
    Reachable(ThingId, bool),
    TimedOut(ThingId),
}

impl SetupEvent {
    pub fn thing_id(&self) -> &ThingId {
        match self {
            Self::Connected(id, _) | Self::Discovered(id, _) | Self::Reachable(id, _) | Self::TimedOut(id) => id,
        }
    }
}

pub type SetupSender = mpsc::UnboundedSender<SetupEvent>;
pub type SetupReceiver = mpsc::UnboundedReceiver<SetupEvent>;

/// One thing whose setup has not finished yet.
#[derive(Debug)]
pub struct PendingSetup {
    thing: Thing,
    state: SetupState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    waiting_for: Option<ThingId>,
}

impl PendingSetup {
    pub fn new(thing: Thing) -> Self {
        Self {
            thing,
            state: SetupState::WaitingReachable,
            cancel: CancellationToken::new(),
            task: None,
            waiting_for: None,
        }
    }

    /// A child setup that can only continue once `parent` is set up.
    pub fn waiting_for(thing: Thing, parent: ThingId) -> Self {
        let mut setup = Self::new(thing);
        setup.waiting_for = Some(parent);
        setup
    }

    pub fn thing(&self) -> &Thing {
        &self.thing
    }

    pub fn state(&self) -> SetupState {
        self.state
    }

    pub fn parent(&self) -> Option<&ThingId> {
        self.waiting_for.as_ref()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_task(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.task.replace(task) {
            previous.abort();
        }
    }

    /// True while a connect or discovery task is still running.
    pub fn is_busy(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the running step but keeps the setup alive, to wait for the device.
    pub fn park(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Sends `TimedOut` after `timeout` unless the setup ends first.
    pub fn set_deadline(&self, timeout: Duration, tx: SetupSender) {
        let (cancel, id) = (self.cancel.clone(), self.thing.id.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(SetupEvent::TimedOut(id));
                }
            }
        });
    }

    pub fn advance(&mut self, next: SetupState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            bail!("{}: setup cannot go from {:?} to {:?}", self.thing.id, self.state, next);
        }
        debug!("{}: setup {:?} -> {:?}", self.thing.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Cancels outstanding work. Results arriving afterwards are dropped.
    pub fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if !self.state.is_terminal() {
            self.state = SetupState::Aborted;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for PendingSetup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ThingClass;

    fn thing() -> Thing {
        Thing {
            id: ThingId::new("sunspec/roof"),
            class: ThingClass::SunSpecConnection,
            name: "roof".to_string(),
            parent: None,
            params: ThingParams::SunSpecConnection {
                address: "10.0.0.2".to_string(),
                port: 502,
                slave_id: 1,
                mac: None,
                base_register: 40000,
            },
        }
    }

    #[test]
    fn follows_the_discovery_path() {
        let mut setup = PendingSetup::new(thing());
        setup.advance(SetupState::Discovering).unwrap();
        setup.advance(SetupState::InstantiatingChildren).unwrap();
        setup.advance(SetupState::Complete).unwrap();
        assert!(setup.state().is_terminal());
    }

    #[test]
    fn rejects_skipping_and_leaving_terminal_states() {
        let mut setup = PendingSetup::new(thing());
        assert!(setup.advance(SetupState::InstantiatingChildren).is_err());

        setup.advance(SetupState::Failed(ThingError::HardwareNotAvailable)).unwrap();
        assert!(setup.advance(SetupState::Discovering).is_err());
        assert!(setup.advance(SetupState::Aborted).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_while_the_setup_lives() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let setup = PendingSetup::new(thing());
        setup.set_deadline(Duration::from_secs(30), tx.clone());

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SetupEvent::TimedOut(id) if id == ThingId::new("sunspec/roof")));

        let finished = PendingSetup::new(thing());
        finished.set_deadline(Duration::from_secs(30), tx);
        drop(finished);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn park_stops_the_step_only() {
        let mut setup = PendingSetup::new(thing());
        setup.set_task(tokio::spawn(std::future::pending::<()>()));
        assert!(setup.is_busy());

        setup.park();
        assert!(!setup.is_busy());
        assert!(!setup.is_cancelled());
        assert_eq!(setup.state(), SetupState::WaitingReachable);
    }

    #[test]
    fn abort_cancels_and_sticks() {
        let mut setup = PendingSetup::new(thing());
        setup.advance(SetupState::Discovering).unwrap();

        setup.abort();
        assert_eq!(setup.state(), SetupState::Aborted);
        assert!(setup.is_cancelled());
        assert!(setup.advance(SetupState::Complete).is_err());
    }
}
