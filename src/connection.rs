//! Lifecycle of the connection to the ledger node.
//!
//! A single lifecycle task owns the transport and walks this state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closing -> Disconnected -> Connecting ...
//!                     |                         ^
//!                     +----- open failed -------+
//! ```
//!
//! - **Connecting**: open a fresh transport through the [`Connector`].
//! - **Connected**: bind the contract on it, register the signing identity, and
//!   publish both in the [`BindingSlot`]. Transport errors are logged and
//!   otherwise ignored.
//! - **Closing**: entered when the transport closes. The signer and the
//!   binding are cleared at once, then the task waits the reconnect delay.
//! - **Disconnected**: the dead transport and its listeners are dropped and
//!   the cycle restarts.
//!
//! Retries are unbounded with a fixed delay. All reactions run on the
//! lifecycle task, so they never overlap.

use alloy::primitives::Address;
use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chain::{
    ChainError, Connector, ProductContract, SigningIdentity, TransportEvent, TransportEvents,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

struct Bound(Arc<dyn ProductContract>);

/// The current contract binding and signer, if connected.
///
/// Written by the lifecycle task only; everyone else reads.
#[derive(Default)]
pub struct BindingSlot {
    contract: ArcSwapOption<Bound>,
    signer: ArcSwapOption<Address>,
}

impl BindingSlot {
    pub fn current(&self) -> Option<Arc<dyn ProductContract>> {
        self.contract
            .load_full()
            .map(|bound| Arc::clone(&bound.0))
    }

    pub fn signer(&self) -> Option<Address> {
        self.signer.load_full().map(|address| *address)
    }

    pub fn is_bound(&self) -> bool {
        self.contract.load().is_some()
    }

    pub(crate) fn install(&self, contract: Arc<dyn ProductContract>, signer: Option<Address>) {
        self.contract.store(Some(Arc::new(Bound(contract))));
        self.signer.store(signer.map(Arc::new));
    }

    pub(crate) fn clear(&self) {
        self.signer.store(None);
        self.contract.store(None);
    }
}

enum Command<T> {
    Replace(T, TransportEvents),
}

/// How a served transport ended.
enum Served<T> {
    Closed(T),
    Replaced(T, TransportEvents),
    Shutdown,
}

/// What to do once the reconnect delay is over.
enum Resume<T> {
    Reconnect,
    Install(T, TransportEvents),
    Shutdown,
}

struct Lifecycle<C: Connector> {
    connector: C,
    identity: Option<SigningIdentity>,
    reconnect_delay: Duration,
    slot: Arc<BindingSlot>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl<C: Connector> Lifecycle<C> {
    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Ledger connection state changed");
        }
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command<C::Transport>>) {
        let mut next: Option<(C::Transport, TransportEvents)> = None;

        loop {
            let (transport, events) = match next.take() {
                Some(link) => link,
                None => {
                    self.transition(ConnectionState::Connecting);
                    let opened = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        opened = self.connector.open() => opened,
                    };
                    match opened {
                        Ok(link) => link,
                        Err(err) => {
                            tracing::error!(error = %err, "Failed to open ledger transport");
                            match self.on_close(None, &mut commands).await {
                                Resume::Reconnect => continue,
                                Resume::Install(transport, events) => {
                                    next = Some((transport, events));
                                    continue;
                                }
                                Resume::Shutdown => break,
                            }
                        }
                    }
                }
            };

            match self.serve(transport, events, &mut commands).await {
                Served::Closed(transport) => {
                    match self.on_close(Some(transport), &mut commands).await {
                        Resume::Reconnect => {}
                        Resume::Install(transport, events) => next = Some((transport, events)),
                        Resume::Shutdown => break,
                    }
                }
                Served::Replaced(transport, events) => next = Some((transport, events)),
                Served::Shutdown => break,
            }
        }

        self.slot.clear();
        self.transition(ConnectionState::Disconnected);
        tracing::info!("Ledger connection lifecycle stopped");
    }

    fn on_connect(&self, transport: &C::Transport) -> Result<(), ChainError> {
        let contract = self.connector.bind(transport, self.identity.as_ref())?;
        let signer = self.identity.as_ref().map(SigningIdentity::address);
        self.slot.install(contract, signer);
        if let Some(signer) = signer {
            tracing::info!(signer = %signer, "Signing identity registered");
        }
        self.transition(ConnectionState::Connected);
        Ok(())
    }

    async fn serve(
        &self,
        transport: C::Transport,
        mut events: TransportEvents,
        commands: &mut mpsc::UnboundedReceiver<Command<C::Transport>>,
    ) -> Served<C::Transport> {
        if let Err(err) = self.on_connect(&transport) {
            tracing::error!(error = %err, "Failed to bind the catalog contract");
            return Served::Closed(transport);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Served::Shutdown,
                event = events.recv() => match event {
                    TransportEvent::Error(message) => {
                        tracing::warn!(error = %message, "Ledger transport error");
                    }
                    TransportEvent::Closed => return Served::Closed(transport),
                },
                Some(Command::Replace(replacement, replacement_events)) = commands.recv() => {
                    tracing::info!("Replacing ledger transport");
                    self.slot.clear();
                    return Served::Replaced(replacement, replacement_events);
                }
            }
        }
    }

    async fn on_close(
        &self,
        transport: Option<C::Transport>,
        commands: &mut mpsc::UnboundedReceiver<Command<C::Transport>>,
    ) -> Resume<C::Transport> {
        self.transition(ConnectionState::Closing);
        self.slot.clear();
        tracing::info!(
            delay_secs = self.reconnect_delay.as_secs(),
            "Ledger connection lost, reconnecting after delay"
        );

        let resume = tokio::select! {
            _ = self.shutdown.cancelled() => Resume::Shutdown,
            _ = tokio::time::sleep(self.reconnect_delay) => Resume::Reconnect,
            Some(Command::Replace(replacement, events)) = commands.recv() => {
                Resume::Install(replacement, events)
            }
        };

        drop(transport);
        self.transition(ConnectionState::Disconnected);
        resume
    }
}

/// Keeps one live connection to the ledger node.
pub struct ConnectionManager<C: Connector> {
    lifecycle: Arc<Lifecycle<C>>,
    commands: mpsc::UnboundedSender<Command<C::Transport>>,
    pending_commands: Mutex<Option<mpsc::UnboundedReceiver<Command<C::Transport>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, identity: Option<SigningIdentity>, reconnect_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (commands, pending) = mpsc::unbounded_channel();
        let lifecycle = Lifecycle {
            connector,
            identity,
            reconnect_delay,
            slot: Arc::new(BindingSlot::default()),
            state,
            shutdown: CancellationToken::new(),
        };
        Self {
            lifecycle: Arc::new(lifecycle),
            commands,
            pending_commands: Mutex::new(Some(pending)),
            task: Mutex::new(None),
        }
    }

    /// Spawns the lifecycle task. Calls after the first are no-ops.
    pub fn start(&self) {
        let pending = self
            .pending_commands
            .lock()
            .ok()
            .and_then(|mut pending| pending.take());
        let Some(commands) = pending else {
            return;
        };

        let handle = tokio::spawn(Arc::clone(&self.lifecycle).run(commands));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// Installs an externally supplied transport in place of the managed one.
    ///
    /// The current transport's listeners are detached first. Later closes
    /// follow the usual reconnection policy.
    pub fn replace_transport(&self, transport: C::Transport, events: TransportEvents) {
        if self.commands.send(Command::Replace(transport, events)).is_err() {
            tracing::warn!("Ledger connection lifecycle is gone, transport not replaced");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.lifecycle.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.state.subscribe()
    }

    pub fn binding_slot(&self) -> Arc<BindingSlot> {
        Arc::clone(&self.lifecycle.slot)
    }

    /// Stops the lifecycle task and drops the current transport.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown.cancel();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Ledger connection lifecycle panicked");
            }
        }
        self.lifecycle.slot.clear();
        self.lifecycle.transition(ConnectionState::Disconnected);
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.lifecycle.shutdown.cancel();
    }
}
