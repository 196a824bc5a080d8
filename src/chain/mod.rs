//! Ledger-facing types shared by the connection manager and the catalog.
//!
//! [`ProductContract`] is the seam between the catalog and a live contract
//! binding; [`Connector`] is the seam between the connection manager and a
//! concrete transport. The alloy implementations of both live in [`evm`].

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod abi;
pub mod evm;
#[cfg(test)]
pub(crate) mod testing;

pub const EVENT_PRODUCT_CREATED: &str = "EventoCrearProducto";
pub const EVENT_PRODUCT_UPDATED: &str = "EventoActualizarProducto";
pub const EVENT_PRODUCT_DELETED: &str = "EventoEliminarProducto";

/// A product record exactly as stored by the contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawProduct {
    pub id: B256,
    pub name: String,
    pub description: String,
    pub image: String,
    pub featured: bool,
    pub created_by: Address,
    pub created_at: u64,
}

/// Product fields submitted on create and update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductDraft {
    pub name: String,
    pub description: String,
    pub image: String,
    pub featured: bool,
}

/// Sender and fee parameters of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
    pub from: Address,
    pub gas_limit: u64,
    pub gas_price_wei: u128,
}

/// A contract event decoded from a transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub name: &'static str,
    pub product: RawProduct,
}

/// Result of a mined write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutcome {
    pub transaction_hash: B256,
    pub events: Vec<LedgerEvent>,
}

impl TxOutcome {
    pub fn event(&self, name: &str) -> Option<&LedgerEvent> {
        self.events.iter().find(|event| event.name == name)
    }
}

/// A failed remote call.
///
/// `message` carries the transport or node text; `reason` is set when the node
/// returned a revert payload that could be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ChainError {
    message: String,
    reason: Option<String>,
}

impl ChainError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Callable surface of the deployed catalog contract.
#[async_trait]
pub trait ProductContract: Send + Sync {
    async fn list_products(&self, from: Address) -> Result<Vec<RawProduct>, ChainError>;

    async fn read_product(&self, id: B256, from: Address) -> Result<RawProduct, ChainError>;

    async fn create_product(
        &self,
        draft: &ProductDraft,
        tx: TxParams,
    ) -> Result<TxOutcome, ChainError>;

    async fn update_product(
        &self,
        id: B256,
        draft: &ProductDraft,
        tx: TxParams,
    ) -> Result<TxOutcome, ChainError>;

    async fn delete_product(&self, id: B256, tx: TxParams) -> Result<TxOutcome, ChainError>;

    /// Gas needed to delete `id` when sent by `from`.
    async fn estimate_delete(&self, id: B256, from: Address) -> Result<u64, ChainError>;

    /// Gas needed to run `data` against the contract when sent by `from`.
    async fn estimate_gas(&self, from: Address, data: Bytes) -> Result<u64, ChainError>;

    /// Native balance of `account`, in wei.
    async fn balance(&self, account: Address) -> Result<U256, ChainError>;
}

/// Private key used to sign write transactions in production.
#[derive(Clone)]
pub struct SigningIdentity {
    signer: PrivateKeySigner,
}

impl SigningIdentity {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Lifecycle notification emitted by a live transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Error(String),
    Closed,
}

impl Display for TransportEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Error(message) => write!(f, "error: {message}"),
            TransportEvent::Closed => write!(f, "closed"),
        }
    }
}

/// Listener side of a transport's lifecycle notifications.
///
/// Dropping it detaches the listeners: the watcher task feeding the channel
/// is aborted.
pub struct TransportEvents {
    receiver: mpsc::UnboundedReceiver<TransportEvent>,
    watcher: Option<JoinHandle<()>>,
}

impl TransportEvents {
    pub fn channel() -> (mpsc::UnboundedSender<TransportEvent>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let events = Self {
            receiver,
            watcher: None,
        };
        (sender, events)
    }

    pub fn with_watcher(mut self, watcher: JoinHandle<()>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Next notification. A dropped sender reads as [`TransportEvent::Closed`].
    pub async fn recv(&mut self) -> TransportEvent {
        self.receiver.recv().await.unwrap_or(TransportEvent::Closed)
    }
}

impl Drop for TransportEvents {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Opens transports to the ledger node and binds the contract on them.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Send + Sync + 'static;

    async fn open(&self) -> Result<(Self::Transport, TransportEvents), ChainError>;

    /// Builds a contract binding on `transport`, registering `identity` as
    /// the signer when present.
    fn bind(
        &self,
        transport: &Self::Transport,
        identity: Option<&SigningIdentity>,
    ) -> Result<Arc<dyn ProductContract>, ChainError>;
}
