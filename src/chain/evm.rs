//! alloy implementation of the ledger seams.
//!
//! - [`ContractBinding`] implements [`ProductContract`] over a type-erased
//!   provider and the `sol!` bindings of the catalog contract.
//! - [`WsConnector`] opens WebSocket transports and reports their lifecycle
//!   through a `newHeads` subscription: the subscription ending means the
//!   transport closed.
//! - [`check_interface`] verifies that a loaded interface descriptor agrees
//!   with the `sol!` bindings on every selector and event topic.
//!
//! alloy's built-in pubsub reconnection is disabled; reconnection is owned by
//! [`crate::connection::ConnectionManager`].

use alloy::contract::Error as ContractError;
use alloy::network::{Ethereum, TransactionBuilder};
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::providers::{
    DynProvider, PendingTransactionError, Provider, ProviderBuilder, RootProvider, WsConnect,
};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{Log, TransactionReceipt, TransactionRequest};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::{RpcError, TransportErrorKind};
use alloy::hex;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::instrument;
use url::Url;

use crate::chain::abi::InterfaceDescriptor;
use crate::network::ContractDeployment;
use crate::chain::{
    ChainError, Connector, EVENT_PRODUCT_CREATED, EVENT_PRODUCT_DELETED, EVENT_PRODUCT_UPDATED,
    LedgerEvent, ProductContract, ProductDraft, RawProduct, SigningIdentity, TransportEvent,
    TransportEvents, TxOutcome, TxParams,
};

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    contract ProductosChain {
        struct Producto {
            bytes32 id;
            string nombre;
            string descripcion;
            string imagen;
            bool destacado;
            address creadoPor;
            uint256 creadoEn;
        }

        event EventoCrearProducto(bytes32 id, string nombre, string descripcion, string imagen, bool destacado, address creadoPor, uint256 creadoEn);
        event EventoActualizarProducto(bytes32 id, string nombre, string descripcion, string imagen, bool destacado, address creadoPor, uint256 creadoEn);
        event EventoEliminarProducto(bytes32 id, string nombre, string descripcion, string imagen, bool destacado, address creadoPor, uint256 creadoEn);

        function crearProducto(string nombre, string descripcion, string imagen, bool destacado) external;
        function editarProducto(bytes32 id) external view returns (Producto memory);
        function eliminarProducto(bytes32 id) external;
        function actualizarProducto(string nombre, string descripcion, string imagen, bool destacado, bytes32 id) external;
        function listarProductos() external view returns (Producto[] memory);
    }
}

macro_rules! impl_raw_product_from {
    ($($source:ty),+ $(,)?) => {
        $(
            impl From<$source> for RawProduct {
                fn from(value: $source) -> Self {
                    RawProduct {
                        id: value.id,
                        name: value.nombre,
                        description: value.descripcion,
                        image: value.imagen,
                        featured: value.destacado,
                        created_by: value.creadoPor,
                        created_at: u64::try_from(value.creadoEn).unwrap_or(u64::MAX),
                    }
                }
            }
        )+
    };
}

impl_raw_product_from!(
    ProductosChain::Producto,
    ProductosChain::EventoCrearProducto,
    ProductosChain::EventoActualizarProducto,
    ProductosChain::EventoEliminarProducto,
);

impl From<ContractError> for ChainError {
    fn from(err: ContractError) -> Self {
        let reason = err
            .as_revert_data()
            .and_then(|data| revert_reason(&data));
        let error = ChainError::new(err.to_string());
        match reason {
            Some(reason) => error.with_reason(reason),
            None => error,
        }
    }
}

impl From<RpcError<TransportErrorKind>> for ChainError {
    fn from(err: RpcError<TransportErrorKind>) -> Self {
        let reason = err
            .as_error_resp()
            .and_then(|payload| payload.as_revert_data())
            .and_then(|data| revert_reason(&data));
        let error = ChainError::new(err.to_string());
        match reason {
            Some(reason) => error.with_reason(reason),
            None => error,
        }
    }
}

impl From<PendingTransactionError> for ChainError {
    fn from(err: PendingTransactionError) -> Self {
        ChainError::new(err.to_string())
    }
}

/// Human-readable revert reason: the message of `Error(string)`, a
/// described `Panic(uint256)`, or revert data that is itself text.
fn revert_reason(data: &[u8]) -> Option<String> {
    let reason = alloy::sol_types::decode_revert_reason(data)?;
    let reason = match reason.strip_prefix("revert: ") {
        Some(message) => message.to_string(),
        None => reason,
    };
    (!reason.trim().is_empty()).then_some(reason)
}

/// The loaded contract interface disagrees with the compiled bindings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceMismatch {
    #[error("contract interface has no {0}")]
    Missing(&'static str),
    #[error("{name} of the contract interface is {found}, the bindings expect {expected}")]
    Selector {
        name: &'static str,
        expected: String,
        found: String,
    },
}

/// Checks that the five functions and three events of `descriptor` have the
/// selectors and topics of the `sol!` bindings.
pub fn check_interface(descriptor: &InterfaceDescriptor) -> Result<(), InterfaceMismatch> {
    let functions = [
        ("crearProducto", ProductosChain::crearProductoCall::SELECTOR),
        ("editarProducto", ProductosChain::editarProductoCall::SELECTOR),
        ("eliminarProducto", ProductosChain::eliminarProductoCall::SELECTOR),
        ("actualizarProducto", ProductosChain::actualizarProductoCall::SELECTOR),
        ("listarProductos", ProductosChain::listarProductosCall::SELECTOR),
    ];
    for (name, expected) in functions {
        let found = descriptor
            .function(name)
            .ok_or(InterfaceMismatch::Missing(name))?
            .selector();
        if found.0 != expected {
            return Err(InterfaceMismatch::Selector {
                name,
                expected: hex::encode_prefixed(expected),
                found: found.to_string(),
            });
        }
    }

    let events = [
        ("EventoCrearProducto", ProductosChain::EventoCrearProducto::SIGNATURE_HASH),
        ("EventoActualizarProducto", ProductosChain::EventoActualizarProducto::SIGNATURE_HASH),
        ("EventoEliminarProducto", ProductosChain::EventoEliminarProducto::SIGNATURE_HASH),
    ];
    for (name, expected) in events {
        let found = descriptor
            .event(name)
            .ok_or(InterfaceMismatch::Missing(name))?
            .selector();
        if found != expected {
            return Err(InterfaceMismatch::Selector {
                name,
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
    }
    Ok(())
}

fn decode_event(log: &Log) -> Option<LedgerEvent> {
    let topic = *log.topic0()?;
    if topic == ProductosChain::EventoCrearProducto::SIGNATURE_HASH {
        let decoded = log.log_decode::<ProductosChain::EventoCrearProducto>().ok()?;
        Some(LedgerEvent {
            name: EVENT_PRODUCT_CREATED,
            product: decoded.inner.data.into(),
        })
    } else if topic == ProductosChain::EventoActualizarProducto::SIGNATURE_HASH {
        let decoded = log
            .log_decode::<ProductosChain::EventoActualizarProducto>()
            .ok()?;
        Some(LedgerEvent {
            name: EVENT_PRODUCT_UPDATED,
            product: decoded.inner.data.into(),
        })
    } else if topic == ProductosChain::EventoEliminarProducto::SIGNATURE_HASH {
        let decoded = log
            .log_decode::<ProductosChain::EventoEliminarProducto>()
            .ok()?;
        Some(LedgerEvent {
            name: EVENT_PRODUCT_DELETED,
            product: decoded.inner.data.into(),
        })
    } else {
        None
    }
}

/// Catalog contract bound to one live provider.
pub struct ContractBinding {
    address: Address,
    provider: DynProvider,
    contract: ProductosChain::ProductosChainInstance<DynProvider>,
}

impl ContractBinding {
    pub fn new(address: Address, provider: DynProvider) -> Self {
        let contract = ProductosChain::new(address, provider.clone());
        Self {
            address,
            provider,
            contract,
        }
    }

    fn outcome(&self, receipt: &TransactionReceipt) -> TxOutcome {
        let events = receipt
            .inner
            .logs()
            .iter()
            .filter(|log| log.address() == self.address)
            .filter_map(decode_event)
            .collect();
        TxOutcome {
            transaction_hash: receipt.transaction_hash,
            events,
        }
    }
}

#[async_trait]
impl ProductContract for ContractBinding {
    #[instrument(skip_all, err)]
    async fn list_products(&self, from: Address) -> Result<Vec<RawProduct>, ChainError> {
        let products = self.contract.listarProductos().from(from).call().await?;
        Ok(products.into_iter().map(RawProduct::from).collect())
    }

    #[instrument(skip_all, fields(id = %id), err)]
    async fn read_product(&self, id: B256, from: Address) -> Result<RawProduct, ChainError> {
        let product = self.contract.editarProducto(id).from(from).call().await?;
        Ok(product.into())
    }

    #[instrument(skip_all, fields(from = %tx.from), err)]
    async fn create_product(
        &self,
        draft: &ProductDraft,
        tx: TxParams,
    ) -> Result<TxOutcome, ChainError> {
        let receipt = self
            .contract
            .crearProducto(
                draft.name.clone(),
                draft.description.clone(),
                draft.image.clone(),
                draft.featured,
            )
            .from(tx.from)
            .gas(tx.gas_limit)
            .gas_price(tx.gas_price_wei)
            .send()
            .await?
            .get_receipt()
            .await?;
        tracing::info!(tx = %receipt.transaction_hash, "Product creation mined");
        Ok(self.outcome(&receipt))
    }

    #[instrument(skip_all, fields(id = %id, from = %tx.from), err)]
    async fn update_product(
        &self,
        id: B256,
        draft: &ProductDraft,
        tx: TxParams,
    ) -> Result<TxOutcome, ChainError> {
        let receipt = self
            .contract
            .actualizarProducto(
                draft.name.clone(),
                draft.description.clone(),
                draft.image.clone(),
                draft.featured,
                id,
            )
            .from(tx.from)
            .gas(tx.gas_limit)
            .gas_price(tx.gas_price_wei)
            .send()
            .await?
            .get_receipt()
            .await?;
        tracing::info!(tx = %receipt.transaction_hash, "Product update mined");
        Ok(self.outcome(&receipt))
    }

    #[instrument(skip_all, fields(id = %id, from = %tx.from), err)]
    async fn delete_product(&self, id: B256, tx: TxParams) -> Result<TxOutcome, ChainError> {
        let receipt = self
            .contract
            .eliminarProducto(id)
            .from(tx.from)
            .gas(tx.gas_limit)
            .gas_price(tx.gas_price_wei)
            .send()
            .await?
            .get_receipt()
            .await?;
        tracing::info!(tx = %receipt.transaction_hash, "Product deletion mined");
        Ok(self.outcome(&receipt))
    }

    async fn estimate_delete(&self, id: B256, from: Address) -> Result<u64, ChainError> {
        Ok(self
            .contract
            .eliminarProducto(id)
            .from(from)
            .estimate_gas()
            .await?)
    }

    async fn estimate_gas(&self, from: Address, data: Bytes) -> Result<u64, ChainError> {
        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(self.address)
            .with_input(data);
        Ok(self.provider.estimate_gas(request).await?)
    }

    async fn balance(&self, account: Address) -> Result<U256, ChainError> {
        Ok(self.provider.get_balance(account).await?)
    }
}

/// Opens WebSocket transports to the ledger node and binds the deployed
/// contract on each of them.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Url,
    contract: ContractDeployment,
}

impl WsConnector {
    pub fn new(endpoint: Url, contract: ContractDeployment) -> Self {
        Self { endpoint, contract }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = RpcClient;

    async fn open(&self) -> Result<(RpcClient, TransportEvents), ChainError> {
        let connect = WsConnect::new(self.endpoint.as_str()).with_max_retries(0);
        let client = RpcClient::connect_pubsub(connect).await?;
        let events = watch_heads(client.clone()).await?;
        tracing::debug!(endpoint = %self.endpoint, "WebSocket transport open");
        Ok((client, events))
    }

    fn bind(
        &self,
        client: &RpcClient,
        identity: Option<&SigningIdentity>,
    ) -> Result<Arc<dyn ProductContract>, ChainError> {
        check_interface(&self.contract.descriptor)
            .map_err(|err| ChainError::new(err.to_string()))?;
        let provider = match identity {
            Some(identity) => ProviderBuilder::new()
                .wallet(identity.wallet())
                .connect_client(client.clone())
                .erased(),
            None => ProviderBuilder::new()
                .connect_client(client.clone())
                .erased(),
        };
        Ok(Arc::new(ContractBinding::new(
            self.contract.address,
            provider,
        )))
    }
}

/// Follows new block headers until the subscription ends.
async fn watch_heads(client: RpcClient) -> Result<TransportEvents, ChainError> {
    let provider = RootProvider::<Ethereum>::new(client);
    let mut heads = provider.subscribe_blocks().await?;
    let (sender, events) = TransportEvents::channel();

    let watcher = tokio::spawn(async move {
        let _provider = provider;
        loop {
            match heads.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    let event = TransportEvent::Error(format!("missed {skipped} block headers"));
                    if sender.send(event).is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => {
                    let _ = sender.send(TransportEvent::Closed);
                    break;
                }
            }
        }
    });

    Ok(events.with_watcher(watcher))
}
