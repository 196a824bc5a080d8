//! Product catalog operations over the current contract binding.
//!
//! Every operation has the same shape:
//!
//! 1. No binding in the [`BindingSlot`] means the ledger is unreachable and
//!    the call returns `Ok(None)` without doing anything else.
//! 2. Identifiers are validated locally before any remote call.
//! 3. The contract is called, and write operations must emit their named
//!    event. A mined transaction without the event is a failure.
//! 4. Failures come back as a [`Rejection`] carrying whatever was computed
//!    so far and the normalized error message.

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use tracing::instrument;

use crate::chain::{
    ChainError, EVENT_PRODUCT_CREATED, EVENT_PRODUCT_DELETED, EVENT_PRODUCT_UPDATED,
    ProductContract, ProductDraft, TxOutcome, TxParams,
};
use crate::connection::BindingSlot;
use crate::encoder::{CallEncoder, EncodeError, OperationKind};
use crate::errors;

mod batch;
mod product;

pub use batch::BatchDeleted;
pub use product::{Balance, PRODUCT_ID_LEN, Product, parse_product, parse_product_id};

pub const PRODUCT_NOT_FOUND: &str = "The product does not exist.";
pub const CREATE_FAILED: &str = "The product could not be created; the contract may not exist or the account does not have enough Ether.";
pub const UPDATE_FAILED: &str = "The product could not be updated; the contract may not exist or the account does not have enough Ether.";
pub const DELETE_FAILED: &str = "The product could not be deleted; the contract may not exist or the account does not have enough Ether.";

const WEI_PER_GWEI: u128 = 1_000_000_000;

/// A failed catalog operation.
///
/// `partial` is the result scaffold as it stood when the operation failed.
/// `error` is `None` when the failure could not be mapped to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection<P> {
    pub partial: P,
    pub error: Option<String>,
}

impl<P> Rejection<P> {
    /// A failure decided locally, before or after the remote call.
    pub fn domain(partial: P, message: &str) -> Self {
        Self {
            partial,
            error: Some(message.to_string()),
        }
    }

    /// A failure raised by the ledger, passed through the normalizer.
    pub fn remote(partial: P, failure: &ChainError) -> Self {
        let error = errors::normalize(failure);
        tracing::warn!(error = %failure, normalized = ?error, "Ledger call failed");
        Self { partial, error }
    }

    fn encoding(partial: P, failure: EncodeError) -> Self {
        match failure {
            EncodeError::InvalidIdentifier(_) => Self::domain(partial, PRODUCT_NOT_FOUND),
            EncodeError::Abi(err) => {
                tracing::error!(error = %err, "Failed to encode call data");
                Self {
                    partial,
                    error: None,
                }
            }
        }
    }
}

impl<P> Display for Rejection<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            Some(error) => f.write_str(error),
            None => f.write_str("catalog operation failed"),
        }
    }
}

impl<P: Debug> std::error::Error for Rejection<P> {}

/// A mined write and the product its event reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submitted {
    pub product: Product,
    pub tx: B256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GasEstimate {
    pub gas: u64,
    /// Per-item estimates dropped from a batch because they failed.
    pub failed: usize,
}

impl GasEstimate {
    fn exact(gas: u64) -> Self {
        Self { gas, failed: 0 }
    }
}

/// The product or products a gas estimate targets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum GasTarget {
    One(String),
    Many(Vec<String>),
}

pub fn gwei_to_wei(gwei: u64) -> u128 {
    u128::from(gwei) * WEI_PER_GWEI
}

pub struct Catalog {
    slot: Arc<BindingSlot>,
    encoder: CallEncoder,
    fallback_gas: u64,
}

impl Catalog {
    pub fn new(slot: Arc<BindingSlot>, encoder: CallEncoder, fallback_gas: u64) -> Self {
        Self {
            slot,
            encoder,
            fallback_gas,
        }
    }

    pub fn is_available(&self) -> bool {
        self.slot.is_bound()
    }

    fn binding(&self) -> Option<Arc<dyn ProductContract>> {
        self.slot.current()
    }

    #[instrument(skip_all, fields(account = %account))]
    pub async fn list_products(
        &self,
        account: Address,
    ) -> Result<Option<Vec<Product>>, Rejection<Vec<Product>>> {
        let Some(contract) = self.binding() else {
            return Ok(None);
        };

        let records = contract
            .list_products(account)
            .await
            .map_err(|err| Rejection::remote(Vec::new(), &err))?;
        Ok(Some(
            records.iter().map(|record| parse_product(Some(record))).collect(),
        ))
    }

    #[instrument(skip_all, fields(account = %account))]
    pub async fn read_product(
        &self,
        id: &str,
        account: Address,
    ) -> Result<Option<Product>, Rejection<Product>> {
        let Some(contract) = self.binding() else {
            return Ok(None);
        };
        let id = parse_product_id(id)
            .ok_or_else(|| Rejection::domain(Product::default(), PRODUCT_NOT_FOUND))?;

        let record = contract
            .read_product(id, account)
            .await
            .map_err(|err| Rejection::remote(Product::default(), &err))?;
        Ok(Some(parse_product(Some(&record))))
    }

    #[instrument(skip_all, fields(account = %account, gas_limit = gas_limit, gas_price_gwei = gas_price_gwei))]
    pub async fn create_product(
        &self,
        draft: &ProductDraft,
        account: Address,
        gas_limit: u64,
        gas_price_gwei: u64,
    ) -> Result<Option<Submitted>, Rejection<Product>> {
        let Some(contract) = self.binding() else {
            return Ok(None);
        };

        let tx = tx_params(account, gas_limit, gas_price_gwei);
        let outcome = contract.create_product(draft, tx).await;
        settle(outcome, EVENT_PRODUCT_CREATED, CREATE_FAILED).map(Some)
    }

    #[instrument(skip_all, fields(account = %account, gas_limit = gas_limit, gas_price_gwei = gas_price_gwei))]
    pub async fn update_product(
        &self,
        draft: &ProductDraft,
        id: &str,
        account: Address,
        gas_limit: u64,
        gas_price_gwei: u64,
    ) -> Result<Option<Submitted>, Rejection<Product>> {
        let Some(contract) = self.binding() else {
            return Ok(None);
        };
        let id = parse_product_id(id)
            .ok_or_else(|| Rejection::domain(Product::default(), PRODUCT_NOT_FOUND))?;

        let tx = tx_params(account, gas_limit, gas_price_gwei);
        let outcome = contract.update_product(id, draft, tx).await;
        settle(outcome, EVENT_PRODUCT_UPDATED, UPDATE_FAILED).map(Some)
    }

    #[instrument(skip_all, fields(account = %account, gas_limit = gas_limit, gas_price_gwei = gas_price_gwei))]
    pub async fn delete_product(
        &self,
        id: &str,
        account: Address,
        gas_limit: u64,
        gas_price_gwei: u64,
    ) -> Result<Option<Submitted>, Rejection<Product>> {
        let Some(contract) = self.binding() else {
            return Ok(None);
        };
        let id = parse_product_id(id)
            .ok_or_else(|| Rejection::domain(Product::default(), PRODUCT_NOT_FOUND))?;

        let tx = tx_params(account, gas_limit, gas_price_gwei);
        let outcome = contract.delete_product(id, tx).await;
        settle(outcome, EVENT_PRODUCT_DELETED, DELETE_FAILED).map(Some)
    }

    /// Estimates the gas `kind` would use.
    ///
    /// A single target that cannot be encoded into a call yields the
    /// fallback estimate. A list of targets is estimated concurrently, see
    /// [`GasEstimate::failed`].
    #[instrument(skip_all, fields(account = %account, kind = ?kind))]
    pub async fn estimate_gas(
        &self,
        account: Address,
        kind: OperationKind,
        product: Option<&ProductDraft>,
        target: Option<&GasTarget>,
    ) -> Result<Option<GasEstimate>, Rejection<GasEstimate>> {
        let Some(contract) = self.binding() else {
            return Ok(None);
        };
        let fallback = GasEstimate::exact(self.fallback_gas);

        let id = match target {
            Some(GasTarget::Many(ids)) => {
                return self
                    .estimate_many(contract.as_ref(), account, kind, ids)
                    .await
                    .map(Some);
            }
            Some(GasTarget::One(id)) => Some(id.as_str()),
            None => None,
        };

        let data = self
            .encoder
            .encode(kind, product, id)
            .map_err(|err| Rejection::encoding(fallback, err))?;
        let Some(data) = data else {
            return Ok(Some(fallback));
        };

        let gas = contract
            .estimate_gas(account, data)
            .await
            .map_err(|err| Rejection::remote(fallback, &err))?;
        Ok(Some(GasEstimate::exact(gas)))
    }

    /// Native balance of `account`.
    ///
    /// `None` only when the ledger is unreachable. A failed query is logged
    /// and reported as [`Balance::unknown`].
    pub async fn get_balance(&self, account: Address) -> Option<Balance> {
        let contract = self.binding()?;
        match contract.balance(account).await {
            Ok(wei) => Some(Balance::from_wei(wei)),
            Err(err) => {
                tracing::warn!(error = %err, account = %account, "Balance query failed");
                Some(Balance::unknown())
            }
        }
    }
}

fn tx_params(from: Address, gas_limit: u64, gas_price_gwei: u64) -> TxParams {
    TxParams {
        from,
        gas_limit,
        gas_price_wei: gwei_to_wei(gas_price_gwei),
    }
}

fn settle(
    outcome: Result<TxOutcome, ChainError>,
    event: &str,
    missing_event: &str,
) -> Result<Submitted, Rejection<Product>> {
    let outcome = outcome.map_err(|err| Rejection::remote(Product::default(), &err))?;
    match outcome.event(event) {
        Some(emitted) => Ok(Submitted {
            product: parse_product(Some(&emitted.product)),
            tx: outcome.transaction_hash,
        }),
        None => {
            tracing::warn!(
                tx = %outcome.transaction_hash,
                event,
                "Transaction mined without the expected event"
            );
            Err(Rejection::domain(Product::default(), missing_event))
        }
    }
}
