use alloy::primitives::{Address, B256, Bytes};
use futures::future::join_all;
use serde::Serialize;
use tracing::instrument;

use super::{Catalog, GasEstimate, Product, Rejection, gwei_to_wei, parse_product, parse_product_id};
use crate::chain::{EVENT_PRODUCT_DELETED, ProductContract, TxParams};
use crate::encoder::OperationKind;

/// Products removed by a batch delete and the transaction of each.
///
/// Only `id` and `image` are kept per product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchDeleted {
    pub products: Vec<Product>,
    pub txs: Vec<B256>,
}

impl BatchDeleted {
    pub fn ids(&self) -> Vec<B256> {
        self.products.iter().filter_map(|product| product.id).collect()
    }

    pub fn joined_txs(&self) -> String {
        self.txs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

impl Catalog {
    /// Deletes `ids` one after another.
    ///
    /// Malformed ids are skipped. Each deletion estimates its own gas limit
    /// first. A deletion mined without its event is left out of the result.
    /// The first remote failure stops the batch, and the rejection carries
    /// what was deleted up to that point.
    #[instrument(skip_all, fields(account = %account, count = ids.len()))]
    pub async fn delete_many_products(
        &self,
        ids: &[String],
        account: Address,
        gas_price_gwei: u64,
    ) -> Result<Option<BatchDeleted>, Rejection<BatchDeleted>> {
        let Some(contract) = self.binding() else {
            return Ok(None);
        };

        let gas_price_wei = gwei_to_wei(gas_price_gwei);
        let mut deleted = BatchDeleted::default();

        for raw_id in ids {
            let Some(id) = parse_product_id(raw_id) else {
                tracing::debug!(id = %raw_id, "Skipping malformed product id");
                continue;
            };

            let gas_limit = match contract.estimate_delete(id, account).await {
                Ok(gas_limit) => gas_limit,
                Err(err) => return Err(Rejection::remote(deleted, &err)),
            };
            let tx = TxParams {
                from: account,
                gas_limit,
                gas_price_wei,
            };
            let outcome = match contract.delete_product(id, tx).await {
                Ok(outcome) => outcome,
                Err(err) => return Err(Rejection::remote(deleted, &err)),
            };

            match outcome.event(EVENT_PRODUCT_DELETED) {
                Some(event) => {
                    let product = parse_product(Some(&event.product));
                    deleted.products.push(Product {
                        id: product.id,
                        image: product.image,
                        ..Product::default()
                    });
                    deleted.txs.push(outcome.transaction_hash);
                }
                None => {
                    tracing::warn!(id = %id, tx = %outcome.transaction_hash, "Deletion mined without event");
                }
            }
        }

        Ok(Some(deleted))
    }

    /// Sums the gas of deleting each id, estimated concurrently.
    ///
    /// Failed estimates are dropped from the sum and counted in
    /// [`GasEstimate::failed`]. Nothing to estimate yields the fallback.
    pub(super) async fn estimate_many(
        &self,
        contract: &dyn ProductContract,
        account: Address,
        kind: OperationKind,
        ids: &[String],
    ) -> Result<GasEstimate, Rejection<GasEstimate>> {
        let fallback = GasEstimate::exact(self.fallback_gas);

        let mut calls: Vec<Bytes> = Vec::with_capacity(ids.len());
        for id in ids {
            match self.encoder.encode(kind, None, Some(id)) {
                Ok(Some(data)) => calls.push(data),
                Ok(None) => {}
                Err(err) => return Err(Rejection::encoding(fallback, err)),
            }
        }
        if calls.is_empty() {
            return Ok(fallback);
        }

        let results = join_all(
            calls
                .into_iter()
                .map(|data| contract.estimate_gas(account, data)),
        )
        .await;

        let mut estimate = GasEstimate::exact(0);
        for result in results {
            match result {
                Ok(gas) => estimate.gas = estimate.gas.saturating_add(gas),
                Err(err) => {
                    tracing::debug!(error = %err, "Dropping failed gas estimate");
                    estimate.failed += 1;
                }
            }
        }
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{FALLBACK_GAS, catalog_with, id_text};
    use super::super::{GasTarget, PRODUCT_NOT_FOUND};
    use super::*;
    use crate::chain::testing::{FakeLedger, GAS_PER_CALL, OWNER, product_id, sample_product};
    use crate::chain::ChainError;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    // ── helpers ──────────────────────────────────────────────────────────

    fn stocked(bytes: &[u8]) -> Arc<FakeLedger> {
        Arc::new(FakeLedger::with_products(
            bytes.iter().copied().map(sample_product).collect(),
        ))
    }

    async fn estimate(catalog: &Catalog, ids: Vec<String>) -> GasEstimate {
        catalog
            .estimate_gas(
                OWNER,
                OperationKind::Delete,
                None,
                Some(&GasTarget::Many(ids)),
            )
            .await
            .unwrap()
            .unwrap()
    }

    // ── tests ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_delete_many_skips_malformed_ids() {
        let ledger = stocked(&[1, 2]);
        let catalog = catalog_with(Arc::clone(&ledger));
        let ids = vec![
            id_text(1),
            "0x1234".to_string(),
            String::new(),
            format!("  {}  ", id_text(2)),
        ];

        let deleted = catalog
            .delete_many_products(&ids, OWNER, 5)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(deleted.ids(), vec![product_id(1), product_id(2)]);
        assert_eq!(deleted.txs.len(), 2);
        assert_eq!(deleted.products[0].name, None);
        assert_eq!(
            deleted.products[0].image.as_deref(),
            Some("https://cdn.example/1.png")
        );
        assert_eq!(
            deleted.joined_txs(),
            format!("{},{}", B256::with_last_byte(1), B256::with_last_byte(2))
        );
        // estimate + send per valid id
        assert_eq!(ledger.calls(), 4);

        let sent = ledger.sent.lock().unwrap().clone();
        assert!(sent.iter().all(|tx| tx.gas_limit == GAS_PER_CALL));
        assert!(sent.iter().all(|tx| tx.gas_price_wei == 5_000_000_000));
    }

    #[tokio::test]
    async fn test_delete_many_without_events_is_empty() {
        let ledger = stocked(&[1]);
        ledger.omit_events.store(true, Ordering::SeqCst);
        let catalog = catalog_with(ledger);

        let deleted = catalog
            .delete_many_products(&[id_text(1)], OWNER, 1)
            .await
            .unwrap()
            .unwrap();
        assert!(deleted.is_empty());
        assert!(deleted.txs.is_empty());
    }

    #[tokio::test]
    async fn test_delete_many_remote_failure_keeps_partial() {
        let ledger = stocked(&[1, 3]);
        let catalog = catalog_with(Arc::clone(&ledger));
        // the second id does not exist
        let ids = vec![id_text(1), id_text(2), id_text(3)];

        let err = catalog
            .delete_many_products(&ids, OWNER, 1)
            .await
            .unwrap_err();

        assert_eq!(err.error.as_deref(), Some("El producto no existe"));
        assert_eq!(err.partial.ids(), vec![product_id(1)]);
        assert_eq!(ledger.products.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_many_failing_estimate_stops_batch() {
        let ledger = stocked(&[1, 2]);
        ledger.failing_estimates.lock().unwrap().insert(product_id(1));
        let catalog = catalog_with(Arc::clone(&ledger));

        let err = catalog
            .delete_many_products(&[id_text(1), id_text(2)], OWNER, 1)
            .await
            .unwrap_err();
        assert!(err.partial.is_empty());
        assert_eq!(ledger.products.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_estimate_many_sums_successes() {
        let ledger = Arc::new(FakeLedger::default());
        ledger.failing_estimates.lock().unwrap().insert(product_id(2));
        let catalog = catalog_with(Arc::clone(&ledger));

        let result = estimate(&catalog, vec![id_text(1), id_text(2), id_text(3)]).await;

        assert_eq!(result.gas, 2 * GAS_PER_CALL);
        assert_eq!(result.failed, 1);
        assert_eq!(ledger.calls(), 3);
    }

    #[tokio::test]
    async fn test_estimate_many_all_failing_is_zero() {
        let ledger = Arc::new(FakeLedger::default());
        *ledger.failure.lock().unwrap() = Some(ChainError::new("execution reverted"));
        let catalog = catalog_with(ledger);

        let result = estimate(&catalog, vec![id_text(1), id_text(2)]).await;
        assert_eq!(result, GasEstimate { gas: 0, failed: 2 });
    }

    #[tokio::test]
    async fn test_estimate_many_empty_uses_fallback() {
        let ledger = Arc::new(FakeLedger::default());
        let catalog = catalog_with(Arc::clone(&ledger));

        let result = estimate(&catalog, Vec::new()).await;
        assert_eq!(result, GasEstimate { gas: FALLBACK_GAS, failed: 0 });
        assert_eq!(ledger.calls(), 0);
    }

    #[tokio::test]
    async fn test_estimate_many_rejects_malformed_id() {
        let catalog = catalog_with(Arc::new(FakeLedger::default()));

        let err = catalog
            .estimate_gas(
                OWNER,
                OperationKind::Delete,
                None,
                Some(&GasTarget::Many(vec![id_text(1), "0xzz".to_string()])),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error.as_deref(), Some(PRODUCT_NOT_FOUND));
        assert_eq!(err.partial.gas, FALLBACK_GAS);
    }
}
