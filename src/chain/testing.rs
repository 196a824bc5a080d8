//! In-memory stand-in for the catalog contract.

use alloy::primitives::{Address, B256, Bytes, U256, address};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::chain::{
    ChainError, EVENT_PRODUCT_CREATED, EVENT_PRODUCT_DELETED, EVENT_PRODUCT_UPDATED, LedgerEvent,
    ProductContract, ProductDraft, RawProduct, TxOutcome, TxParams,
};

pub(crate) const OWNER: Address = address!("00000000000000000000000000000000000000aa");
pub(crate) const GAS_PER_CALL: u64 = 50_000;

pub(crate) fn product_id(byte: u8) -> B256 {
    B256::repeat_byte(byte)
}

pub(crate) fn sample_product(byte: u8) -> RawProduct {
    RawProduct {
        id: product_id(byte),
        name: format!("Product {byte}"),
        description: "Sample description".to_string(),
        image: format!("https://cdn.example/{byte}.png"),
        featured: byte % 2 == 0,
        created_by: OWNER,
        created_at: 1_700_000_000 + u64::from(byte),
    }
}

pub(crate) struct FakeLedger {
    pub products: Mutex<Vec<RawProduct>>,
    pub calls: AtomicUsize,
    /// Every remote call fails with this error when set.
    pub failure: Mutex<Option<ChainError>>,
    /// Writes are mined without emitting events.
    pub omit_events: AtomicBool,
    /// Gas estimates targeting these ids fail.
    pub failing_estimates: Mutex<HashSet<B256>>,
    pub balance: Mutex<Option<U256>>,
    pub sent: Mutex<Vec<TxParams>>,
    next_tx: AtomicU8,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self {
            products: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
            omit_events: AtomicBool::new(false),
            failing_estimates: Mutex::new(HashSet::new()),
            // 1.5 ether
            balance: Mutex::new(Some(U256::from(1_500_000_000_000_000_000u128))),
            sent: Mutex::new(Vec::new()),
            next_tx: AtomicU8::new(1),
        }
    }
}

impl FakeLedger {
    pub fn with_products(products: Vec<RawProduct>) -> Self {
        let ledger = Self::default();
        *ledger.products.lock().unwrap() = products;
        ledger
    }

    pub fn failing_with(message: &str) -> Self {
        let ledger = Self::default();
        *ledger.failure.lock().unwrap() = Some(ChainError::new(message));
        ledger
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn call(&self) -> Result<(), ChainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn mined(&self, tx: TxParams, name: &'static str, product: RawProduct) -> TxOutcome {
        self.sent.lock().unwrap().push(tx);
        let events = if self.omit_events.load(Ordering::SeqCst) {
            Vec::new()
        } else {
            vec![LedgerEvent { name, product }]
        };
        TxOutcome {
            transaction_hash: B256::with_last_byte(self.next_tx.fetch_add(1, Ordering::SeqCst)),
            events,
        }
    }

    fn estimate_for(&self, id: B256) -> Result<u64, ChainError> {
        if self.failing_estimates.lock().unwrap().contains(&id) {
            return Err(ChainError::new(
                "VM Exception while processing transaction: revert El producto no existe",
            ));
        }
        Ok(GAS_PER_CALL)
    }
}

fn not_found() -> ChainError {
    ChainError::new("VM Exception while processing transaction: revert El producto no existe")
}

#[async_trait]
impl ProductContract for FakeLedger {
    async fn list_products(&self, _from: Address) -> Result<Vec<RawProduct>, ChainError> {
        self.call()?;
        Ok(self.products.lock().unwrap().clone())
    }

    async fn read_product(&self, id: B256, _from: Address) -> Result<RawProduct, ChainError> {
        self.call()?;
        let products = self.products.lock().unwrap();
        Ok(products
            .iter()
            .find(|product| product.id == id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_product(
        &self,
        draft: &ProductDraft,
        tx: TxParams,
    ) -> Result<TxOutcome, ChainError> {
        self.call()?;
        let product = {
            let mut products = self.products.lock().unwrap();
            let product = RawProduct {
                id: product_id(0xf0 + products.len() as u8),
                name: draft.name.clone(),
                description: draft.description.clone(),
                image: draft.image.clone(),
                featured: draft.featured,
                created_by: tx.from,
                created_at: 1_700_000_000,
            };
            products.push(product.clone());
            product
        };
        Ok(self.mined(tx, EVENT_PRODUCT_CREATED, product))
    }

    async fn update_product(
        &self,
        id: B256,
        draft: &ProductDraft,
        tx: TxParams,
    ) -> Result<TxOutcome, ChainError> {
        self.call()?;
        let product = {
            let mut products = self.products.lock().unwrap();
            let product = products
                .iter_mut()
                .find(|product| product.id == id)
                .ok_or_else(not_found)?;
            product.name = draft.name.clone();
            product.description = draft.description.clone();
            product.image = draft.image.clone();
            product.featured = draft.featured;
            product.clone()
        };
        Ok(self.mined(tx, EVENT_PRODUCT_UPDATED, product))
    }

    async fn delete_product(&self, id: B256, tx: TxParams) -> Result<TxOutcome, ChainError> {
        self.call()?;
        let product = {
            let mut products = self.products.lock().unwrap();
            let index = products
                .iter()
                .position(|product| product.id == id)
                .ok_or_else(not_found)?;
            products.remove(index)
        };
        Ok(self.mined(tx, EVENT_PRODUCT_DELETED, product))
    }

    async fn estimate_delete(&self, id: B256, _from: Address) -> Result<u64, ChainError> {
        self.call()?;
        self.estimate_for(id)
    }

    async fn estimate_gas(&self, _from: Address, data: Bytes) -> Result<u64, ChainError> {
        self.call()?;
        // delete calls end with the target id
        if data.len() >= 36 {
            return self.estimate_for(B256::from_slice(&data[data.len() - 32..]));
        }
        Ok(GAS_PER_CALL)
    }

    async fn balance(&self, _account: Address) -> Result<U256, ChainError> {
        self.call()?;
        self.balance
            .lock()
            .unwrap()
            .ok_or_else(|| ChainError::new("header not found"))
    }
}
