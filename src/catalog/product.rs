//! Catalog-facing product shapes.

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::chain::RawProduct;

/// Length of a product id including the `0x` prefix.
pub const PRODUCT_ID_LEN: usize = 66;

/// A product as returned to callers.
///
/// Every field is optional: the empty product is how "not found" is
/// represented, so callers check fields rather than null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<B256>,
    #[serde(rename = "nombre", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "descripcion", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "imagen", default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "destacado", default, skip_serializing_if = "Option::is_none")]
    pub featured: Option<bool>,
    #[serde(rename = "creadoPor", default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Address>,
    #[serde(rename = "creadoEn", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl Product {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Maps a contract record to a [`Product`].
///
/// A missing record, or one with a zero id (the contract's empty slot),
/// yields the empty product.
pub fn parse_product(raw: Option<&RawProduct>) -> Product {
    match raw {
        Some(raw) if !raw.id.is_zero() => Product {
            id: Some(raw.id),
            name: Some(raw.name.clone()),
            description: Some(raw.description.clone()),
            image: Some(raw.image.clone()),
            featured: Some(raw.featured),
            created_by: Some(raw.created_by),
            created_at: Some(raw.created_at),
        },
        _ => Product::default(),
    }
}

/// Parses a product id, accepting only `0x`-prefixed 32-byte hex of exactly
/// [`PRODUCT_ID_LEN`] characters after trimming.
pub fn parse_product_id(raw: &str) -> Option<B256> {
    let raw = raw.trim();
    if raw.len() != PRODUCT_ID_LEN || !raw.starts_with("0x") {
        return None;
    }
    B256::from_str(raw).ok()
}

/// An account balance in ether with eight decimals, or `-1` when unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balance(String);

impl Balance {
    const UNKNOWN: &'static str = "-1";

    pub fn unknown() -> Self {
        Balance(Self::UNKNOWN.to_string())
    }

    /// Converts wei to ether, rounding half up at the eighth decimal.
    pub fn from_wei(wei: U256) -> Self {
        // 10^18 wei per ether, 10^8 kept
        let step = U256::from(10_000_000_000u64);
        let scale = U256::from(100_000_000u64);
        let units = wei.saturating_add(step / U256::from(2u8)) / step;
        let whole = units / scale;
        let fraction = u64::try_from(units % scale).unwrap_or_default();
        Balance(format!("{whole}.{fraction:08}"))
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Balance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
