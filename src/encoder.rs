//! Call data encoding for gas estimation.
//!
//! [`CallEncoder`] maps an [`OperationKind`] to a catalog contract function and
//! ABI-encodes its arguments, so the cost of an operation can be estimated
//! without submitting it. The real image URL only exists after a product is
//! stored, so create and update estimates use [`MOCK_IMAGE_URL`] instead.

use alloy::dyn_abi::{DynSolValue, JsonAbiExt};
use alloy::primitives::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::catalog::parse_product_id;
use crate::chain::ProductDraft;
use crate::chain::abi::InterfaceDescriptor;

pub const MOCK_IMAGE_URL: &str = "https://esta-es-una-url-mock-para-la-imagen-debido-a-que-la-url-se-genera-solo-si-el-producto-es-creado";

/// Catalog operation whose cost is being estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum OperationKind {
    #[serde(rename = "CREAR")]
    Create,
    #[serde(rename = "ACTUALIZAR")]
    Update,
    #[serde(rename = "ELIMINAR")]
    Delete,
    /// Anything else. Encodes to nothing.
    #[serde(rename = "OTRO")]
    Other,
}

impl OperationKind {
    pub fn function_name(&self) -> Option<&'static str> {
        match self {
            OperationKind::Create => Some("crearProducto"),
            OperationKind::Update => Some("actualizarProducto"),
            OperationKind::Delete => Some("eliminarProducto"),
            OperationKind::Other => None,
        }
    }
}

impl From<String> for OperationKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREAR" | "CREATE" => OperationKind::Create,
            "ACTUALIZAR" | "UPDATE" => OperationKind::Update,
            "ELIMINAR" | "DELETE" => OperationKind::Delete,
            _ => OperationKind::Other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("invalid product identifier: {0}")]
    InvalidIdentifier(String),
    #[error("cannot encode call: {0}")]
    Abi(#[from] alloy::dyn_abi::Error),
}

#[derive(Debug, Clone)]
pub struct CallEncoder {
    descriptor: Arc<InterfaceDescriptor>,
}

impl CallEncoder {
    pub fn new(descriptor: Arc<InterfaceDescriptor>) -> Self {
        Self { descriptor }
    }

    /// Encodes the call `kind` would make.
    ///
    /// Returns `Ok(None)` when no estimate is possible: the function is not in
    /// the descriptor, or the arguments for `kind` are missing. `None` does not
    /// mean zero cost.
    pub fn encode(
        &self,
        kind: OperationKind,
        product: Option<&ProductDraft>,
        id: Option<&str>,
    ) -> Result<Option<Bytes>, EncodeError> {
        let Some(function) = kind
            .function_name()
            .and_then(|name| self.descriptor.function(name))
        else {
            return Ok(None);
        };

        let params = match (kind, product, id) {
            (OperationKind::Create, Some(product), _) => draft_params(product),
            (OperationKind::Update, Some(product), Some(id)) => {
                let mut params = draft_params(product);
                params.push(id_param(id)?);
                params
            }
            (OperationKind::Delete, _, Some(id)) => vec![id_param(id)?],
            _ => Vec::new(),
        };
        if params.is_empty() {
            return Ok(None);
        }

        let data = function.abi_encode_input(&params)?;
        Ok(Some(Bytes::from(data)))
    }
}

fn draft_params(product: &ProductDraft) -> Vec<DynSolValue> {
    vec![
        DynSolValue::String(escape_text(&product.name)),
        DynSolValue::String(escape_text(&product.description)),
        DynSolValue::String(MOCK_IMAGE_URL.to_string()),
        DynSolValue::Bool(product.featured),
    ]
}

fn id_param(id: &str) -> Result<DynSolValue, EncodeError> {
    let id = parse_product_id(id).ok_or_else(|| EncodeError::InvalidIdentifier(id.to_string()))?;
    Ok(DynSolValue::FixedBytes(id, 32))
}

/// JSON string escaping without the surrounding quotes.
fn escape_text(text: &str) -> String {
    match serde_json::to_string(text) {
        Ok(quoted) => quoted[1..quoted.len() - 1].to_string(),
        Err(_) => text.to_string(),
    }
}
