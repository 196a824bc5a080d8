//! HTTP endpoints of the product ledger service.
//!
//! Every product route requires a signature token (see [`crate::auth`]) and
//! answers with the envelope `{"success": bool, "msj": string, ...}`.
//!
//! - `GET /health`: ledger connection status
//! - `POST /auth/login`, `GET /auth/verificar-token`: token check
//! - `POST /productos/consultar-gas`: gas estimate for an operation
//! - `GET /productos`, `POST /productos`: list, create
//! - `GET|PUT|DELETE /productos/{id}`: read, update, delete
//! - `POST /productos/eliminar`: delete many
//! - `GET /socket`: change notification relay
//!
//! Create and update accept either a JSON body or a `multipart/form-data`
//! form whose `imagen` file is checked and stored before the ledger is
//! touched.
//!
//! After each catalog operation the caller's balance is queried. An
//! unreachable ledger or an unknown balance answers 500 "service not
//! available" instead of the operation's result.

use alloy::primitives::Address;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::instrument;

use crate::auth::{self, Account};
use crate::catalog::{Balance, Catalog, GasTarget, PRODUCT_NOT_FOUND, Product, Rejection};
use crate::chain::ProductDraft;
use crate::config::CatalogConfig;
use crate::connection::ConnectionState;
use crate::encoder::OperationKind;
use crate::from_env::GasDefaults;
use crate::images::{self, IMAGE_FIELD, ImageStore, ImageUpload};
use crate::socket::{self, Relay};

pub const MSG_SERVICE_UNAVAILABLE: &str = "The service is not available.";
pub const MSG_LIST_UNAVAILABLE: &str =
    "Could not list the products; the service may not be available.";
pub const MSG_TOKEN_MISSING: &str = "Token not sent.";
pub const MSG_TOKEN_INVALID: &str = "Invalid token.";
pub const MSG_UNAUTHORIZED: &str = "Unauthorized.";
pub const MSG_NOTHING_DELETED: &str = "The products could not be deleted.";

/// Shared state of every handler.
pub struct AppState {
    pub catalog: Catalog,
    pub images: Arc<dyn ImageStore>,
    pub relay: Arc<Relay>,
    pub limits: CatalogConfig,
    pub gas: GasDefaults,
    pub connection: watch::Receiver<ConnectionState>,
}

impl AppState {
    /// The caller's balance, or 500 when it cannot be trusted.
    async fn balance_gate(&self, account: Address) -> Result<Balance, ApiError> {
        match self.catalog.get_balance(account).await {
            Some(balance) if !balance.is_unknown() => Ok(balance),
            _ => Err(ApiError::Unavailable(MSG_SERVICE_UNAVAILABLE)),
        }
    }

    /// Trims and caps the text fields of a product body.
    fn draft(&self, body: &ProductBody, image: String) -> ProductDraft {
        ProductDraft {
            name: limit_chars(&body.name, self.limits.name_max_chars),
            description: limit_chars(&body.description, self.limits.description_max_chars),
            image,
            featured: body.featured,
        }
    }

    /// Stores `file`, or returns `fallback` when the store fails.
    async fn store_image(&self, file: ImageUpload, replacing: Option<&str>, fallback: String) -> String {
        match self.images.upload(file, replacing).await {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(error = %err, "Image upload failed, keeping the previous image");
                fallback
            }
        }
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/productos", get(get_products).post(post_product))
        .route("/productos/consultar-gas", post(post_estimate_gas))
        .route("/productos/eliminar", post(post_delete_many))
        .route(
            "/productos/{id}",
            get(get_product).put(put_product).delete(delete_product),
        )
        .route("/socket", get(socket::get_socket))
        .route_layer(axum::middleware::from_fn(auth::require_token));

    Router::new()
        .route("/health", get(get_health))
        .route("/auth/login", post(login))
        .route("/auth/verificar-token", get(login))
        .merge(protected)
        .with_state(state)
}

/// HTTP-facing failure. Every variant renders as `{"success": false, "msj": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{}", MSG_TOKEN_MISSING)]
    MissingToken,
    #[error("{}", MSG_TOKEN_INVALID)]
    InvalidToken,
    #[error("{}", MSG_UNAUTHORIZED)]
    Unauthorized,
    #[error("{0}")]
    InvalidInput(String),
    /// The operation ran and reported nothing to act on.
    #[error("{message}")]
    Failed { message: String, balance: Balance },
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Unavailable(&'static str),
}

impl ApiError {
    fn rejected<P>(rejection: Rejection<P>) -> Self {
        ApiError::Rejected(
            rejection
                .error
                .unwrap_or_else(|| MSG_SERVICE_UNAVAILABLE.to_string()),
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            ApiError::MissingToken | ApiError::InvalidToken | ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "msj": message })),
            )
                .into_response(),
            ApiError::InvalidInput(_) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "msj": message })),
            )
                .into_response(),
            ApiError::Failed { balance, .. } => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "msj": message, "balance": balance })),
            )
                .into_response(),
            ApiError::Rejected(_) | ApiError::Unavailable(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "msj": message })),
            )
                .into_response(),
        }
    }
}

/// Product fields of a create, update or estimate body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductBody {
    #[serde(rename = "nombre", default, deserialize_with = "trimmed")]
    pub name: String,
    #[serde(rename = "descripcion", default, deserialize_with = "trimmed")]
    pub description: String,
    #[serde(rename = "imagen", default, deserialize_with = "trimmed_option")]
    pub image: Option<String>,
    #[serde(rename = "destacado", default, deserialize_with = "lenient_bool")]
    pub featured: bool,
    #[serde(rename = "gasLimit", default, deserialize_with = "lenient_u64")]
    pub gas_limit: Option<u64>,
    #[serde(rename = "gasPrice", default, deserialize_with = "lenient_u64")]
    pub gas_price: Option<u64>,
}

impl ProductBody {
    fn validate(&self) -> Result<(), ApiError> {
        if self.name.is_empty() {
            return Err(ApiError::InvalidInput("The name is required.".to_string()));
        }
        if self.description.is_empty() {
            return Err(ApiError::InvalidInput(
                "The description is required.".to_string(),
            ));
        }
        Ok(())
    }
}

/// A create or update request: JSON, or a multipart form with an optional
/// `imagen` file.
#[derive(Debug)]
pub struct ProductForm {
    pub body: ProductBody,
    pub file: Option<ImageUpload>,
}

impl ProductForm {
    /// Rejects files of the wrong type or size before anything is stored.
    fn checked(self) -> Result<(ProductBody, Option<ImageUpload>), ApiError> {
        self.body.validate()?;
        if let Some(file) = &self.file {
            images::check_upload(file).map_err(|err| ApiError::InvalidInput(err.to_string()))?;
        }
        Ok((self.body, self.file))
    }
}

impl<S: Send + Sync> FromRequest<S> for ProductForm {
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("multipart/form-data"));
        if !is_multipart {
            let Json(body) = Json::<ProductBody>::from_request(request, state).await?;
            return Ok(Self { body, file: None });
        }

        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|rejection| ApiError::InvalidInput(rejection.body_text()))?;
        let mut fields = serde_json::Map::new();
        let mut file = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::InvalidInput(err.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == IMAGE_FIELD && field.file_name().is_some() {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::InvalidInput(err.body_text()))?;
                // browsers send an empty part when no file was picked
                if !bytes.is_empty() {
                    file = Some(ImageUpload {
                        file_name,
                        content_type,
                        bytes: bytes.into(),
                    });
                }
            } else {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::InvalidInput(err.body_text()))?;
                fields.insert(name, serde_json::Value::String(text));
            }
        }
        let body = serde_json::from_value(serde_json::Value::Object(fields))
            .map_err(|err| ApiError::InvalidInput(err.to_string()))?;
        Ok(Self { body, file })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GasBody {
    #[serde(rename = "gasLimit", default, deserialize_with = "lenient_u64")]
    pub gas_limit: Option<u64>,
    #[serde(rename = "gasPrice", default, deserialize_with = "lenient_u64")]
    pub gas_price: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstimateBody {
    #[serde(rename = "tipo", default, deserialize_with = "trimmed")]
    pub kind: String,
    #[serde(rename = "producto", default)]
    pub product: Option<ProductBody>,
    #[serde(default)]
    pub id: Option<GasTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteManyBody {
    #[serde(alias = "id", default)]
    pub ids: Vec<String>,
    #[serde(rename = "gasPrice", default, deserialize_with = "lenient_u64")]
    pub gas_price: Option<u64>,
}

/// `GET /health`: whether the ledger connection is up.
#[instrument(skip_all)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connection = *state.connection.borrow();
    Json(json!({
        "connected": connection == ConnectionState::Connected && state.catalog.is_available(),
        "state": connection,
    }))
}

/// `POST /auth/login`, `GET /auth/verificar-token`: checks the caller's token
/// and returns the account it belongs to.
#[instrument(skip_all)]
pub async fn login(request: Request) -> Result<Json<serde_json::Value>, ApiError> {
    let token = auth::token_header(&request).ok_or(ApiError::Unauthorized)?;
    let account = auth::verify_token(&token, Utc::now()).map_err(|err| {
        tracing::debug!(error = %err, "Login rejected");
        ApiError::Unauthorized
    })?;
    Ok(Json(json!({
        "success": true,
        "msj": "Login successful.",
        "data": token,
        "cuenta": account,
    })))
}

/// `POST /productos/consultar-gas`
#[instrument(skip_all)]
pub async fn post_estimate_gas(
    State(state): State<Arc<AppState>>,
    Extension(Account(account)): Extension<Account>,
    payload: Result<Json<EstimateBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = payload?;
    if body.kind.is_empty() {
        return Err(ApiError::InvalidInput("The type is required.".to_string()));
    }
    let kind = OperationKind::from(body.kind.clone());
    let draft = body
        .product
        .as_ref()
        .map(|product| state.draft(product, String::new()));

    let estimate = state
        .catalog
        .estimate_gas(account, kind, draft.as_ref(), body.id.as_ref())
        .await
        .map_err(ApiError::rejected)?;
    let balance = state.balance_gate(account).await?;
    let estimate = estimate.ok_or(ApiError::Unavailable(MSG_SERVICE_UNAVAILABLE))?;

    Ok(Json(json!({
        "success": true,
        "msj": "Ok.",
        "gas": estimate.gas,
        "fallidos": estimate.failed,
        "balance": balance,
    })))
}

/// `GET /productos`
#[instrument(skip_all)]
pub async fn get_products(
    State(state): State<Arc<AppState>>,
    Extension(Account(account)): Extension<Account>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let products = state
        .catalog
        .list_products(account)
        .await
        .map_err(|rejection| match rejection.error {
            Some(error) => ApiError::Rejected(error),
            None => ApiError::Rejected(MSG_LIST_UNAVAILABLE.to_string()),
        })?;
    let balance = state
        .balance_gate(account)
        .await
        .map_err(|_| ApiError::Unavailable(MSG_LIST_UNAVAILABLE))?;
    let products = products.ok_or(ApiError::Unavailable(MSG_LIST_UNAVAILABLE))?;

    Ok(Json(json!({
        "success": true,
        "msj": "Products listed.",
        "balance": balance,
        "productos": products,
    })))
}

/// `POST /productos`
#[instrument(skip_all)]
pub async fn post_product(
    State(state): State<Arc<AppState>>,
    Extension(Account(account)): Extension<Account>,
    form: ProductForm,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (body, file) = form.checked()?;
    let image = body.image.clone().unwrap_or_default();
    let image = match file {
        Some(file) => state.store_image(file, None, image).await,
        None => image,
    };
    let draft = state.draft(&body, image);
    let gas_limit = body.gas_limit.unwrap_or(state.gas.gas_limit);
    let gas_price = body.gas_price.unwrap_or(state.gas.gas_price_gwei);

    let created = async {
        let submitted = state
            .catalog
            .create_product(&draft, account, gas_limit, gas_price)
            .await
            .map_err(ApiError::rejected)?;
        let balance = state.balance_gate(account).await?;
        let submitted = submitted.ok_or(ApiError::Unavailable(MSG_SERVICE_UNAVAILABLE))?;
        Ok::<_, ApiError>(json!({
            "success": true,
            "msj": "Product created.",
            "balance": balance,
            "producto": submitted.product,
            "tx": submitted.tx,
        }))
    }
    .await;

    if created.is_err() && !draft.image.is_empty() {
        state.images.remove(&draft.image).await;
    }
    created.map(Json)
}

/// `GET /productos/{id}`
#[instrument(skip_all)]
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Extension(Account(account)): Extension<Account>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let product = state
        .catalog
        .read_product(&id, account)
        .await
        .map_err(ApiError::rejected)?;
    let balance = state.balance_gate(account).await?;
    let product = product.ok_or(ApiError::Unavailable(MSG_SERVICE_UNAVAILABLE))?;
    if product.is_empty() {
        return Err(ApiError::Failed {
            message: PRODUCT_NOT_FOUND.to_string(),
            balance,
        });
    }

    Ok(Json(json!({
        "success": true,
        "msj": "Product retrieved.",
        "balance": balance,
        "producto": product,
    })))
}

/// `PUT /productos/{id}`: an uploaded `imagen` replaces the current image
/// under the same public id. Without one the current image is kept.
#[instrument(skip_all)]
pub async fn put_product(
    State(state): State<Arc<AppState>>,
    Extension(Account(account)): Extension<Account>,
    Path(id): Path<String>,
    form: ProductForm,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (body, file) = form.checked()?;

    let current = state
        .catalog
        .read_product(&id, account)
        .await
        .map_err(ApiError::rejected)?
        .ok_or(ApiError::Unavailable(MSG_SERVICE_UNAVAILABLE))?;
    let current_image = current.image.unwrap_or_default();
    let image = body.image.clone().unwrap_or_else(|| current_image.clone());
    let replacing = (!current_image.is_empty()).then_some(current_image.as_str());
    let (image, replaced) = match file {
        Some(file) => (state.store_image(file, replacing, image).await, replacing.is_some()),
        None => (image, false),
    };
    let draft = state.draft(&body, image);
    let gas_limit = body.gas_limit.unwrap_or(state.gas.gas_limit);
    let gas_price = body.gas_price.unwrap_or(state.gas.gas_price_gwei);

    let updated = async {
        let submitted = state
            .catalog
            .update_product(&draft, &id, account, gas_limit, gas_price)
            .await
            .map_err(ApiError::rejected)?;
        let balance = state.balance_gate(account).await?;
        let submitted = submitted.ok_or(ApiError::Unavailable(MSG_SERVICE_UNAVAILABLE))?;
        Ok::<_, ApiError>(json!({
            "success": true,
            "msj": "Product updated.",
            "balance": balance,
            "producto": submitted.product,
            "tx": submitted.tx,
        }))
    }
    .await;

    // a replacing upload shares its public id with the current image
    if updated.is_err() && !replaced && !draft.image.is_empty() && draft.image != current_image {
        state.images.remove(&draft.image).await;
    }
    updated.map(Json)
}

/// `DELETE /productos/{id}`: the product's image is removed once deleted.
#[instrument(skip_all)]
pub async fn delete_product(
    State(state): State<Arc<AppState>>,
    Extension(Account(account)): Extension<Account>,
    Path(id): Path<String>,
    payload: Result<Json<GasBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(JsonRejection::MissingJsonContentType(_)) => GasBody::default(),
        Err(rejection) => return Err(rejection.into()),
    };
    let gas_limit = body.gas_limit.unwrap_or(state.gas.gas_limit);
    let gas_price = body.gas_price.unwrap_or(state.gas.gas_price_gwei);

    let deleted = state
        .catalog
        .delete_product(&id, account, gas_limit, gas_price)
        .await
        .map_err(ApiError::rejected)?;
    let balance = state.balance_gate(account).await?;
    let deleted = deleted.ok_or(ApiError::Unavailable(MSG_SERVICE_UNAVAILABLE))?;

    remove_image(&state, &deleted.product).await;
    Ok(Json(json!({
        "success": true,
        "msj": "Product deleted.",
        "balance": balance,
        "producto": deleted.product,
        "tx": deleted.tx,
    })))
}

/// `POST /productos/eliminar`
#[instrument(skip_all)]
pub async fn post_delete_many(
    State(state): State<Arc<AppState>>,
    Extension(Account(account)): Extension<Account>,
    payload: Result<Json<DeleteManyBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = payload?;
    if body.ids.is_empty() {
        return Err(ApiError::InvalidInput("Ids are required.".to_string()));
    }
    let gas_price = body.gas_price.unwrap_or(state.gas.gas_price_gwei);

    let deleted = match state
        .catalog
        .delete_many_products(&body.ids, account, gas_price)
        .await
    {
        Ok(deleted) => deleted,
        Err(rejection) => {
            for product in &rejection.partial.products {
                remove_image(&state, product).await;
            }
            return Err(ApiError::rejected(rejection));
        }
    };
    let balance = state.balance_gate(account).await?;
    let deleted = deleted.ok_or(ApiError::Unavailable(MSG_SERVICE_UNAVAILABLE))?;
    if deleted.is_empty() {
        return Err(ApiError::Failed {
            message: MSG_NOTHING_DELETED.to_string(),
            balance,
        });
    }

    for product in &deleted.products {
        remove_image(&state, product).await;
    }
    Ok(Json(json!({
        "success": true,
        "msj": "Products deleted.",
        "balance": balance,
        "ids": deleted.ids(),
        "tx": deleted.joined_txs(),
    })))
}

async fn remove_image(state: &AppState, product: &Product) {
    if let Some(image) = product.image.as_deref().filter(|image| !image.is_empty()) {
        state.images.remove(image).await;
    }
}

fn limit_chars(text: &str, max: usize) -> String {
    text.trim().chars().take(max).collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
    Value(T),
    Text(String),
}

fn trimmed<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .map(|text| text.trim().to_string())
        .unwrap_or_default())
}

fn trimmed_option<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty()))
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Option::<Lenient<bool>>::deserialize(deserializer)? {
        Some(Lenient::Value(value)) => value,
        Some(Lenient::Text(text)) => text.trim().eq_ignore_ascii_case("true"),
        None => false,
    })
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<Lenient<u64>>::deserialize(deserializer)? {
        Some(Lenient::Value(value)) => Ok(Some(value)),
        Some(Lenient::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Lenient::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
