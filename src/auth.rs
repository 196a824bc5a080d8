//! Signature-token authentication.
//!
//! Clients send an `x-token` header holding base64 JSON
//! `{"signature": "0x...", "body": "..."}`. The body is a plain-text message
//! signed with `personal_sign` (EIP-191) by the caller's wallet. Its
//! `Expiration Time` and `Not Before` lines bound the token's validity when
//! present. The recovered signer becomes the request's [`Account`].

use alloy::primitives::{Address, Signature, hex};
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::http::header::ACCESS_CONTROL_EXPOSE_HEADERS;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::handlers::ApiError;

pub const TOKEN_HEADER: &str = "x-token";

const EXPIRATION_TIME: &str = "Expiration Time";
const NOT_BEFORE: &str = "Not Before";

/// The wallet address that signed the request's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account(pub Address);

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("token payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("token signature is malformed: {0}")]
    SignatureHex(#[from] hex::FromHexError),
    #[error("token signature is invalid: {0}")]
    Signature(#[from] alloy::primitives::SignatureError),
    #[error("invalid {field} in token body: {value}")]
    Timestamp { field: &'static str, value: String },
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("token is not valid before {0}")]
    NotYetValid(DateTime<Utc>),
}

#[derive(Deserialize)]
struct SignedToken {
    signature: String,
    body: String,
}

/// Verifies `token` at instant `now` and returns the signer.
pub fn verify_token(token: &str, now: DateTime<Utc>) -> Result<Address, TokenError> {
    let raw = STANDARD.decode(token.trim())?;
    let signed: SignedToken = serde_json::from_slice(&raw)?;

    let signature = Signature::from_raw(&hex::decode(signed.signature.trim())?)?;
    let signer = signature.recover_address_from_msg(signed.body.as_bytes())?;

    if let Some(expires) = body_timestamp(&signed.body, EXPIRATION_TIME)? {
        if expires < now {
            return Err(TokenError::Expired(expires));
        }
    }
    if let Some(not_before) = body_timestamp(&signed.body, NOT_BEFORE)? {
        if not_before > now {
            return Err(TokenError::NotYetValid(not_before));
        }
    }
    Ok(signer)
}

fn body_timestamp(body: &str, field: &'static str) -> Result<Option<DateTime<Utc>>, TokenError> {
    let Some(value) = body.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == field).then(|| value.trim())
    }) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| Some(timestamp.with_timezone(&Utc)))
        .map_err(|_| TokenError::Timestamp {
            field,
            value: value.to_string(),
        })
}

/// Reads the token header, trimmed, if present and non-empty.
pub fn token_header(request: &Request) -> Option<String> {
    request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Rejects requests without a valid token and attaches the [`Account`].
///
/// The token is echoed back on the response so browser clients can keep it.
pub async fn require_token(mut request: Request, next: Next) -> Response {
    let Some(token) = token_header(&request) else {
        return ApiError::MissingToken.into_response();
    };
    let account = match verify_token(&token, Utc::now()) {
        Ok(account) => account,
        Err(err) => {
            tracing::debug!(error = %err, "Rejected token");
            return ApiError::InvalidToken.into_response();
        }
    };

    request.extensions_mut().insert(Account(account));
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(TOKEN_HEADER),
    );
    if let Ok(value) = HeaderValue::from_str(&token) {
        headers.insert(TOKEN_HEADER, value);
    }
    response
}
