//! Caller authentication and request ids.
//!
//! Requests authenticate either with the platform identity header (base64
//! JSON carrying `identity.account_number`) or with a service-to-service
//! triple of client id, account and pre-shared key matched against the
//! configured secrets.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

pub const IDENTITY_HEADER: &str = "x-rh-identity";
pub const CLIENT_ID_HEADER: &str = "x-rh-receptor-controller-client-id";
pub const ACCOUNT_HEADER: &str = "x-rh-receptor-controller-account";
pub const PSK_HEADER: &str = "x-rh-receptor-controller-psk";
pub const REQUEST_ID_HEADER: &str = "x-rh-insights-request-id";

/// Who made the request, as established by [`require_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Identity { account: String },
    Service { client_id: String, account: String },
}

impl Principal {
    pub fn account(&self) -> &str {
        match self {
            Self::Identity { account } | Self::Service { account, .. } => account,
        }
    }
}

/// Service-to-service secrets (`client id -> psk`), injected as an
/// extension so [`require_auth`] can reach them without router state.
#[derive(Clone, Default)]
pub struct Credentials(pub Arc<HashMap<String, String>>);

impl Credentials {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self(Arc::new(secrets))
    }
}

/// Request id of the current request, generated when the caller sent none.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Account number from a base64 identity header value.
pub fn account_from_identity(encoded: &str) -> Option<String> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let identity: Value = serde_json::from_slice(&decoded).ok()?;
    identity["identity"]["account_number"]
        .as_str()
        .filter(|a| !a.is_empty())
        .map(str::to_string)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Establish the [`Principal`] for a request, if it carries valid
/// credentials.
pub fn authenticate(headers: &HeaderMap, credentials: &Credentials) -> Option<Principal> {
    if let Some(identity) = header(headers, IDENTITY_HEADER) {
        return account_from_identity(identity).map(|account| Principal::Identity { account });
    }

    let client_id = header(headers, CLIENT_ID_HEADER)?;
    let account = header(headers, ACCOUNT_HEADER)?;
    let psk = header(headers, PSK_HEADER)?;
    let expected = credentials.0.get(client_id)?;
    if !constant_time_eq(expected.as_bytes(), psk.as_bytes()) {
        debug!(client_id = %client_id, "Pre-shared key mismatch");
        return None;
    }
    Some(Principal::Service {
        client_id: client_id.to_string(),
        account: account.to_string(),
    })
}

/// Axum middleware that rejects unauthenticated requests with `401` and
/// stores the [`Principal`] as a request extension.
pub async fn require_auth(mut request: Request, next: Next) -> Response {
    let credentials = request
        .extensions()
        .get::<Credentials>()
        .cloned()
        .unwrap_or_default();

    match authenticate(request.headers(), &credentials) {
        Some(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized", "code": 401})),
        )
            .into_response(),
    }
}

/// Attach a [`RequestId`] to the request and echo it on the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = header(request.headers(), REQUEST_ID_HEADER)
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so response times do not reveal the key length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}
