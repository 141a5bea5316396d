//! Connection management endpoints.
//!
//! - `POST /connection/status`: connected or not, plus advertised capabilities
//! - `POST /connection/disconnect`: close a connection
//! - `POST /connection/ping`: round-trip a ping directive
//! - `GET /connection`: every connection by account
//!
//! The `POST` endpoints take `{"account": "...", "node_id": "..."}`.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::RequestId;
use crate::session::DispatchError;
use crate::AppState;

/// Deadline for the agent to answer a management ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

pub const CONNECTED: &str = "connected";
pub const DISCONNECTED: &str = "disconnected";

#[derive(Debug, Deserialize)]
pub struct ConnectionId {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub node_id: String,
}

type ApiError = (StatusCode, Json<Value>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({"error": message.into(), "code": status.as_u16()})),
    )
}

fn parse_connection_id(body: &[u8]) -> Result<ConnectionId, ApiError> {
    let id: ConnectionId = serde_json::from_slice(body)
        .map_err(|e| error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    if id.account.is_empty() || id.node_id.is_empty() {
        return Err(error(
            StatusCode::BAD_REQUEST,
            "account and node_id are required",
        ));
    }
    Ok(id)
}

/// `POST /connection/status`
pub async fn status(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let id = parse_connection_id(&body)?;
    let Some(connection) = state
        .locator
        .locate(&id.account, &id.node_id, &request_id)
        .await
    else {
        return Ok(Json(json!({"status": DISCONNECTED})));
    };

    match connection.capabilities().await {
        Ok(capabilities) => Ok(Json(json!({
            "status": CONNECTED,
            "capabilities": capabilities,
        }))),
        Err(DispatchError::NotFound) => Ok(Json(json!({"status": DISCONNECTED}))),
        Err(e) => {
            warn!(account = %id.account, node_id = %id.node_id, error = %e, "Unable to read connection status");
            Err(error(StatusCode::BAD_REQUEST, e.to_string()))
        }
    }
}

/// `POST /connection/disconnect`
pub async fn disconnect(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let id = parse_connection_id(&body)?;
    let Some(connection) = state
        .locator
        .locate(&id.account, &id.node_id, &request_id)
        .await
    else {
        debug!(account = %id.account, node_id = %id.node_id, "No connection to disconnect");
        return Err(error(StatusCode::NOT_FOUND, "connection not found"));
    };

    connection
        .close()
        .await
        .map_err(|e| error(StatusCode::BAD_REQUEST, e.to_string()))?;
    info!(account = %id.account, node_id = %id.node_id, request_id = %request_id, "Disconnected connection");
    Ok(Json(json!({})))
}

/// `POST /connection/ping`
///
/// Answers `{"status":"connected","payload":<response>}`, or
/// `{"status":"disconnected"}` when the pair is unknown. A ping that fails
/// or is not answered within [`PING_TIMEOUT`] is a `400`.
pub async fn ping(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let id = parse_connection_id(&body)?;
    let Some(connection) = state
        .locator
        .locate(&id.account, &id.node_id, &request_id)
        .await
    else {
        return Ok(Json(json!({"status": DISCONNECTED})));
    };

    let pinged = tokio::time::timeout(
        PING_TIMEOUT,
        connection.ping(&id.node_id, vec![id.node_id.clone()]),
    )
    .await;

    match pinged {
        Ok(Ok(payload)) => Ok(Json(json!({"status": CONNECTED, "payload": payload}))),
        Ok(Err(DispatchError::NotFound)) => Ok(Json(json!({"status": DISCONNECTED}))),
        Ok(Err(e)) => {
            info!(account = %id.account, node_id = %id.node_id, error = %e, "Ping failed");
            Err(error(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(_) => {
            info!(account = %id.account, node_id = %id.node_id, "Ping timed out");
            Err(error(StatusCode::BAD_REQUEST, "ping timed out"))
        }
    }
}

/// `GET /connection`
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let connections: Vec<Value> = state
        .locator
        .list()
        .await
        .into_iter()
        .map(|(account, nodes)| json!({"account": account, "connections": nodes}))
        .collect();
    Json(json!({ "connections": connections }))
}
