//! HTTP route handlers and the routers that mount them.
//!
//! Job and management endpoints require authentication via
//! [`crate::auth::require_auth`]; the monitoring endpoints do not.

pub mod connection;
pub mod health;
pub mod job;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, Credentials};
use crate::state::MonitoringState;
use crate::AppState;

fn credentials(state: &AppState) -> Credentials {
    Credentials::new(state.config.auth.service_to_service_credentials.clone())
}

/// Management listener of the gateway and of `job_receiver`: connection
/// endpoints, `POST /job` and `GET /openapi.json`.
pub fn management_router(state: AppState) -> Router {
    let creds = credentials(&state);
    let authed = Router::new()
        .route("/connection", get(connection::list))
        .route("/connection/status", post(connection::status))
        .route("/connection/disconnect", post(connection::disconnect))
        .route("/connection/ping", post(connection::ping))
        .route("/job", post(job::submit_job))
        .layer(RequestBodyLimitLayer::new(job::MAX_JOB_BODY))
        .layer(middleware::from_fn(auth::require_auth));

    Router::new()
        .route("/openapi.json", get(health::openapi))
        .merge(authed)
        .layer(Extension(creds))
        .layer(middleware::from_fn(auth::request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `/liveness`, `/readiness`, `/metrics`.
pub fn monitoring_router(state: MonitoringState) -> Router {
    Router::new()
        .route("/liveness", get(health::liveness))
        .route("/readiness", get(health::readiness))
        .route("/metrics", get(health::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use base64::Engine;

    use crate::config::Config;
    use crate::locator::LocalLocator;
    use crate::registry::LocalRegistry;
    use crate::AppState;

    pub(crate) fn identity(account: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(
            serde_json::json!({"identity": {"account_number": account}}).to_string(),
        )
    }

    pub(crate) fn test_state(local: LocalRegistry) -> AppState {
        AppState::new(
            Arc::new(Config::default()),
            Arc::new(LocalLocator::new(local)),
        )
    }
}
