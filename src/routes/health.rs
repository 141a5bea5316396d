//! Unauthenticated probes, metrics, and the API description.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::state::MonitoringState;
use crate::AppState;

/// `GET /liveness`
pub async fn liveness(State(state): State<MonitoringState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /readiness`: `503` once shutdown has started.
pub async fn readiness(State(state): State<MonitoringState>) -> (StatusCode, Json<Value>) {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "shutting_down"})),
        )
    }
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics(State(state): State<MonitoringState>) -> Response {
    match state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /openapi.json`: serve the configured API description file.
pub async fn openapi(State(state): State<AppState>) -> Response {
    let path = &state.config.server.openapi_spec_file;
    match tokio::fs::read(path).await {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            warn!(path = %path, error = %e, "Unable to read API description");
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "API description not available", "code": 404})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_readiness_flips_on_shutdown() {
        let state = MonitoringState::new(None);
        let app = crate::routes::monitoring_router(state.clone());

        let (status, _) = get(app.clone(), "/readiness").await;
        assert_eq!(status, StatusCode::OK);

        state.set_ready(false);
        let (status, body) = get(app.clone(), "/readiness").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("shutting_down"));

        let (status, _) = get(app, "/liveness").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let app = crate::routes::monitoring_router(MonitoringState::new(None));
        let (status, _) = get(app, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
