//! `POST /job`: hand a directive to a connected agent.

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::auth::{Principal, RequestId};
use crate::AppState;

/// Largest accepted request body.
pub const MAX_JOB_BODY: usize = 1 << 20;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub directive: String,
}

impl JobRequest {
    /// Names of required fields that are missing or empty.
    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.account.is_empty() {
            missing.push("account");
        }
        if self.recipient.is_empty() {
            missing.push("recipient");
        }
        if self.payload.as_ref().map_or(true, Value::is_null) {
            missing.push("payload");
        }
        if self.directive.is_empty() {
            missing.push("directive");
        }
        missing
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
}

type Problem = (StatusCode, Json<Value>);

fn problem(status: StatusCode, title: &str, detail: impl Into<String>) -> Problem {
    (
        status,
        Json(json!({
            "title": title,
            "status": status.as_u16(),
            "detail": detail.into(),
        })),
    )
}

/// Parse and validate a job body.
///
/// # Errors
///
/// - `422 Unprocessable Entity`: not JSON, not an object, or unknown fields
/// - `400 Bad Request`: a required field is missing or empty
pub fn parse_job(body: &[u8]) -> Result<JobRequest, Problem> {
    let job: JobRequest = serde_json::from_slice(body).map_err(|e| {
        problem(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Unable to process json input",
            e.to_string(),
        )
    })?;
    let missing = job.missing_fields();
    if !missing.is_empty() {
        return Err(problem(
            StatusCode::BAD_REQUEST,
            "Request body is missing required fields",
            missing.join(", "),
        ));
    }
    Ok(job)
}

/// `POST /job`
///
/// # Errors
///
/// Besides the validation errors of [`parse_job`]:
///
/// - `404 Not Found`: no replica holds a connection for the pair
/// - `422 Unprocessable Entity`: the directive could not be queued in time
pub async fn submit_job(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<(StatusCode, Json<JobResponse>), Problem> {
    let job = parse_job(&body)?;
    debug!(
        principal = %principal.account(),
        account = %job.account,
        request_id = %request_id,
        "Job received"
    );

    let Some(connection) = state
        .locator
        .locate(&job.account, &job.recipient, &request_id)
        .await
    else {
        info!(account = %job.account, recipient = %job.recipient, request_id = %request_id, "No connection to the receptor node");
        return Err(problem(
            StatusCode::NOT_FOUND,
            "No connection to the receptor node",
            format!("{}:{} is not connected", job.account, job.recipient),
        ));
    };

    let payload = job.payload.unwrap_or(Value::Null);
    let id = connection
        .send_message(
            &job.recipient,
            vec![job.recipient.clone()],
            payload,
            &job.directive,
        )
        .await
        .map_err(|e| {
            info!(account = %job.account, recipient = %job.recipient, error = %e, "Unable to pass message to receptor");
            problem(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Error passing message to receptor",
                e.to_string(),
            )
        })?;

    info!(
        account = %job.account,
        recipient = %job.recipient,
        directive = %job.directive,
        job_id = %id,
        request_id = %request_id,
        "Job dispatched"
    );
    Ok((StatusCode::CREATED, Json(JobResponse { id: id.to_string() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{IDENTITY_HEADER, REQUEST_ID_HEADER};
    use crate::registry::LocalRegistry;
    use crate::routes::tests::{identity, test_state};
    use crate::session::tests::test_session;
    use crate::session::Sessionlike;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn post_job(local: &LocalRegistry, body: impl Into<Body>) -> (StatusCode, Value) {
        let app = crate::routes::management_router(test_state(local.clone()));
        let req = Request::builder()
            .method("POST")
            .uri("/job")
            .header(IDENTITY_HEADER, identity("01"))
            .header(REQUEST_ID_HEADER, "req-9")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn job() -> String {
        json!({"account": "01", "recipient": "node-a", "payload": ["p"], "directive": "x:y"})
            .to_string()
    }

    #[test]
    fn test_missing_fields_listed() {
        let job = parse_job(br#"{"account":"01","recipient":"","payload":null}"#).unwrap_err();
        assert_eq!(job.0, StatusCode::BAD_REQUEST);
        assert_eq!(job.1["detail"], "recipient, payload, directive");
    }

    #[test]
    fn test_unknown_field_unprocessable() {
        let err = parse_job(br#"{"account":"01","recipient":"a","payload":1,"directive":"d","extra":1}"#)
            .unwrap_err();
        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.1["status"], 422);
    }

    #[tokio::test]
    async fn test_job_enqueued_on_local_session() {
        let local = LocalRegistry::new();
        let (session, mut rx) = test_session("01", "node-a", 1);
        local.register("01", "node-a", session).await;

        let (status, body) = post_job(&local, job()).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().unwrap().to_string();

        let crate::protocol::Message::Payload(msg) = rx.recv().await.unwrap() else {
            panic!("expected a payload");
        };
        assert_eq!(msg.data.message_id, id);
        assert_eq!(msg.routing.recipient, "node-a");
        assert_eq!(msg.routing.route_list, vec!["node-a".to_string()]);
        assert_eq!(msg.data.directive, "x:y");
        assert_eq!(msg.data.raw_payload, json!(["p"]));
    }

    #[tokio::test]
    async fn test_unknown_connection_not_found() {
        let (status, body) = post_job(&LocalRegistry::new(), job()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
    }

    #[tokio::test]
    async fn test_malformed_json_unprocessable() {
        let (status, _) = post_job(&LocalRegistry::new(), "{not json").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_missing_directive_bad_request() {
        let body = json!({"account": "01", "recipient": "node-a", "payload": ["p"]}).to_string();
        let (status, body) = post_job(&LocalRegistry::new(), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "directive");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let big = format!(
            r#"{{"account":"01","recipient":"node-a","payload":"{}","directive":"x:y"}}"#,
            "a".repeat(MAX_JOB_BODY)
        );
        let (status, _) = post_job(&LocalRegistry::new(), big).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_closed_session_unprocessable() {
        let local = LocalRegistry::new();
        let (session, _rx) = test_session("01", "node-a", 1);
        session.cancel_token().cancel();
        local.register("01", "node-a", session).await;

        let (status, body) = post_job(&local, job()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["title"], "Error passing message to receptor");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_send_channel_times_out() {
        let local = LocalRegistry::new();
        let (session, _rx) = test_session("01", "node-a", 1);
        local.register("01", "node-a", session.clone()).await;
        session
            .send_message("node-a", vec![], json!(1), "fill")
            .await
            .unwrap();

        let (status, _) = post_job(&local, job()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_job_for_remote_connection_forwarded_to_owner() {
        use crate::config::{Config, ProxyConfig};
        use crate::locator::{LayeredLocator, LocalLocator, RedisLocator};
        use crate::proxy::ProxyFactory;
        use crate::registry::{GlobalRegistry, MemoryRegistry};
        use crate::AppState;
        use std::sync::Arc;

        // Owning gateway holds the live session and accepts the proxy's psk.
        let owner_local = LocalRegistry::new();
        let (session, mut rx) = test_session("01", "node-a", 1);
        owner_local.register("01", "node-a", session).await;
        let mut owner_config = Config::default();
        owner_config
            .auth
            .service_to_service_credentials
            .insert("gateway".into(), "s3cret".into());
        let owner_app = crate::routes::management_router(AppState::new(
            Arc::new(owner_config),
            Arc::new(LocalLocator::new(owner_local)),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, owner_app).await.unwrap() });

        // Entry gateway has no session, only the claim naming the owner.
        let global = MemoryRegistry::new();
        global.register("01", "node-a", "127.0.0.1").await.unwrap();
        let proxies = ProxyFactory::new(&ProxyConfig {
            scheme: "http".into(),
            port,
            timeout_secs: 5,
            client_id: "gateway".into(),
            psk: "s3cret".into(),
        })
        .unwrap();
        let locator = LayeredLocator::new(
            LocalLocator::new(LocalRegistry::new()),
            RedisLocator::new(Arc::new(global), proxies),
            "10.9.9.9".into(),
        );
        let entry_app = crate::routes::management_router(AppState::new(
            Arc::new(Config::default()),
            Arc::new(locator),
        ));

        let req = Request::builder()
            .method("POST")
            .uri("/job")
            .header(IDENTITY_HEADER, identity("01"))
            .header("content-type", "application/json")
            .body(Body::from(job()))
            .unwrap();
        let resp = entry_app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: JobResponse = serde_json::from_slice(&bytes).unwrap();

        let crate::protocol::Message::Payload(msg) = rx.recv().await.unwrap() else {
            panic!("expected a payload");
        };
        assert_eq!(msg.data.message_id, body.id);
        assert_eq!(msg.routing.recipient, "node-a");
        assert_eq!(msg.data.directive, "x:y");
        assert_eq!(msg.data.raw_payload, json!(["p"]));
    }
}
