//! Operate on a connection owned by another replica over its management API.
//!
//! [`HttpProxy`] implements [`Sessionlike`] by calling `/job` and
//! `/connection/*` on the owning gateway with service-to-service
//! credentials. Every call records its duration and status code.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::{ACCOUNT_HEADER, CLIENT_ID_HEADER, PSK_HEADER, REQUEST_ID_HEADER};
use crate::config::ProxyConfig;
use crate::metrics;
use crate::session::{DispatchError, Sessionlike};

struct ProxySettings {
    scheme: String,
    port: u16,
    client_id: String,
    psk: String,
}

/// Shared HTTP client plus the settings every proxy uses.
#[derive(Clone)]
pub struct ProxyFactory {
    http: reqwest::Client,
    settings: Arc<ProxySettings>,
}

impl ProxyFactory {
    pub fn new(cfg: &ProxyConfig) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            settings: Arc::new(ProxySettings {
                scheme: cfg.scheme.clone(),
                port: cfg.port,
                client_id: cfg.client_id.clone(),
                psk: cfg.psk.clone(),
            }),
        })
    }

    /// Proxy for `(account, node_id)` owned by `hostname`.
    pub fn connect(
        &self,
        hostname: &str,
        account: &str,
        node_id: &str,
        request_id: &str,
    ) -> HttpProxy {
        HttpProxy {
            http: self.http.clone(),
            base_url: format!(
                "{}://{}:{}",
                self.settings.scheme, hostname, self.settings.port
            ),
            account: account.to_string(),
            node_id: node_id.to_string(),
            request_id: request_id.to_string(),
            settings: self.settings.clone(),
        }
    }
}

pub struct HttpProxy {
    http: reqwest::Client,
    base_url: String,
    account: String,
    node_id: String,
    request_id: String,
    settings: Arc<ProxySettings>,
}

impl HttpProxy {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(
        &self,
        method: &'static str,
        path: &str,
        body: &Value,
    ) -> Result<(StatusCode, Value), DispatchError> {
        let started = Instant::now();
        let sent = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .header(CLIENT_ID_HEADER, &self.settings.client_id)
            .header(ACCOUNT_HEADER, &self.account)
            .header(PSK_HEADER, &self.settings.psk)
            .header(REQUEST_ID_HEADER, &self.request_id)
            .json(body)
            .send()
            .await;

        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                metrics::proxy_request(method, None, started.elapsed());
                return Err(e.into());
            }
        };
        let status = resp.status();
        let bytes = resp.bytes().await?;
        metrics::proxy_request(method, Some(status.as_u16()), started.elapsed());
        debug!(method, url = %self.base_url, status = status.as_u16(), "Proxied request");

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        Ok((status, body))
    }

    fn connection_body(&self) -> Value {
        json!({"account": self.account, "node_id": self.node_id})
    }

    /// `status` and `ping` answer `{"status":"disconnected"}` when the owner
    /// no longer holds the connection.
    fn connected_body(status: StatusCode, body: Value) -> Result<Value, DispatchError> {
        match status {
            StatusCode::OK if body["status"] == "disconnected" => Err(DispatchError::NotFound),
            StatusCode::OK => Ok(body),
            StatusCode::NOT_FOUND => Err(DispatchError::NotFound),
            other => Err(DispatchError::UnexpectedStatus(other.as_u16())),
        }
    }
}

#[async_trait]
impl Sessionlike for HttpProxy {
    async fn send_message(
        &self,
        recipient: &str,
        _route: Vec<String>,
        payload: Value,
        directive: &str,
    ) -> Result<Uuid, DispatchError> {
        let body = json!({
            "account": self.account,
            "recipient": recipient,
            "payload": payload,
            "directive": directive,
        });
        let (status, body) = self.post("send_message", "job", &body).await?;
        match status {
            StatusCode::CREATED => body["id"]
                .as_str()
                .and_then(|id| Uuid::parse_str(id).ok())
                .ok_or_else(|| DispatchError::InvalidResponse(format!("missing job id in {body}"))),
            StatusCode::NOT_FOUND => Err(DispatchError::NotFound),
            other => Err(DispatchError::UnexpectedStatus(other.as_u16())),
        }
    }

    async fn ping(&self, _recipient: &str, _route: Vec<String>) -> Result<Value, DispatchError> {
        let (status, body) = self
            .post("ping", "connection/ping", &self.connection_body())
            .await?;
        let mut body = Self::connected_body(status, body)?;
        Ok(body["payload"].take())
    }

    async fn close(&self) -> Result<(), DispatchError> {
        match self
            .post("close", "connection/disconnect", &self.connection_body())
            .await
        {
            Ok((StatusCode::OK, _)) => {}
            Ok((status, body)) => {
                warn!(
                    account = %self.account,
                    node_id = %self.node_id,
                    status = status.as_u16(),
                    body = %body,
                    "Owning gateway did not close connection"
                );
            }
            Err(e) => {
                warn!(account = %self.account, node_id = %self.node_id, error = %e, "Unable to proxy disconnect");
            }
        }
        Ok(())
    }

    async fn capabilities(&self) -> Result<Value, DispatchError> {
        let (status, body) = self
            .post("get_capabilities", "connection/status", &self.connection_body())
            .await?;
        let mut body = Self::connected_body(status, body)?;
        Ok(body["capabilities"].take())
    }
}
