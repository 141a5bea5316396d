//! Per-connection session handle and the dispatch capability shared by local
//! sessions and cross-replica proxies.

pub mod transport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics;
use crate::protocol::{Message, PayloadMessage, ProtocolError, RouteTableMessage, Timestamp};
use crate::queue::ResponseRecord;

pub use transport::{Transport, TransportSettings};

/// Directive an agent answers with its own clock.
pub const PING_DIRECTIVE: &str = "receptor:ping";

/// Errors that end a transport.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("write deadline exceeded")]
    WriteTimeout,
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Errors from operating on a connection, local or remote.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("connection is closed")]
    Closed,
    #[error("timed out waiting on the connection")]
    Timeout,
    #[error("connection not found on the owning gateway")]
    NotFound,
    #[error("owning gateway answered with status {0}")]
    UnexpectedStatus(u16),
    #[error("proxy request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response from owning gateway: {0}")]
    InvalidResponse(String),
}

/// What can be done with a connection regardless of which replica owns it.
#[async_trait]
pub trait Sessionlike: Send + Sync {
    /// Queue a directive for `recipient`. Returns the job id.
    async fn send_message(
        &self,
        recipient: &str,
        route: Vec<String>,
        payload: Value,
        directive: &str,
    ) -> Result<Uuid, DispatchError>;

    /// Round-trip a ping directive and return the agent's response record.
    async fn ping(&self, recipient: &str, route: Vec<String>) -> Result<Value, DispatchError>;

    async fn close(&self) -> Result<(), DispatchError>;

    async fn capabilities(&self) -> Result<Value, DispatchError>;
}

/// Waiters for synchronous responses, keyed by the job id they answer.
#[derive(Clone, Default)]
pub struct PendingResponses {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<ResponseRecord>>>>,
}

impl PendingResponses {
    pub(crate) fn register(&self, job_id: String, tx: oneshot::Sender<ResponseRecord>) -> PendingGuard {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(job_id.clone(), tx);
        }
        PendingGuard {
            pending: self.clone(),
            job_id,
        }
    }

    /// Hand `record` to whoever waits on its `in_response_to`. Gives the
    /// record back when nobody does.
    pub fn dispatch(&self, record: ResponseRecord) -> Option<ResponseRecord> {
        let waiter = self
            .inner
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&record.in_response_to));
        match waiter {
            Some(tx) => match tx.send(record) {
                Ok(()) => None,
                Err(record) => Some(record),
            },
            None => Some(record),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a waiter when the ping future completes or is dropped.
pub(crate) struct PendingGuard {
    pending: PendingResponses,
    job_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.inner.lock() {
            map.remove(&self.job_id);
        }
    }
}

/// Identity of a connected peer, known once its `HI` arrives.
#[derive(Debug, Clone)]
pub struct Peer {
    pub account: String,
    pub node_id: String,
    pub capabilities: Value,
}

/// Handles a session needs from its transport.
#[derive(Clone)]
pub struct Outbound {
    pub send_tx: mpsc::Sender<Message>,
    pub cancel: CancellationToken,
    pub send_timeout: Duration,
}

/// A live, handshaken agent connection on this replica.
pub struct Session {
    peer: Peer,
    local_node_id: String,
    request_id: String,
    outbound: Outbound,
    pending: PendingResponses,
    route_table: RwLock<Option<RouteTableMessage>>,
}

impl Session {
    pub fn new(peer: Peer, local_node_id: String, request_id: String, outbound: Outbound) -> Self {
        Self {
            peer,
            local_node_id,
            request_id,
            outbound,
            pending: PendingResponses::default(),
            route_table: RwLock::new(None),
        }
    }

    pub fn account(&self) -> &str {
        &self.peer.account
    }

    pub fn node_id(&self) -> &str {
        &self.peer.node_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.outbound.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.cancel.is_cancelled()
    }

    /// Keep the latest adjacency the peer advertised.
    pub fn record_route_table(&self, table: RouteTableMessage) {
        if let Ok(mut slot) = self.route_table.write() {
            *slot = Some(table);
        }
    }

    pub fn route_table(&self) -> Option<RouteTableMessage> {
        self.route_table.read().ok().and_then(|t| t.clone())
    }

    /// Queue `msg` for the writer, bounded by the send timeout.
    async fn enqueue(&self, msg: Message) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        tokio::select! {
            biased;
            () = self.outbound.cancel.cancelled() => Err(DispatchError::Closed),
            sent = tokio::time::timeout(self.outbound.send_timeout, self.outbound.send_tx.send(msg)) => {
                match sent {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(DispatchError::Closed),
                    Err(_) => Err(DispatchError::Timeout),
                }
            }
        }
    }

    fn directive(
        &self,
        job_id: Uuid,
        recipient: &str,
        route: Vec<String>,
        payload: Value,
        directive: &str,
    ) -> Message {
        Message::Payload(PayloadMessage::directive(
            job_id,
            &self.local_node_id,
            recipient,
            route,
            directive,
            payload,
        ))
    }
}

#[async_trait]
impl Sessionlike for Session {
    async fn send_message(
        &self,
        recipient: &str,
        route: Vec<String>,
        payload: Value,
        directive: &str,
    ) -> Result<Uuid, DispatchError> {
        let job_id = Uuid::new_v4();
        self.enqueue(self.directive(job_id, recipient, route, payload, directive))
            .await?;
        info!(
            account = %self.peer.account,
            recipient = %recipient,
            message_id = %job_id,
            directive = %directive,
            "Queued message for connected client"
        );
        Ok(job_id)
    }

    async fn ping(&self, recipient: &str, route: Vec<String>) -> Result<Value, DispatchError> {
        let job_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let _guard = self.pending.register(job_id.to_string(), tx);
        let started = Instant::now();

        let payload = Value::String(Timestamp::now().to_string());
        self.enqueue(self.directive(job_id, recipient, route, payload, PING_DIRECTIVE))
            .await?;
        debug!(account = %self.peer.account, message_id = %job_id, "Waiting for ping response");

        let record = tokio::select! {
            () = self.outbound.cancel.cancelled() => return Err(DispatchError::Closed),
            response = rx => response.map_err(|_| DispatchError::Closed)?,
        };
        metrics::ping_elapsed(&self.peer.account, recipient, started.elapsed());
        serde_json::to_value(record).map_err(|e| DispatchError::InvalidResponse(e.to_string()))
    }

    async fn close(&self) -> Result<(), DispatchError> {
        info!(account = %self.peer.account, node_id = %self.peer.node_id, "Closing connection");
        self.outbound.cancel.cancel();
        Ok(())
    }

    async fn capabilities(&self) -> Result<Value, DispatchError> {
        Ok(self.peer.capabilities.clone())
    }
}
