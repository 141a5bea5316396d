//! Steady-state handlers installed once a peer has completed the handshake.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::handshake::{ConnectionState, StateCell};
use crate::metrics;
use crate::protocol::Message;
use crate::queue::{ResponseBus, ResponseRecord};
use crate::reactor::{self, HandlerError, MessageHandler};
use crate::registry::Registrar;
use crate::session::{Session, Sessionlike};

pub struct RouteTableHandler {
    session: Arc<Session>,
}

impl RouteTableHandler {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl MessageHandler for RouteTableHandler {
    async fn handle(&self, msg: Message) -> Result<(), HandlerError> {
        let table = match msg {
            Message::RouteTable(table) => table,
            other => return Err(HandlerError::UnexpectedMessage(other.kind())),
        };
        debug!(
            account = %self.session.account(),
            node_id = %self.session.node_id(),
            edges = table.edges.len(),
            "Route table updated"
        );
        self.session.record_route_table(table);
        Ok(())
    }
}

/// Publishes responses addressed to this gateway. A response that answers
/// a synchronous request goes to its waiter instead of the bus.
pub struct PayloadHandler {
    session: Arc<Session>,
    bus: Arc<dyn ResponseBus>,
}

impl PayloadHandler {
    pub fn new(session: Arc<Session>, bus: Arc<dyn ResponseBus>) -> Self {
        Self { session, bus }
    }
}

#[async_trait]
impl MessageHandler for PayloadHandler {
    async fn handle(&self, msg: Message) -> Result<(), HandlerError> {
        let payload = match msg {
            Message::Payload(payload) => payload,
            other => return Err(HandlerError::UnexpectedMessage(other.kind())),
        };

        if payload.routing.recipient != self.session.local_node_id() {
            warn!(
                account = %self.session.account(),
                recipient = %payload.routing.recipient,
                "Dropping payload addressed to another node"
            );
            return Ok(());
        }

        let record = ResponseRecord::from_payload(self.session.account(), &payload);
        let Some(record) = self.session.pending().dispatch(record) else {
            debug!(in_response_to = %payload.data.in_response_to, "Delivered response to waiter");
            metrics::response_handled();
            return Ok(());
        };

        let in_response_to = record.in_response_to.clone();
        match self.bus.publish(record).await {
            Ok(()) => {
                metrics::response_handled();
                debug!(account = %self.session.account(), in_response_to = %in_response_to, "Published response");
            }
            Err(e) => {
                metrics::kafka_write_failed(1);
                warn!(
                    account = %self.session.account(),
                    in_response_to = %in_response_to,
                    error = %e,
                    "Unable to publish response"
                );
            }
        }
        Ok(())
    }
}

/// Tears the session down once its transport is gone.
pub struct DisconnectHandler {
    session: Arc<Session>,
    registrar: Arc<Registrar>,
    state: StateCell,
}

impl DisconnectHandler {
    pub fn new(session: Arc<Session>, registrar: Arc<Registrar>, state: StateCell) -> Self {
        Self {
            session,
            registrar,
            state,
        }
    }
}

#[async_trait]
impl reactor::DisconnectHandler for DisconnectHandler {
    async fn disconnected(&self) {
        if !self.state.advance(ConnectionState::Closing) {
            return;
        }
        self.registrar.unregister(&self.session).await;
        let _ = self.session.close().await;
        self.state.advance(ConnectionState::Closed);
        info!(
            account = %self.session.account(),
            node_id = %self.session.node_id(),
            "Connection torn down"
        );
    }
}
