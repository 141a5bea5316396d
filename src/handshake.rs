//! Connection state machine: `AwaitingHi -> Registering -> Active ->
//! Closing -> Closed`.
//!
//! Until the peer's `HI` arrives, [`HandshakeHandler`] is installed for
//! every message type, so anything else fails the connection. Once the peer
//! is registered, the handshake installs the steady-state handlers from
//! [`crate::handlers`] in its place.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::handlers::{DisconnectHandler, PayloadHandler, RouteTableHandler};
use crate::protocol::{HiMessage, Message, MessageType};
use crate::queue::ResponseBus;
use crate::reactor::{HandlerError, MessageHandler, Reactor};
use crate::registry::Registrar;
use crate::session::{Outbound, Peer, Session, SessionError};

/// Bound on queueing our `HI` reply.
const HI_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    #[default]
    AwaitingHi,
    Registering,
    Active,
    Closing,
    Closed,
}

/// Shared, forward-only connection state.
#[derive(Clone, Default)]
pub struct StateCell(Arc<Mutex<ConnectionState>>);

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        self.0.lock().map(|s| *s).unwrap_or(ConnectionState::Closed)
    }

    /// Move to `to` if that is forward of the current state. Returns
    /// whether the state changed.
    pub fn advance(&self, to: ConnectionState) -> bool {
        match self.0.lock() {
            Ok(mut state) if *state < to => {
                *state = to;
                true
            }
            _ => false,
        }
    }
}

/// Everything the handshake needs to turn a transport into a registered
/// session.
pub struct HandshakeContext {
    pub account: String,
    pub request_id: String,
    pub local_node_id: String,
    pub control_tx: mpsc::Sender<Message>,
    pub error_tx: mpsc::Sender<SessionError>,
    pub outbound: Outbound,
    pub registrar: Arc<Registrar>,
    pub bus: Arc<dyn ResponseBus>,
    pub reactor: Reactor,
    pub state: StateCell,
}

pub struct HandshakeHandler {
    ctx: HandshakeContext,
    completed: Mutex<Option<oneshot::Sender<Arc<Session>>>>,
}

impl HandshakeHandler {
    /// Install the handshake for every message type. The receiver yields
    /// the session once it is registered and active.
    pub fn install(ctx: HandshakeContext) -> oneshot::Receiver<Arc<Session>> {
        let (tx, rx) = oneshot::channel();
        let reactor = ctx.reactor.clone();
        let handler = Arc::new(Self {
            ctx,
            completed: Mutex::new(Some(tx)),
        });
        for message_type in [MessageType::Hi, MessageType::RouteTable, MessageType::Payload] {
            reactor.register(message_type, handler.clone());
        }
        rx
    }

    fn fail(&self, reason: String) {
        self.ctx.state.advance(ConnectionState::Closing);
        if self
            .ctx
            .error_tx
            .try_send(SessionError::Handshake(reason))
            .is_err()
        {
            self.ctx.outbound.cancel.cancel();
        }
    }

    async fn reply_hi(&self) -> Result<(), HandlerError> {
        let hi = Message::Hi(HiMessage::new(self.ctx.local_node_id.clone()));
        match tokio::time::timeout(HI_REPLY_TIMEOUT, self.ctx.control_tx.send(hi)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HandlerError::Closed),
            Err(_) => Err(HandlerError::Timeout),
        }
    }

    async fn complete(&self, hi: HiMessage) -> Result<(), HandlerError> {
        let ctx = &self.ctx;

        if let Err(e) = self.reply_hi().await {
            self.fail(format!("unable to reply to hi: {e}"));
            return Err(e);
        }

        let session = Arc::new(Session::new(
            Peer {
                account: ctx.account.clone(),
                node_id: hi.id.clone(),
                capabilities: hi.capabilities(),
            },
            ctx.local_node_id.clone(),
            ctx.request_id.clone(),
            ctx.outbound.clone(),
        ));

        if let Err(e) = ctx.registrar.register(&session).await {
            self.fail(format!("registration failed: {e}"));
            return Err(e.into());
        }

        ctx.reactor.register(
            MessageType::RouteTable,
            Arc::new(RouteTableHandler::new(session.clone())),
        );
        ctx.reactor.register(
            MessageType::Payload,
            Arc::new(PayloadHandler::new(session.clone(), ctx.bus.clone())),
        );
        ctx.reactor.register_disconnect(Arc::new(DisconnectHandler::new(
            session.clone(),
            ctx.registrar.clone(),
            ctx.state.clone(),
        )));

        ctx.state.advance(ConnectionState::Active);
        info!(account = %ctx.account, node_id = %hi.id, "Handshake complete");

        let completed = self.completed.lock().ok().and_then(|mut c| c.take());
        if let Some(tx) = completed {
            let _ = tx.send(session);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for HandshakeHandler {
    async fn handle(&self, msg: Message) -> Result<(), HandlerError> {
        if !self.ctx.state.advance(ConnectionState::Registering) {
            debug!(kind = msg.kind(), "Ignoring message, handshake already done");
            return Ok(());
        }

        let hi = match msg {
            Message::Hi(hi) if !hi.id.is_empty() => hi,
            Message::Hi(_) => {
                self.fail("hi without a node id".to_string());
                return Err(HandlerError::UnexpectedMessage("hi"));
            }
            other => {
                warn!(kind = other.kind(), "Expected hi as the first message");
                self.fail(format!("expected hi, got {}", other.kind()));
                return Err(HandlerError::UnexpectedMessage(other.kind()));
            }
        };

        self.complete(hi).await
    }
}
