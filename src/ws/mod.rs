//! Agent-facing WebSocket endpoint.
//!
//! ## Connection lifecycle
//!
//! 1. The agent connects to `GET /wss/receptor-controller/gateway` with an
//!    identity header; the account comes from the authenticated principal.
//! 2. The upgraded socket is handed to a [`Transport`] (reader and writer
//!    pumps) and a [`Reactor`] with the handshake installed.
//! 3. The agent must send `HI` within `handshake_read_wait`, otherwise the
//!    connection is cancelled.
//! 4. When either pump or the reactor stops, the disconnect handler
//!    unregisters the session and the socket is closed.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocket, Extension, State, WebSocketUpgrade},
    middleware,
    response::Response,
    routing::get,
    Router,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::{self, Credentials, Principal, RequestId};
use crate::config::Config;
use crate::handshake::{HandshakeContext, HandshakeHandler, StateCell};
use crate::metrics;
use crate::queue::ResponseBus;
use crate::reactor::Reactor;
use crate::registry::Registrar;
use crate::session::{Outbound, Transport, TransportSettings};

pub const GATEWAY_PATH: &str = "/wss/receptor-controller/gateway";

/// Everything a new connection needs.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registrar: Arc<Registrar>,
    pub bus: Arc<dyn ResponseBus>,
    /// Parent of every connection's cancellation token.
    pub shutdown: CancellationToken,
}

pub fn router(state: GatewayState) -> Router {
    let creds = Credentials::new(state.config.auth.service_to_service_credentials.clone());
    Router::new()
        .route(GATEWAY_PATH, get(ws_upgrade))
        .layer(middleware::from_fn(auth::require_auth))
        .layer(Extension(creds))
        .layer(middleware::from_fn(auth::request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /wss/receptor-controller/gateway`: WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<GatewayState>,
    Extension(principal): Extension<Principal>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    ws: WebSocketUpgrade,
) -> Response {
    let account = principal.account().to_string();
    let max_message_size = state.config.websocket.max_message_size;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            let span = info_span!("connection", account = %account, request_id = %request_id);
            handle_socket(socket, state, account, request_id).instrument(span)
        })
}

async fn handle_socket(socket: WebSocket, state: GatewayState, account: String, request_id: String) {
    metrics::connection_opened(&account);
    info!("Agent connected");

    let ws_cfg = &state.config.websocket;
    let cancel = state.shutdown.child_token();
    let (sink, stream) = socket.split();
    let Transport {
        send_tx,
        control_tx,
        error_tx,
        recv_rx,
        reader,
        writer,
        ..
    } = Transport::spawn(sink, stream, &TransportSettings::from(ws_cfg), cancel.clone());

    let reactor = Reactor::new();
    let handshake_done = HandshakeHandler::install(HandshakeContext {
        account: account.clone(),
        request_id,
        local_node_id: ws_cfg.node_id.clone(),
        control_tx,
        error_tx,
        outbound: Outbound {
            send_tx,
            cancel: cancel.clone(),
            send_timeout: ws_cfg.send_message_timeout(),
        },
        registrar: state.registrar.clone(),
        bus: state.bus.clone(),
        reactor: reactor.clone(),
        state: StateCell::default(),
    });

    let reactor_task = tokio::spawn(
        {
            let cancel = cancel.clone();
            async move { reactor.run(recv_rx, cancel).await }
        }
        .in_current_span(),
    );

    tokio::select! {
        () = cancel.cancelled() => debug!("Connection ended before handshake completed"),
        done = tokio::time::timeout(ws_cfg.handshake_read_wait(), handshake_done) => match done {
            Ok(Ok(session)) => info!(node_id = %session.node_id(), "Agent registered"),
            Ok(Err(_)) => debug!("Handshake abandoned"),
            Err(_) => {
                warn!("No hi received before the handshake deadline");
                cancel.cancel();
            }
        },
    }

    if let Err(e) = reactor_task.await {
        warn!(error = %e, "Reactor task failed");
    }
    cancel.cancel();
    let _ = reader.await;
    let _ = writer.await;

    metrics::connection_closed(&account);
    info!("Agent disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::IDENTITY_HEADER;
    use crate::protocol::{self, HiMessage, InnerEnvelope, Message, PayloadMessage, RoutingMessage};
    use crate::queue::MemoryBus;
    use crate::registry::LocalRegistry;
    use crate::routes::tests::identity;
    use futures::SinkExt;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as WsMessage};

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn gateway(bus: MemoryBus) -> (String, Arc<Registrar>, CancellationToken) {
        let mut config = Config::default();
        config.websocket.handshake_read_wait_secs = 1;
        let registrar = Arc::new(Registrar::local_only(LocalRegistry::new(), "pod-1".into()));
        let shutdown = CancellationToken::new();
        let app = router(GatewayState {
            config: Arc::new(config),
            registrar: registrar.clone(),
            bus: Arc::new(bus),
            shutdown: shutdown.clone(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}{GATEWAY_PATH}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (url, registrar, shutdown)
    }

    async fn connect(url: &str) -> Client {
        let mut req = url.into_client_request().unwrap();
        req.headers_mut()
            .insert(IDENTITY_HEADER, identity("540155").parse().unwrap());
        let (client, _) = tokio_tungstenite::connect_async(req).await.unwrap();
        client
    }

    async fn send(client: &mut Client, msg: &Message) {
        let bytes = protocol::encode(msg).unwrap();
        client.send(WsMessage::Binary(bytes.into())).await.unwrap();
    }

    /// Next decoded message, skipping pings. `None` once the socket closes.
    async fn recv(client: &mut Client) -> Option<Message> {
        while let Some(frame) = client.next().await {
            match frame.ok()? {
                WsMessage::Binary(bytes) => {
                    return Some(protocol::read_message(&mut bytes.as_ref()).unwrap())
                }
                WsMessage::Close(_) => return None,
                _ => {}
            }
        }
        None
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_agent_lifecycle() {
        let bus = MemoryBus::default();
        let (url, registrar, _shutdown) = gateway(bus.clone()).await;
        let mut client = connect(&url).await;

        send(&mut client, &Message::Hi(HiMessage::new("node-42"))).await;
        let reply = recv(&mut client).await.unwrap();
        assert_eq!(
            reply,
            Message::Hi(HiMessage::new("node-cloud-receptor-controller"))
        );
        eventually(|| {
            let registrar = registrar.clone();
            async move { registrar.local().get("540155", "node-42").await.is_some() }
        })
        .await;

        let response = Message::Payload(PayloadMessage {
            routing: RoutingMessage {
                sender: "node-42".into(),
                recipient: "node-cloud-receptor-controller".into(),
                route_list: vec!["node-42".into()],
            },
            data: InnerEnvelope {
                message_id: "m-1".into(),
                in_response_to: "job-7".into(),
                message_type: "response".into(),
                raw_payload: serde_json::json!({"ok": true}),
                ..InnerEnvelope::default()
            },
        });
        send(&mut client, &response).await;
        eventually(|| {
            let bus = bus.clone();
            async move { bus.records().len() == 1 }
        })
        .await;
        assert_eq!(bus.records()[0].key(), "job-7");

        client.close(None).await.unwrap();
        eventually(|| {
            let registrar = registrar.clone();
            async move { registrar.local().get_all().await.is_empty() }
        })
        .await;
    }

    #[tokio::test]
    async fn test_payload_before_hi_closes() {
        let (url, registrar, _shutdown) = gateway(MemoryBus::default()).await;
        let mut client = connect(&url).await;

        send(&mut client, &Message::Payload(PayloadMessage::default())).await;
        assert!(recv(&mut client).await.is_none());
        assert!(registrar.local().get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_silent_agent_dropped_after_handshake_wait() {
        let (url, _registrar, _shutdown) = gateway(MemoryBus::default()).await;
        let mut client = connect(&url).await;
        assert!(recv(&mut client).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let (url, registrar, shutdown) = gateway(MemoryBus::default()).await;
        let mut client = connect(&url).await;
        send(&mut client, &Message::Hi(HiMessage::new("node-42"))).await;
        assert!(recv(&mut client).await.is_some());

        shutdown.cancel();
        assert!(recv(&mut client).await.is_none());
        eventually(|| {
            let registrar = registrar.clone();
            async move { registrar.local().get_all().await.is_empty() }
        })
        .await;
    }

    #[tokio::test]
    async fn test_upgrade_requires_identity() {
        let (url, _registrar, _shutdown) = gateway(MemoryBus::default()).await;
        assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
    }
}
