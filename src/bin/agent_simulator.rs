#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # agent_simulator
//!
//! Opens a number of fake receptor agent connections against a gateway for
//! manual end-to-end checks. Each agent says `HI`, advertises a one-edge
//! route table, answers `receptor:ping` and echoes every other directive
//! back as a response.

use std::time::Duration;

use base64::Engine;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use receptor_gateway::auth::IDENTITY_HEADER;
use receptor_gateway::protocol::{
    self, HiMessage, InnerEnvelope, Message, PayloadMessage, RouteTableMessage, RoutingMessage,
    Timestamp,
};
use receptor_gateway::session::PING_DIRECTIVE;
use receptor_gateway::util;

/// Simulate receptor agents connected to a gateway.
#[derive(Parser)]
#[command(name = "agent_simulator", version)]
struct Cli {
    #[arg(long, default_value = "ws://localhost:8080/wss/receptor-controller/gateway")]
    url: String,
    /// Account every agent authenticates as.
    #[arg(long, default_value = "01")]
    account: String,
    #[arg(long, default_value_t = 1)]
    connection_count: usize,
    /// Agents are named `{prefix}-{n}`.
    #[arg(long, default_value = "node")]
    node_prefix: String,
    /// Seconds to wait before reconnecting a dropped agent; 0 disables.
    #[arg(long, default_value_t = 0)]
    reconnect_secs: u64,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn identity_header(account: &str) -> String {
    let identity = json!({
        "identity": {
            "account_number": account,
            "type": "User",
            "internal": {"org_id": account},
        }
    });
    base64::engine::general_purpose::STANDARD.encode(identity.to_string())
}

fn route_table(node_id: &str, peer: &str) -> Message {
    Message::RouteTable(RouteTableMessage {
        command: "ROUTE".to_string(),
        id: node_id.to_string(),
        capabilities: json!({"max_work_threads": 1}),
        groups: json!([]),
        edges: vec![vec![json!(node_id), json!(peer), json!(1)]],
        seen: vec![node_id.to_string()],
    })
}

/// What a well-behaved agent sends back for `directive`, if anything.
fn respond(node_id: &str, directive: &PayloadMessage) -> Option<Message> {
    if directive.routing.recipient != node_id {
        return None;
    }

    let payload = if directive.data.directive == PING_DIRECTIVE {
        let now = Timestamp::now();
        json!({
            "initial_time": directive.data.timestamp,
            "response_time": now,
            "active_work": [],
        })
    } else {
        json!({
            "directive": directive.data.directive,
            "echo": directive.data.raw_payload,
        })
    };

    Some(Message::Payload(PayloadMessage {
        routing: RoutingMessage {
            sender: node_id.to_string(),
            recipient: directive.routing.sender.clone(),
            route_list: vec![node_id.to_string()],
        },
        data: InnerEnvelope {
            message_id: Uuid::new_v4().to_string(),
            sender: node_id.to_string(),
            recipient: directive.data.sender.clone(),
            message_type: "response".to_string(),
            timestamp: Timestamp::now(),
            raw_payload: payload,
            in_response_to: directive.data.message_id.clone(),
            serial: 1,
            ..InnerEnvelope::default()
        },
    }))
}

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] protocol::ProtocolError),
    #[error("gateway closed the connection before replying to hi")]
    NoHiReply,
}

fn frame(msg: &Message) -> Result<WsMessage, AgentError> {
    Ok(WsMessage::Binary(protocol::encode(msg)?.into()))
}

async fn run_agent(
    url: &str,
    account: &str,
    node_id: &str,
    stop: &CancellationToken,
) -> Result<(), AgentError> {
    let mut req = url.into_client_request()?;
    if let Ok(value) = identity_header(account).parse() {
        req.headers_mut().insert(IDENTITY_HEADER, value);
    }
    let (ws, _) = tokio_tungstenite::connect_async(req).await?;
    let (mut sink, mut stream) = ws.split();

    sink.send(frame(&Message::Hi(HiMessage::new(node_id)))?).await?;

    let mut gateway_node = None;
    loop {
        let next = tokio::select! {
            () = stop.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            next = stream.next() => next,
        };
        let Some(frame_in) = next else {
            return match gateway_node {
                Some(_) => Ok(()),
                None => Err(AgentError::NoHiReply),
            };
        };

        let bytes = match frame_in? {
            WsMessage::Binary(bytes) => bytes,
            WsMessage::Close(_) => return Ok(()),
            _ => continue,
        };
        match protocol::read_message(&mut bytes.as_ref())? {
            Message::Hi(hi) => {
                info!(gateway = %hi.id, "Handshake complete");
                sink.send(frame(&route_table(node_id, &hi.id))?).await?;
                gateway_node = Some(hi.id);
            }
            Message::RouteTable(_) => debug!("Route table received"),
            Message::Payload(directive) => {
                info!(
                    directive = %directive.data.directive,
                    message_id = %directive.data.message_id,
                    "Directive received"
                );
                match respond(node_id, &directive) {
                    Some(reply) => sink.send(frame(&reply)?).await?,
                    None => warn!(recipient = %directive.routing.recipient, "Directive for another node"),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    util::init_tracing(&cli.log_level);
    info!(url = %cli.url, count = cli.connection_count, "Connecting agents");

    let stop = CancellationToken::new();
    let mut agents = Vec::with_capacity(cli.connection_count);
    for n in 0..cli.connection_count {
        let node_id = format!("{}-{n}", cli.node_prefix);
        let url = cli.url.clone();
        let account = cli.account.clone();
        let stop = stop.clone();
        let reconnect = Duration::from_secs(cli.reconnect_secs);
        let span = info_span!("agent", node_id = %node_id);
        agents.push(tokio::spawn(
            async move {
                loop {
                    match run_agent(&url, &account, &node_id, &stop).await {
                        Ok(()) => info!("Disconnected"),
                        Err(e) => error!(error = %e, "Agent failed"),
                    }
                    if stop.is_cancelled() || reconnect.is_zero() {
                        return;
                    }
                    tokio::select! {
                        () = stop.cancelled() => return,
                        () = tokio::time::sleep(reconnect) => {}
                    }
                }
            }
            .instrument(span),
        ));
    }

    tokio::spawn(async move {
        util::shutdown_signal().await;
        stop.cancel();
    });
    futures::future::join_all(agents).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(name: &str, recipient: &str) -> PayloadMessage {
        PayloadMessage::directive(
            Uuid::new_v4(),
            "node-cloud-receptor-controller",
            recipient,
            vec![recipient.to_string()],
            name,
            json!({"x": 1}),
        )
    }

    #[test]
    fn test_echo_answers_the_sender() {
        let job = directive("demo:echo", "node-0");
        let Some(Message::Payload(reply)) = respond("node-0", &job) else {
            panic!("expected a payload");
        };
        assert_eq!(reply.routing.recipient, "node-cloud-receptor-controller");
        assert_eq!(reply.routing.sender, "node-0");
        assert_eq!(reply.data.in_response_to, job.data.message_id);
        assert_eq!(reply.data.message_type, "response");
        assert_eq!(reply.data.raw_payload["echo"], json!({"x": 1}));
    }

    #[test]
    fn test_ping_reports_times() {
        let job = directive(PING_DIRECTIVE, "node-0");
        let Some(Message::Payload(reply)) = respond("node-0", &job) else {
            panic!("expected a payload");
        };
        assert!(reply.data.raw_payload.get("response_time").is_some());
        assert_eq!(reply.data.raw_payload["active_work"], json!([]));
    }

    #[test]
    fn test_directive_for_other_node_ignored() {
        assert!(respond("node-0", &directive("demo:echo", "node-1")).is_none());
    }

    #[test]
    fn test_identity_header_decodes() {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(identity_header("540155"))
            .unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["identity"]["account_number"], "540155");
    }
}
