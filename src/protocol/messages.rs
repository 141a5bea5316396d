//! Message kinds exchanged with receptor peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::timestamp::Timestamp;

/// `message_type` stamped on work sent to a peer.
pub const DIRECTIVE_MESSAGE_TYPE: &str = "directive";

/// Peer-to-peer handshake command.
///
/// `{"cmd": "HI", "id": "node-b", "expire_time": 1571507551.71}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HiMessage {
    #[serde(rename = "cmd", default)]
    pub command: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub expire_time: Value,
    #[serde(rename = "meta", default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl HiMessage {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            command: "HI".to_string(),
            id: node_id.into(),
            ..Self::default()
        }
    }

    /// Capabilities advertised under `meta.capabilities`, or `{}`.
    pub fn capabilities(&self) -> Value {
        self.metadata
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }
}

/// Adjacency gossip.
///
/// `edges` holds `[left, right, cost]` triples exactly as the peer sent them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTableMessage {
    #[serde(rename = "cmd", default)]
    pub command: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub groups: Value,
    #[serde(default)]
    pub edges: Vec<Vec<Value>>,
    #[serde(default)]
    pub seen: Vec<String>,
}

/// Routing header that travels in the frame preceding a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMessage {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub route_list: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InnerEnvelope {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub raw_payload: Value,
    #[serde(default)]
    pub directive: String,
    #[serde(default)]
    pub in_response_to: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub serial: i64,
}

/// A routed payload: header frame plus payload frame on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadMessage {
    pub routing: RoutingMessage,
    pub data: InnerEnvelope,
}

impl PayloadMessage {
    /// Build a directive addressed to `recipient` via `route`.
    pub fn directive(
        message_id: Uuid,
        sender: &str,
        recipient: &str,
        route: Vec<String>,
        directive: &str,
        payload: Value,
    ) -> Self {
        Self {
            routing: RoutingMessage {
                sender: sender.to_string(),
                recipient: recipient.to_string(),
                route_list: route,
            },
            data: InnerEnvelope {
                message_id: message_id.to_string(),
                sender: sender.to_string(),
                recipient: recipient.to_string(),
                message_type: DIRECTIVE_MESSAGE_TYPE.to_string(),
                timestamp: Timestamp::now(),
                raw_payload: payload,
                directive: directive.to_string(),
                ..InnerEnvelope::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hi,
    RouteTable,
    Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hi(HiMessage),
    RouteTable(RouteTableMessage),
    Payload(PayloadMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hi(_) => MessageType::Hi,
            Self::RouteTable(_) => MessageType::RouteTable,
            Self::Payload(_) => MessageType::Payload,
        }
    }

    /// Short label used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hi(_) => "hi",
            Self::RouteTable(_) => "route_table",
            Self::Payload(_) => "payload",
        }
    }
}
