//! Framed binary protocol spoken over each agent WebSocket.
//!
//! A logical message is carried in one WebSocket binary message:
//!
//! - `HI` and `ROUTE` commands travel as a single COMMAND frame whose data is
//!   JSON. Which one it is gets decided by substring: `"HI"` first, then
//!   `"ROUTE"`. Peers in the mesh rely on this, so it stays.
//! - A payload travels as a HEADER frame (routing JSON) immediately followed
//!   by a PAYLOAD frame (inner envelope JSON).

pub mod frame;
pub mod messages;
pub mod timestamp;

use std::io::{Read, Write};

use thiserror::Error;

pub use frame::{FrameHeader, FrameType, MessageId, FRAME_HEADER_LENGTH};
pub use messages::{
    HiMessage, InnerEnvelope, Message, MessageType, PayloadMessage, RouteTableMessage,
    RoutingMessage,
};
pub use timestamp::Timestamp;

/// Largest frame body accepted when no explicit cap is given.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid frame type {0}")]
    InvalidFrameType(i8),
    #[error("frame too short")]
    FrameTooShort,
    #[error("frame data too short")]
    FrameDataTooShort,
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("unrecognized receptor-network message: {0}")]
    UnrecognizedCommand(String),
    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one message using the default frame size cap.
pub fn read_message<R: Read>(r: &mut R) -> Result<Message, ProtocolError> {
    read_message_limited(r, DEFAULT_MAX_FRAME_SIZE)
}

/// Read one message, rejecting any frame body larger than `max_frame_size`.
pub fn read_message_limited<R: Read>(
    r: &mut R,
    max_frame_size: usize,
) -> Result<Message, ProtocolError> {
    let header = frame::read_frame(r)?;
    let data = frame::read_frame_data(r, header.length, max_frame_size)?;

    match header.frame_type {
        FrameType::Command => parse_command(&data),
        FrameType::Header => {
            let routing: RoutingMessage = serde_json::from_slice(&data)?;
            let payload_header = frame::read_frame(r)?;
            if payload_header.frame_type != FrameType::Payload {
                return Err(ProtocolError::InvalidMessage(format!(
                    "expected payload frame after header frame, got {:?}",
                    payload_header.frame_type
                )));
            }
            let data = frame::read_frame_data(r, payload_header.length, max_frame_size)?;
            let envelope: InnerEnvelope = serde_json::from_slice(&data)?;
            Ok(Message::Payload(PayloadMessage {
                routing,
                data: envelope,
            }))
        }
        FrameType::Payload => Err(ProtocolError::InvalidMessage(
            "payload frame without a preceding header frame".to_string(),
        )),
    }
}

fn parse_command(data: &[u8]) -> Result<Message, ProtocolError> {
    let text = String::from_utf8_lossy(data);
    if text.contains("HI") {
        Ok(Message::Hi(serde_json::from_slice(data)?))
    } else if text.contains("ROUTE") {
        Ok(Message::RouteTable(serde_json::from_slice(data)?))
    } else {
        Err(ProtocolError::UnrecognizedCommand(text.into_owned()))
    }
}

/// Write one message: payloads as HEADER + PAYLOAD frames, commands as one
/// COMMAND frame.
pub fn write_message<W: Write>(w: &mut W, message: &Message) -> Result<(), ProtocolError> {
    match message {
        Message::Payload(payload) => {
            let routing = serde_json::to_vec(&payload.routing)?;
            let envelope = serde_json::to_vec(&payload.data)?;
            frame::write_frame(w, FrameType::Header, &routing)?;
            frame::write_frame(w, FrameType::Payload, &envelope)
        }
        Message::Hi(hi) => frame::write_frame(w, FrameType::Command, &serde_json::to_vec(hi)?),
        Message::RouteTable(rt) => {
            frame::write_frame(w, FrameType::Command, &serde_json::to_vec(rt)?)
        }
    }
}

/// Encode a message into the bytes of one WebSocket binary message.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    write_message(&mut buf, message)?;
    Ok(buf)
}
