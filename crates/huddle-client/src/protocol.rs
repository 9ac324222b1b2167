//! Hub wire protocol (JSON encoding).
//!
//! Every record is a JSON object terminated by the ASCII record separator
//! `0x1E`. One WebSocket text frame may carry several records.
//!
//! ```text
//!   client → {"protocol":"json","version":1}␞          handshake request
//!   server → {}␞                                       handshake ok
//!   server → {"type":1,"target":"ReceiveMessage","arguments":[1,2,"hi","2024-…"]}␞
//!   client → {"type":1,"invocationId":"3","target":"SendMessage","arguments":[1,2,"hi"]}␞
//!   server → {"type":3,"invocationId":"3"}␞
//!   either → {"type":6}␞                               ping
//!   server → {"type":7,"error":"…","allowReconnect":true}␞
//! ```
//!
//! Record types other than Invocation (1), Completion (3), Ping (6) and
//! Close (7) are skipped.

use huddle_types::{ChatMessage, MessageTarget, UserId, now_millis};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::dto::{RoomMessageDto, WireTimestamp};

/// Terminates every record.
pub const RECORD_SEPARATOR: char = '\u{1e}';

// Hub method names.
pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
pub const RECEIVE_NOTIFICATION: &str = "ReceiveNotification";
pub const RECEIVE_ROOM_MESSAGE: &str = "ReceiveRoomMessage";
pub const SEND_MESSAGE: &str = "SendMessage";

const TYPE_INVOCATION: u8 = 1;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

/// Errors decoding hub records.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("record is missing its terminator")]
    Incomplete,
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("record type {0} is missing field `{1}`")]
    MissingField(u8, &'static str),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("bad arguments for {target}: {reason}")]
    BadArguments { target: String, reason: String },
}

/// One decoded hub record.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl HubMessage {
    pub fn invocation(invocation_id: Option<String>, target: &str, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id,
            target: target.to_string(),
            arguments,
        }
    }

    /// Encode as a single terminated record.
    pub fn encode(&self) -> String {
        let body = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let mut obj = json!({
                    "type": TYPE_INVOCATION,
                    "target": target,
                    "arguments": arguments,
                });
                if let Some(id) = invocation_id {
                    obj["invocationId"] = Value::from(id.as_str());
                }
                obj
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut obj = json!({ "type": TYPE_COMPLETION, "invocationId": invocation_id });
                if let Some(result) = result {
                    obj["result"] = result.clone();
                }
                if let Some(error) = error {
                    obj["error"] = Value::from(error.as_str());
                }
                obj
            }
            HubMessage::Ping => json!({ "type": TYPE_PING }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut obj = json!({ "type": TYPE_CLOSE, "allowReconnect": allow_reconnect });
                if let Some(error) = error {
                    obj["error"] = Value::from(error.as_str());
                }
                obj
            }
        };
        let mut out = body.to_string();
        out.push(RECORD_SEPARATOR);
        out
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    #[serde(rename = "type")]
    kind: u8,
    invocation_id: Option<String>,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    result: Option<Value>,
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

/// Split a frame into its terminated records.
fn split_records(frame: &str) -> Result<Vec<&str>, ProtocolError> {
    if frame.is_empty() {
        return Ok(Vec::new());
    }
    if !frame.ends_with(RECORD_SEPARATOR) {
        return Err(ProtocolError::Incomplete);
    }
    Ok(frame
        .split(RECORD_SEPARATOR)
        .filter(|r| !r.trim().is_empty())
        .collect())
}

/// Decode every record in a text frame. Unknown record types are dropped.
pub fn decode_frame(frame: &str) -> Result<Vec<HubMessage>, ProtocolError> {
    let mut out = Vec::new();
    for record in split_records(frame)? {
        let raw: RawRecord =
            serde_json::from_str(record).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let msg = match raw.kind {
            TYPE_INVOCATION => HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target: raw
                    .target
                    .ok_or(ProtocolError::MissingField(TYPE_INVOCATION, "target"))?,
                arguments: raw.arguments,
            },
            TYPE_COMPLETION => HubMessage::Completion {
                invocation_id: raw
                    .invocation_id
                    .ok_or(ProtocolError::MissingField(TYPE_COMPLETION, "invocationId"))?,
                result: raw.result,
                error: raw.error,
            },
            TYPE_PING => HubMessage::Ping,
            TYPE_CLOSE => HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect,
            },
            other => {
                debug!("skipping hub record of unsupported type {}", other);
                continue;
            }
        };
        out.push(msg);
    }
    Ok(out)
}

/// The first record a client sends.
pub fn handshake_request() -> String {
    let mut out = json!({ "protocol": "json", "version": 1 }).to_string();
    out.push(RECORD_SEPARATOR);
    out
}

/// Check the server's handshake reply.
///
/// Returns whatever followed the handshake record in the same frame, which
/// must be decoded as regular records.
pub fn parse_handshake_response(frame: &str) -> Result<&str, ProtocolError> {
    let end = frame.find(RECORD_SEPARATOR).ok_or(ProtocolError::Incomplete)?;
    let (record, rest) = (&frame[..end], &frame[end + RECORD_SEPARATOR.len_utf8()..]);
    let value: Value =
        serde_json::from_str(record).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(ProtocolError::HandshakeRejected(error.to_string()));
    }
    Ok(rest)
}

// ============================================================================
// Typed events
// ============================================================================

fn bad_args(target: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::BadArguments {
        target: target.to_string(),
        reason: reason.into(),
    }
}

fn user_arg(target: &str, value: Option<&Value>, name: &str) -> Result<UserId, ProtocolError> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(UserId::new(s.as_str())),
        Some(Value::Number(n)) => Ok(UserId::new(n.to_string())),
        _ => Err(bad_args(target, format!("`{name}` must be a user id"))),
    }
}

/// `ReceiveMessage(senderId, recipientId, content, timestamp)`.
pub fn parse_direct_message(args: &[Value]) -> Result<ChatMessage, ProtocolError> {
    let sender = user_arg(RECEIVE_MESSAGE, args.first(), "senderId")?;
    let recipient = user_arg(RECEIVE_MESSAGE, args.get(1), "recipientId")?;
    let content = args
        .get(2)
        .and_then(Value::as_str)
        .ok_or_else(|| bad_args(RECEIVE_MESSAGE, "`content` must be a string"))?;
    let timestamp = args
        .get(3)
        .and_then(WireTimestamp::from_value)
        .unwrap_or_else(now_millis);
    Ok(ChatMessage::pushed(
        None,
        sender,
        MessageTarget::Direct(recipient),
        content,
        timestamp,
    ))
}

/// `ReceiveRoomMessage(message)`.
pub fn parse_room_message(args: &[Value]) -> Result<ChatMessage, ProtocolError> {
    let value = args
        .first()
        .ok_or_else(|| bad_args(RECEIVE_ROOM_MESSAGE, "missing message"))?;
    let dto: RoomMessageDto = serde_json::from_value(value.clone())
        .map_err(|e| bad_args(RECEIVE_ROOM_MESSAGE, e.to_string()))?;
    Ok(dto.into_pushed())
}

/// `ReceiveNotification(message)`.
pub fn parse_notification(args: &[Value]) -> Result<String, ProtocolError> {
    match args.first() {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(bad_args(RECEIVE_NOTIFICATION, "missing message")),
    }
}

/// Arguments for `SendMessage(senderId, recipientId, content)`.
pub fn send_message_args(sender: &UserId, recipient: &UserId, content: &str) -> Vec<Value> {
    vec![sender.to_hub_arg(), recipient.to_hub_arg(), Value::from(content)]
}
