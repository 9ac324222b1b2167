//! JSON shapes exchanged with the backend.
//!
//! The backend is not consistent about field names across endpoints (a room
//! message may say `chatRoomId` or `roomId`, a body may be `content` or
//! `message`), so the DTOs accept the known aliases and convert into
//! [`ChatMessage`] at the edge.

use huddle_types::{ChatMessage, MessageId, MessageTarget, RoomId, UserId, now_millis, parse_timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A timestamp as sent by the backend: ISO text or Unix millis.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(u64),
    Text(String),
}

impl WireTimestamp {
    /// Unix millis, or `None` when the text does not parse.
    pub fn to_millis(&self) -> Option<u64> {
        match self {
            WireTimestamp::Millis(ms) => Some(*ms),
            WireTimestamp::Text(text) => parse_timestamp(text),
        }
    }

    pub fn from_value(value: &Value) -> Option<u64> {
        serde_json::from_value::<WireTimestamp>(value.clone())
            .ok()
            .and_then(|ts| ts.to_millis())
    }
}

fn resolve_timestamp(ts: Option<&WireTimestamp>) -> u64 {
    match ts.and_then(WireTimestamp::to_millis) {
        Some(ms) => ms,
        None => {
            tracing::debug!("message without a usable timestamp, stamping with local clock");
            now_millis()
        }
    }
}

/// A direct message as returned by the message endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageDto {
    #[serde(default, alias = "messageId")]
    pub id: Option<MessageId>,
    pub sender_id: UserId,
    #[serde(alias = "receiverId")]
    pub recipient_id: UserId,
    #[serde(alias = "message")]
    pub content: String,
    #[serde(default, alias = "sentAt", alias = "createdAt")]
    pub timestamp: Option<WireTimestamp>,
}

impl DirectMessageDto {
    pub fn into_history(self) -> ChatMessage {
        let ts = resolve_timestamp(self.timestamp.as_ref());
        ChatMessage::from_history(
            self.id,
            self.sender_id,
            MessageTarget::Direct(self.recipient_id),
            self.content,
            ts,
        )
    }
}

/// A room message as returned by the room endpoints and `ReceiveRoomMessage`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessageDto {
    #[serde(default, alias = "messageId")]
    pub id: Option<MessageId>,
    #[serde(alias = "chatRoomId")]
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(alias = "message")]
    pub content: String,
    #[serde(default, alias = "sentAt", alias = "createdAt")]
    pub timestamp: Option<WireTimestamp>,
}

impl RoomMessageDto {
    pub fn into_history(self) -> ChatMessage {
        let ts = resolve_timestamp(self.timestamp.as_ref());
        ChatMessage::from_history(
            self.id,
            self.sender_id,
            MessageTarget::Room(self.room_id),
            self.content,
            ts,
        )
    }

    pub fn into_pushed(self) -> ChatMessage {
        ChatMessage {
            origin: huddle_types::DeliveryOrigin::PushedLive,
            ..self.into_history()
        }
    }
}

/// A chat room listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    #[serde(alias = "chatRoomId", alias = "roomId")]
    pub id: RoomId,
    pub name: String,
}

/// Body of a room-creation request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest<'a> {
    pub name: &'a str,
}
