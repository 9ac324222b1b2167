//! Chat message model and conversation addressing.
//!
//! A [`ChatMessage`] always belongs to exactly one conversation, addressed by a
//! [`ConversationKey`]: an unordered pair of users for direct chat, or a room.
//!
//! ## Design: DeliveryOrigin + DeliveryState
//!
//! `DeliveryOrigin` records *where the entry came from* (local compose, REST
//! history or server echo, live push). `DeliveryState` records *whether the
//! send went through*. Only optimistic entries ever leave `Confirmed`: a
//! message we learned about from the server is confirmed by definition.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::{LocalId, MessageId, RoomId, UserId};

/// Where a displayed message came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum DeliveryOrigin {
    /// Composed on this client, not yet echoed back by the server.
    OptimisticLocal,
    /// Fetched from history, or an optimistic entry whose echo arrived.
    ServerConfirmed,
    /// Pushed over the hub while the conversation was open.
    PushedLive,
}

impl DeliveryOrigin {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOrigin::OptimisticLocal => "optimistic-local",
            DeliveryOrigin::ServerConfirmed => "server-confirmed",
            DeliveryOrigin::PushedLive => "pushed-live",
        }
    }
}

/// Outcome of sending a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum DeliveryState {
    /// Handed to the network, no answer yet.
    Pending,
    /// Accepted by the server.
    #[default]
    Confirmed,
    /// The send failed; the entry stays visible and can be retried.
    Failed,
}

impl DeliveryState {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Confirmed => "confirmed",
            DeliveryState::Failed => "failed",
        }
    }
}

/// The addressee of a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    Direct(UserId),
    Room(RoomId),
}

/// Identifies one conversation.
///
/// Direct keys are normalized so that `direct(a, b) == direct(b, a)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKey {
    Direct { low: UserId, high: UserId },
    Room(RoomId),
}

impl ConversationKey {
    pub fn direct(a: UserId, b: UserId) -> Self {
        if a <= b {
            ConversationKey::Direct { low: a, high: b }
        } else {
            ConversationKey::Direct { low: b, high: a }
        }
    }

    pub fn room(room: RoomId) -> Self {
        ConversationKey::Room(room)
    }

    /// The conversation a message belongs to.
    pub fn of(msg: &ChatMessage) -> Self {
        match &msg.target {
            MessageTarget::Direct(recipient) => {
                Self::direct(msg.sender_id.clone(), recipient.clone())
            }
            MessageTarget::Room(room) => Self::room(room.clone()),
        }
    }

    pub fn contains(&self, msg: &ChatMessage) -> bool {
        *self == Self::of(msg)
    }

    pub fn is_room(&self) -> bool {
        matches!(self, ConversationKey::Room(_))
    }

    /// For a direct key, the participant that is not `me`.
    pub fn peer_of(&self, me: &UserId) -> Option<&UserId> {
        match self {
            ConversationKey::Direct { low, high } if low == me => Some(high),
            ConversationKey::Direct { low, high } if high == me => Some(low),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Direct { low, high } => write!(f, "dm:{low}:{high}"),
            ConversationKey::Room(room) => write!(f, "room:{room}"),
        }
    }
}

/// One displayed chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server identity, when the server told us one.
    pub id: Option<MessageId>,
    /// Set on entries composed by this client.
    pub local_id: Option<LocalId>,
    pub sender_id: UserId,
    pub target: MessageTarget,
    pub content: String,
    /// Unix millis.
    pub timestamp: u64,
    pub origin: DeliveryOrigin,
    pub state: DeliveryState,
}

impl ChatMessage {
    /// A message learned from REST history.
    pub fn from_history(
        id: Option<MessageId>,
        sender_id: UserId,
        target: MessageTarget,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id,
            local_id: None,
            sender_id,
            target,
            content: content.into(),
            timestamp,
            origin: DeliveryOrigin::ServerConfirmed,
            state: DeliveryState::Confirmed,
        }
    }

    /// A message pushed over the hub.
    pub fn pushed(
        id: Option<MessageId>,
        sender_id: UserId,
        target: MessageTarget,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            origin: DeliveryOrigin::PushedLive,
            ..Self::from_history(id, sender_id, target, content, timestamp)
        }
    }

    /// A locally composed message, not yet sent.
    pub fn optimistic(
        sender_id: UserId,
        target: MessageTarget,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: None,
            local_id: Some(LocalId::new()),
            sender_id,
            target,
            content: content.into(),
            timestamp,
            origin: DeliveryOrigin::OptimisticLocal,
            state: DeliveryState::Pending,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.origin == DeliveryOrigin::OptimisticLocal
    }

    pub fn is_failed(&self) -> bool {
        self.state == DeliveryState::Failed
    }
}

// ============================================================================
// Tests
// ============================================================================
