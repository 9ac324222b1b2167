//! Typed identifiers for users, rooms, and messages.
//!
//! `UserId`, `RoomId` and `MessageId` are opaque strings handed to us by the
//! backend. The backend is inconsistent about whether it serializes them as
//! JSON numbers or strings, so deserialization accepts both and always stores
//! the canonical text form.
//!
//! `LocalId` is minted on the client for optimistic sends. It wraps UUIDv7 so
//! ids sort by creation time, and displays as standard UUID text for logging.
//! The `short()` form (first 8 hex chars) is for human-facing output only.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Who sent or receives a message.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

/// A group chat room.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

/// Server-assigned message identity.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

/// Client-assigned identity of an optimistic send (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(uuid::Uuid);

/// Accepts `"42"` and `42` alike.
#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Int(i64),
    Uint(u64),
}

impl From<TextOrNumber> for String {
    fn from(v: TextOrNumber) -> String {
        match v {
            TextOrNumber::Text(s) => s,
            TextOrNumber::Int(n) => n.to_string(),
            TextOrNumber::Uint(n) => n.to_string(),
        }
    }
}

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_text_id {
    ($T:ident, $name:literal) => {
        impl $T {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into().trim().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Empty ids never reach the wire; callers treat them as "absent".
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// The id as a hub argument: a JSON number when the text is an
            /// integer, a JSON string otherwise.
            pub fn to_hub_arg(&self) -> serde_json::Value {
                match self.0.parse::<i64>() {
                    Ok(n) => serde_json::Value::from(n),
                    Err(_) => serde_json::Value::from(self.0.clone()),
                }
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                TextOrNumber::deserialize(d).map(|v| Self::new(String::from(v)))
            }
        }

        impl From<&str> for $T {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $T {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<i64> for $T {
            fn from(n: i64) -> Self {
                Self(n.to_string())
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.0)
            }
        }
    };
}

impl_text_id!(UserId, "UserId");
impl_text_id!(RoomId, "RoomId");
impl_text_id!(MessageId, "MessageId");

impl LocalId {
    /// Create a new time-ordered ID (UUIDv7).
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// First 8 hex characters, for display only.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }

    /// Check if a query string matches this ID by hex prefix.
    pub fn matches_hex_prefix(&self, prefix: &str) -> bool {
        self.0.as_simple().to_string().starts_with(prefix)
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId({})", self.short())
    }
}

// ============================================================================
// Tests
// ============================================================================
