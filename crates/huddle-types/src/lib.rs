//! Shared identity and message types for Huddle.
//!
//! A pure leaf crate: typed ids, the chat message model and timestamp
//! helpers. Transport, merge logic and network clients live in
//! `huddle-client`.
//!
//! # Key Types
//!
//! |---------------------|---------------------------------------------|
//! | Type                | Purpose                                     |
//! |---------------------|---------------------------------------------|
//! | [`UserId`]          | Who (opaque, number-or-string on the wire)  |
//! | [`RoomId`]          | Which group room                            |
//! | [`MessageId`]       | Server-assigned message identity            |
//! | [`LocalId`]         | Client-assigned id of an optimistic send    |
//! | [`ChatMessage`]     | One displayed message                       |
//! | [`ConversationKey`] | Direct pair or room                         |
//! | [`DeliveryOrigin`]  | Local / confirmed / pushed                  |
//! | [`DeliveryState`]   | Pending / Confirmed / Failed                |
//! |---------------------|---------------------------------------------|

pub mod ids;
pub mod message;
pub mod time;

pub use ids::{LocalId, MessageId, RoomId, UserId};
pub use message::{ChatMessage, ConversationKey, DeliveryOrigin, DeliveryState, MessageTarget};
pub use time::{format_timestamp, now_millis, parse_timestamp};
