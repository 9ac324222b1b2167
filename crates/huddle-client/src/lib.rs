//! Huddle real-time chat client core
//!
//! Keeps one hub connection per signed-in user alive, routes pushed events
//! to registered handlers, and merges REST history, live pushes and local
//! sends into ordered conversations.
//!
//! The usual entry point is [`Session::from_store`], then
//! [`Session::connect`] and [`Session::open_direct`] / [`Session::open_room`].

pub mod actor;
pub mod chat;
pub mod config;
pub mod constants;
pub mod conversation;
pub mod dto;
pub mod history;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod subscriptions;
pub mod transport;
pub mod ws;

pub use actor::{
    ConnectError, Connected, ConnectionManager, DisconnectError, Disconnected, SendError,
};
pub use chat::{ChatError, ChatView, NotificationFeed};
pub use config::{ClientConfig, ConfigError, RetryPolicy};
pub use conversation::{Conversation, HistoryMerge, LocalEntryError, MergeOutcome, SkipReason};
pub use dto::ChatRoom;
pub use history::{HistoryClient, HistoryError, HistorySource};
pub use identity::{FileIdentityStore, IdentityError, IdentityStore, MemoryIdentityStore};
pub use protocol::{HubMessage, ProtocolError};
pub use registry::{EventCallback, HandlerRegistry, HandlerToken};
pub use session::{Session, SessionError};
pub use subscriptions::{ConnectionState, ConnectionStatus, LifecycleHooks};
pub use transport::{Connector, HubLink, LinkPeer, TransportError};
pub use ws::WebSocketConnector;
