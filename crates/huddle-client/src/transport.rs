//! Transport seam between the connection actor and the network.
//!
//! A [`Connector`] opens one hub link for a user. The link is a pair of
//! channels carrying decoded [`HubMessage`]s:
//!
//! ```text
//!   SessionActor                 HubLink                 pump task / peer
//!   ┌────────────┐  outbound ─────────────────────────▶  ┌──────────────┐
//!   │            │                                       │  WebSocket   │
//!   │            │  ◀───────────────────────── inbound   │  (or script) │
//!   └────────────┘                                       └──────────────┘
//! ```
//!
//! The inbound channel closing means the transport went away. Dropping the
//! outbound sender asks the transport to close.

use std::time::Duration;

use async_trait::async_trait;
use huddle_types::UserId;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::constants::LINK_CHANNEL_CAPACITY;
use crate::protocol::{HubMessage, ProtocolError};

/// Errors establishing or running a hub link.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("link closed")]
    Closed,
}

/// One live hub connection, as seen by its owner.
#[derive(Debug)]
pub struct HubLink {
    pub outbound: mpsc::Sender<HubMessage>,
    pub inbound: mpsc::Receiver<HubMessage>,
}

/// The far side of a [`HubLink`]: what a transport (or a test) holds.
#[derive(Debug)]
pub struct LinkPeer {
    /// Messages to deliver to the link owner.
    pub to_client: mpsc::Sender<HubMessage>,
    /// Messages the link owner sent.
    pub from_client: mpsc::Receiver<HubMessage>,
}

impl HubLink {
    /// A connected link/peer pair.
    pub fn channel() -> (HubLink, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        (
            HubLink {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                to_client: in_tx,
                from_client: out_rx,
            },
        )
    }
}

/// Opens hub links.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link for `user_id`. Must not return before the hub handshake
    /// has completed.
    async fn connect(&self, user_id: &UserId) -> Result<HubLink, TransportError>;
}
