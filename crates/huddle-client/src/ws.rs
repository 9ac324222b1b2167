//! WebSocket [`Connector`] for the hub.
//!
//! Connects with `tokio-tungstenite`, performs the JSON protocol handshake,
//! then hands the socket to a pump task that translates between text frames
//! and [`HubMessage`]s. The pump also sends a keep-alive ping whenever the
//! link has been idle for the keep-alive interval.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use huddle_types::UserId;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::config::ClientConfig;
use crate::constants::HUB_USER_QUERY_PARAM;
use crate::protocol::{self, HubMessage};
use crate::transport::{Connector, HubLink, LinkPeer, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens hub links over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    hub_url: String,
    connect_timeout: Duration,
    keepalive_interval: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            hub_url: config.hub_url.clone(),
            connect_timeout: config.connect_timeout,
            keepalive_interval: config.keepalive_interval,
        }
    }

    /// `{hub_url}?userId={user_id}`, keeping any query the base already has.
    pub fn endpoint_for(&self, user_id: &UserId) -> Result<Url, TransportError> {
        let mut url =
            Url::parse(&self.hub_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair(HUB_USER_QUERY_PARAM, user_id.as_str());
        Ok(url)
    }

    async fn open(&self, url: &Url) -> Result<(WsStream, Vec<HubMessage>), TransportError> {
        let (mut ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        ws.send(Message::text(protocol::handshake_request()))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        // The reply may share its frame with the first real records.
        loop {
            let frame = ws
                .next()
                .await
                .ok_or_else(|| TransportError::Handshake("closed during handshake".into()))?
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            match frame {
                Message::Text(_) => {
                    let text = frame
                        .to_text()
                        .map_err(|e| TransportError::Handshake(e.to_string()))?;
                    let rest = protocol::parse_handshake_response(text)?;
                    let early = protocol::decode_frame(rest)?;
                    return Ok((ws, early));
                }
                Message::Close(_) => {
                    return Err(TransportError::Handshake("closed during handshake".into()));
                }
                _ => continue,
            }
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, user_id: &UserId) -> Result<HubLink, TransportError> {
        let url = self.endpoint_for(user_id)?;
        log::info!("Connecting to hub {}", url);

        let (ws, early) = tokio::time::timeout(self.connect_timeout, self.open(&url))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;

        let (link, peer) = HubLink::channel();
        for msg in early {
            peer.to_client
                .send(msg)
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        tokio::spawn(pump(ws, peer, self.keepalive_interval));
        Ok(link)
    }
}

/// Shuttle frames until either side goes away.
async fn pump(ws: WsStream, peer: LinkPeer, keepalive: Duration) {
    let LinkPeer {
        to_client,
        mut from_client,
    } = peer;
    let (mut sink, mut stream) = ws.split();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            outgoing = from_client.recv() => {
                let Some(msg) = outgoing else {
                    log::debug!("hub link released by owner, closing socket");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = sink.send(Message::text(msg.encode())).await {
                    log::warn!("hub send failed: {e}");
                    break;
                }
                ping.reset();
            }
            incoming = stream.next() => {
                let frame = match incoming {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        log::warn!("hub socket error: {e}");
                        break;
                    }
                    None => {
                        log::debug!("hub socket ended");
                        break;
                    }
                };
                match frame {
                    Message::Text(_) => {
                        let Ok(text) = frame.to_text() else { continue };
                        match protocol::decode_frame(text) {
                            Ok(msgs) => {
                                for msg in msgs {
                                    if to_client.send(msg).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => log::warn!("dropping undecodable hub frame: {e}"),
                        }
                    }
                    Message::Close(reason) => {
                        log::debug!("hub closed socket: {:?}", reason);
                        break;
                    }
                    // tungstenite answers pings itself
                    _ => {}
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::text(HubMessage::Ping.encode())).await {
                    log::warn!("hub keep-alive failed: {e}");
                    break;
                }
            }
        }
    }
    // Dropping `to_client` closes the owner's inbound channel.
}
