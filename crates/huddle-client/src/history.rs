//! REST history and room endpoints.
//!
//! [`HistorySource`] is what chat views fetch from; [`HistoryClient`] is the
//! `reqwest` implementation against the backend's API:
//!
//! | Call | Request |
//! |------|---------|
//! | `user_messages` | `GET {api}/Messages/user/{userId}` |
//! | `direct_history` | `GET {api}/Messages/{a}/{b}` and `GET {api}/Messages/{b}/{a}` |
//! | `list_rooms` | `GET {api}/ChatRooms` |
//! | `create_room` | `POST {api}/ChatRooms` |
//! | `room_history` | `GET {api}/ChatRooms/{roomId}/messages` |
//! | `send_room_message` | `POST {api}/ChatRooms/{roomId}/messages?senderId=..&content=..` |

use std::time::Duration;

use async_trait::async_trait;
use huddle_types::{ChatMessage, RoomId, UserId};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::ClientConfig;
use crate::dto::{ChatRoom, CreateRoomRequest, DirectMessageDto, RoomMessageDto};

/// Errors from REST calls.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum HistoryError {
    #[error("invalid api url: {0}")]
    InvalidUrl(String),
    #[error("{url} answered {status}")]
    RequestFailed { status: u16, url: String },
    #[error("http error: {0}")]
    Http(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Where conversation history comes from.
#[async_trait]
pub trait HistorySource: Send + Sync + 'static {
    /// Every message involving `user`.
    async fn user_messages(&self, user: &UserId) -> Result<Vec<ChatMessage>, HistoryError>;

    /// Messages sent by `sender` to `receiver` (one direction).
    async fn messages_between(
        &self,
        sender: &UserId,
        receiver: &UserId,
    ) -> Result<Vec<ChatMessage>, HistoryError>;

    async fn room_history(&self, room: &RoomId) -> Result<Vec<ChatMessage>, HistoryError>;

    async fn list_rooms(&self) -> Result<Vec<ChatRoom>, HistoryError>;

    async fn create_room(&self, name: &str) -> Result<ChatRoom, HistoryError>;

    /// Post to a room. Returns the stored message when the server echoes it.
    async fn send_room_message(
        &self,
        room: &RoomId,
        sender: &UserId,
        content: &str,
    ) -> Result<Option<ChatMessage>, HistoryError>;

    /// Both directions of a direct pair, fetched concurrently.
    ///
    /// One failed direction is logged and the other is still returned; the
    /// call only fails when both do.
    async fn direct_history(
        &self,
        me: &UserId,
        peer: &UserId,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let (sent, received) = tokio::join!(
            self.messages_between(me, peer),
            self.messages_between(peer, me)
        );
        match (sent, received) {
            (Ok(mut a), Ok(b)) => {
                a.extend(b);
                Ok(a)
            }
            (Ok(a), Err(e)) | (Err(e), Ok(a)) => {
                tracing::warn!("direct history {me}<->{peer}: one direction failed: {e}");
                Ok(a)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }
}

/// `reqwest`-backed [`HistorySource`].
#[derive(Debug, Clone)]
pub struct HistoryClient {
    client: Client,
    base: Url,
    timeout: Duration,
}

impl HistoryClient {
    pub fn new(config: &ClientConfig) -> Result<Self, HistoryError> {
        let base = Url::parse(&config.api_base_url)
            .map_err(|e| HistoryError::InvalidUrl(format!("{}: {e}", config.api_base_url)))?;
        if base.cannot_be_a_base() {
            return Err(HistoryError::InvalidUrl(config.api_base_url.clone()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| HistoryError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base,
            timeout: config.request_timeout,
        })
    }

    /// `{base}/{segments...}` with each segment percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, HistoryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| HistoryError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn map_err(&self, err: reqwest::Error) -> HistoryError {
        if err.is_timeout() {
            HistoryError::Timeout(self.timeout)
        } else if err.is_decode() {
            HistoryError::Decode(err.to_string())
        } else {
            HistoryError::Http(err.to_string())
        }
    }

    fn check(&self, response: Response) -> Result<Response, HistoryError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(HistoryError::RequestFailed {
                status: status.as_u16(),
                url: response.url().to_string(),
            })
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, HistoryError> {
        tracing::debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.check(response)?
            .json::<T>()
            .await
            .map_err(|e| self.map_err(e))
    }
}

#[async_trait]
impl HistorySource for HistoryClient {
    async fn user_messages(&self, user: &UserId) -> Result<Vec<ChatMessage>, HistoryError> {
        let url = self.endpoint(&["Messages", "user", user.as_str()])?;
        let dtos: Vec<DirectMessageDto> = self.get_json(url).await?;
        Ok(dtos.into_iter().map(DirectMessageDto::into_history).collect())
    }

    async fn messages_between(
        &self,
        sender: &UserId,
        receiver: &UserId,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let url = self.endpoint(&["Messages", sender.as_str(), receiver.as_str()])?;
        let dtos: Vec<DirectMessageDto> = self.get_json(url).await?;
        Ok(dtos.into_iter().map(DirectMessageDto::into_history).collect())
    }

    async fn room_history(&self, room: &RoomId) -> Result<Vec<ChatMessage>, HistoryError> {
        let url = self.endpoint(&["ChatRooms", room.as_str(), "messages"])?;
        let dtos: Vec<RoomMessageDto> = self.get_json(url).await?;
        Ok(dtos.into_iter().map(RoomMessageDto::into_history).collect())
    }

    async fn list_rooms(&self) -> Result<Vec<ChatRoom>, HistoryError> {
        let url = self.endpoint(&["ChatRooms"])?;
        self.get_json(url).await
    }

    async fn create_room(&self, name: &str) -> Result<ChatRoom, HistoryError> {
        let url = self.endpoint(&["ChatRooms"])?;
        tracing::debug!("POST {url}");
        let response = self
            .client
            .post(url)
            .json(&CreateRoomRequest { name })
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.check(response)?
            .json::<ChatRoom>()
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn send_room_message(
        &self,
        room: &RoomId,
        sender: &UserId,
        content: &str,
    ) -> Result<Option<ChatMessage>, HistoryError> {
        let mut url = self.endpoint(&["ChatRooms", room.as_str(), "messages"])?;
        url.query_pairs_mut()
            .append_pair("senderId", sender.as_str())
            .append_pair("content", content);
        tracing::debug!("POST {}", url.path());
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        let body = self
            .check(response)?
            .bytes()
            .await
            .map_err(|e| self.map_err(e))?;
        // The body is optional; anything that is not a message is ignored.
        Ok(serde_json::from_slice::<RoomMessageDto>(&body)
            .ok()
            .map(RoomMessageDto::into_history))
    }
}
