//! One signed-in client: identity, connection, history.
//!
//! A [`Session`] owns the single [`ConnectionManager`] for its user. Chat
//! views opened through it share that connection and only layer handler
//! registrations on top.

use std::sync::Arc;

use huddle_types::{ConversationKey, RoomId, UserId};

use crate::actor::{ConnectError, Connected, ConnectionManager, Disconnected};
use crate::chat::{ChatError, ChatView, NotificationFeed};
use crate::config::ClientConfig;
use crate::history::{HistoryClient, HistoryError, HistorySource};
use crate::identity::{IdentityError, IdentityStore};
use crate::transport::Connector;
use crate::ws::WebSocketConnector;

/// Errors building a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("identity store: {0}")]
    Identity(#[from] IdentityError),
    #[error("history client: {0}")]
    History(#[from] HistoryError),
}

pub struct Session {
    user_id: Option<UserId>,
    manager: ConnectionManager,
    history: Arc<dyn HistorySource>,
    store: Option<Arc<dyn IdentityStore>>,
    config: ClientConfig,
}

impl Session {
    /// Build a session for whoever `store` remembers, talking WebSocket and
    /// REST to the endpoints in `config`.
    ///
    /// An empty store is not an error here; `connect()` reports
    /// [`ConnectError::MissingIdentity`] instead.
    pub fn from_store(
        store: Arc<dyn IdentityStore>,
        config: ClientConfig,
    ) -> Result<Self, SessionError> {
        let user_id = store.load()?;
        if user_id.is_none() {
            log::info!("no stored identity, session starts signed out");
        }
        let connector: Arc<dyn Connector> = Arc::new(WebSocketConnector::new(&config));
        let history: Arc<dyn HistorySource> = Arc::new(HistoryClient::new(&config)?);
        let mut session = Self::with_parts(user_id, connector, history, config);
        session.store = Some(store);
        Ok(session)
    }

    /// Assemble a session from explicit parts.
    pub fn with_parts(
        user_id: Option<UserId>,
        connector: Arc<dyn Connector>,
        history: Arc<dyn HistorySource>,
        config: ClientConfig,
    ) -> Self {
        let manager = ConnectionManager::spawn(connector, &config);
        Self {
            user_id: user_id.filter(|id| !id.is_empty()),
            manager,
            history,
            store: None,
            config,
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn history(&self) -> &Arc<dyn HistorySource> {
        &self.history
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<Connected, ConnectError> {
        self.manager.connect(self.user_id.as_ref()).await
    }

    /// Remember `user_id` and connect as them.
    pub async fn sign_in(&mut self, user_id: UserId) -> Result<Connected, ConnectError> {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&user_id) {
                log::warn!("could not persist identity: {e}");
            }
        }
        self.user_id = Some(user_id).filter(|id| !id.is_empty());
        self.connect().await
    }

    /// Disconnect, forget the stored identity and stop the connection actor.
    pub async fn sign_out(self) -> Result<Disconnected, SessionError> {
        let disconnected = self
            .manager
            .disconnect()
            .await
            .unwrap_or(Disconnected { was_connected: false });
        if let Some(store) = &self.store {
            store.clear()?;
        }
        self.manager.shutdown();
        Ok(disconnected)
    }

    pub async fn open_direct(&self, peer: UserId) -> Result<ChatView, ChatError> {
        let me = self.user_id.clone().ok_or(ChatError::MissingIdentity)?;
        let key = ConversationKey::direct(me.clone(), peer);
        self.open(key, me).await
    }

    pub async fn open_room(&self, room: RoomId) -> Result<ChatView, ChatError> {
        let me = self.user_id.clone().ok_or(ChatError::MissingIdentity)?;
        self.open(ConversationKey::room(room), me).await
    }

    async fn open(&self, key: ConversationKey, me: UserId) -> Result<ChatView, ChatError> {
        ChatView::open_with_tolerance(
            &self.manager,
            self.history.clone(),
            key,
            me,
            self.config.echo_tolerance,
        )
        .await
    }

    pub fn notifications(&self) -> NotificationFeed {
        NotificationFeed::attach(&self.manager)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}
