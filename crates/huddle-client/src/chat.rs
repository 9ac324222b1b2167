//! Chat views: one open conversation wired to the hub and REST history.
//!
//! A [`ChatView`] registers the push handler for its conversation kind,
//! fetches history, and reconciles local sends against both. Closing or
//! dropping the view unregisters its handler; the session's connection is
//! not touched.
//!
//! [`NotificationFeed`] is the app-level listener for `ReceiveNotification`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use huddle_types::{
    ChatMessage, ConversationKey, LocalId, MessageTarget, UserId, now_millis,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::actor::{ConnectionManager, SendError};
use crate::constants::{ECHO_TOLERANCE, NOTIFICATION_CHANNEL_CAPACITY};
use crate::conversation::{Conversation, HistoryMerge, LocalEntryError, MergeOutcome};
use crate::history::{HistoryError, HistorySource};
use crate::protocol;
use crate::registry::HandlerToken;

/// Errors from chat view operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ChatError {
    #[error("no user id available")]
    MissingIdentity,
    #[error("{me} is not part of {key}")]
    NotParticipant { me: UserId, key: String },
    #[error("message is empty")]
    EmptyMessage,
    /// The entry stays in the conversation marked failed.
    #[error("send {local_id} failed: {source}")]
    SendFailed {
        local_id: LocalId,
        #[source]
        source: SendError,
    },
    #[error(transparent)]
    Entry(#[from] LocalEntryError),
}

/// State shared between the view and its push handler.
struct ViewShared {
    conversation: Mutex<Conversation>,
    changes: watch::Sender<u64>,
}

impl ViewShared {
    /// Run `f` against the conversation and publish the version if it moved.
    fn apply<R>(&self, f: impl FnOnce(&mut Conversation) -> R) -> R {
        let (result, before, after) = {
            let mut conv = self.conversation.lock();
            let before = conv.version();
            let result = f(&mut conv);
            (result, before, conv.version())
        };
        if after != before {
            self.changes.send_replace(after);
        }
        result
    }
}

/// One open conversation.
pub struct ChatView {
    shared: Arc<ViewShared>,
    manager: ConnectionManager,
    history: Arc<dyn HistorySource>,
    me: UserId,
    /// Where this view's sends go.
    target: MessageTarget,
    token: Option<HandlerToken>,
}

impl ChatView {
    /// Open `key` as `me`: register the push handler, then load history.
    ///
    /// A failed history fetch is logged and leaves the view empty; pushes
    /// still arrive and `refresh()` can try again.
    pub async fn open(
        manager: &ConnectionManager,
        history: Arc<dyn HistorySource>,
        key: ConversationKey,
        me: UserId,
    ) -> Result<Self, ChatError> {
        Self::open_with_tolerance(manager, history, key, me, ECHO_TOLERANCE).await
    }

    pub async fn open_with_tolerance(
        manager: &ConnectionManager,
        history: Arc<dyn HistorySource>,
        key: ConversationKey,
        me: UserId,
        echo_tolerance: Duration,
    ) -> Result<Self, ChatError> {
        if me.is_empty() {
            return Err(ChatError::MissingIdentity);
        }
        let target = match &key {
            ConversationKey::Room(room) => MessageTarget::Room(room.clone()),
            ConversationKey::Direct { .. } => {
                let peer = key.peer_of(&me).ok_or_else(|| ChatError::NotParticipant {
                    me: me.clone(),
                    key: key.to_string(),
                })?;
                MessageTarget::Direct(peer.clone())
            }
        };

        let (changes, _) = watch::channel(0);
        let shared = Arc::new(ViewShared {
            conversation: Mutex::new(Conversation::with_echo_tolerance(key.clone(), echo_tolerance)),
            changes,
        });

        let token = register_push_handler(manager, &key, Arc::downgrade(&shared));
        let view = Self {
            shared,
            manager: manager.clone(),
            history,
            me,
            target,
            token: Some(token),
        };

        // Logged inside refresh(); the view stays usable.
        let _ = view.refresh().await;
        Ok(view)
    }

    pub fn key(&self) -> ConversationKey {
        self.shared.conversation.lock().key().clone()
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    /// Current messages, oldest first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.shared.conversation.lock().messages().to_vec()
    }

    pub fn version(&self) -> u64 {
        self.shared.conversation.lock().version()
    }

    /// Receives the conversation version after every change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Re-fetch history and merge it in.
    pub async fn refresh(&self) -> Result<HistoryMerge, HistoryError> {
        let fetched = match &self.target {
            MessageTarget::Direct(peer) => self.history.direct_history(&self.me, peer).await,
            MessageTarget::Room(room) => self.history.room_history(room).await,
        };
        match fetched {
            Ok(batch) => Ok(self.shared.apply(|conv| conv.merge_history(batch))),
            Err(e) => {
                log::warn!("history fetch for {} failed: {e}", self.key());
                Err(e)
            }
        }
    }

    /// Show `content` immediately, then deliver it.
    ///
    /// Direct messages go through the hub's `SendMessage`; room messages are
    /// posted over REST. On failure the entry is kept, marked failed, and
    /// the error names its local id for [`retry`](Self::retry).
    pub async fn send(&self, content: &str) -> Result<LocalId, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let local_id = self.shared.apply(|conv| {
            conv.push_optimistic(self.me.clone(), self.target.clone(), content, now_millis())
        });
        self.deliver(local_id, content).await
    }

    /// Resend a failed entry.
    pub async fn retry(&self, local_id: &LocalId) -> Result<LocalId, ChatError> {
        let entry = self.shared.apply(|conv| conv.retry(local_id, now_millis()))?;
        self.deliver(*local_id, &entry.content).await
    }

    async fn deliver(&self, local_id: LocalId, content: &str) -> Result<LocalId, ChatError> {
        let result = match &self.target {
            MessageTarget::Direct(peer) => self.manager.send_message(&self.me, peer, content).await,
            MessageTarget::Room(room) => {
                match self.history.send_room_message(room, &self.me, content).await {
                    Ok(stored) => {
                        if let Some(stored) = stored {
                            self.shared.apply(|conv| conv.merge_history(vec![stored]));
                        }
                        Ok(())
                    }
                    Err(e) => Err(SendError::Request(e.to_string())),
                }
            }
        };

        match result {
            Ok(()) => {
                self.shared.apply(|conv| conv.mark_sent(&local_id))?;
                Ok(local_id)
            }
            Err(source) => {
                log::warn!("send {} to {} failed: {source}", local_id.short(), self.key());
                if let Err(e) = self.shared.apply(|conv| conv.mark_failed(&local_id)) {
                    // The echo beat the error; the message did arrive.
                    log::debug!("not marking {} failed: {e}", local_id.short());
                    return Ok(local_id);
                }
                Err(ChatError::SendFailed { local_id, source })
            }
        }
    }

    /// Unregister this view's handler.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(token) = self.token.take() {
            self.manager.unregister(&token);
        }
    }
}

impl Drop for ChatView {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ChatView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatView")
            .field("key", &self.key())
            .field("me", &self.me)
            .field("version", &self.version())
            .finish()
    }
}

fn register_push_handler(
    manager: &ConnectionManager,
    key: &ConversationKey,
    shared: Weak<ViewShared>,
) -> HandlerToken {
    type Parser = fn(&[Value]) -> Result<ChatMessage, protocol::ProtocolError>;
    let (event, parse): (&'static str, Parser) = if key.is_room() {
        (protocol::RECEIVE_ROOM_MESSAGE, protocol::parse_room_message as Parser)
    } else {
        (protocol::RECEIVE_MESSAGE, protocol::parse_direct_message as Parser)
    };

    manager.register(event, move |args: &[Value]| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match parse(args) {
            Ok(msg) => {
                let outcome = shared.apply(|conv| conv.apply_pushed(msg));
                if let MergeOutcome::Confirmed { local_id, .. } = outcome {
                    log::debug!("echo confirmed {}", local_id.short());
                }
            }
            Err(e) => log::warn!("dropping malformed {event}: {e}"),
        }
    })
}

// ============================================================================
// Notifications
// ============================================================================

/// Fans `ReceiveNotification` out to any number of subscribers.
pub struct NotificationFeed {
    tx: broadcast::Sender<String>,
    manager: ConnectionManager,
    token: Option<HandlerToken>,
}

impl NotificationFeed {
    pub fn attach(manager: &ConnectionManager) -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let sender = tx.clone();
        let token = manager.register(protocol::RECEIVE_NOTIFICATION, move |args: &[Value]| {
            match protocol::parse_notification(args) {
                // No subscribers is fine
                Ok(text) => {
                    let _ = sender.send(text);
                }
                Err(e) => log::warn!("dropping malformed notification: {e}"),
            }
        });
        Self {
            tx,
            manager: manager.clone(),
            token: Some(token),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(token) = self.token.take() {
            self.manager.unregister(&token);
        }
    }
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        self.release();
    }
}
