//! Shared fixtures: a scripted hub connector and an in-memory history source.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use huddle_client::{
    ChatRoom, ClientConfig, Connector, HistoryError, HistorySource, HubLink, HubMessage, LinkPeer,
    RetryPolicy, TransportError,
};
use huddle_types::{ChatMessage, MessageTarget, RoomId, UserId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Config with a deterministic 5s retry.
pub fn fixed_retry_config() -> ClientConfig {
    ClientConfig {
        retry: RetryPolicy::fixed(Duration::from_secs(5)),
        ..ClientConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fail,
    Accept,
}

/// Connector that follows a script, then accepts everything.
///
/// Accepted links hand their far side to the test through `peers`.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Step>>,
    attempts: Mutex<Vec<(UserId, Instant)>>,
    peers: mpsc::UnboundedSender<LinkPeer>,
}

impl ScriptedConnector {
    pub fn new(script: &[Step]) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            attempts: Mutex::new(Vec::new()),
            peers,
        });
        (connector, rx)
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().iter().map(|(_, t)| *t).collect()
    }

    pub fn attempt_users(&self) -> Vec<UserId> {
        self.attempts.lock().iter().map(|(u, _)| u.clone()).collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, user_id: &UserId) -> Result<HubLink, TransportError> {
        self.attempts.lock().push((user_id.clone(), Instant::now()));
        let step = self.script.lock().pop_front().unwrap_or(Step::Accept);
        match step {
            Step::Fail => Err(TransportError::Connect("connection refused".into())),
            Step::Accept => {
                let (link, peer) = HubLink::channel();
                self.peers.send(peer).map_err(|_| TransportError::Closed)?;
                Ok(link)
            }
        }
    }
}

/// Answer every invocation the client sends with a completion.
pub fn auto_complete(mut peer: LinkPeer, error: Option<&'static str>) -> mpsc::UnboundedReceiver<HubMessage> {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(msg) = peer.from_client.recv().await {
            if let HubMessage::Invocation {
                invocation_id: Some(id),
                ..
            } = &msg
            {
                let reply = HubMessage::Completion {
                    invocation_id: id.clone(),
                    result: None,
                    error: error.map(str::to_string),
                };
                if peer.to_client.send(reply).await.is_err() {
                    break;
                }
            }
            let _ = seen_tx.send(msg);
        }
    });
    seen_rx
}

pub fn push(target: &str, arguments: Vec<Value>) -> HubMessage {
    HubMessage::invocation(None, target, arguments)
}

/// History served from memory. Failing it makes every call return 503.
#[derive(Default)]
pub struct MemoryHistory {
    direct: Mutex<Vec<ChatMessage>>,
    rooms: Mutex<HashMap<RoomId, Vec<ChatMessage>>>,
    failing: Mutex<bool>,
    next_id: Mutex<u64>,
}

impl MemoryHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, msg: ChatMessage) {
        match &msg.target {
            MessageTarget::Direct(_) => self.direct.lock().push(msg),
            MessageTarget::Room(room) => {
                self.rooms.lock().entry(room.clone()).or_default().push(msg)
            }
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    fn check(&self) -> Result<(), HistoryError> {
        if *self.failing.lock() {
            Err(HistoryError::RequestFailed {
                status: 503,
                url: "memory://history".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HistorySource for MemoryHistory {
    async fn user_messages(&self, user: &UserId) -> Result<Vec<ChatMessage>, HistoryError> {
        self.check()?;
        Ok(self
            .direct
            .lock()
            .iter()
            .filter(|m| &m.sender_id == user || m.target == MessageTarget::Direct(user.clone()))
            .cloned()
            .collect())
    }

    async fn messages_between(
        &self,
        sender: &UserId,
        receiver: &UserId,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        self.check()?;
        Ok(self
            .direct
            .lock()
            .iter()
            .filter(|m| &m.sender_id == sender && m.target == MessageTarget::Direct(receiver.clone()))
            .cloned()
            .collect())
    }

    async fn room_history(&self, room: &RoomId) -> Result<Vec<ChatMessage>, HistoryError> {
        self.check()?;
        Ok(self.rooms.lock().get(room).cloned().unwrap_or_default())
    }

    async fn list_rooms(&self) -> Result<Vec<ChatRoom>, HistoryError> {
        self.check()?;
        Ok(self
            .rooms
            .lock()
            .keys()
            .map(|id| ChatRoom {
                id: id.clone(),
                name: format!("room {id}"),
            })
            .collect())
    }

    async fn create_room(&self, name: &str) -> Result<ChatRoom, HistoryError> {
        self.check()?;
        let mut next = self.next_id.lock();
        *next += 1;
        let id = RoomId::new(format!("r{}", *next));
        self.rooms.lock().insert(id.clone(), Vec::new());
        Ok(ChatRoom {
            id,
            name: name.to_string(),
        })
    }

    async fn send_room_message(
        &self,
        room: &RoomId,
        sender: &UserId,
        content: &str,
    ) -> Result<Option<ChatMessage>, HistoryError> {
        self.check()?;
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let stored = ChatMessage::from_history(
            Some(id.to_string().into()),
            sender.clone(),
            MessageTarget::Room(room.clone()),
            content,
            huddle_types::now_millis(),
        );
        self.add(stored.clone());
        Ok(Some(stored))
    }
}
