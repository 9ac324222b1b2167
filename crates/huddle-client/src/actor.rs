//! Actor-owned hub connection with auto-reconnect.
//!
//! [`ConnectionManager`] is a cheap `Clone + Send + Sync` handle. The single
//! live [`HubLink`] is owned by a `SessionActor` task that processes commands
//! sequentially from an mpsc channel, dispatches inbound events to the
//! [`HandlerRegistry`], and drives the retry schedule.
//!
//! ```text
//!   ConnectionManager (Clone)    mpsc      SessionActor (tokio task)
//!   ┌─────────────────────┐  ────────▶  ┌──────────────────────────────┐
//!   │ .connect()          │             │ HubLink (at most one)        │
//!   │ .disconnect()       │  ◀────────  │ retry schedule               │
//!   │ .invoke()           │   oneshot   │ inbound → HandlerRegistry    │
//!   └─────────────────────┘             └──────────────────────────────┘
//! ```
//!
//! Because commands are handled one at a time, two concurrent `connect()`
//! calls for the same user open one link: the second finds it already up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use huddle_types::UserId;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, RetryPolicy};
use crate::constants::STATUS_CHANNEL_CAPACITY;
use crate::protocol::{self, HubMessage};
use crate::registry::{HandlerRegistry, HandlerToken};
use crate::subscriptions::{ConnectionState, ConnectionStatus, LifecycleHooks};
use crate::transport::{Connector, HubLink, TransportError};

// ============================================================================
// Error / Result Types
// ============================================================================

/// Errors from [`ConnectionManager::connect`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConnectError {
    #[error("no user id available")]
    MissingIdentity,
    #[error("transport connect failed: {0}")]
    Transport(#[from] TransportError),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection manager shut down")]
    Shutdown,
}

impl ConnectError {
    /// Whether the manager keeps retrying after this error.
    pub fn is_retrying(&self) -> bool {
        matches!(self, ConnectError::Transport(_) | ConnectError::Timeout(_))
    }
}

/// Errors from [`ConnectionManager::disconnect`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum DisconnectError {
    #[error("connection manager shut down")]
    Shutdown,
}

/// Errors from outbound hub invocations.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SendError {
    #[error("not connected to hub")]
    NotConnected,
    #[error("connection lost before the hub answered")]
    ConnectionLost,
    #[error("hub rejected the call: {0}")]
    Rejected(String),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(String),
    #[error("connection manager shut down")]
    Shutdown,
}

/// Proof of a live link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub user_id: UserId,
    pub generation: u64,
}

/// Result of a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected {
    /// `false` when there was nothing to tear down.
    pub was_connected: bool,
}

type InvokeReply = oneshot::Sender<Result<Option<Value>, SendError>>;

// ============================================================================
// Commands (internal)
// ============================================================================

/// Internal command sent from ConnectionManager → SessionActor via mpsc.
enum SessionCommand {
    Connect {
        user_id: UserId,
        reply: oneshot::Sender<Result<Connected, ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Disconnected>,
    },
    Invoke {
        target: String,
        arguments: Vec<Value>,
        reply: InvokeReply,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
}

// ============================================================================
// ConnectionManager (Send + Sync public API)
// ============================================================================

/// Handle to the session's connection actor.
///
/// Each method sends a command via mpsc and awaits the oneshot reply.
/// The handle can be cloned and shared across tasks; every clone talks to the
/// same actor and therefore the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::UnboundedSender<SessionCommand>,
    registry: HandlerRegistry,
    hooks: LifecycleHooks,
    state_rx: watch::Receiver<ConnectionState>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    request_timeout: Duration,
}

impl ConnectionManager {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        Self::spawn_with_cancel(connector, config, CancellationToken::new())
    }

    /// Spawn the actor, stopping it (and any retrying) when `cancel` fires.
    pub fn spawn_with_cancel(
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let registry = HandlerRegistry::new();
        let hooks = LifecycleHooks::default();

        let actor = SessionActor {
            connector,
            registry: registry.clone(),
            hooks: hooks.clone(),
            retry: config.retry.clone(),
            connect_timeout: config.connect_timeout,
            user_id: None,
            link: None,
            state_tx,
            status_tx: status_tx.clone(),
            cancel: cancel.clone(),
            retry_at: None,
            failures: 0,
            reconnecting: false,
            pending: HashMap::new(),
            next_invocation: 0,
            generation: 0,
        };
        tokio::spawn(actor.run(rx));

        Self {
            tx,
            registry,
            hooks,
            state_rx,
            status_tx,
            cancel,
            request_timeout: config.request_timeout,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Open the session's link for `user_id`.
    ///
    /// Fails fast with [`ConnectError::MissingIdentity`] when there is no
    /// user id. On transport failure the error is returned *and* a retry is
    /// scheduled; the manager keeps trying until it connects, `disconnect()`
    /// is called, or the manager is cancelled.
    pub async fn connect(&self, user_id: Option<&UserId>) -> Result<Connected, ConnectError> {
        let user_id = match user_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => return Err(ConnectError::MissingIdentity),
        };
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Connect { user_id, reply })
            .map_err(|_| ConnectError::Shutdown)?;
        rx.await.map_err(|_| ConnectError::Shutdown)?
    }

    /// Close the link and stop retrying. Idempotent.
    pub async fn disconnect(&self) -> Result<Disconnected, DisconnectError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Disconnect { reply })
            .map_err(|_| DisconnectError::Shutdown)?;
        rx.await.map_err(|_| DisconnectError::Shutdown)
    }

    /// Stop the actor for good. Pending calls fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ConnectError> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| ConnectError::Shutdown)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn on_unexpected_close<F>(&self, f: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.hooks.set_unexpected_close(f);
    }

    pub fn on_reconnecting<F>(&self, f: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.hooks.set_reconnecting(f);
    }

    pub fn on_reconnected<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.set_reconnected(f);
    }

    // ── Events ───────────────────────────────────────────────────────────

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Install the handler for `event`, replacing any previous one.
    pub fn register<F>(&self, event: &str, callback: F) -> HandlerToken
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.registry.register(event, callback)
    }

    pub fn unregister(&self, token: &HandlerToken) -> bool {
        self.registry.unregister(token)
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Call a hub method and wait for its completion.
    pub async fn invoke(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>, SendError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Invoke {
                target: target.to_string(),
                arguments,
                reply,
            })
            .map_err(|_| SendError::Shutdown)?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(result) => result.map_err(|_| SendError::Shutdown)?,
            Err(_) => Err(SendError::Timeout(self.request_timeout)),
        }
    }

    /// Invocations the actor still tracks as awaiting a completion.
    pub async fn pending_invocations(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionCommand::PendingCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// `SendMessage(senderId, recipientId, content)`.
    pub async fn send_message(
        &self,
        sender: &UserId,
        recipient: &UserId,
        content: &str,
    ) -> Result<(), SendError> {
        self.invoke(
            protocol::SEND_MESSAGE,
            protocol::send_message_args(sender, recipient, content),
        )
        .await
        .map(|_| ())
    }
}

// ============================================================================
// SessionActor (internal, runs in its own task)
// ============================================================================

struct SessionActor {
    connector: Arc<dyn Connector>,
    registry: HandlerRegistry,
    hooks: LifecycleHooks,
    retry: RetryPolicy,
    connect_timeout: Duration,
    /// Who the session is for. Set by the first `connect`.
    user_id: Option<UserId>,
    /// Live link (None = disconnected).
    link: Option<HubLink>,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    /// When the next retry fires (None = no retry scheduled).
    retry_at: Option<Instant>,
    /// Consecutive failed attempts in the current outage.
    failures: u32,
    /// Retries belong to a lost link rather than a first connect.
    reconnecting: bool,
    pending: HashMap<String, InvokeReply>,
    next_invocation: u64,
    generation: u64,
}

/// Next inbound message, or `None` once the link's transport is gone.
/// Never resolves while there is no link.
async fn next_inbound(link: &mut Option<HubLink>) -> Option<HubMessage> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_retry(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    /// Process commands, inbound frames and retries until cancelled or every
    /// handle is dropped.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::debug!("Session actor cancelled");
                    break;
                }
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        log::debug!("Session actor shutting down: channel closed");
                        break;
                    }
                },
                inbound = next_inbound(&mut self.link) => self.handle_inbound(inbound),
                _ = sleep_until_retry(retry_at) => self.retry_now().await,
            }
        }
        self.drop_link();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect { user_id, reply } => {
                let result = self.handle_connect(user_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::Disconnect { reply } => {
                let was_connected = self.link.is_some();
                self.retry_at = None;
                self.failures = 0;
                self.reconnecting = false;
                self.drop_link();
                self.set_state(ConnectionState::Disconnected);
                if was_connected {
                    log::info!("Disconnected from hub");
                    self.emit(ConnectionStatus::Disconnected);
                }
                let _ = reply.send(Disconnected { was_connected });
            }
            SessionCommand::Invoke {
                target,
                arguments,
                reply,
            } => self.handle_invoke(target, arguments, reply).await,
            SessionCommand::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
        }
    }

    async fn handle_connect(&mut self, user_id: UserId) -> Result<Connected, ConnectError> {
        if self.link.is_some() {
            if self.user_id.as_ref() == Some(&user_id) {
                log::debug!("connect({user_id}) while connected, reusing link");
                return Ok(Connected {
                    user_id,
                    generation: self.generation,
                });
            }
            log::info!(
                "Switching session user {:?} -> {}, closing current link",
                self.user_id, user_id
            );
            self.drop_link();
        }

        self.user_id = Some(user_id);
        self.retry_at = None;
        self.failures = 0;
        self.reconnecting = false;
        self.attempt().await
    }

    /// One connect attempt; schedules the next one on failure.
    async fn attempt(&mut self) -> Result<Connected, ConnectError> {
        let Some(user_id) = self.user_id.clone() else {
            return Err(ConnectError::MissingIdentity);
        };
        let phase = if self.reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        self.set_state(phase);

        let result = match tokio::time::timeout(self.connect_timeout, self.connector.connect(&user_id))
            .await
        {
            Ok(Ok(link)) => Ok(link),
            Ok(Err(e)) => Err(ConnectError::Transport(e)),
            Err(_) => Err(ConnectError::Timeout(self.connect_timeout)),
        };

        match result {
            Ok(link) => {
                self.generation += 1;
                self.link = Some(link);
                self.retry_at = None;
                self.failures = 0;
                let was_reconnecting = std::mem::replace(&mut self.reconnecting, false);
                self.set_state(ConnectionState::Connected);
                log::info!(
                    "Hub connected user={} generation={} handlers={:?}",
                    user_id,
                    self.generation,
                    self.registry.events()
                );
                self.emit(ConnectionStatus::Connected {
                    generation: self.generation,
                });
                if was_reconnecting {
                    self.emit(ConnectionStatus::Reconnected {
                        generation: self.generation,
                    });
                    self.hooks.fire_reconnected();
                }
                Ok(Connected {
                    user_id,
                    generation: self.generation,
                })
            }
            Err(e) => {
                self.schedule_retry(&e);
                Err(e)
            }
        }
    }

    fn schedule_retry(&mut self, error: &ConnectError) {
        self.failures = self.failures.saturating_add(1);
        let delay = self.retry.delay_for(self.failures);
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Disconnected);
        log::warn!(
            "Hub connect attempt {} failed: {error}; retrying in {:?}",
            self.failures, delay
        );
        self.emit(ConnectionStatus::RetryScheduled {
            attempt: self.failures,
            delay,
        });
    }

    async fn retry_now(&mut self) {
        self.retry_at = None;
        if self.reconnecting {
            self.emit(ConnectionStatus::Reconnecting {
                attempt: self.failures + 1,
            });
            self.hooks.fire_reconnecting(self.failures + 1);
        }
        // Errors are logged and rescheduled inside attempt()
        let _ = self.attempt().await;
    }

    async fn handle_invoke(&mut self, target: String, arguments: Vec<Value>, reply: InvokeReply) {
        let Some(link) = &self.link else {
            let _ = reply.send(Err(SendError::NotConnected));
            return;
        };
        self.next_invocation += 1;
        let invocation_id = self.next_invocation.to_string();
        let msg = HubMessage::invocation(Some(invocation_id.clone()), &target, arguments);
        if link.outbound.send(msg).await.is_err() {
            log::warn!("Invoke {target}: link already closed");
            let _ = reply.send(Err(SendError::ConnectionLost));
            return;
        }
        log::trace!("Invoke {target} id={invocation_id}");
        // Callers that timed out dropped their receiver
        self.pending.retain(|_, waiting| !waiting.is_closed());
        self.pending.insert(invocation_id, reply);
    }

    fn handle_inbound(&mut self, inbound: Option<HubMessage>) {
        match inbound {
            Some(HubMessage::Invocation {
                target, arguments, ..
            }) => {
                self.registry.dispatch(&target, &arguments);
            }
            Some(HubMessage::Completion {
                invocation_id,
                error,
                result,
            }) => match self.pending.remove(&invocation_id) {
                Some(reply) => {
                    let outcome = match error {
                        Some(e) => Err(SendError::Rejected(e)),
                        None => Ok(result),
                    };
                    let _ = reply.send(outcome);
                }
                None => log::debug!("completion for unknown invocation {invocation_id}"),
            },
            Some(HubMessage::Ping) => log::trace!("hub ping"),
            Some(HubMessage::Close {
                error,
                allow_reconnect,
            }) => {
                log::debug!("hub sent close (allow_reconnect={allow_reconnect})");
                self.handle_unexpected_close(error);
            }
            None => self.handle_unexpected_close(None),
        }
    }

    /// The transport dropped us: same recovery path as a failed connect.
    fn handle_unexpected_close(&mut self, error: Option<String>) {
        log::warn!(
            "Hub link closed unexpectedly: {}",
            error.as_deref().unwrap_or("transport closed")
        );
        self.drop_link();
        self.hooks.fire_unexpected_close(error.as_deref());
        self.emit(ConnectionStatus::Closed { error });
        self.reconnecting = true;
        self.failures = 0;
        // Reconnect right away; the retry branch of the run loop picks this up.
        self.retry_at = Some(Instant::now());
        self.set_state(ConnectionState::Reconnecting);
    }

    /// Release the link and fail every invocation still waiting on it.
    fn drop_link(&mut self) {
        self.link = None;
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(SendError::ConnectionLost));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn emit(&self, status: ConnectionStatus) {
        // No subscribers is fine
        let _ = self.status_tx.send(status);
    }
}
