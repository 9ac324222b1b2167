//! Connection lifecycle types.
//!
//! Provides [`ConnectionState`] (the session state machine position),
//! [`ConnectionStatus`] (lifecycle events on a broadcast channel, for any
//! number of observers) and [`LifecycleHooks`] (single-slot callbacks for
//! unexpected close / reconnecting / reconnected).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Where the session is in its lifecycle.
///
/// ```text
/// Disconnected --connect()--> Connecting --ok--> Connected
/// Connecting --fail--> Disconnected (retry scheduled)
/// Connected --unexpected close--> Reconnecting --ok--> Connected
/// Reconnecting --fail--> Disconnected (retry scheduled)
/// Connected --disconnect()--> Disconnected (no retry)
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Connection lifecycle events.
///
/// Subscribe via [`ConnectionManager::subscribe_status()`](crate::ConnectionManager::subscribe_status).
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionStatus {
    /// A link is up. `generation` increases with every new link.
    Connected { generation: u64 },
    /// The caller disconnected.
    Disconnected,
    /// The transport went away without being asked to.
    Closed { error: Option<String> },
    /// About to try restoring a lost link.
    Reconnecting { attempt: u32 },
    /// A lost link was restored.
    Reconnected { generation: u64 },
    /// An attempt failed; another one follows after `delay`.
    RetryScheduled { attempt: u32, delay: Duration },
}

type CloseHook = Arc<dyn Fn(Option<&str>) + Send + Sync>;
type ReconnectingHook = Arc<dyn Fn(u32) + Send + Sync>;
type ReconnectedHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    unexpected_close: Option<CloseHook>,
    reconnecting: Option<ReconnectingHook>,
    reconnected: Option<ReconnectedHook>,
}

/// Pass-through lifecycle callbacks. Setting a hook replaces the previous one.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    inner: Arc<Mutex<Hooks>>,
}

impl LifecycleHooks {
    pub fn set_unexpected_close<F>(&self, f: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.inner.lock().unexpected_close = Some(Arc::new(f));
    }

    pub fn set_reconnecting<F>(&self, f: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.inner.lock().reconnecting = Some(Arc::new(f));
    }

    pub fn set_reconnected<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().reconnected = Some(Arc::new(f));
    }

    pub(crate) fn fire_unexpected_close(&self, error: Option<&str>) {
        let hook = self.inner.lock().unexpected_close.clone();
        if let Some(hook) = hook {
            hook(error);
        }
    }

    pub(crate) fn fire_reconnecting(&self, attempt: u32) {
        let hook = self.inner.lock().reconnecting.clone();
        if let Some(hook) = hook {
            hook(attempt);
        }
    }

    pub(crate) fn fire_reconnected(&self) {
        let hook = self.inner.lock().reconnected.clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}
