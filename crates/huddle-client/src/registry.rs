//! Inbound event dispatch.
//!
//! The registry maps a hub event name to at most one callback. Registering a
//! second callback for the same name replaces the first; only the latest
//! registrant sees later events.
//!
//! `register` hands back a [`HandlerToken`]. `unregister(token)` removes the
//! callback only while that token is still current, so a view that closes
//! late cannot knock out the handler a newer view installed.
//!
//! The registry is independent of any transport. Registrations made while
//! disconnected are simply live once a link delivers events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

/// Callback invoked with the raw hub arguments of an event.
pub type EventCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Receipt for one registration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandlerToken {
    event: String,
    serial: u64,
}

impl HandlerToken {
    pub fn event(&self) -> &str {
        &self.event
    }
}

struct Slot {
    serial: u64,
    callback: EventCallback,
}

/// Single-slot-per-event callback table. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    next_serial: Arc<AtomicU64>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `callback` for `event`, replacing any previous one.
    pub fn register<F>(&self, event: &str, callback: F) -> HandlerToken
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.slots.lock().insert(
            event.to_string(),
            Slot {
                serial,
                callback: Arc::new(callback),
            },
        );
        if previous.is_some() {
            log::debug!("handler for {event} replaced");
        }
        HandlerToken {
            event: event.to_string(),
            serial,
        }
    }

    /// Remove the registration behind `token` if it is still the current one.
    ///
    /// Returns `false` when a newer registration has taken the slot.
    pub fn unregister(&self, token: &HandlerToken) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&token.event) {
            Some(slot) if slot.serial == token.serial => {
                slots.remove(&token.event);
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, event: &str) -> bool {
        self.slots.lock().contains_key(event)
    }

    /// Names with a live callback, sorted.
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke the current callback for `event` on the calling task.
    ///
    /// Returns `false` when nothing is registered; the event is dropped.
    pub fn dispatch(&self, event: &str, args: &[Value]) -> bool {
        // Clone out of the lock so a callback may (re)register handlers.
        let callback = self.slots.lock().get(event).map(|slot| slot.callback.clone());
        match callback {
            Some(callback) => {
                callback(args);
                true
            }
            None => {
                log::debug!("no handler for {event}, dropping event ({} args)", args.len());
                false
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("events", &self.events())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&[Value]) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move |_: &[Value]| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_latest_registration_wins() {
        let registry = HandlerRegistry::new();
        let (first, cb1) = counter();
        let (second, cb2) = counter();
        registry.register("ReceiveMessage", cb1);
        registry.register("ReceiveMessage", cb2);

        assert!(registry.dispatch("ReceiveMessage", &[json!(1)]));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(registry.events(), vec!["ReceiveMessage".to_string()]);
    }

    #[test]
    fn test_unregistered_event_is_dropped() {
        let registry = HandlerRegistry::new();
        assert!(!registry.dispatch("ReceiveNotification", &[json!("x")]));
    }

    #[test]
    fn test_stale_token_does_not_remove_newer_handler() {
        let registry = HandlerRegistry::new();
        let (_, cb1) = counter();
        let (hits, cb2) = counter();
        let old = registry.register("ReceiveMessage", cb1);
        let new = registry.register("ReceiveMessage", cb2);

        assert!(!registry.unregister(&old));
        assert!(registry.dispatch("ReceiveMessage", &[]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.unregister(&new));
        assert!(!registry.is_registered("ReceiveMessage"));
    }

    #[test]
    fn test_dispatch_preserves_order() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        registry.register("ReceiveNotification", move |args: &[Value]| {
            s.lock().push(args[0].as_i64().unwrap());
        });
        for i in 0..20 {
            registry.dispatch("ReceiveNotification", &[json!(i)]);
        }
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_callback_may_reregister() {
        let registry = HandlerRegistry::new();
        let inner = registry.clone();
        registry.register("Once", move |_: &[Value]| {
            inner.register("Once", |_: &[Value]| {});
        });
        assert!(registry.dispatch("Once", &[]));
        assert!(registry.is_registered("Once"));
    }
}
