//! Event bus for merge workflow events
//!
//! Handlers are plain closures registered per [`EventKind`] (or for every
//! event with [`EventBus::on_any`]). Dispatch is synchronous, in the
//! emitter's context, in registration order.
//!
//! # Example
//!
//! ```rust
//! use appmerge_core::bus::{EventBus, EventKind, MergeEvent};
//!
//! let bus = EventBus::new();
//! let id = bus.on(EventKind::LockExpired, |event| {
//!     println!("{}: {:?}", event.name(), event);
//! });
//!
//! bus.emit(MergeEvent::LockExpired { app_id: 42 });
//! bus.off(EventKind::LockExpired, Some(id));
//! ```

pub mod events;

pub use events::{EventKind, MergeEvent};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::error;

/// Event handler
pub type Handler = Arc<dyn Fn(&MergeEvent) + Send + Sync>;

/// Handle returned on registration, used to unsubscribe one handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// `None` is the catch-all topic used by [`EventBus::on_any`]
type Topic = Option<EventKind>;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    topics: RwLock<HashMap<Topic, Vec<Subscription>>>,
}

/// In-process publish/subscribe hub
///
/// Cloning is cheap; every clone shares the same handler table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&MergeEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler), false)
    }

    /// Register a handler that is removed before its first invocation
    pub fn once<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&MergeEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler), true)
    }

    /// Register a handler for every event
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&MergeEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler), false)
    }

    /// Remove one handler, or every handler of `kind` when `id` is `None`
    ///
    /// Returns how many handlers were removed.
    pub fn off(&self, kind: EventKind, id: Option<SubscriptionId>) -> usize {
        self.remove(Some(kind), id)
    }

    /// Remove a handler registered with [`EventBus::on_any`]
    pub fn off_any(&self, id: SubscriptionId) -> bool {
        self.remove(None, Some(id)) > 0
    }

    /// Deliver an event to a snapshot of the current handlers
    ///
    /// A panicking handler is logged and skipped; the remaining handlers
    /// still run and `emit` itself never panics.
    pub fn emit(&self, event: MergeEvent) {
        let kind = event.kind();
        let snapshot: Vec<(Topic, Subscription)> = {
            let topics = self.read();
            [Some(kind), None]
                .into_iter()
                .flat_map(|topic| {
                    topics
                        .get(&topic)
                        .into_iter()
                        .flatten()
                        .map(move |sub| (topic, sub.clone()))
                })
                .collect()
        };

        for (topic, subscription) in snapshot {
            // Claim once-handlers before running them so concurrent emits cannot both fire
            if subscription.once && self.remove(topic, Some(subscription.id)) == 0 {
                continue;
            }

            let handler = &subscription.handler;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                error!(
                    event = kind.as_str(),
                    "Event handler panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    /// Number of handlers registered for `kind` (catch-all handlers excluded)
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.read().get(&Some(kind)).map_or(0, Vec::len)
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.write().clear();
    }

    fn register(&self, topic: Topic, handler: Handler, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.write()
            .entry(topic)
            .or_default()
            .push(Subscription { id, handler, once });
        id
    }

    fn remove(&self, topic: Topic, id: Option<SubscriptionId>) -> usize {
        let mut topics = self.write();
        let Some(subscriptions) = topics.get_mut(&topic) else {
            return 0;
        };

        let before = subscriptions.len();
        match id {
            Some(id) => subscriptions.retain(|sub| sub.id != id),
            None => subscriptions.clear(),
        }
        let removed = before - subscriptions.len();

        if subscriptions.is_empty() {
            topics.remove(&topic);
        }
        removed
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Topic, Vec<Subscription>>> {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Topic, Vec<Subscription>>> {
        self.inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.read();
        let handlers: usize = topics.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("topics", &topics.len())
            .field("handlers", &handlers)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn expired(app_id: u64) -> MergeEvent {
        MergeEvent::LockExpired { app_id }
    }

    fn recorder(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<MergeEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[test]
    fn test_emit_reaches_matching_handlers_only() {
        let bus = EventBus::new();
        let expired_seen = recorder(&bus, EventKind::LockExpired);
        let released_seen = recorder(&bus, EventKind::LockReleased);

        bus.emit(expired(1));

        assert_eq!(*expired_seen.lock().unwrap(), vec![expired(1)]);
        assert!(released_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(EventKind::LockExpired, move |_| order.lock().unwrap().push(label));
        }

        bus.emit(expired(1));

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_once_runs_a_single_time() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        bus.once(EventKind::LockExpired, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(expired(1));
        bus.emit(expired(1));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::LockExpired), 0);
    }

    #[test]
    fn test_off_by_id_and_by_kind() {
        let bus = EventBus::new();
        let first = bus.on(EventKind::LockExpired, |_| {});
        bus.on(EventKind::LockExpired, |_| {});
        bus.on(EventKind::LockExpired, |_| {});

        assert_eq!(bus.off(EventKind::LockExpired, Some(first)), 1);
        assert_eq!(bus.off(EventKind::LockExpired, Some(first)), 0);
        assert_eq!(bus.listener_count(EventKind::LockExpired), 2);

        assert_eq!(bus.off(EventKind::LockExpired, None), 2);
        assert_eq!(bus.listener_count(EventKind::LockExpired), 0);
        assert_eq!(bus.off(EventKind::LockReleased, None), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_siblings() {
        let bus = EventBus::new();
        bus.on(EventKind::LockExpired, |_| panic!("handler failure"));
        let seen = recorder(&bus, EventKind::LockExpired);

        bus.emit(expired(7));

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_during_emit_uses_snapshot() {
        let bus = EventBus::new();
        let later_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        let bus_handle = bus.clone();
        let target = Arc::clone(&later_id);
        bus.on(EventKind::LockExpired, move |_| {
            if let Some(id) = *target.lock().unwrap() {
                bus_handle.off(EventKind::LockExpired, Some(id));
            }
        });
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.on(EventKind::LockExpired, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        *later_id.lock().unwrap() = Some(id);

        // The second handler was removed mid-dispatch but still sees this event
        bus.emit(expired(1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        bus.emit(expired(1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_during_emit_waits_for_next_event() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU64::new(0));

        let bus_handle = bus.clone();
        let counter = Arc::clone(&seen);
        bus.once(EventKind::LockExpired, move |_| {
            let counter = Arc::clone(&counter);
            bus_handle.on(EventKind::LockExpired, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        bus.emit(expired(1));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        bus.emit(expired(1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_any_sees_every_event() {
        let bus = EventBus::new();
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&names);
        let id = bus.on_any(move |event| sink.lock().unwrap().push(event.name()));

        bus.emit(expired(1));
        bus.emit(MergeEvent::LockReleased {
            source_id: 1,
            destination_id: 2,
        });
        assert!(bus.off_any(id));
        bus.emit(expired(1));

        assert_eq!(*names.lock().unwrap(), vec!["lock:expired", "lock:released"]);
    }

    #[test]
    fn test_clones_share_handlers() {
        let bus = EventBus::new();
        let seen = recorder(&bus, EventKind::LockExpired);

        bus.clone().emit(expired(3));

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(format!("{bus:?}").contains("handlers: 1"));
    }
}
