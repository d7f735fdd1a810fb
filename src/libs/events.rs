//! Process-wide lifecycle event bus.
//!
//! A bounded synchronous publish/subscribe channel. Listeners are invoked on
//! the publishing thread in registration order and must not block; a listener
//! panic is caught and logged without affecting the producer or the other
//! listeners. A bounded history ring keeps the most recent events for
//! diagnostics.

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Default number of events retained in the history ring.
pub const DEFAULT_HISTORY: usize = 256;

/// Lifecycle event kinds emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    KnowledgeCreated,
    KnowledgeUpdated,
    KnowledgeDeleted,
    TransactionStarted,
    TransactionCommitted,
    TransactionRolledBack,
    TransactionTimeout,
    CacheCleared,
    BackupCompleted,
}

/// A single lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// Primary entity key (task path, knowledge id, transaction id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Structured event payload.
    pub payload: serde_json::Value,
    /// Emission time in milliseconds since epoch.
    pub at_ms: i64,
}

impl Event {
    pub fn new(kind: EventKind, key: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            key,
            payload,
            at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Listener callback. Runs on the publishing thread; must be non-blocking.
pub type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct BusInner {
    subscribers: Vec<(u64, Listener)>,
    next_id: u64,
    history: VecDeque<Event>,
    capacity: usize,
    published: u64,
}

/// Bounded synchronous publish/subscribe bus.
pub struct EventBus {
    inner: RwLock<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(BusInner {
                subscribers: Vec::new(),
                next_id: 1,
                history: VecDeque::with_capacity(history_capacity.min(1024)),
                capacity: history_capacity,
                published: 0,
            }),
        }
    }

    /// Registers a listener; returns a handle for [`unsubscribe`].
    ///
    /// [`unsubscribe`]: EventBus::unsubscribe
    pub fn subscribe(&self, listener: Listener) -> SubscriberId {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, listener));
        SubscriberId(id)
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.write();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id.0);
        inner.subscribers.len() != before
    }

    /// Dispatches the event synchronously to all listeners, then records it
    /// in the history ring. A panicking listener is logged and skipped.
    pub fn publish(&self, event: Event) {
        {
            let inner = self.inner.read();
            for (id, listener) in inner.subscribers.iter() {
                if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                    tracing::warn!(subscriber = id, kind = ?event.kind, "event listener panicked");
                }
            }
        }

        let mut inner = self.inner.write();
        inner.published += 1;
        if inner.history.len() >= inner.capacity && inner.capacity > 0 {
            inner.history.pop_front();
        }
        if inner.capacity > 0 {
            inner.history.push_back(event);
        }
    }

    /// Most recent events, newest last, at most `n`.
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let inner = self.inner.read();
        inner.history.iter().rev().take(n).rev().cloned().collect()
    }

    /// Total number of events published since construction.
    pub fn published(&self) -> u64 {
        self.inner.read().published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn publish_reaches_subscribers_in_order() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_a = seen.clone();
        bus.subscribe(Box::new(move |_| {
            seen_a.fetch_add(1, Ordering::SeqCst);
        }));
        let seen_b = seen.clone();
        bus.subscribe(Box::new(move |_| {
            seen_b.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(Event::new(EventKind::TaskCreated, Some("a/b".into()), serde_json::json!({})));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(bus.recent(10).len(), 1);
    }

    #[test]
    fn panicking_listener_does_not_poison_bus() {
        let bus = EventBus::default();
        bus.subscribe(Box::new(|_| panic!("boom")));
        let ok = Arc::new(AtomicUsize::new(0));
        let ok_clone = ok.clone();
        bus.subscribe(Box::new(move |_| {
            ok_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(Event::new(EventKind::TaskDeleted, None, serde_json::json!({})));
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn history_is_bounded() {
        let bus = EventBus::new(2);
        for i in 0..5 {
            bus.publish(Event::new(EventKind::TaskUpdated, Some(format!("t{i}")), serde_json::json!({})));
        }
        let recent = bus.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].key.as_deref(), Some("t4"));
        assert_eq!(bus.published(), 5);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let id = bus.subscribe(Box::new(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(Event::new(EventKind::TaskCreated, None, serde_json::json!({})));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
