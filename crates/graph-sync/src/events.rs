//! Event infrastructure for graph-sync.
//!
//! Provides a generic `EventBus` with drop-to-unsubscribe `Subscription`s, and
//! `SyncEvent`, the session-level events emitted while mutations are persisted,
//! promoted and replayed.

use crate::connectivity::TransportStatus;
use crate::ids::{CanonicalId, EphemeralId, RoomId};
use crate::model::EntityKind;
use crate::session::SessionState;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Session-level events for monitoring and UI status indicators.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Network reachability or transport status changed.
    ConnectivityChanged {
        online: bool,
        #[serde(rename = "networkReachable")]
        network_reachable: bool,
        transport: TransportStatus,
        /// Milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// An entity received its canonical id from the persisted store.
    EntityPromoted {
        kind: EntityKind,
        #[serde(rename = "ephemeralId")]
        ephemeral_id: EphemeralId,
        #[serde(rename = "canonicalId")]
        canonical_id: CanonicalId,
        timestamp: f64,
    },
    /// A pass over the offline queue finished.
    QueueDrained {
        processed: usize,
        promoted: usize,
        retained: usize,
        dropped: usize,
        timestamp: f64,
    },
    /// The session moved through its lifecycle.
    SessionStateChanged {
        #[serde(rename = "roomId")]
        room_id: Option<RoomId>,
        state: SessionState,
        timestamp: f64,
    },
    /// A background persistence call failed and was not surfaced to the caller.
    PersistenceFailed {
        operation: String,
        #[serde(rename = "entityId")]
        entity_id: String,
        error: String,
        /// Whether the mutation was put back on the offline queue.
        requeued: bool,
        timestamp: f64,
    },
}

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn timestamp() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: usize);
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<dyn Unsubscribe>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Thread-safe. Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Send + Sync + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        let bus: Weak<dyn Unsubscribe> = Arc::downgrade(self) as Weak<dyn Unsubscribe>;
        Subscription { bus, id }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<E: Send + Sync + 'static> Unsubscribe for EventBus<E> {
    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drained() -> SyncEvent {
        SyncEvent::QueueDrained {
            processed: 1,
            promoted: 1,
            retained: 0,
            dropped: 0,
            timestamp: 1000.0,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event: &SyncEvent| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(drained());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count_clone = Arc::clone(&count);
            let _sub = bus.subscribe(move |_event: &SyncEvent| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(drained());
        }

        bus.emit(drained());
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus: Arc<EventBus<SyncEvent>> = Arc::new(EventBus::new());
        let sub = bus.subscribe(|_| {});
        drop(bus);
        drop(sub);
    }

    #[test]
    fn test_callback_may_subscribe_during_emit() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        let held = Arc::new(std::sync::Mutex::new(Vec::new()));
        let held_clone = Arc::clone(&held);

        let _sub = bus.subscribe(move |_| {
            let sub = inner.subscribe(|_| {});
            held_clone.lock().unwrap().push(sub);
        });

        bus.emit(1);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_sync_event_serialization() {
        let event = SyncEvent::PersistenceFailed {
            operation: "updateNode".into(),
            entity_id: "n-1".into(),
            error: "Transport error: connection refused".into(),
            requeued: true,
            timestamp: 1234567890.0,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"persistenceFailed\""));
        assert!(json.contains("\"entityId\":\"n-1\""));
        assert!(json.contains("\"requeued\":true"));
    }
}
