//! Connectivity monitor.
//!
//! Tracks two independent signals: whether the network is reachable, and the
//! status of the realtime transport. The session is online only when both say
//! so. Online/offline transitions are reported to the caller (which drains the
//! offline queue on `WentOnline`), to `watch` subscribers and to the event bus.
//! Going offline only updates state; in-flight requests are left to fail on
//! their own.

use crate::events::{EventBus, SyncEvent, timestamp};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

/// Status of the realtime transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

/// An online/offline edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub network_reachable: bool,
    pub transport: TransportStatus,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        self.network_reachable && self.transport == TransportStatus::Connected
    }
}

pub struct ConnectivityMonitor {
    state: Mutex<ConnectivityState>,
    online_tx: watch::Sender<bool>,
    events: Option<Arc<EventBus<SyncEvent>>>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the transport disconnected.
    pub fn new(network_reachable: bool) -> Self {
        let (online_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(ConnectivityState {
                network_reachable,
                transport: TransportStatus::Disconnected,
            }),
            online_tx,
            events: None,
        }
    }

    /// Also report changes as `SyncEvent::ConnectivityChanged`.
    pub fn with_events(mut self, events: Arc<EventBus<SyncEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Receiver that observes the online flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    pub fn set_network_reachable(&self, reachable: bool) -> Option<Transition> {
        self.update(|state| state.network_reachable = reachable)
    }

    pub fn set_transport_status(&self, status: TransportStatus) -> Option<Transition> {
        self.update(|state| state.transport = status)
    }

    fn update(&self, change: impl FnOnce(&mut ConnectivityState)) -> Option<Transition> {
        let (before, after) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let before = *state;
            change(&mut state);
            (before, *state)
        };

        if before == after {
            return None;
        }

        debug!(
            "Connectivity: network={} transport={:?}",
            after.network_reachable, after.transport
        );

        if let Some(events) = &self.events {
            events.emit(SyncEvent::ConnectivityChanged {
                online: after.is_online(),
                network_reachable: after.network_reachable,
                transport: after.transport,
                timestamp: timestamp(),
            });
        }

        let transition = match (before.is_online(), after.is_online()) {
            (false, true) => Some(Transition::WentOnline),
            (true, false) => Some(Transition::WentOffline),
            _ => None,
        };

        if let Some(transition) = transition {
            info!("Connectivity transition: {:?}", transition);
            self.online_tx.send_replace(after.is_online());
        }

        transition
    }
}
