//! SessionManager: owns the lifecycle of the single active room session.
//!
//! `initialize` builds a fresh document, wires its observers, loads the local
//! cache, joins the realtime transport, reloads the offline queue and seeds
//! the document from the store's snapshot. Three background tasks then run
//! until `cleanup`:
//!
//! - forwarder: transport status -> connectivity monitor (requesting a drain
//!   on reconnect), remote updates -> document
//! - drainer: drains the offline queue whenever the coordinator asks, retrying
//!   with backoff while the store stays unreachable
//! - publisher: local document changes -> transport at once, local cache at
//!   most every [`CACHE_SAVE_DELAY`]
//!
//! Cleanup stops all three before closing the session's queue, so nothing
//! from an old session writes the queue blob after a new one loaded it.

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, Transition, TransportStatus};
use crate::coordinator::{DrainReport, MutationCoordinator};
use crate::document::{ChangeOrigin, DocumentError, GraphDocument};
use crate::events::{EventBus, Subscription, SyncEvent, timestamp};
use crate::gateway::{Gateway, GatewayError};
use crate::ids::RoomId;
use crate::offline_queue::{OfflineQueue, QueueError};
use crate::projection::GraphProjection;
use crate::providers::{DocumentCache, RealtimeTransport, TransportError, TransportEvent};
use crate::reconcile;
use crate::storage::{BlobStore, StoreError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long local changes accumulate before the cache is rewritten.
pub const CACHE_SAVE_DELAY: Duration = Duration::from_millis(200);

const DRAIN_RETRY_INITIAL: Duration = Duration::from_secs(1);
const DRAIN_RETRY_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Active,
    Terminating,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active session")]
    NotActive,

    #[error("Failed to load offline queue: {0}")]
    Queue(#[from] QueueError),

    #[error("Failed to load document cache: {0}")]
    Cache(#[from] StoreError),

    #[error("Failed to fetch initial snapshot: {0}")]
    Snapshot(GatewayError),

    #[error("Snapshot is for room {actual}, expected {expected}")]
    SnapshotRoomMismatch { expected: RoomId, actual: RoomId },

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything owned by an active session. Dropped wholesale on cleanup.
struct ActiveSession {
    room: RoomId,
    doc: Arc<GraphDocument>,
    coordinator: Arc<MutationCoordinator>,
    connectivity: Arc<ConnectivityMonitor>,
    projection: Arc<GraphProjection>,
    cache: Arc<DocumentCache>,
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
}

pub struct SessionManager {
    gateway: Arc<dyn Gateway>,
    transport: Arc<dyn RealtimeTransport>,
    store: Arc<dyn BlobStore>,
    config: SyncConfig,
    events: Arc<EventBus<SyncEvent>>,
    state: Mutex<(SessionState, Option<RoomId>)>,
    network_reachable: AtomicBool,
    active: AsyncMutex<Option<ActiveSession>>,
    /// Serializes initialize and cleanup
    lifecycle: AsyncMutex<()>,
}

impl SessionManager {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        transport: Arc<dyn RealtimeTransport>,
        store: Arc<dyn BlobStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            gateway,
            transport,
            store,
            config,
            events: Arc::new(EventBus::new()),
            state: Mutex::new((SessionState::Uninitialized, None)),
            network_reachable: AtomicBool::new(true),
            active: AsyncMutex::new(None),
            lifecycle: AsyncMutex::new(()),
        }
    }

    /// Session-level events for every session this manager runs.
    pub fn events(&self) -> &Arc<EventBus<SyncEvent>> {
        &self.events
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    pub fn room(&self) -> Option<RoomId> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).1.clone()
    }

    /// Start a session for `room`, tearing down any previous one.
    ///
    /// On failure the manager is back in `Uninitialized` and the error is
    /// returned.
    pub async fn initialize(&self, room: RoomId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;

        info!("Initializing session for room {}", room);
        self.set_state(SessionState::Initializing, Some(room.clone()));

        match self.build(room.clone()).await {
            Ok(active) => {
                *self.active.lock().await = Some(active);
                self.set_state(SessionState::Active, Some(room.clone()));
                info!("Session active for room {}", room);
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize session for room {}: {}", room, e);
                self.transport.disconnect().await;
                self.set_state(SessionState::Uninitialized, None);
                Err(e)
            }
        }
    }

    /// Release the active session. Safe to call any number of times.
    pub async fn cleanup(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
    }

    pub async fn coordinator(&self) -> Option<Arc<MutationCoordinator>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.coordinator))
    }

    pub async fn projection(&self) -> Option<Arc<GraphProjection>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.projection))
    }

    pub async fn document(&self) -> Option<Arc<GraphDocument>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.doc))
    }

    pub async fn connectivity(&self) -> Option<Arc<ConnectivityMonitor>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.connectivity))
    }

    /// Record network reachability. Going online drains the offline queue
    /// before returning.
    pub async fn set_network_reachable(&self, reachable: bool) -> Option<DrainReport> {
        self.network_reachable.store(reachable, Ordering::SeqCst);
        let (connectivity, coordinator) = {
            let active = self.active.lock().await;
            let active = active.as_ref()?;
            (Arc::clone(&active.connectivity), Arc::clone(&active.coordinator))
        };
        match connectivity.set_network_reachable(reachable) {
            Some(Transition::WentOnline) => Some(coordinator.drain().await),
            _ => None,
        }
    }

    /// Drain the offline queue now.
    pub async fn drain(&self) -> Result<DrainReport> {
        let coordinator = self.coordinator().await.ok_or(SessionError::NotActive)?;
        Ok(coordinator.drain().await)
    }

    async fn build(&self, room: RoomId) -> Result<ActiveSession> {
        let doc = Arc::new(GraphDocument::new());
        let projection = Arc::new(GraphProjection::new());
        let connectivity = Arc::new(
            ConnectivityMonitor::new(self.network_reachable.load(Ordering::SeqCst))
                .with_events(Arc::clone(&self.events)),
        );
        let local_changes = Arc::new(Notify::new());

        let observer = {
            let projection = Arc::clone(&projection);
            let local_changes = Arc::clone(&local_changes);
            let doc_ref = Arc::downgrade(&doc);
            doc.observe(move |event| {
                projection.apply(event);
                match event.origin {
                    ChangeOrigin::Local => local_changes.notify_one(),
                    ChangeOrigin::Remote => {
                        if let Some(doc) = doc_ref.upgrade() {
                            if let Err(e) = doc.prune_dangling_edges() {
                                warn!("Failed to prune dangling edges: {}", e);
                            }
                        }
                    }
                }
            })
        };

        let cache = Arc::new(DocumentCache::new(&room, Arc::clone(&self.store)));
        if cache.load_into(&doc).await? {
            debug!("Loaded cached document for room {}", room);
        }

        let queue = Arc::new(
            OfflineQueue::load(room.clone(), Arc::clone(&self.store), self.config.queue_capacity)
                .await?,
        );
        let coordinator = Arc::new(MutationCoordinator::new(
            room.clone(),
            Arc::clone(&doc),
            Arc::clone(&self.gateway),
            queue,
            Arc::clone(&connectivity),
            Arc::clone(&self.events),
            self.config.clone(),
        ));

        match self.gateway.room_snapshot(&room).await {
            Ok(snapshot) => {
                if snapshot.room.id != room {
                    return Err(SessionError::SnapshotRoomMismatch {
                        expected: room,
                        actual: snapshot.room.id,
                    });
                }
                let touched = reconcile::seed_from_snapshot(&doc, &snapshot)?;
                debug!(
                    "Seeded room {} from snapshot ({} nodes, {} edges, {} entries changed)",
                    room,
                    snapshot.nodes.len(),
                    snapshot.edges.len(),
                    touched
                );
            }
            Err(e) if e.is_transport() && !self.config.require_initial_snapshot => {
                warn!("Store unreachable, starting room {} from local state: {}", room, e);
            }
            Err(e) => return Err(SessionError::Snapshot(e)),
        }

        let transport_events = self.transport.connect(&room).await?;

        let forwarder = tokio::spawn(forward_transport_events(
            transport_events,
            Arc::clone(&doc),
            Arc::clone(&connectivity),
            Arc::clone(&coordinator),
            Arc::clone(&self.transport),
        ));
        let drainer = tokio::spawn(run_drains(Arc::clone(&coordinator)));
        let publisher = tokio::spawn(publish_local_changes(
            local_changes,
            Arc::clone(&doc),
            Arc::clone(&cache),
            Arc::clone(&self.transport),
        ));

        Ok(ActiveSession {
            room,
            doc,
            coordinator,
            connectivity,
            projection,
            cache,
            tasks: vec![forwarder, drainer, publisher],
            subscriptions: vec![observer],
        })
    }

    async fn teardown(&self) {
        let Some(active) = self.active.lock().await.take() else {
            if self.state() != SessionState::Uninitialized {
                self.set_state(SessionState::Uninitialized, None);
            }
            return;
        };

        info!("Terminating session for room {}", active.room);
        self.set_state(SessionState::Terminating, Some(active.room.clone()));

        let ActiveSession {
            room,
            doc,
            coordinator,
            projection,
            cache,
            tasks,
            subscriptions,
            ..
        } = active;

        drop(subscriptions);
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        // Waits out a drain pass still running on a caller's task.
        coordinator.queue().close().await;
        self.transport.disconnect().await;

        if let Err(e) = cache.save(&doc).await {
            warn!("Failed to save document cache for room {}: {}", room, e);
        }
        projection.clear();

        self.set_state(SessionState::Uninitialized, None);
    }

    fn set_state(&self, state: SessionState, room: Option<RoomId>) {
        {
            let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *current = (state, room.clone());
        }
        debug!("Session state: {:?}", state);
        self.events.emit(SyncEvent::SessionStateChanged {
            room_id: room,
            state,
            timestamp: timestamp(),
        });
    }
}

async fn forward_transport_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    doc: Arc<GraphDocument>,
    connectivity: Arc<ConnectivityMonitor>,
    coordinator: Arc<MutationCoordinator>,
    transport: Arc<dyn RealtimeTransport>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Status(status) => {
                if status == TransportStatus::Connected {
                    // Peers may have missed updates while we were away.
                    match doc.export_snapshot() {
                        Ok(snapshot) => {
                            if let Err(e) = transport.publish(snapshot).await {
                                debug!("Failed to publish snapshot on connect: {}", e);
                            }
                        }
                        Err(e) => warn!("Failed to export snapshot: {}", e),
                    }
                }
                if connectivity.set_transport_status(status) == Some(Transition::WentOnline) {
                    coordinator.request_drain();
                }
            }
            TransportEvent::Update(update) => {
                if let Err(e) = doc.import(&update) {
                    warn!("Failed to import remote update: {}", e);
                }
            }
        }
    }
    debug!("Transport event stream closed");
}

/// Drain the queue on every request. A pass that leaves work behind is
/// retried with exponential backoff.
async fn run_drains(coordinator: Arc<MutationCoordinator>) {
    let mut delay = DRAIN_RETRY_INITIAL;
    loop {
        coordinator.drain_requested().await;
        let report = coordinator.drain().await;
        if report.retained == 0 {
            delay = DRAIN_RETRY_INITIAL;
            continue;
        }
        debug!("{} operations still queued, retrying drain in {:?}", report.retained, delay);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(DRAIN_RETRY_MAX);
        coordinator.request_drain();
    }
}

/// Publish each local change right away. The cache is a full snapshot, so
/// saves are coalesced: one per burst of changes, [`CACHE_SAVE_DELAY`] after
/// its first change. Cleanup saves whatever is left.
async fn publish_local_changes(
    local_changes: Arc<Notify>,
    doc: Arc<GraphDocument>,
    cache: Arc<DocumentCache>,
    transport: Arc<dyn RealtimeTransport>,
) {
    let mut save_at: Option<Instant> = None;
    loop {
        let deadline = save_at.unwrap_or_else(Instant::now);
        tokio::select! {
            _ = local_changes.notified() => {
                match doc.take_pending_update() {
                    Ok(Some(update)) => {
                        if let Err(e) = transport.publish(update).await {
                            debug!("Update not published: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to export pending update: {}", e),
                }
                save_at.get_or_insert_with(|| Instant::now() + CACHE_SAVE_DELAY);
            }
            _ = tokio::time::sleep_until(deadline), if save_at.is_some() => {
                save_at = None;
                if let Err(e) = cache.save(&doc).await {
                    warn!("Failed to save document cache: {}", e);
                }
            }
        }
    }
}
