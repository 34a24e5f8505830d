//! Durable FIFO log of mutations awaiting persistence.
//!
//! The full queue is rewritten to the blob store on every change, under
//! `offline/<room>.json`, so pending work survives a restart.
//!
//! Draining works on a snapshot taken under an exclusive drain lock. Entries
//! stay in the queue until the drain pass finishes, and anything enqueued
//! while the pass runs is kept behind whatever the pass retains.
//!
//! A full queue rejects new operations; what is already queued is never
//! evicted.

use crate::ids::{EntityId, RoomId};
use crate::model::{Edge, EdgePatch, Node, NodePatch};
use crate::reconcile::{self, IdMap};
use crate::storage::{self, BlobStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Offline queue is full ({0} operations)")]
    Full(usize),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Corrupt offline queue: {0}")]
    Corrupt(String),

    #[error("Offline queue is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A mutation that could not be persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Mutation {
    /// Carries the ephemeral node as it was created locally.
    CreateNode { node: Node },
    UpdateNode { id: EntityId, patch: NodePatch },
    DeleteNode { id: EntityId },
    /// Carries the ephemeral edge; endpoints may be ephemeral too.
    CreateEdge { edge: Edge },
    UpdateEdge { id: EntityId, patch: EdgePatch },
    DeleteEdge { id: EntityId },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateNode { .. } => "create-node",
            Self::UpdateNode { .. } => "update-node",
            Self::DeleteNode { .. } => "delete-node",
            Self::CreateEdge { .. } => "create-edge",
            Self::UpdateEdge { .. } => "update-edge",
            Self::DeleteEdge { .. } => "delete-edge",
        }
    }

    /// Id of the entity the mutation targets.
    pub fn target(&self) -> &EntityId {
        match self {
            Self::CreateNode { node } => &node.id,
            Self::CreateEdge { edge } => &edge.id,
            Self::UpdateNode { id, .. }
            | Self::DeleteNode { id }
            | Self::UpdateEdge { id, .. }
            | Self::DeleteEdge { id } => id,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, Self::CreateNode { .. } | Self::CreateEdge { .. })
    }

    /// The target plus, for edge creates, both endpoints.
    pub fn entities(&self) -> Vec<&EntityId> {
        match self {
            Self::CreateEdge { edge } => vec![&edge.id, &edge.source_id, &edge.target_id],
            other => vec![other.target()],
        }
    }
}

impl Display for Mutation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.target())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineOperation {
    pub id: Uuid,
    pub room_id: RoomId,
    pub timestamp: DateTime<Utc>,
    pub mutation: Mutation,
}

/// Operations claimed by a drain pass. Holds the drain lock until passed to
/// `OfflineQueue::finish_drain` or dropped.
pub struct DrainBatch {
    pub operations: Vec<OfflineOperation>,
    _guard: OwnedMutexGuard<()>,
}

pub struct OfflineQueue {
    room: RoomId,
    store: Arc<dyn BlobStore>,
    key: String,
    capacity: usize,
    entries: Mutex<VecDeque<OfflineOperation>>,
    drain_lock: Arc<Mutex<()>>,
    closed: AtomicBool,
}

impl OfflineQueue {
    /// Open the queue for a room, reloading anything persisted earlier.
    pub async fn load(room: RoomId, store: Arc<dyn BlobStore>, capacity: usize) -> Result<Self> {
        let key = storage::room_key("offline", &room, "json");
        let entries: VecDeque<OfflineOperation> = match storage::read_optional(&*store, &key).await? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| QueueError::Corrupt(e.to_string()))?
            }
            None => VecDeque::new(),
        };

        if !entries.is_empty() {
            info!("Reloaded {} offline operations for room {}", entries.len(), room);
        }

        Ok(Self {
            room,
            store,
            key,
            capacity,
            entries: Mutex::new(entries),
            drain_lock: Arc::new(Mutex::new(())),
            closed: AtomicBool::new(false),
        })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Append a mutation and persist the whole queue.
    ///
    /// Fails with `Full` at capacity and `Closed` after `close`; the mutation
    /// is not queued in either case. If persisting fails the operation is
    /// still queued in memory.
    pub async fn enqueue(&self, mutation: Mutation) -> Result<OfflineOperation> {
        let mut entries = self.entries.lock().await;
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if entries.len() >= self.capacity {
            return Err(QueueError::Full(self.capacity));
        }

        let operation = OfflineOperation {
            id: Uuid::new_v4(),
            room_id: self.room.clone(),
            timestamp: Utc::now(),
            mutation,
        };
        debug!("Queued {} ({} pending)", operation.mutation, entries.len() + 1);
        entries.push_back(operation.clone());

        self.persist(&entries).await?;
        Ok(operation)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Copy of the pending operations in FIFO order.
    pub async fn pending(&self) -> Vec<OfflineOperation> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Claim the current contents for a drain pass.
    ///
    /// Waits for any drain pass already running.
    pub async fn begin_drain(&self) -> DrainBatch {
        let guard = Arc::clone(&self.drain_lock).lock_owned().await;
        let operations = self.entries.lock().await.iter().cloned().collect();
        DrainBatch {
            operations,
            _guard: guard,
        }
    }

    /// Like `begin_drain`, but returns `None` if a pass is already running
    /// or the queue is closed.
    pub async fn try_begin_drain(&self) -> Option<DrainBatch> {
        let guard = Arc::clone(&self.drain_lock).try_lock_owned().ok()?;
        if self.is_closed() {
            return None;
        }
        let operations = self.entries.lock().await.iter().cloned().collect();
        Some(DrainBatch {
            operations,
            _guard: guard,
        })
    }

    /// End a drain pass.
    ///
    /// The claimed operations are replaced by `retained`. Operations enqueued
    /// during the pass are rewritten through `map` and kept after them.
    pub async fn finish_drain(
        &self,
        batch: DrainBatch,
        retained: Vec<OfflineOperation>,
        map: &IdMap,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let claimed = batch.operations.len().min(entries.len());
        entries.drain(..claimed);

        for operation in entries.iter_mut() {
            reconcile::rewrite_mutation(&mut operation.mutation, map);
        }
        for operation in retained.into_iter().rev() {
            entries.push_front(operation);
        }

        let result = self.persist(&entries).await;
        drop(entries);
        drop(batch);
        result
    }

    /// Stop accepting work. Waits for a running drain pass to finish, so
    /// nothing writes the persisted queue once this returns.
    pub async fn close(&self) {
        let _guard = self.drain_lock.lock().await;
        let _entries = self.entries.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        debug!("Closed offline queue for room {}", self.room);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop every pending operation.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.drain_lock.lock().await;
        let mut entries = self.entries.lock().await;
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        entries.clear();
        self.persist(&entries).await
    }

    async fn persist(&self, entries: &VecDeque<OfflineOperation>) -> Result<()> {
        let result = if entries.is_empty() {
            self.store.delete(&self.key).await
        } else {
            let json = serde_json::to_vec(entries).map_err(|e| StoreError::Serialization(e.to_string()))?;
            self.store.write(&self.key, &json).await
        };
        if let Err(e) = &result {
            warn!("Failed to persist offline queue for room {}: {}", self.room, e);
        }
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CanonicalId;
    use crate::model::NewNode;
    use crate::storage::InMemoryBlobStore;

    fn room() -> RoomId {
        RoomId::new("room-1").unwrap()
    }

    fn create(label: &str) -> Mutation {
        Mutation::CreateNode {
            node: Node::ephemeral(room(), NewNode::new(label, 0.0, 0.0)),
        }
    }

    fn labels(operations: &[OfflineOperation]) -> Vec<String> {
        operations
            .iter()
            .map(|op| match &op.mutation {
                Mutation::CreateNode { node } => node.label.clone(),
                other => other.kind().to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_enqueue_persists_and_reloads_in_order() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let queue = OfflineQueue::load(room(), Arc::clone(&store), 100).await.unwrap();
        queue.enqueue(create("A")).await.unwrap();
        queue.enqueue(create("B")).await.unwrap();
        drop(queue);

        let reloaded = OfflineQueue::load(room(), store, 100).await.unwrap();
        assert_eq!(labels(&reloaded.pending().await), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let queue = OfflineQueue::load(room(), store, 1).await.unwrap();
        queue.enqueue(create("A")).await.unwrap();
        assert!(matches!(queue.enqueue(create("B")).await, Err(QueueError::Full(1))));
    }

    #[tokio::test]
    async fn test_enqueue_during_drain_is_kept_and_rewritten() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let queue = OfflineQueue::load(room(), Arc::clone(&store), 100).await.unwrap();
        let first = create("A");
        let ephemeral = first.target().as_ephemeral().cloned().unwrap();
        queue.enqueue(first).await.unwrap();

        let batch = queue.begin_drain().await;
        assert_eq!(batch.operations.len(), 1);

        // Arrives while the pass is running and still refers to the ephemeral id.
        queue
            .enqueue(Mutation::UpdateNode {
                id: EntityId::Ephemeral(ephemeral.clone()),
                patch: NodePatch::position(1.0, 1.0),
            })
            .await
            .unwrap();

        let canonical = CanonicalId::new("C1").unwrap();
        let mut map = IdMap::new();
        map.insert(ephemeral, canonical.clone());
        queue.finish_drain(batch, Vec::new(), &map).await.unwrap();

        let pending = queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].mutation.target(), &EntityId::Canonical(canonical));
    }

    #[tokio::test]
    async fn test_retained_operations_stay_in_front() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let queue = OfflineQueue::load(room(), store, 100).await.unwrap();
        queue.enqueue(create("A")).await.unwrap();
        queue.enqueue(create("B")).await.unwrap();

        let batch = queue.begin_drain().await;
        let retained = batch.operations[1..].to_vec();
        queue.enqueue(create("C")).await.unwrap();
        queue.finish_drain(batch, retained, &IdMap::new()).await.unwrap();

        assert_eq!(labels(&queue.pending().await), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_only_one_drain_at_a_time() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let queue = OfflineQueue::load(room(), store, 100).await.unwrap();

        let batch = queue.begin_drain().await;
        assert!(queue.try_begin_drain().await.is_none());
        queue.finish_drain(batch, Vec::new(), &IdMap::new()).await.unwrap();
        assert!(queue.try_begin_drain().await.is_some());
    }

    #[tokio::test]
    async fn test_close_waits_for_drain_and_stops_writes() {
        let store = Arc::new(InMemoryBlobStore::new());
        let queue = Arc::new(OfflineQueue::load(room(), store.clone(), 100).await.unwrap());
        queue.enqueue(create("A")).await.unwrap();

        let batch = queue.begin_drain().await;
        let closing = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.close().await }
        });
        tokio::task::yield_now().await;
        assert!(!queue.is_closed(), "close must wait for the running pass");

        queue.finish_drain(batch, Vec::new(), &IdMap::new()).await.unwrap();
        closing.await.unwrap();
        assert!(queue.is_closed());
        assert!(!store.exists("offline/room-1.json").await.unwrap());

        // A second session owns the blob now; this queue must not touch it.
        store.write("offline/room-1.json", b"[]").await.unwrap();
        assert!(matches!(queue.enqueue(create("B")).await, Err(QueueError::Closed)));
        assert!(queue.try_begin_drain().await.is_none());
        assert_eq!(store.read("offline/room-1.json").await.unwrap(), b"[]".to_vec());
    }

    #[test]
    fn test_edge_create_touches_its_endpoints() {
        let a = EntityId::ephemeral();
        let b = EntityId::Canonical(CanonicalId::new("B").unwrap());
        let edge = Edge::ephemeral(room(), a.clone(), b.clone(), Default::default());
        let mutation = Mutation::CreateEdge { edge: edge.clone() };
        assert_eq!(mutation.entities(), vec![&edge.id, &a, &b]);
        assert_eq!(Mutation::DeleteNode { id: b.clone() }.entities(), vec![&b]);
    }

    #[tokio::test]
    async fn test_empty_queue_removes_blob() {
        let store = Arc::new(InMemoryBlobStore::new());
        let queue = OfflineQueue::load(room(), store.clone(), 100).await.unwrap();
        queue.enqueue(create("A")).await.unwrap();
        assert!(store.exists("offline/room-1.json").await.unwrap());

        queue.clear().await.unwrap();
        assert!(!store.exists("offline/room-1.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_operation_in_memory() {
        let store = Arc::new(InMemoryBlobStore::new());
        let queue = OfflineQueue::load(room(), store.clone(), 100).await.unwrap();
        store.set_fail_writes(true);

        assert!(matches!(queue.enqueue(create("A")).await, Err(QueueError::Store(_))));
        assert_eq!(queue.len().await, 1);
    }

    #[test]
    fn test_mutation_wire_format() {
        let mutation = Mutation::DeleteNode {
            id: EntityId::Canonical(CanonicalId::new("n-1").unwrap()),
        };
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(value["kind"], "delete-node");
        assert_eq!(value["id"]["value"], "n-1");
    }
}
