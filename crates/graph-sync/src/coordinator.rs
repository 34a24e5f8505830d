//! MutationCoordinator: applies graph mutations to the room document and
//! persists them to the store, now or later.
//!
//! Every operation writes the document first and only then awaits the
//! gateway, so the local view never waits on the network and is never rolled
//! back because of it. What happens to the network half depends on
//! connectivity:
//!
//! - online: the gateway is called directly and its result is folded back
//!   into the document (promotion of ephemeral ids, server-derived fields)
//! - offline, targeting an entity the store has not confirmed yet, or
//!   touching an entity that already has queued work: the mutation is
//!   appended to the offline queue and replayed by `drain`, in order
//!
//! Requeueing while online asks the session's drainer to run (`request_drain`).
//!
//! Background failures are logged and reported as `SyncEvent`s; only local
//! validation errors reach the caller.

use crate::config::{DrainMode, SyncConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::document::{DocumentError, GraphDocument};
use crate::events::{EventBus, SyncEvent, timestamp};
use crate::gateway::{BulkEdge, BulkNode, BulkSyncRequest, Gateway, GatewayError};
use crate::ids::{CanonicalId, EntityId, EphemeralId, RoomId};
use crate::model::{Edge, EdgePatch, EntityKind, ModelError, NewEdge, NewNode, Node, NodePatch, Payload};
use crate::offline_queue::{Mutation, OfflineOperation, OfflineQueue, QueueError};
use crate::reconcile::{self, IdMap};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Session is bound to room {expected}, not {actual}")]
    WrongRoom { expected: RoomId, actual: RoomId },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

impl From<ModelError> for MutationError {
    fn from(e: ModelError) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MutationError>;

/// Outcome of a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Operations the store accepted.
    pub processed: usize,
    /// Entities that received a canonical id.
    pub promoted: usize,
    /// Operations left queued after a transport failure.
    pub retained: usize,
    /// Operations the store rejected; they are not retried.
    pub dropped: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.processed += other.processed;
        self.promoted += other.promoted;
        self.retained = other.retained;
        self.dropped += other.dropped;
    }
}

struct PassOutcome {
    report: DrainReport,
    retained: Vec<OfflineOperation>,
    stopped: bool,
}

pub struct MutationCoordinator {
    room: RoomId,
    doc: Arc<GraphDocument>,
    gateway: Arc<dyn Gateway>,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    events: Arc<EventBus<SyncEvent>>,
    config: SyncConfig,
    /// Every promotion seen this session, so stale ephemeral ids still resolve.
    aliases: RwLock<IdMap>,
    drain_requests: Notify,
}

impl MutationCoordinator {
    pub fn new(
        room: RoomId,
        doc: Arc<GraphDocument>,
        gateway: Arc<dyn Gateway>,
        queue: Arc<OfflineQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        events: Arc<EventBus<SyncEvent>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            room,
            doc,
            gateway,
            queue,
            connectivity,
            events,
            config,
            aliases: RwLock::new(IdMap::new()),
            drain_requests: Notify::new(),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn document(&self) -> &Arc<GraphDocument> {
        &self.doc
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Current id for `id`, following any promotion.
    pub fn resolve(&self, id: &EntityId) -> EntityId {
        self.aliases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(id)
    }

    pub async fn add_node(&self, room: &RoomId, new: NewNode) -> Result<Node> {
        self.check_room(room)?;
        new.validate()?;

        if !self.connectivity.is_online() {
            let node = Node::ephemeral(self.room.clone(), new);
            self.doc.set_node(&node)?;
            debug!("Offline: created {} locally", node.id);
            self.enqueue(Mutation::CreateNode { node: node.clone() }).await;
            return Ok(node);
        }

        match self.gateway.create_node(&self.room, &new).await {
            Ok(node) => {
                self.doc.set_node(&node)?;
                debug!("Created node {}", node.id);
                Ok(node)
            }
            Err(e) => {
                let node = Node::ephemeral(self.room.clone(), new);
                self.doc.set_node(&node)?;
                self.persistence_failed(Mutation::CreateNode { node: node.clone() }, e)
                    .await;
                Ok(node)
            }
        }
    }

    /// Merge `patch` into a node. Position-only patches use the lightweight
    /// position call.
    pub async fn update_node(&self, room: &RoomId, id: &EntityId, patch: NodePatch) -> Result<Node> {
        self.check_room(room)?;
        patch.validate()?;
        let id = self.resolve(id);
        let mut node = self
            .doc
            .get_node(&id)
            .ok_or_else(|| MutationError::NotFound(format!("node {id}")))?;
        if patch.is_empty() {
            return Ok(node);
        }

        node.apply_patch(&patch);
        self.doc.set_node(&node)?;

        self.persist(Mutation::UpdateNode {
            id: id.clone(),
            patch,
        })
        .await;
        Ok(self.doc.get_node(&id).unwrap_or(node))
    }

    /// Remove a node and every edge incident to it. Missing nodes are ignored.
    pub async fn delete_node(&self, room: &RoomId, id: &EntityId) -> Result<()> {
        self.check_room(room)?;
        let id = self.resolve(id);

        let incident = self.doc.edges_incident_to(&id);
        let existed = self.doc.transact(|txn| {
            for edge in &incident {
                txn.delete_edge(&edge.id)?;
            }
            txn.delete_node(&id)
        })?;
        if !existed && incident.is_empty() {
            debug!("Delete of absent node {} ignored", id);
            return Ok(());
        }

        self.persist(Mutation::DeleteNode { id }).await;
        for edge in incident {
            self.persist(Mutation::DeleteEdge { id: edge.id }).await;
        }
        Ok(())
    }

    pub async fn add_edge(
        &self,
        room: &RoomId,
        source_id: &EntityId,
        target_id: &EntityId,
        data: Payload,
    ) -> Result<Edge> {
        self.check_room(room)?;
        let source_id = self.resolve(source_id);
        let target_id = self.resolve(target_id);

        for endpoint in [&source_id, &target_id] {
            let node = self
                .doc
                .get_node(endpoint)
                .ok_or_else(|| MutationError::NotFound(format!("node {endpoint}")))?;
            if node.room_id != self.room {
                return Err(MutationError::Validation(format!(
                    "node {endpoint} belongs to room {}",
                    node.room_id
                )));
            }
        }
        if self.doc.has_edge_between(&source_id, &target_id) {
            return Err(MutationError::Conflict(format!(
                "edge {source_id} -> {target_id} already exists"
            )));
        }

        let edge = Edge::ephemeral(self.room.clone(), source_id, target_id, data);
        self.doc.set_edge(&edge)?;

        let id = match self.persist(Mutation::CreateEdge { edge: edge.clone() }).await {
            Some(canonical) => EntityId::Canonical(canonical),
            None => edge.id.clone(),
        };
        Ok(self.doc.get_edge(&id).unwrap_or(edge))
    }

    pub async fn update_edge(&self, room: &RoomId, id: &EntityId, patch: EdgePatch) -> Result<Edge> {
        self.check_room(room)?;
        let id = self.resolve(id);
        let mut edge = self
            .doc
            .get_edge(&id)
            .ok_or_else(|| MutationError::NotFound(format!("edge {id}")))?;
        if patch.is_empty() {
            return Ok(edge);
        }

        edge.apply_patch(&patch);
        self.doc.set_edge(&edge)?;

        self.persist(Mutation::UpdateEdge {
            id: id.clone(),
            patch,
        })
        .await;
        Ok(self.doc.get_edge(&id).unwrap_or(edge))
    }

    /// Remove an edge. Missing edges are ignored.
    pub async fn delete_edge(&self, room: &RoomId, id: &EntityId) -> Result<()> {
        self.check_room(room)?;
        let id = self.resolve(id);
        if !self.doc.delete_edge(&id)? {
            debug!("Delete of absent edge {} ignored", id);
            return Ok(());
        }
        self.persist(Mutation::DeleteEdge { id }).await;
        Ok(())
    }

    /// Ask whoever waits in `drain_requested` to drain. Requests made while
    /// nobody waits are remembered, and repeated requests collapse into one.
    pub fn request_drain(&self) {
        self.drain_requests.notify_one();
    }

    /// Resolves at the next `request_drain`.
    pub async fn drain_requested(&self) {
        self.drain_requests.notified().await;
    }

    /// Replay the offline queue against the store.
    ///
    /// Runs passes until the queue is empty, a transport failure stops a pass,
    /// or a pass makes no progress. Returns immediately if another drain is
    /// already running or the session is offline.
    pub async fn drain(&self) -> DrainReport {
        let mut total = DrainReport::default();
        if !self.connectivity.is_online() {
            debug!("Offline, not draining");
            return total;
        }

        loop {
            let Some(batch) = self.queue.try_begin_drain().await else {
                debug!("Drain already in progress");
                return total;
            };
            if batch.operations.is_empty() {
                return total;
            }

            info!(
                "Draining {} offline operations for room {}",
                batch.operations.len(),
                self.room
            );
            let outcome = match self.config.drain_mode {
                DrainMode::Sequential => self.sequential_pass(&batch.operations).await,
                DrainMode::Batched => self.batched_pass(&batch.operations).await,
            };

            let aliases = self.aliases_snapshot();
            if let Err(e) = self.queue.finish_drain(batch, outcome.retained, &aliases).await {
                warn!("Failed to persist offline queue after drain: {}", e);
            }

            let report = outcome.report;
            info!(
                "Drain pass: {} processed, {} promoted, {} retained, {} dropped",
                report.processed, report.promoted, report.retained, report.dropped
            );
            self.events.emit(SyncEvent::QueueDrained {
                processed: report.processed,
                promoted: report.promoted,
                retained: report.retained,
                dropped: report.dropped,
                timestamp: timestamp(),
            });
            total.merge(report);

            let progressed = report.processed + report.dropped > 0;
            if outcome.stopped || !progressed || !self.connectivity.is_online() {
                return total;
            }
        }
    }

    /// Bulk-create ephemeral entities that have no pending create in the
    /// queue, e.g. after an online create was rejected or not requeued.
    pub async fn sync_unsynced(&self) -> std::result::Result<DrainReport, GatewayError> {
        let queued: Vec<EntityId> = self
            .queue
            .pending()
            .await
            .into_iter()
            .filter(|op| op.mutation.is_create())
            .map(|op| op.mutation.target().clone())
            .collect();

        let mut request = reconcile::collect_unsynced(&self.doc);
        request
            .nodes
            .retain(|n| !queued.contains(&EntityId::Ephemeral(n.ephemeral_id.clone())));
        request
            .edges
            .retain(|e| !queued.contains(&EntityId::Ephemeral(e.ephemeral_id.clone())));
        if request.is_empty() {
            return Ok(DrainReport::default());
        }

        let response = self.gateway.bulk_sync(&self.room, &request).await?;
        let map = reconcile::apply_bulk_result(&self.doc, &response).map_err(local_failure)?;
        for synced in &response.nodes {
            self.record_promotion(EntityKind::Node, &synced.ephemeral_id, &synced.server_id);
        }
        for synced in &response.edges {
            self.record_promotion(EntityKind::Edge, &synced.ephemeral_id, &synced.server_id);
        }
        for failure in &response.failed {
            warn!("Bulk sync rejected {}: {}", failure.ephemeral_id, failure.error);
        }

        Ok(DrainReport {
            processed: map.len(),
            promoted: map.len(),
            retained: 0,
            dropped: response.failed.len(),
        })
    }

    fn check_room(&self, room: &RoomId) -> Result<()> {
        if room == &self.room {
            Ok(())
        } else {
            Err(MutationError::WrongRoom {
                expected: self.room.clone(),
                actual: room.clone(),
            })
        }
    }

    fn aliases_snapshot(&self) -> IdMap {
        self.aliases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Send a mutation now, or queue it when the store cannot take it yet.
    /// Returns the canonical id if the mutation promoted an entity.
    async fn persist(&self, mut mutation: Mutation) -> Option<CanonicalId> {
        reconcile::rewrite_mutation(&mut mutation, &self.aliases_snapshot());

        if !self.connectivity.is_online() {
            debug!("Offline: queueing {}", mutation);
            self.enqueue(mutation).await;
            return None;
        }
        if needs_unsynced_reference(&mutation) {
            debug!("Queueing {}: refers to an unsynced entity", mutation);
            self.enqueue(mutation).await;
            return None;
        }
        if self.has_queued_work(&mutation).await {
            debug!("Queueing {}: earlier work on the same entity is pending", mutation);
            self.enqueue(mutation).await;
            self.request_drain();
            return None;
        }

        match self.execute(&mutation, true).await {
            Ok(promoted) => promoted,
            Err(e) => {
                self.persistence_failed(mutation, e).await;
                None
            }
        }
    }

    /// Whether any queued operation touches an entity `mutation` touches.
    /// Sending it directly would let the store see it before that operation.
    async fn has_queued_work(&self, mutation: &Mutation) -> bool {
        let pending = self.queue.pending().await;
        if pending.is_empty() {
            return false;
        }
        let wanted: Vec<EntityId> = mutation.entities().into_iter().map(|id| self.resolve(id)).collect();
        pending.iter().any(|op| {
            op.mutation
                .entities()
                .into_iter()
                .any(|id| wanted.contains(&self.resolve(id)))
        })
    }

    /// Call the gateway for one mutation. Promotions always reach the
    /// document; the store's copy of an updated entity only with `fold`.
    async fn execute(
        &self,
        mutation: &Mutation,
        fold: bool,
    ) -> std::result::Result<Option<CanonicalId>, GatewayError> {
        let room = &self.room;
        match mutation {
            Mutation::CreateNode { node } => {
                let Some(ephemeral) = node.id.as_ephemeral() else {
                    return Ok(None);
                };
                if let Some(existing) = self.alias_of(ephemeral) {
                    return Ok(Some(existing));
                }
                let created = self.gateway.create_node(room, &node.to_new_node()).await?;
                let canonical = canonical_of(&created.id)?;
                reconcile::promote_node(&self.doc, ephemeral, &created).map_err(local_failure)?;
                self.record_promotion(EntityKind::Node, ephemeral, &canonical);
                Ok(Some(canonical))
            }
            Mutation::UpdateNode { id, patch } => {
                let canonical = canonical_of(id)?;
                let position = patch
                    .is_position_only()
                    .then(|| self.position_after(id, patch))
                    .flatten();
                let updated = match position {
                    Some((x, y)) => {
                        self.gateway
                            .update_node_position(room, &canonical, x, y)
                            .await?
                    }
                    None => self.gateway.update_node(room, &canonical, patch).await?,
                };
                if fold && self.doc.contains_node(&updated.id) {
                    self.doc.set_node(&updated).map_err(local_failure)?;
                }
                Ok(None)
            }
            Mutation::DeleteNode { id } => {
                let canonical = canonical_of(id)?;
                tolerate_not_found(self.gateway.delete_node(room, &canonical).await)?;
                Ok(None)
            }
            Mutation::CreateEdge { edge } => {
                let Some(ephemeral) = edge.id.as_ephemeral() else {
                    return Ok(None);
                };
                if let Some(existing) = self.alias_of(ephemeral) {
                    return Ok(Some(existing));
                }
                let new_edge = NewEdge {
                    source_id: canonical_of(&self.resolve(&edge.source_id))?,
                    target_id: canonical_of(&self.resolve(&edge.target_id))?,
                    data: edge.data.clone(),
                };
                let created = self.gateway.create_edge(room, &new_edge).await?;
                let canonical = canonical_of(&created.id)?;
                reconcile::promote_edge(&self.doc, ephemeral, &created).map_err(local_failure)?;
                self.record_promotion(EntityKind::Edge, ephemeral, &canonical);
                Ok(Some(canonical))
            }
            Mutation::UpdateEdge { id, patch } => {
                let canonical = canonical_of(id)?;
                let updated = self.gateway.update_edge(room, &canonical, patch).await?;
                if fold && self.doc.get_edge(&updated.id).is_some() {
                    self.doc.set_edge(&updated).map_err(local_failure)?;
                }
                Ok(None)
            }
            Mutation::DeleteEdge { id } => {
                let canonical = canonical_of(id)?;
                tolerate_not_found(self.gateway.delete_edge(room, &canonical).await)?;
                Ok(None)
            }
        }
    }

    /// Full position for a position-only update, filling an omitted axis
    /// from the document.
    fn position_after(&self, id: &EntityId, patch: &NodePatch) -> Option<(f64, f64)> {
        let current = self.doc.get_node(id);
        let x = patch.position_x.or(current.as_ref().map(|n| n.position_x))?;
        let y = patch.position_y.or(current.as_ref().map(|n| n.position_y))?;
        Some((x, y))
    }

    async fn sequential_pass(&self, operations: &[OfflineOperation]) -> PassOutcome {
        let mut report = DrainReport::default();
        for (index, operation) in operations.iter().enumerate() {
            let mut mutation = operation.mutation.clone();
            reconcile::rewrite_mutation(&mut mutation, &self.aliases_snapshot());
            let fold = !self.superseded(&mutation, &operations[index + 1..]);
            match self.execute(&mutation, fold).await {
                Ok(promoted) => {
                    report.processed += 1;
                    if promoted.is_some() && mutation.is_create() {
                        report.promoted += 1;
                    }
                }
                Err(e) if e.is_transport() => {
                    return self.stop_pass(report, &operations[index..], e);
                }
                Err(e) => {
                    self.drop_operation(&mutation, &e);
                    report.dropped += 1;
                }
            }
        }
        PassOutcome {
            report,
            retained: Vec::new(),
            stopped: false,
        }
    }

    /// Like `sequential_pass`, but each run of consecutive creates is sent as
    /// one bulk sync.
    async fn batched_pass(&self, operations: &[OfflineOperation]) -> PassOutcome {
        let mut report = DrainReport::default();
        let mut index = 0;
        while index < operations.len() {
            let run = operations[index..]
                .iter()
                .take_while(|op| op.mutation.is_create())
                .count();

            if run == 0 {
                let mut mutation = operations[index].mutation.clone();
                reconcile::rewrite_mutation(&mut mutation, &self.aliases_snapshot());
                let fold = !self.superseded(&mutation, &operations[index + 1..]);
                match self.execute(&mutation, fold).await {
                    Ok(_) => report.processed += 1,
                    Err(e) if e.is_transport() => {
                        return self.stop_pass(report, &operations[index..], e);
                    }
                    Err(e) => {
                        self.drop_operation(&mutation, &e);
                        report.dropped += 1;
                    }
                }
                index += 1;
                continue;
            }

            let request = self.bulk_request(&operations[index..index + run]);
            match self.gateway.bulk_sync(&self.room, &request).await {
                Ok(response) => {
                    match reconcile::apply_bulk_result(&self.doc, &response) {
                        Ok(_) => {}
                        Err(e) => warn!("Failed to apply bulk result locally: {}", e),
                    }
                    for synced in &response.nodes {
                        self.record_promotion(EntityKind::Node, &synced.ephemeral_id, &synced.server_id);
                    }
                    for synced in &response.edges {
                        self.record_promotion(EntityKind::Edge, &synced.ephemeral_id, &synced.server_id);
                    }
                    for failure in &response.failed {
                        warn!(
                            "Dropping queued create of {}: {}",
                            failure.ephemeral_id, failure.error
                        );
                    }
                    let promoted = response.nodes.len() + response.edges.len();
                    report.promoted += promoted;
                    report.processed += promoted;
                    report.dropped += run - promoted.min(run);
                }
                Err(e) if e.is_transport() => {
                    return self.stop_pass(report, &operations[index..], e);
                }
                Err(e) => {
                    warn!("Bulk sync of {} queued creates rejected: {}", run, e);
                    report.dropped += run;
                }
            }
            index += run;
        }
        PassOutcome {
            report,
            retained: Vec::new(),
            stopped: false,
        }
    }

    /// Whether a later operation targets the same entity, making the store's
    /// answer to `mutation` stale before the pass ends.
    fn superseded(&self, mutation: &Mutation, later: &[OfflineOperation]) -> bool {
        let target = self.resolve(mutation.target());
        later
            .iter()
            .any(|op| self.resolve(op.mutation.target()) == target)
    }

    fn bulk_request(&self, operations: &[OfflineOperation]) -> BulkSyncRequest {
        let mut request = BulkSyncRequest::default();
        for operation in operations {
            match &operation.mutation {
                Mutation::CreateNode { node } => {
                    if let Some(ephemeral) = node.id.as_ephemeral() {
                        request.nodes.push(BulkNode {
                            ephemeral_id: ephemeral.clone(),
                            node: node.to_new_node(),
                        });
                    }
                }
                Mutation::CreateEdge { edge } => {
                    if let Some(ephemeral) = edge.id.as_ephemeral() {
                        request.edges.push(BulkEdge {
                            ephemeral_id: ephemeral.clone(),
                            source_id: self.resolve(&edge.source_id),
                            target_id: self.resolve(&edge.target_id),
                            data: edge.data.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        request
    }

    fn stop_pass(
        &self,
        mut report: DrainReport,
        remaining: &[OfflineOperation],
        error: GatewayError,
    ) -> PassOutcome {
        warn!(
            "Drain stopped by transport failure, {} operations retained: {}",
            remaining.len(),
            error
        );
        let aliases = self.aliases_snapshot();
        let retained: Vec<OfflineOperation> = remaining
            .iter()
            .cloned()
            .map(|mut op| {
                reconcile::rewrite_mutation(&mut op.mutation, &aliases);
                op
            })
            .collect();
        report.retained = retained.len();
        PassOutcome {
            report,
            retained,
            stopped: true,
        }
    }

    fn drop_operation(&self, mutation: &Mutation, error: &GatewayError) {
        warn!("Dropping queued {}: {}", mutation, error);
        self.events.emit(SyncEvent::PersistenceFailed {
            operation: mutation.kind().to_string(),
            entity_id: mutation.target().to_string(),
            error: error.to_string(),
            requeued: false,
            timestamp: timestamp(),
        });
    }

    async fn persistence_failed(&self, mutation: Mutation, error: GatewayError) {
        let requeue = error.is_transport() && self.config.requeue_on_transport_failure;
        warn!(
            "Failed to persist {}: {}{}",
            mutation,
            error,
            if requeue { " (queued for retry)" } else { "" }
        );
        self.events.emit(SyncEvent::PersistenceFailed {
            operation: mutation.kind().to_string(),
            entity_id: mutation.target().to_string(),
            error: error.to_string(),
            requeued: requeue,
            timestamp: timestamp(),
        });
        if requeue && self.enqueue(mutation).await && self.connectivity.is_online() {
            self.request_drain();
        }
    }

    /// Append to the offline queue. Returns whether the mutation was queued.
    ///
    /// A full queue rejects the mutation; the local change stays and the loss
    /// is reported as a persistence failure.
    async fn enqueue(&self, mutation: Mutation) -> bool {
        let (operation, entity_id) = (mutation.kind(), mutation.target().to_string());
        match self.queue.enqueue(mutation).await {
            Ok(_) => true,
            Err(QueueError::Store(e)) => {
                warn!("Queued {} {} in memory only: {}", operation, entity_id, e);
                true
            }
            Err(QueueError::Closed) => {
                debug!("Session closed, not queueing {} {}", operation, entity_id);
                false
            }
            Err(e) => {
                warn!("Failed to queue {} {}: {}", operation, entity_id, e);
                self.events.emit(SyncEvent::PersistenceFailed {
                    operation: operation.to_string(),
                    entity_id,
                    error: e.to_string(),
                    requeued: false,
                    timestamp: timestamp(),
                });
                false
            }
        }
    }

    fn alias_of(&self, ephemeral: &EphemeralId) -> Option<CanonicalId> {
        self.aliases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ephemeral)
            .cloned()
    }

    fn record_promotion(&self, kind: EntityKind, ephemeral: &EphemeralId, canonical: &CanonicalId) {
        self.aliases
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ephemeral.clone(), canonical.clone());
        debug!("Promoted {} -> {}", ephemeral, canonical);
        self.events.emit(SyncEvent::EntityPromoted {
            kind,
            ephemeral_id: ephemeral.clone(),
            canonical_id: canonical.clone(),
            timestamp: timestamp(),
        });
    }
}

/// Whether the store cannot address this mutation yet.
fn needs_unsynced_reference(mutation: &Mutation) -> bool {
    match mutation {
        Mutation::CreateNode { .. } => false,
        Mutation::CreateEdge { edge } => edge.source_id.is_ephemeral() || edge.target_id.is_ephemeral(),
        other => other.target().is_ephemeral(),
    }
}

fn canonical_of(id: &EntityId) -> std::result::Result<CanonicalId, GatewayError> {
    id.as_canonical()
        .cloned()
        .ok_or_else(|| GatewayError::NotFound(format!("{id} was never persisted")))
}

fn tolerate_not_found(result: std::result::Result<(), GatewayError>) -> std::result::Result<(), GatewayError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn local_failure(e: DocumentError) -> GatewayError {
    GatewayError::Validation(format!("persisted, but the local document rejected the result: {e}"))
}
