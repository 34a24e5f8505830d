//! Reconciliation: replacing ephemeral ids with canonical ones.
//!
//! Covers single-entity promotion inside the document, the batch protocol
//! used by `bulk_sync`, and rewriting of queued mutations that still refer
//! to ids promoted since they were enqueued.

use crate::document::{GraphDocument, Result as DocumentResult};
use crate::gateway::{
    BulkEdge, BulkFailure, BulkNode, BulkSyncRequest, BulkSyncResponse, GatewayError, SyncedEdge,
    SyncedNode,
};
use crate::ids::{CanonicalId, EntityId, EphemeralId};
use crate::model::{Edge, EntityKind, NewEdge, NewNode, Node, RoomSnapshot};
use crate::offline_queue::Mutation;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Ephemeral -> canonical mapping built while reconciling.
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    entries: HashMap<EphemeralId, CanonicalId>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ephemeral: EphemeralId, canonical: CanonicalId) {
        self.entries.insert(ephemeral, canonical);
    }

    pub fn get(&self, ephemeral: &EphemeralId) -> Option<&CanonicalId> {
        self.entries.get(ephemeral)
    }

    /// Map an id through the table, falling back to the id itself.
    pub fn resolve(&self, id: &EntityId) -> EntityId {
        match id {
            EntityId::Ephemeral(ephemeral) => self
                .entries
                .get(ephemeral)
                .map(|canonical| EntityId::Canonical(canonical.clone()))
                .unwrap_or_else(|| id.clone()),
            EntityId::Canonical(_) => id.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EphemeralId, &CanonicalId)> {
        self.entries.iter()
    }
}

/// Replace an ephemeral node with its canonical counterpart and point every
/// incident edge at the canonical id, in one document commit.
///
/// If the ephemeral node was deleted locally in the meantime nothing is
/// written and `false` is returned.
pub fn promote_node(
    doc: &GraphDocument,
    ephemeral: &EphemeralId,
    canonical: &Node,
) -> DocumentResult<bool> {
    let old_id = EntityId::Ephemeral(ephemeral.clone());
    if !doc.contains_node(&old_id) {
        debug!("Ephemeral node {} no longer present, skipping promotion", ephemeral);
        return Ok(false);
    }
    let incident = doc.edges_incident_to(&old_id);

    doc.transact(|txn| {
        txn.delete_node(&old_id)?;
        txn.set_node(canonical)?;
        for mut edge in incident {
            edge.rewrite_endpoint(&old_id, &canonical.id);
            txn.set_edge(&edge)?;
        }
        Ok(true)
    })
}

/// Replace an ephemeral edge with its canonical counterpart.
///
/// Skipped (returns `false`) if the ephemeral edge is gone or either
/// endpoint of the canonical edge no longer exists locally.
pub fn promote_edge(
    doc: &GraphDocument,
    ephemeral: &EphemeralId,
    canonical: &Edge,
) -> DocumentResult<bool> {
    let old_id = EntityId::Ephemeral(ephemeral.clone());
    if doc.get_edge(&old_id).is_none() {
        debug!("Ephemeral edge {} no longer present, skipping promotion", ephemeral);
        return Ok(false);
    }
    if !doc.contains_node(&canonical.source_id) || !doc.contains_node(&canonical.target_id) {
        doc.delete_edge(&old_id)?;
        return Ok(false);
    }

    doc.transact(|txn| {
        txn.delete_edge(&old_id)?;
        txn.set_edge(canonical)?;
        Ok(true)
    })
}

/// Apply a bulk sync result to the document: every node first, then every
/// edge, mirroring the order in which the store created them.
///
/// Returns the ids that were promoted.
pub fn apply_bulk_result(doc: &GraphDocument, response: &BulkSyncResponse) -> DocumentResult<IdMap> {
    let mut map = IdMap::new();
    for synced in &response.nodes {
        promote_node(doc, &synced.ephemeral_id, &synced.node)?;
        map.insert(synced.ephemeral_id.clone(), synced.server_id.clone());
    }
    for synced in &response.edges {
        promote_edge(doc, &synced.ephemeral_id, &synced.edge)?;
        map.insert(synced.ephemeral_id.clone(), synced.server_id.clone());
    }
    Ok(map)
}

/// Bring the document in line with the store's snapshot of the room.
///
/// Server entities are written under their canonical ids, canonical entities
/// the store no longer has are removed, and ephemeral entities are kept.
/// Returns the number of entries written or removed.
pub fn seed_from_snapshot(doc: &GraphDocument, snapshot: &RoomSnapshot) -> DocumentResult<usize> {
    let server_nodes: HashSet<&EntityId> = snapshot.nodes.iter().map(|n| &n.id).collect();
    let server_edges: HashSet<&EntityId> = snapshot.edges.iter().map(|e| &e.id).collect();
    let stale_nodes: Vec<EntityId> = doc
        .nodes()
        .into_iter()
        .filter(|n| !n.id.is_ephemeral() && !server_nodes.contains(&n.id))
        .map(|n| n.id)
        .collect();
    let stale_edges: Vec<EntityId> = doc
        .edges()
        .into_iter()
        .filter(|e| !e.id.is_ephemeral() && !server_edges.contains(&e.id))
        .map(|e| e.id)
        .collect();

    let mut touched = doc.transact(|txn| {
        let mut touched = 0;
        for node in &snapshot.nodes {
            if doc.get_node(&node.id).as_ref() != Some(node) {
                txn.set_node(node)?;
                touched += 1;
            }
        }
        for edge in &snapshot.edges {
            if doc.get_edge(&edge.id).as_ref() != Some(edge) {
                txn.set_edge(edge)?;
                touched += 1;
            }
        }
        for id in &stale_edges {
            txn.delete_edge(id)?;
            touched += 1;
        }
        for id in &stale_nodes {
            txn.delete_node(id)?;
            touched += 1;
        }
        Ok(touched)
    })?;

    // Ephemeral edges may have pointed at a pruned node.
    touched += doc.prune_dangling_edges()?;
    Ok(touched)
}

/// Rewrite every id a queued mutation refers to through `map`.
pub fn rewrite_mutation(mutation: &mut Mutation, map: &IdMap) {
    if map.is_empty() {
        return;
    }
    match mutation {
        Mutation::CreateNode { .. } => {}
        Mutation::UpdateNode { id, .. }
        | Mutation::DeleteNode { id }
        | Mutation::UpdateEdge { id, .. }
        | Mutation::DeleteEdge { id } => *id = map.resolve(id),
        Mutation::CreateEdge { edge } => {
            edge.source_id = map.resolve(&edge.source_id);
            edge.target_id = map.resolve(&edge.target_id);
        }
    }
}

/// Ephemeral nodes and edges still in the document, as a bulk request.
pub fn collect_unsynced(doc: &GraphDocument) -> BulkSyncRequest {
    let nodes = doc
        .nodes()
        .into_iter()
        .filter_map(|node| {
            let ephemeral_id = node.id.as_ephemeral()?.clone();
            Some(BulkNode {
                ephemeral_id,
                node: node.to_new_node(),
            })
        })
        .collect();
    let edges = doc
        .edges()
        .into_iter()
        .filter_map(|edge| {
            let ephemeral_id = edge.id.as_ephemeral()?.clone();
            Some(BulkEdge {
                ephemeral_id,
                source_id: edge.source_id,
                target_id: edge.target_id,
                data: edge.data,
            })
        })
        .collect();
    BulkSyncRequest { nodes, edges }
}

/// Store-side primitives the batch protocol needs.
pub trait BatchTarget {
    fn create_node(&mut self, node: &NewNode) -> Result<Node, GatewayError>;
    fn create_edge(&mut self, edge: &NewEdge) -> Result<Edge, GatewayError>;
}

/// Run a bulk sync against a store.
///
/// All nodes are created first, building an ephemeral -> canonical map; edges
/// are then created with their endpoints resolved through that map (ids not
/// in the map pass through unchanged). Sequential and best-effort: an item
/// that fails is reported in `failed` and does not undo earlier items.
pub fn reconcile_batch<T: BatchTarget + ?Sized>(
    target: &mut T,
    request: &BulkSyncRequest,
) -> BulkSyncResponse {
    let mut response = BulkSyncResponse::default();
    let mut map = IdMap::new();

    for item in &request.nodes {
        match target.create_node(&item.node) {
            Ok(node) => match node.id.as_canonical().cloned() {
                Some(server_id) => {
                    map.insert(item.ephemeral_id.clone(), server_id.clone());
                    response.nodes.push(SyncedNode {
                        ephemeral_id: item.ephemeral_id.clone(),
                        server_id,
                        node,
                    });
                }
                None => response.failed.push(failure(
                    &item.ephemeral_id,
                    EntityKind::Node,
                    "store returned a non-canonical id",
                )),
            },
            Err(e) => response
                .failed
                .push(failure(&item.ephemeral_id, EntityKind::Node, e)),
        }
    }

    for item in &request.edges {
        let source = map.resolve(&item.source_id);
        let target_id = map.resolve(&item.target_id);
        let (Some(source), Some(target_id)) = (source.as_canonical(), target_id.as_canonical()) else {
            response.failed.push(failure(
                &item.ephemeral_id,
                EntityKind::Edge,
                GatewayError::NotFound("edge endpoint was never persisted".into()),
            ));
            continue;
        };
        let new_edge = NewEdge {
            source_id: source.clone(),
            target_id: target_id.clone(),
            data: item.data.clone(),
        };
        match target.create_edge(&new_edge) {
            Ok(edge) => match edge.id.as_canonical().cloned() {
                Some(server_id) => response.edges.push(SyncedEdge {
                    ephemeral_id: item.ephemeral_id.clone(),
                    server_id,
                    edge,
                }),
                None => response.failed.push(failure(
                    &item.ephemeral_id,
                    EntityKind::Edge,
                    "store returned a non-canonical id",
                )),
            },
            Err(e) => response
                .failed
                .push(failure(&item.ephemeral_id, EntityKind::Edge, e)),
        }
    }

    response
}

fn failure(ephemeral_id: &EphemeralId, kind: EntityKind, error: impl ToString) -> BulkFailure {
    BulkFailure {
        ephemeral_id: ephemeral_id.clone(),
        kind,
        error: error.to_string(),
    }
}
