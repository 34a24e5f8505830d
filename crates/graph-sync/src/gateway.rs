//! Persisted Store Gateway: the network boundary to the authoritative store.
//!
//! Implementations:
//! - `InMemoryGateway` - For testing; enforces the store's referential rules
//! - `HttpGateway` (in graph-sync-daemon) - Uses reqwest against the REST API

use crate::ids::{CanonicalId, EntityId, EphemeralId, RoomId};
use crate::model::{Edge, EdgePatch, EntityKind, NewEdge, NewNode, Node, NodePatch, Room, RoomSnapshot};
use crate::reconcile;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Whether the store could not be reached (as opposed to rejecting the call).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// A node creation inside a bulk request, keyed by the client's ephemeral id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkNode {
    pub ephemeral_id: EphemeralId,
    #[serde(flatten)]
    pub node: NewNode,
}

/// An edge creation inside a bulk request. Endpoints may still be ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEdge {
    pub ephemeral_id: EphemeralId,
    pub source_id: EntityId,
    pub target_id: EntityId,
    #[serde(default)]
    pub data: crate::model::Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkSyncRequest {
    pub nodes: Vec<BulkNode>,
    pub edges: Vec<BulkEdge>,
}

impl BulkSyncRequest {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedNode {
    pub ephemeral_id: EphemeralId,
    pub server_id: CanonicalId,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedEdge {
    pub ephemeral_id: EphemeralId,
    pub server_id: CanonicalId,
    pub edge: Edge,
}

/// An item the store did not create during a bulk sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub ephemeral_id: EphemeralId,
    pub kind: EntityKind,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkSyncResponse {
    pub nodes: Vec<SyncedNode>,
    pub edges: Vec<SyncedEdge>,
    #[serde(default)]
    pub failed: Vec<BulkFailure>,
}

/// Operations offered by the authoritative store.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn create_node(&self, room: &RoomId, node: &NewNode) -> Result<Node>;

    async fn update_node(&self, room: &RoomId, id: &CanonicalId, patch: &NodePatch) -> Result<Node>;

    /// Lightweight path for drag-style moves.
    async fn update_node_position(&self, room: &RoomId, id: &CanonicalId, x: f64, y: f64) -> Result<Node>;

    /// Delete a node and, on the store side, its incident edges.
    /// A missing node is not an error.
    async fn delete_node(&self, room: &RoomId, id: &CanonicalId) -> Result<()>;

    /// Fails with `Conflict` on a duplicate (source, target) pair and
    /// `NotFound` if either endpoint is missing.
    async fn create_edge(&self, room: &RoomId, edge: &NewEdge) -> Result<Edge>;

    async fn update_edge(&self, room: &RoomId, id: &CanonicalId, patch: &EdgePatch) -> Result<Edge>;

    async fn delete_edge(&self, room: &RoomId, id: &CanonicalId) -> Result<()>;

    /// Create a batch of nodes then edges, resolving ephemeral edge endpoints
    /// through the ids issued for the batch's nodes.
    async fn bulk_sync(&self, room: &RoomId, request: &BulkSyncRequest) -> Result<BulkSyncResponse>;

    async fn room_snapshot(&self, room: &RoomId) -> Result<RoomSnapshot>;
}

/// A call observed by `InMemoryGateway`.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    CreateNode(String),
    UpdateNode(CanonicalId),
    UpdateNodePosition(CanonicalId),
    DeleteNode(CanonicalId),
    CreateEdge(CanonicalId, CanonicalId),
    UpdateEdge(CanonicalId),
    DeleteEdge(CanonicalId),
    BulkSync { nodes: usize, edges: usize },
    RoomSnapshot,
}

struct RoomState {
    room: Room,
    nodes: BTreeMap<CanonicalId, Node>,
    edges: BTreeMap<CanonicalId, Edge>,
}

impl reconcile::BatchTarget for RoomState {
    fn create_node(&mut self, node: &NewNode) -> Result<Node> {
        self.insert_node(node)
    }

    fn create_edge(&mut self, edge: &NewEdge) -> Result<Edge> {
        self.insert_edge(edge)
    }
}

impl RoomState {
    fn insert_node(&mut self, new: &NewNode) -> Result<Node> {
        new.validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        let id = issue_id();
        let now = Utc::now();
        let node = Node {
            id: EntityId::Canonical(id.clone()),
            room_id: self.room.id.clone(),
            label: new.label.clone(),
            position_x: new.position_x,
            position_y: new.position_y,
            data: new.data.clone(),
            created_at: now,
            updated_at: now,
        };
        self.nodes.insert(id, node.clone());
        Ok(node)
    }

    fn update_node(&mut self, id: &CanonicalId, patch: &NodePatch) -> Result<Node> {
        patch
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("node {id}")))?;
        node.apply_patch(patch);
        Ok(node.clone())
    }

    fn delete_node(&mut self, id: &CanonicalId) {
        if self.nodes.remove(id).is_some() {
            let node_id = EntityId::Canonical(id.clone());
            self.edges.retain(|_, edge| !edge.references(&node_id));
        }
    }

    fn insert_edge(&mut self, new: &NewEdge) -> Result<Edge> {
        for endpoint in [&new.source_id, &new.target_id] {
            if !self.nodes.contains_key(endpoint) {
                return Err(GatewayError::NotFound(format!("node {endpoint}")));
            }
        }
        let source_id = EntityId::Canonical(new.source_id.clone());
        let target_id = EntityId::Canonical(new.target_id.clone());
        if self
            .edges
            .values()
            .any(|edge| edge.source_id == source_id && edge.target_id == target_id)
        {
            return Err(GatewayError::Conflict(format!(
                "edge {} -> {} already exists",
                new.source_id, new.target_id
            )));
        }

        let id = issue_id();
        let now = Utc::now();
        let edge = Edge {
            id: EntityId::Canonical(id.clone()),
            room_id: self.room.id.clone(),
            source_id,
            target_id,
            data: new.data.clone(),
            created_at: now,
            updated_at: now,
        };
        self.edges.insert(id, edge.clone());
        Ok(edge)
    }
}

fn issue_id() -> CanonicalId {
    CanonicalId::from(Uuid::new_v4())
}

/// In-memory store for testing.
///
/// Rooms must be created with `create_room` before use. Supports switching
/// the store unreachable and injecting one-shot failures.
#[derive(Default)]
pub struct InMemoryGateway {
    rooms: Mutex<HashMap<RoomId, RoomState>>,
    unreachable: AtomicBool,
    injected: Mutex<VecDeque<GatewayError>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_room(&self, id: RoomId, name: impl Into<String>) {
        let room = Room {
            id: id.clone(),
            name: name.into(),
            created_at: Utc::now(),
        };
        self.rooms.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            RoomState {
                room,
                nodes: BTreeMap::new(),
                edges: BTreeMap::new(),
            },
        );
    }

    /// While unreachable every call fails with `Transport`.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Fail the next call with `error`.
    pub fn fail_next(&self, error: GatewayError) {
        self.injected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn nodes(&self, room: &RoomId) -> Vec<Node> {
        self.rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .map(|state| state.nodes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn edges(&self, room: &RoomId) -> Vec<Edge> {
        self.rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .map(|state| state.edges.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Record the call and apply reachability and injected failures.
    fn enter(&self, call: GatewayCall) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("store unreachable".into()));
        }
        match self
            .injected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn with_room<T>(&self, room: &RoomId, f: impl FnOnce(&mut RoomState) -> Result<T>) -> Result<T> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let state = rooms
            .get_mut(room)
            .ok_or_else(|| GatewayError::NotFound(format!("room {room}")))?;
        f(state)
    }
}

#[async_trait]
impl Gateway for InMemoryGateway {
    async fn create_node(&self, room: &RoomId, node: &NewNode) -> Result<Node> {
        self.enter(GatewayCall::CreateNode(node.label.clone()))?;
        self.with_room(room, |state| state.insert_node(node))
    }

    async fn update_node(&self, room: &RoomId, id: &CanonicalId, patch: &NodePatch) -> Result<Node> {
        self.enter(GatewayCall::UpdateNode(id.clone()))?;
        self.with_room(room, |state| state.update_node(id, patch))
    }

    async fn update_node_position(&self, room: &RoomId, id: &CanonicalId, x: f64, y: f64) -> Result<Node> {
        self.enter(GatewayCall::UpdateNodePosition(id.clone()))?;
        self.with_room(room, |state| state.update_node(id, &NodePatch::position(x, y)))
    }

    async fn delete_node(&self, room: &RoomId, id: &CanonicalId) -> Result<()> {
        self.enter(GatewayCall::DeleteNode(id.clone()))?;
        self.with_room(room, |state| {
            state.delete_node(id);
            Ok(())
        })
    }

    async fn create_edge(&self, room: &RoomId, edge: &NewEdge) -> Result<Edge> {
        self.enter(GatewayCall::CreateEdge(
            edge.source_id.clone(),
            edge.target_id.clone(),
        ))?;
        self.with_room(room, |state| state.insert_edge(edge))
    }

    async fn update_edge(&self, room: &RoomId, id: &CanonicalId, patch: &EdgePatch) -> Result<Edge> {
        self.enter(GatewayCall::UpdateEdge(id.clone()))?;
        self.with_room(room, |state| {
            let edge = state
                .edges
                .get_mut(id)
                .ok_or_else(|| GatewayError::NotFound(format!("edge {id}")))?;
            edge.apply_patch(patch);
            Ok(edge.clone())
        })
    }

    async fn delete_edge(&self, room: &RoomId, id: &CanonicalId) -> Result<()> {
        self.enter(GatewayCall::DeleteEdge(id.clone()))?;
        self.with_room(room, |state| {
            state
                .edges
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| GatewayError::NotFound(format!("edge {id}")))
        })
    }

    async fn bulk_sync(&self, room: &RoomId, request: &BulkSyncRequest) -> Result<BulkSyncResponse> {
        self.enter(GatewayCall::BulkSync {
            nodes: request.nodes.len(),
            edges: request.edges.len(),
        })?;
        self.with_room(room, |state| Ok(reconcile::reconcile_batch(state, request)))
    }

    async fn room_snapshot(&self, room: &RoomId) -> Result<RoomSnapshot> {
        self.enter(GatewayCall::RoomSnapshot)?;
        self.with_room(room, |state| {
            Ok(RoomSnapshot {
                room: state.room.clone(),
                nodes: state.nodes.values().cloned().collect(),
                edges: state.edges.values().cloned().collect(),
            })
        })
    }
}
