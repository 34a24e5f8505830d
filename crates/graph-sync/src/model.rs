//! Graph entities shared by the document, the queue and the gateway.

use crate::ids::{CanonicalId, EntityId, RoomId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Opaque key/value payload attached to nodes and edges.
pub type Payload = Map<String, Value>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("Node label must not be empty")]
    EmptyLabel,
    #[error("Position field {0} is not a finite number")]
    NonFinitePosition(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Node,
    Edge,
}

/// A positioned, labeled vertex of the room graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: EntityId,
    pub room_id: RoomId,
    pub label: String,
    pub position_x: f64,
    pub position_y: f64,
    #[serde(default)]
    pub data: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Build a node that has not been confirmed by the persisted store.
    pub fn ephemeral(room_id: RoomId, new: NewNode) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::ephemeral(),
            room_id,
            label: new.label,
            position_x: new.position_x,
            position_y: new.position_y,
            data: new.data,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a patch into this node and refresh `updated_at`.
    pub fn apply_patch(&mut self, patch: &NodePatch) {
        if let Some(label) = &patch.label {
            self.label = label.clone();
        }
        if let Some(x) = patch.position_x {
            self.position_x = x;
        }
        if let Some(y) = patch.position_y {
            self.position_y = y;
        }
        if let Some(data) = &patch.data {
            self.data = data.clone();
        }
        self.updated_at = Utc::now();
    }

    /// The create payload that reproduces this node on the server.
    pub fn to_new_node(&self) -> NewNode {
        NewNode {
            label: self.label.clone(),
            position_x: self.position_x,
            position_y: self.position_y,
            data: self.data.clone(),
        }
    }
}

/// Payload for creating a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNode {
    pub label: String,
    pub position_x: f64,
    pub position_y: f64,
    #[serde(default)]
    pub data: Payload,
}

impl NewNode {
    pub fn new(label: impl Into<String>, position_x: f64, position_y: f64) -> Self {
        Self {
            label: label.into(),
            position_x,
            position_y,
            data: Payload::new(),
        }
    }

    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.label.trim().is_empty() {
            return Err(ModelError::EmptyLabel);
        }
        check_finite("positionX", self.position_x)?;
        check_finite("positionY", self.position_y)
    }
}

/// Partial update for a node. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl NodePatch {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            position_x: Some(x),
            position_y: Some(y),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.position_x.is_none()
            && self.position_y.is_none()
            && self.data.is_none()
    }

    /// True when the patch moves the node and touches nothing else.
    pub fn is_position_only(&self) -> bool {
        self.label.is_none()
            && self.data.is_none()
            && (self.position_x.is_some() || self.position_y.is_some())
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if let Some(label) = &self.label {
            if label.trim().is_empty() {
                return Err(ModelError::EmptyLabel);
            }
        }
        if let Some(x) = self.position_x {
            check_finite("positionX", x)?;
        }
        if let Some(y) = self.position_y {
            check_finite("positionY", y)?;
        }
        Ok(())
    }
}

/// A directed connection between two nodes of the same room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EntityId,
    pub room_id: RoomId,
    pub source_id: EntityId,
    pub target_id: EntityId,
    #[serde(default)]
    pub data: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Edge {
    /// Build an edge that has not been confirmed by the persisted store.
    pub fn ephemeral(room_id: RoomId, source_id: EntityId, target_id: EntityId, data: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::ephemeral(),
            room_id,
            source_id,
            target_id,
            data,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether either endpoint is `node_id`.
    pub fn references(&self, node_id: &EntityId) -> bool {
        &self.source_id == node_id || &self.target_id == node_id
    }

    /// Point every endpoint equal to `from` at `to`. Returns whether anything changed.
    pub fn rewrite_endpoint(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let mut changed = false;
        if &self.source_id == from {
            self.source_id = to.clone();
            changed = true;
        }
        if &self.target_id == from {
            self.target_id = to.clone();
            changed = true;
        }
        changed
    }

    pub fn apply_patch(&mut self, patch: &EdgePatch) {
        if let Some(data) = &patch.data {
            self.data = data.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// Payload for creating an edge between two persisted nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEdge {
    pub source_id: CanonicalId,
    pub target_id: CanonicalId,
    #[serde(default)]
    pub data: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl EdgePatch {
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Authoritative state of a room as returned by the persisted store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room: Room,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ModelError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ModelError::NonFinitePosition(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn room() -> RoomId {
        RoomId::new("room-1").unwrap()
    }

    #[test]
    fn test_position_only_detection() {
        let patch = NodePatch {
            position_x: Some(5.0),
            ..NodePatch::default()
        };
        assert!(patch.is_position_only());

        let patch = NodePatch {
            position_x: Some(5.0),
            label: Some("renamed".into()),
            ..NodePatch::default()
        };
        assert!(!patch.is_position_only());

        assert!(!NodePatch::default().is_position_only());
        assert!(NodePatch::default().is_empty());
    }

    #[test]
    fn test_apply_patch_merges_fields() {
        let mut node = Node::ephemeral(room(), NewNode::new("A", 0.0, 0.0));
        let before = node.updated_at;
        node.apply_patch(&NodePatch {
            position_y: Some(12.5),
            ..NodePatch::default()
        });

        assert_eq!(node.label, "A");
        assert_eq!(node.position_x, 0.0);
        assert_eq!(node.position_y, 12.5);
        assert!(node.updated_at >= before);
    }

    #[test]
    fn test_validation() {
        assert_eq!(NewNode::new("  ", 0.0, 0.0).validate(), Err(ModelError::EmptyLabel));
        assert_eq!(
            NewNode::new("A", f64::NAN, 0.0).validate(),
            Err(ModelError::NonFinitePosition("positionX"))
        );
        assert!(NodePatch::position(1.0, f64::INFINITY).validate().is_err());
        assert!(NewNode::new("A", 1.0, 2.0).validate().is_ok());
    }

    #[test]
    fn test_edge_rewrite_endpoint() {
        let a = EntityId::ephemeral();
        let b = EntityId::ephemeral();
        let mut self_loop = Edge::ephemeral(room(), a.clone(), a.clone(), Payload::new());
        let canonical = EntityId::Canonical(CanonicalId::new("c-1").unwrap());

        assert!(!self_loop.rewrite_endpoint(&b, &canonical));
        assert!(self_loop.rewrite_endpoint(&a, &canonical));
        assert_eq!(self_loop.source_id, canonical);
        assert_eq!(self_loop.target_id, canonical);
        assert!(self_loop.references(&canonical));
        assert!(!self_loop.references(&a));
    }

    #[test]
    fn test_node_serializes_camel_case() {
        let mut data = Payload::new();
        data.insert("color".into(), json!("red"));
        let node = Node::ephemeral(room(), NewNode::new("A", 1.0, 2.0).with_data(data));
        let value = serde_json::to_value(&node).unwrap();

        assert_eq!(value["roomId"], "room-1");
        assert_eq!(value["positionX"], 1.0);
        assert_eq!(value["data"]["color"], "red");
        assert_eq!(value["id"]["kind"], "ephemeral");
    }
}
