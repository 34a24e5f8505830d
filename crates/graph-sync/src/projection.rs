//! Read-side view of the room graph, fed by document change batches.
//!
//! Applying a batch is idempotent: the same batch delivered twice leaves the
//! projection unchanged.

use crate::document::{ChangeAction, DocumentEvent, GraphEntity};
use crate::model::{Edge, Node};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct GraphProjection {
    nodes: RwLock<HashMap<String, Node>>,
    edges: RwLock<HashMap<String, Edge>>,
}

impl GraphProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &DocumentEvent) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let mut edges = self.edges.write().unwrap_or_else(|e| e.into_inner());

        for change in &event.changes {
            match (&change.action, &change.entity) {
                (ChangeAction::Delete, _) => {
                    nodes.remove(&change.key);
                    edges.remove(&change.key);
                }
                (_, Some(GraphEntity::Node(node))) => {
                    nodes.insert(change.key.clone(), node.clone());
                }
                (_, Some(GraphEntity::Edge(edge))) => {
                    edges.insert(change.key.clone(), edge.clone());
                }
                (_, None) => {}
            }
        }
    }

    pub fn node(&self, key: &str) -> Option<Node> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn edge(&self, key: &str) -> Option<Edge> {
        self.edges
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Nodes sorted by creation time.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        nodes
    }

    /// Edges sorted by creation time.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .edges
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        edges
    }

    pub fn clear(&self) {
        self.nodes.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.edges.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
