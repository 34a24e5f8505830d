//! GraphDocument: Loro document holding one room's graph.
//!
//! The document has two root maps:
//! - `nodes`: node key -> JSON-encoded `Node`
//! - `edges`: edge key -> JSON-encoded `Edge`
//!
//! Keys are `EntityId::as_key()`. Concurrent writers converge through Loro's
//! per-key last-writer-wins map semantics. Every committed change, local or
//! imported from a peer, is reported to observers as a batch of `DocChange`s
//! after the write completes, so observers may read the document again.

use crate::events::{EventBus, Subscription};
use crate::ids::EntityId;
use crate::model::{Edge, Node};
use loro::{ExportMode, LoroDoc, LoroMap, LoroValue, ValueOrContainer, VersionVector};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

const NODES: &str = "nodes";
const EDGES: &str = "edges";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Nodes,
    Edges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOrigin {
    /// Written through this document handle
    Local,
    /// Imported from a peer or the local cache
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "entity", rename_all = "camelCase")]
pub enum GraphEntity {
    Node(Node),
    Edge(Edge),
}

/// One key-level change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocChange {
    pub collection: Collection,
    pub action: ChangeAction,
    pub key: String,
    /// New value; `None` for deletes.
    pub entity: Option<GraphEntity>,
}

/// A batch of changes committed together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentEvent {
    pub origin: ChangeOrigin,
    pub changes: Vec<DocChange>,
}

/// Replicated document for a single room.
pub struct GraphDocument {
    doc: LoroDoc,
    observers: Arc<EventBus<DocumentEvent>>,
    /// Version last handed to the realtime transport
    last_published: Mutex<VersionVector>,
    /// Serializes imports so before/after projections are not interleaved
    import_lock: Mutex<()>,
}

impl GraphDocument {
    pub fn new() -> Self {
        let doc = LoroDoc::new();
        let last_published = doc.oplog_vv();
        Self {
            doc,
            observers: Arc::new(EventBus::new()),
            last_published: Mutex::new(last_published),
            import_lock: Mutex::new(()),
        }
    }

    /// Register a listener for committed changes.
    pub fn observe(&self, listener: impl Fn(&DocumentEvent) + Send + Sync + 'static) -> Subscription {
        self.observers.subscribe(listener)
    }

    fn nodes_map(&self) -> LoroMap {
        self.doc.get_map(NODES)
    }

    fn edges_map(&self) -> LoroMap {
        self.doc.get_map(EDGES)
    }

    pub fn get_node(&self, id: &EntityId) -> Option<Node> {
        read_entry(&self.nodes_map(), id.as_key())
    }

    pub fn get_edge(&self, id: &EntityId) -> Option<Edge> {
        read_entry(&self.edges_map(), id.as_key())
    }

    pub fn contains_node(&self, id: &EntityId) -> bool {
        self.nodes_map().get(id.as_key()).is_some()
    }

    /// All nodes currently in the document.
    pub fn nodes(&self) -> Vec<Node> {
        read_all(&self.nodes_map())
    }

    /// All edges currently in the document.
    pub fn edges(&self) -> Vec<Edge> {
        read_all(&self.edges_map())
    }

    pub fn node_count(&self) -> usize {
        self.nodes_map().len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges_map().len()
    }

    /// Every edge with `node_id` as source or target. Scans all edges.
    pub fn edges_incident_to(&self, node_id: &EntityId) -> Vec<Edge> {
        self.edges()
            .into_iter()
            .filter(|edge| edge.references(node_id))
            .collect()
    }

    pub fn find_edge_between(&self, source: &EntityId, target: &EntityId) -> Option<Edge> {
        self.edges()
            .into_iter()
            .find(|edge| &edge.source_id == source && &edge.target_id == target)
    }

    pub fn has_edge_between(&self, source: &EntityId, target: &EntityId) -> bool {
        self.find_edge_between(source, target).is_some()
    }

    /// Remove every edge whose source or target node is missing.
    ///
    /// Concurrent peers can produce such edges (one adds an edge while the
    /// other deletes its endpoint). Returns the number of edges removed.
    pub fn prune_dangling_edges(&self) -> Result<usize> {
        let nodes = self.nodes_map();
        let dangling: Vec<Edge> = self
            .edges()
            .into_iter()
            .filter(|edge| {
                nodes.get(edge.source_id.as_key()).is_none()
                    || nodes.get(edge.target_id.as_key()).is_none()
            })
            .collect();
        if dangling.is_empty() {
            return Ok(0);
        }
        self.transact(|txn| {
            for edge in &dangling {
                txn.delete_edge(&edge.id)?;
            }
            Ok(dangling.len())
        })
    }

    pub fn set_node(&self, node: &Node) -> Result<()> {
        self.transact(|txn| txn.set_node(node))
    }

    /// Remove a node key. Returns whether it existed.
    pub fn delete_node(&self, id: &EntityId) -> Result<bool> {
        self.transact(|txn| txn.delete_node(id))
    }

    pub fn set_edge(&self, edge: &Edge) -> Result<()> {
        self.transact(|txn| txn.set_edge(edge))
    }

    /// Remove an edge key. Returns whether it existed.
    pub fn delete_edge(&self, id: &EntityId) -> Result<bool> {
        self.transact(|txn| txn.delete_edge(id))
    }

    /// Apply several writes as one commit and one observer notification.
    ///
    /// Writes made before an error inside `f` stay applied.
    pub fn transact<R>(&self, f: impl FnOnce(&mut DocumentTxn) -> Result<R>) -> Result<R> {
        let mut txn = DocumentTxn {
            nodes: self.nodes_map(),
            edges: self.edges_map(),
            changes: Vec::new(),
        };
        let result = f(&mut txn);
        self.doc.commit();

        if !txn.changes.is_empty() {
            self.observers.emit(DocumentEvent {
                origin: ChangeOrigin::Local,
                changes: txn.changes,
            });
        }
        result
    }

    /// Current version vector
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Export full snapshot
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Export updates since a version
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(from))
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Updates committed since the previous call, for the realtime transport.
    pub fn take_pending_update(&self) -> Result<Option<Vec<u8>>> {
        let mut last = self.last_published.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.doc.oplog_vv();
        if current == *last {
            return Ok(None);
        }
        let update = self.export_updates(&last)?;
        *last = current;
        Ok(Some(update))
    }

    /// Import a snapshot or update from a peer and notify observers of the
    /// resulting key-level changes.
    pub fn import(&self, data: &[u8]) -> Result<()> {
        let _guard = self.import_lock.lock().unwrap_or_else(|e| e.into_inner());

        let nodes_before = raw_entries(&self.nodes_map());
        let edges_before = raw_entries(&self.edges_map());

        self.doc
            .import(data)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;

        let mut changes = diff_entries(
            Collection::Nodes,
            &nodes_before,
            &raw_entries(&self.nodes_map()),
        );
        changes.extend(diff_entries(
            Collection::Edges,
            &edges_before,
            &raw_entries(&self.edges_map()),
        ));

        if !changes.is_empty() {
            self.observers.emit(DocumentEvent {
                origin: ChangeOrigin::Remote,
                changes,
            });
        }
        Ok(())
    }
}

impl Default for GraphDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Write handle passed to `GraphDocument::transact`.
pub struct DocumentTxn {
    nodes: LoroMap,
    edges: LoroMap,
    changes: Vec<DocChange>,
}

impl DocumentTxn {
    pub fn set_node(&mut self, node: &Node) -> Result<()> {
        let key = node.id.as_key();
        let action = upsert_action(&self.nodes, key);
        write_entry(&self.nodes, key, node)?;
        self.changes.push(DocChange {
            collection: Collection::Nodes,
            action,
            key: key.to_string(),
            entity: Some(GraphEntity::Node(node.clone())),
        });
        Ok(())
    }

    pub fn delete_node(&mut self, id: &EntityId) -> Result<bool> {
        self.delete(Collection::Nodes, id)
    }

    pub fn set_edge(&mut self, edge: &Edge) -> Result<()> {
        let key = edge.id.as_key();
        let action = upsert_action(&self.edges, key);
        write_entry(&self.edges, key, edge)?;
        self.changes.push(DocChange {
            collection: Collection::Edges,
            action,
            key: key.to_string(),
            entity: Some(GraphEntity::Edge(edge.clone())),
        });
        Ok(())
    }

    pub fn delete_edge(&mut self, id: &EntityId) -> Result<bool> {
        self.delete(Collection::Edges, id)
    }

    fn delete(&mut self, collection: Collection, id: &EntityId) -> Result<bool> {
        let map = match collection {
            Collection::Nodes => &self.nodes,
            Collection::Edges => &self.edges,
        };
        let key = id.as_key();
        if map.get(key).is_none() {
            return Ok(false);
        }
        map.delete(key)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.changes.push(DocChange {
            collection,
            action: ChangeAction::Delete,
            key: key.to_string(),
            entity: None,
        });
        Ok(true)
    }
}

fn upsert_action(map: &LoroMap, key: &str) -> ChangeAction {
    if map.get(key).is_some() {
        ChangeAction::Update
    } else {
        ChangeAction::Add
    }
}

fn write_entry<T: Serialize>(map: &LoroMap, key: &str, value: &T) -> Result<()> {
    let json =
        serde_json::to_string(value).map_err(|e| DocumentError::Serialization(e.to_string()))?;
    map.insert(key, json)
        .map_err(|e| DocumentError::Loro(e.to_string()))
}

fn read_entry<T: serde::de::DeserializeOwned>(map: &LoroMap, key: &str) -> Option<T> {
    match map.get(key) {
        Some(ValueOrContainer::Value(LoroValue::String(s))) => parse_entry(key, &s),
        _ => None,
    }
}

fn read_all<T: serde::de::DeserializeOwned>(map: &LoroMap) -> Vec<T> {
    raw_entries(map)
        .iter()
        .filter_map(|(key, json)| parse_entry(key, json))
        .collect()
}

fn parse_entry<T: serde::de::DeserializeOwned>(key: &str, json: &str) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Skipping malformed document entry {}: {}", key, e);
            None
        }
    }
}

/// Key -> raw JSON for every string entry of a map.
fn raw_entries(map: &LoroMap) -> HashMap<String, String> {
    match map.get_deep_value() {
        LoroValue::Map(entries) => entries
            .iter()
            .filter_map(|(key, value)| match value {
                LoroValue::String(s) => Some((key.clone(), s.to_string())),
                _ => None,
            })
            .collect(),
        _ => HashMap::new(),
    }
}

fn diff_entries(
    collection: Collection,
    before: &HashMap<String, String>,
    after: &HashMap<String, String>,
) -> Vec<DocChange> {
    let mut changes = Vec::new();

    for (key, json) in after {
        let action = match before.get(key) {
            None => ChangeAction::Add,
            Some(old) if old != json => ChangeAction::Update,
            Some(_) => continue,
        };
        let entity = match collection {
            Collection::Nodes => parse_entry::<Node>(key, json).map(GraphEntity::Node),
            Collection::Edges => parse_entry::<Edge>(key, json).map(GraphEntity::Edge),
        };
        changes.push(DocChange {
            collection,
            action,
            key: key.clone(),
            entity,
        });
    }

    for key in before.keys().filter(|key| !after.contains_key(*key)) {
        changes.push(DocChange {
            collection,
            action: ChangeAction::Delete,
            key: key.clone(),
            entity: None,
        });
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CanonicalId, RoomId};
    use crate::model::{NewNode, NodePatch, Payload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn room() -> RoomId {
        RoomId::new("room-1").unwrap()
    }

    fn node(label: &str) -> Node {
        Node::ephemeral(room(), NewNode::new(label, 0.0, 0.0))
    }

    #[test]
    fn test_set_get_delete_node() {
        let doc = GraphDocument::new();
        let a = node("A");
        doc.set_node(&a).unwrap();

        assert_eq!(doc.get_node(&a.id), Some(a.clone()));
        assert_eq!(doc.node_count(), 1);

        assert!(doc.delete_node(&a.id).unwrap());
        assert!(doc.get_node(&a.id).is_none());
        assert!(!doc.delete_node(&a.id).unwrap());
    }

    #[test]
    fn test_incident_edges() {
        let doc = GraphDocument::new();
        let (a, b, c) = (node("A"), node("B"), node("C"));
        for n in [&a, &b, &c] {
            doc.set_node(n).unwrap();
        }
        let ab = Edge::ephemeral(room(), a.id.clone(), b.id.clone(), Payload::new());
        let bc = Edge::ephemeral(room(), b.id.clone(), c.id.clone(), Payload::new());
        doc.set_edge(&ab).unwrap();
        doc.set_edge(&bc).unwrap();

        assert_eq!(doc.edges_incident_to(&a.id), vec![ab.clone()]);
        assert_eq!(doc.edges_incident_to(&b.id).len(), 2);
        assert_eq!(doc.find_edge_between(&a.id, &b.id), Some(ab));
        assert!(doc.find_edge_between(&b.id, &a.id).is_none());
    }

    #[test]
    fn test_local_changes_reach_observers() {
        let doc = GraphDocument::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let _sub = doc.observe(move |event| {
            events_clone.lock().unwrap().push(event.clone());
        });

        let mut a = node("A");
        doc.set_node(&a).unwrap();
        a.apply_patch(&NodePatch::position(3.0, 4.0));
        doc.set_node(&a).unwrap();
        doc.delete_node(&a.id).unwrap();

        let events = events.lock().unwrap();
        let actions: Vec<_> = events.iter().map(|e| e.changes[0].action).collect();
        assert_eq!(
            actions,
            vec![ChangeAction::Add, ChangeAction::Update, ChangeAction::Delete]
        );
        assert!(events.iter().all(|e| e.origin == ChangeOrigin::Local));
    }

    #[test]
    fn test_transaction_emits_single_batch() {
        let doc = GraphDocument::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = doc.observe(move |event| {
            assert_eq!(event.changes.len(), 2);
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        doc.transact(|txn| {
            txn.set_node(&node("A"))?;
            txn.set_node(&node("B"))
        })
        .unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_import_reports_remote_changes() {
        let source = GraphDocument::new();
        let replica = GraphDocument::new();

        let a = node("A");
        source.set_node(&a).unwrap();
        replica.import(&source.export_snapshot().unwrap()).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let _sub = replica.observe(move |event| {
            events_clone.lock().unwrap().push(event.clone());
        });

        let since = source.version();
        let b = node("B");
        source.set_node(&b).unwrap();
        source.delete_node(&a.id).unwrap();
        replica.import(&source.export_updates(&since).unwrap()).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, ChangeOrigin::Remote);
        let mut actions: Vec<_> = events[0]
            .changes
            .iter()
            .map(|c| (c.key.clone(), c.action))
            .collect();
        actions.sort_by(|x, y| x.0.cmp(&y.0));
        let mut expected = vec![
            (a.id.as_key().to_string(), ChangeAction::Delete),
            (b.id.as_key().to_string(), ChangeAction::Add),
        ];
        expected.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(actions, expected);
        assert_eq!(replica.get_node(&b.id), Some(b));
    }

    #[test]
    fn test_reimport_is_silent() {
        let source = GraphDocument::new();
        source.set_node(&node("A")).unwrap();
        let snapshot = source.export_snapshot().unwrap();

        let replica = GraphDocument::new();
        replica.import(&snapshot).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = replica.observe(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        replica.import(&snapshot).unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_take_pending_update() {
        let doc = GraphDocument::new();
        assert!(doc.take_pending_update().unwrap().is_none());

        doc.set_node(&node("A")).unwrap();
        let update = doc.take_pending_update().unwrap().expect("pending update");
        assert!(doc.take_pending_update().unwrap().is_none());

        let replica = GraphDocument::new();
        replica.import(&update).unwrap();
        assert_eq!(replica.node_count(), 1);
    }

    #[test]
    fn test_concurrent_writers_converge() {
        let left = GraphDocument::new();
        let right = GraphDocument::new();
        let mut shared = node("shared");
        shared.id = EntityId::Canonical(CanonicalId::new("n-1").unwrap());
        left.set_node(&shared).unwrap();
        right.import(&left.export_snapshot().unwrap()).unwrap();

        let mut from_left = shared.clone();
        from_left.apply_patch(&NodePatch::position(1.0, 1.0));
        let mut from_right = shared.clone();
        from_right.apply_patch(&NodePatch::position(9.0, 9.0));
        left.set_node(&from_left).unwrap();
        right.set_node(&from_right).unwrap();

        left.import(&right.export_snapshot().unwrap()).unwrap();
        right.import(&left.export_snapshot().unwrap()).unwrap();

        let winner = left.get_node(&shared.id).unwrap();
        assert_eq!(right.get_node(&shared.id).unwrap(), winner);
        assert!(winner == from_left || winner == from_right);
    }

    #[test]
    fn test_prune_dangling_edges() {
        let doc = GraphDocument::new();
        let (a, b) = (node("A"), node("B"));
        doc.set_node(&a).unwrap();
        doc.set_node(&b).unwrap();
        let edge = Edge::ephemeral(room(), a.id.clone(), b.id.clone(), Payload::new());
        doc.set_edge(&edge).unwrap();
        assert_eq!(doc.prune_dangling_edges().unwrap(), 0);

        doc.nodes_map().delete(b.id.as_key()).unwrap();
        assert_eq!(doc.prune_dangling_edges().unwrap(), 1);
        assert_eq!(doc.edge_count(), 0);
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let doc = GraphDocument::new();
        doc.nodes_map().insert("garbage", "not json").unwrap();
        doc.set_node(&node("A")).unwrap();
        assert_eq!(doc.nodes().len(), 1);
    }
}
