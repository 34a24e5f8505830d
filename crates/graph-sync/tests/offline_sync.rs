//! End-to-end scenarios across sessions, the offline queue and the store.

use graph_sync::gateway::GatewayCall;
use graph_sync::{
    BlobStore, DrainMode, EntityId, GatewayError, InMemoryBlobStore, InMemoryGateway, LoopbackHub,
    NewNode, NodePatch, Payload, RoomId, SessionManager, SyncConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn room() -> RoomId {
    RoomId::new("board").unwrap()
}

struct Peer {
    manager: SessionManager,
}

impl Peer {
    fn new(
        gateway: &Arc<InMemoryGateway>,
        hub: &LoopbackHub,
        store: Arc<dyn BlobStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            manager: SessionManager::new(
                gateway.clone(),
                Arc::new(hub.transport()),
                store,
                config,
            ),
        }
    }

    async fn start(&self) {
        self.manager.initialize(room()).await.unwrap();
        let mut online = self.manager.connectivity().await.unwrap().subscribe();
        online.wait_for(|online| *online).await.unwrap();
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn setup() -> (Arc<InMemoryGateway>, LoopbackHub) {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.create_room(room(), "Board");
    (gateway, LoopbackHub::new())
}

#[tokio::test]
async fn test_offline_edits_reconcile_on_reconnect() {
    let (gateway, hub) = setup();
    let peer = Peer::new(&gateway, &hub, Arc::new(InMemoryBlobStore::new()), SyncConfig::default());
    peer.start().await;
    let coordinator = peer.manager.coordinator().await.unwrap();

    peer.manager.set_network_reachable(false).await;
    let a = coordinator
        .add_node(&room(), NewNode::new("A", 0.0, 0.0))
        .await
        .unwrap();
    let b = coordinator
        .add_node(&room(), NewNode::new("B", 10.0, 0.0))
        .await
        .unwrap();
    let edge = coordinator
        .add_edge(&room(), &a.id, &b.id, Payload::new())
        .await
        .unwrap();
    assert!(a.id.is_ephemeral() && b.id.is_ephemeral() && edge.id.is_ephemeral());
    assert_eq!(coordinator.queue().len().await, 3);
    assert!(gateway.nodes(&room()).is_empty());

    let report = peer.manager.set_network_reachable(true).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.promoted, 3);
    assert!(coordinator.queue().is_empty().await);

    let doc = coordinator.document();
    assert!(doc.get_node(&a.id).is_none());
    assert!(doc.get_edge(&edge.id).is_none());
    assert!(doc.nodes().iter().all(|n| !n.id.is_ephemeral()));

    let edges = doc.edges();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].source_id, coordinator.resolve(&a.id));
    assert_eq!(edges[0].target_id, coordinator.resolve(&b.id));
    assert!(!edges[0].source_id.is_ephemeral());

    let server_edges = gateway.edges(&room());
    assert_eq!(server_edges.len(), 1);
    assert_eq!(server_edges[0].id, edges[0].id);
}

#[tokio::test]
async fn test_batched_drain_reconciles_self_loop() {
    let (gateway, hub) = setup();
    let config = SyncConfig {
        drain_mode: DrainMode::Batched,
        ..SyncConfig::default()
    };
    let peer = Peer::new(&gateway, &hub, Arc::new(InMemoryBlobStore::new()), config);
    peer.start().await;
    let coordinator = peer.manager.coordinator().await.unwrap();

    peer.manager.set_network_reachable(false).await;
    let a = coordinator
        .add_node(&room(), NewNode::new("A", 0.0, 0.0))
        .await
        .unwrap();
    coordinator
        .add_edge(&room(), &a.id, &a.id, Payload::new())
        .await
        .unwrap();
    gateway.clear_calls();

    let report = peer.manager.set_network_reachable(true).await.unwrap();
    assert_eq!(report.promoted, 2);
    assert_eq!(
        gateway.calls(),
        vec![GatewayCall::BulkSync { nodes: 1, edges: 1 }]
    );

    let canonical = coordinator.resolve(&a.id);
    let edges = coordinator.document().edges();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].source_id, canonical);
    assert_eq!(edges[0].target_id, canonical);
}

#[tokio::test]
async fn test_queue_and_cache_survive_restart() {
    let (gateway, hub) = setup();
    let store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());

    let first = Peer::new(&gateway, &hub, Arc::clone(&store), SyncConfig::default());
    first.start().await;
    first.manager.set_network_reachable(false).await;
    let node = first
        .manager
        .coordinator()
        .await
        .unwrap()
        .add_node(&room(), NewNode::new("draft", 1.0, 2.0))
        .await
        .unwrap();
    first.manager.cleanup().await;
    assert!(gateway.nodes(&room()).is_empty());

    // A fresh process on the same storage comes up online and replays the queue.
    let second = Peer::new(&gateway, &hub, store, SyncConfig::default());
    second.start().await;
    eventually("queued create to reach the store", || {
        gateway.nodes(&room()).len() == 1
    })
    .await;

    let doc = second.manager.document().await.unwrap();
    eventually("local promotion", || doc.get_node(&node.id).is_none()).await;
    let nodes = doc.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].label, "draft");
    assert_eq!(nodes[0].id, gateway.nodes(&room())[0].id);
}

#[tokio::test]
async fn test_cascade_delete_leaves_no_dangling_edges() {
    let (gateway, hub) = setup();
    let peer = Peer::new(&gateway, &hub, Arc::new(InMemoryBlobStore::new()), SyncConfig::default());
    peer.start().await;
    let coordinator = peer.manager.coordinator().await.unwrap();

    let a = coordinator
        .add_node(&room(), NewNode::new("A", 0.0, 0.0))
        .await
        .unwrap();
    let b = coordinator
        .add_node(&room(), NewNode::new("B", 0.0, 0.0))
        .await
        .unwrap();
    let c = coordinator
        .add_node(&room(), NewNode::new("C", 0.0, 0.0))
        .await
        .unwrap();
    coordinator
        .add_edge(&room(), &a.id, &b.id, Payload::new())
        .await
        .unwrap();
    coordinator
        .add_edge(&room(), &c.id, &a.id, Payload::new())
        .await
        .unwrap();
    coordinator
        .add_edge(&room(), &b.id, &c.id, Payload::new())
        .await
        .unwrap();

    coordinator.delete_node(&room(), &a.id).await.unwrap();

    let doc = coordinator.document();
    for edge in doc.edges() {
        assert!(doc.contains_node(&edge.source_id));
        assert!(doc.contains_node(&edge.target_id));
    }
    assert_eq!(doc.edge_count(), 1);
    assert_eq!(gateway.edges(&room()).len(), 1);

    let projection = peer.manager.projection().await.unwrap();
    assert_eq!(projection.edges().len(), 1);
    assert!(projection.node(a.id.as_key()).is_none());

    // Deleting again, or deleting something that never existed, is fine.
    coordinator.delete_node(&room(), &a.id).await.unwrap();
    coordinator
        .delete_node(&room(), &EntityId::ephemeral())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_position_only_update_keeps_label_and_data() {
    let (gateway, hub) = setup();
    let peer = Peer::new(&gateway, &hub, Arc::new(InMemoryBlobStore::new()), SyncConfig::default());
    peer.start().await;
    let coordinator = peer.manager.coordinator().await.unwrap();

    let mut data = Payload::new();
    data.insert("color".into(), "red".into());
    let node = coordinator
        .add_node(&room(), NewNode::new("A", 1.0, 2.0).with_data(data.clone()))
        .await
        .unwrap();

    let patch = NodePatch {
        position_x: Some(5.0),
        ..NodePatch::default()
    };
    let updated = coordinator
        .update_node(&room(), &node.id, patch)
        .await
        .unwrap();

    assert_eq!(updated.position_x, 5.0);
    assert_eq!(updated.position_y, 2.0);
    assert_eq!(updated.label, "A");
    assert_eq!(updated.data, data);
    let server = &gateway.nodes(&room())[0];
    assert_eq!(server.label, "A");
    assert_eq!(server.data, data);
    assert_eq!(server.position_x, 5.0);
}

#[tokio::test]
async fn test_rejected_create_is_recovered_by_bulk_sync() {
    let (gateway, hub) = setup();
    let peer = Peer::new(&gateway, &hub, Arc::new(InMemoryBlobStore::new()), SyncConfig::default());
    peer.start().await;
    let coordinator = peer.manager.coordinator().await.unwrap();

    gateway.fail_next(GatewayError::Validation("try later".into()));
    let node = coordinator
        .add_node(&room(), NewNode::new("A", 0.0, 0.0))
        .await
        .unwrap();
    assert!(node.id.is_ephemeral());
    assert!(coordinator.queue().is_empty().await);

    let report = coordinator.sync_unsynced().await.unwrap();
    assert_eq!(report.promoted, 1);
    let canonical = coordinator.resolve(&node.id);
    assert!(!canonical.is_ephemeral());
    assert!(coordinator.document().contains_node(&canonical));
    assert_eq!(gateway.nodes(&room()).len(), 1);
}

#[tokio::test]
async fn test_peers_converge_through_loopback_hub() {
    let (gateway, hub) = setup();
    let alice = Peer::new(&gateway, &hub, Arc::new(InMemoryBlobStore::new()), SyncConfig::default());
    let bob = Peer::new(&gateway, &hub, Arc::new(InMemoryBlobStore::new()), SyncConfig::default());
    alice.start().await;
    bob.start().await;

    let alice_coord = alice.manager.coordinator().await.unwrap();
    let bob_coord = bob.manager.coordinator().await.unwrap();
    let node = alice_coord
        .add_node(&room(), NewNode::new("shared", 0.0, 0.0))
        .await
        .unwrap();

    let bob_doc = bob.manager.document().await.unwrap();
    eventually("bob to see alice's node", || bob_doc.contains_node(&node.id)).await;

    // Both edit the same node at once.
    let rename = |label: &str| NodePatch {
        label: Some(label.to_string()),
        ..NodePatch::default()
    };
    let board = room();
    let (left, right) = tokio::join!(
        alice_coord.update_node(&board, &node.id, rename("from alice")),
        bob_coord.update_node(&board, &node.id, rename("from bob")),
    );
    left.unwrap();
    right.unwrap();

    let alice_doc = alice.manager.document().await.unwrap();
    eventually("both documents to agree", || {
        match (alice_doc.get_node(&node.id), bob_doc.get_node(&node.id)) {
            (Some(a), Some(b)) => a.label == b.label,
            _ => false,
        }
    })
    .await;
    let label = alice_doc.get_node(&node.id).unwrap().label;
    assert!(label == "from alice" || label == "from bob");

    // A delete on one side removes the node and its edges on the other.
    let other = bob_coord
        .add_node(&room(), NewNode::new("other", 1.0, 1.0))
        .await
        .unwrap();
    eventually("alice to see bob's node", || alice_doc.contains_node(&other.id)).await;
    alice_coord
        .add_edge(&room(), &node.id, &other.id, Payload::new())
        .await
        .unwrap();
    eventually("bob to see the edge", || bob_doc.edge_count() == 1).await;

    bob_coord.delete_node(&room(), &other.id).await.unwrap();
    eventually("alice to drop the node and edge", || {
        !alice_doc.contains_node(&other.id) && alice_doc.edge_count() == 0
    })
    .await;
}
