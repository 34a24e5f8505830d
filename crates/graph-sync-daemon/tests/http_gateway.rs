//! HttpGateway against a REST store served by axum over `InMemoryGateway`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use graph_sync::gateway::{BulkSyncRequest, BulkSyncResponse};
use graph_sync::{
    CanonicalId, Edge, EdgePatch, EntityId, Gateway, GatewayError, InMemoryBlobStore,
    InMemoryGateway, LoopbackHub, NewEdge, NewNode, Node, NodePatch, Payload, RoomId, RoomSnapshot,
    SessionManager, SyncConfig,
};
use graph_sync_daemon::HttpGateway;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

type Store = Arc<InMemoryGateway>;

fn room() -> RoomId {
    RoomId::new("team board").unwrap()
}

// ============================================================================
// Test store
// ============================================================================

struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self.0 {
            GatewayError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            GatewayError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            GatewayError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            GatewayError::Transport(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Position {
    position_x: f64,
    position_y: f64,
}

async fn create_node(
    State(store): State<Store>,
    Path(room): Path<RoomId>,
    Json(node): Json<NewNode>,
) -> ApiResult<Node> {
    Ok(Json(store.create_node(&room, &node).await?))
}

async fn update_node(
    State(store): State<Store>,
    Path((room, id)): Path<(RoomId, CanonicalId)>,
    Json(patch): Json<NodePatch>,
) -> ApiResult<Node> {
    Ok(Json(store.update_node(&room, &id, &patch).await?))
}

async fn move_node(
    State(store): State<Store>,
    Path((room, id)): Path<(RoomId, CanonicalId)>,
    Json(pos): Json<Position>,
) -> ApiResult<Node> {
    Ok(Json(
        store
            .update_node_position(&room, &id, pos.position_x, pos.position_y)
            .await?,
    ))
}

async fn delete_node(
    State(store): State<Store>,
    Path((room, id)): Path<(RoomId, CanonicalId)>,
) -> Result<StatusCode, ApiError> {
    store.delete_node(&room, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_edge(
    State(store): State<Store>,
    Path(room): Path<RoomId>,
    Json(edge): Json<NewEdge>,
) -> ApiResult<Edge> {
    Ok(Json(store.create_edge(&room, &edge).await?))
}

async fn update_edge(
    State(store): State<Store>,
    Path((room, id)): Path<(RoomId, CanonicalId)>,
    Json(patch): Json<EdgePatch>,
) -> ApiResult<Edge> {
    Ok(Json(store.update_edge(&room, &id, &patch).await?))
}

async fn delete_edge(
    State(store): State<Store>,
    Path((room, id)): Path<(RoomId, CanonicalId)>,
) -> Result<StatusCode, ApiError> {
    store.delete_edge(&room, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn bulk_sync(
    State(store): State<Store>,
    Path(room): Path<RoomId>,
    Json(request): Json<BulkSyncRequest>,
) -> ApiResult<BulkSyncResponse> {
    Ok(Json(store.bulk_sync(&room, &request).await?))
}

async fn snapshot(State(store): State<Store>, Path(room): Path<RoomId>) -> ApiResult<RoomSnapshot> {
    Ok(Json(store.room_snapshot(&room).await?))
}

struct TestStore {
    store: Store,
    url: String,
    task: JoinHandle<()>,
}

impl Drop for TestStore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_store() -> TestStore {
    let store = Arc::new(InMemoryGateway::new());
    store.create_room(room(), "Team board");

    let app = Router::new()
        .route("/api/rooms/{room}/nodes", post(create_node))
        .route("/api/rooms/{room}/nodes/{id}", patch(update_node).delete(delete_node))
        .route("/api/rooms/{room}/nodes/{id}/position", patch(move_node))
        .route("/api/rooms/{room}/edges", post(create_edge))
        .route("/api/rooms/{room}/edges/{id}", patch(update_edge).delete(delete_edge))
        .route("/api/rooms/{room}/bulk-sync", post(bulk_sync))
        .route("/api/rooms/{room}/snapshot", get(snapshot))
        .with_state(Arc::clone(&store));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestStore {
        store,
        url: format!("http://{addr}/api"),
        task,
    }
}

// ============================================================================
// Gateway calls
// ============================================================================

#[tokio::test]
async fn test_node_and_edge_crud() {
    let server = serve_store().await;
    let gateway = HttpGateway::new(&server.url).unwrap();

    let a = gateway
        .create_node(&room(), &NewNode::new("A", 0.0, 0.0))
        .await
        .unwrap();
    let b = gateway
        .create_node(&room(), &NewNode::new("B", 10.0, 0.0))
        .await
        .unwrap();
    let a_id = a.id.as_canonical().unwrap().clone();
    let b_id = b.id.as_canonical().unwrap().clone();

    let renamed = gateway
        .update_node(
            &room(),
            &a_id,
            &NodePatch {
                label: Some("Alpha".into()),
                ..NodePatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.label, "Alpha");

    let moved = gateway
        .update_node_position(&room(), &a_id, 3.0, 4.0)
        .await
        .unwrap();
    assert_eq!((moved.position_x, moved.position_y), (3.0, 4.0));
    assert_eq!(moved.label, "Alpha");

    let edge = gateway
        .create_edge(
            &room(),
            &NewEdge {
                source_id: a_id.clone(),
                target_id: b_id.clone(),
                data: Default::default(),
            },
        )
        .await
        .unwrap();
    let edge_id = edge.id.as_canonical().unwrap().clone();
    let mut data = Payload::new();
    data.insert("weight".into(), json!(2));
    let weighted = gateway
        .update_edge(&room(), &edge_id, &EdgePatch { data: Some(data) })
        .await
        .unwrap();
    assert_eq!(weighted.data["weight"], 2);

    let snapshot = gateway.room_snapshot(&room()).await.unwrap();
    assert_eq!(snapshot.room.id, room());
    assert_eq!(snapshot.nodes.len(), 2);
    assert_eq!(snapshot.edges.len(), 1);

    // Deleting a node cascades to its edges on the store side.
    gateway.delete_node(&room(), &a_id).await.unwrap();
    assert_eq!(server.store.nodes(&room()).len(), 1);
    assert!(server.store.edges(&room()).is_empty());
}

#[tokio::test]
async fn test_store_errors_map_to_gateway_errors() {
    let server = serve_store().await;
    let gateway = HttpGateway::new(&server.url).unwrap();

    let a = gateway.create_node(&room(), &NewNode::new("A", 0.0, 0.0)).await.unwrap();
    let a_id = a.id.as_canonical().unwrap().clone();
    let self_loop = NewEdge {
        source_id: a_id.clone(),
        target_id: a_id.clone(),
        data: Default::default(),
    };
    gateway.create_edge(&room(), &self_loop).await.unwrap();

    let duplicate = gateway.create_edge(&room(), &self_loop).await.unwrap_err();
    assert!(matches!(duplicate, GatewayError::Conflict(_)), "{duplicate:?}");

    let ghost = CanonicalId::new("ghost").unwrap();
    let missing = gateway
        .update_node(&room(), &ghost, &NodePatch::default())
        .await
        .unwrap_err();
    assert!(missing.is_not_found(), "{missing:?}");

    // Deleting an absent node is not an error; deleting an absent edge is.
    gateway.delete_node(&room(), &ghost).await.unwrap();
    assert!(gateway.delete_edge(&room(), &ghost).await.unwrap_err().is_not_found());

    let unknown = gateway
        .room_snapshot(&RoomId::new("nowhere").unwrap())
        .await
        .unwrap_err();
    assert!(unknown.is_not_found(), "{unknown:?}");

    server.store.fail_next(GatewayError::Transport("maintenance".into()));
    let down = gateway.room_snapshot(&room()).await.unwrap_err();
    assert!(down.is_transport(), "{down:?}");
}

#[tokio::test]
async fn test_bulk_sync_resolves_ephemeral_endpoints() {
    let server = serve_store().await;
    let gateway = HttpGateway::new(&server.url).unwrap();

    let request: BulkSyncRequest = serde_json::from_value(json!({
        "nodes": [
            { "ephemeralId": "tmp_1_000000000000000a", "label": "A", "positionX": 0, "positionY": 0 }
        ],
        "edges": [
            {
                "ephemeralId": "tmp_1_000000000000000e",
                "sourceId": { "kind": "ephemeral", "value": "tmp_1_000000000000000a" },
                "targetId": { "kind": "ephemeral", "value": "tmp_1_000000000000000a" }
            }
        ]
    }))
    .unwrap();

    let response = gateway.bulk_sync(&room(), &request).await.unwrap();
    assert_eq!(response.nodes.len(), 1);
    assert_eq!(response.edges.len(), 1);
    assert!(response.failed.is_empty());

    let node_id = EntityId::Canonical(response.nodes[0].server_id.clone());
    let edge = &response.edges[0].edge;
    assert_eq!(edge.source_id, node_id);
    assert_eq!(edge.target_id, node_id);
    assert_eq!(server.store.edges(&room()).len(), 1);
}

// ============================================================================
// Sessions over HTTP
// ============================================================================

#[tokio::test]
async fn test_session_over_http_requeues_when_store_is_down() {
    let server = serve_store().await;
    let gateway = HttpGateway::with_timeout(&server.url, Duration::from_secs(5)).unwrap();
    let manager = SessionManager::new(
        Arc::new(gateway),
        Arc::new(LoopbackHub::new().transport()),
        Arc::new(InMemoryBlobStore::new()),
        SyncConfig::default(),
    );
    manager.initialize(room()).await.unwrap();
    let mut online = manager.connectivity().await.unwrap().subscribe();
    online.wait_for(|online| *online).await.unwrap();
    let coordinator = manager.coordinator().await.unwrap();

    let a = coordinator
        .add_node(&room(), NewNode::new("A", 0.0, 0.0))
        .await
        .unwrap();
    assert!(!a.id.is_ephemeral());

    // A 503 from the store keeps the create locally and queues it. The
    // session retries on its own; the edge follows whichever id B has by then.
    server.store.fail_next(GatewayError::Transport("maintenance".into()));
    let b = coordinator
        .add_node(&room(), NewNode::new("B", 1.0, 1.0))
        .await
        .unwrap();
    assert!(b.id.is_ephemeral());

    coordinator
        .add_edge(&room(), &a.id, &b.id, Default::default())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !(coordinator.queue().is_empty().await && server.store.edges(&room()).len() == 1) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Queued create and edge never reached the store");
    assert!(!coordinator.resolve(&b.id).is_ephemeral());

    let stored = server.store.edges(&room());
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].source_id, a.id);
    assert_eq!(stored[0].target_id, coordinator.resolve(&b.id));
    assert_eq!(server.store.nodes(&room()).len(), 2);

    manager.cleanup().await;
}
