//! REST client for the persisted store.
//!
//! Routes, relative to the configured base URL:
//!
//! | call                  | route                                   |
//! |-----------------------|-----------------------------------------|
//! | create_node           | `POST   /rooms/{room}/nodes`            |
//! | update_node           | `PATCH  /rooms/{room}/nodes/{id}`       |
//! | update_node_position  | `PATCH  /rooms/{room}/nodes/{id}/position` |
//! | delete_node           | `DELETE /rooms/{room}/nodes/{id}`       |
//! | create_edge           | `POST   /rooms/{room}/edges`            |
//! | update_edge           | `PATCH  /rooms/{room}/edges/{id}`       |
//! | delete_edge           | `DELETE /rooms/{room}/edges/{id}`       |
//! | bulk_sync             | `POST   /rooms/{room}/bulk-sync`        |
//! | room_snapshot         | `GET    /rooms/{room}/snapshot`         |
//!
//! Error statuses map onto `GatewayError`: 404 NotFound, 409 Conflict,
//! 400/422 Validation, anything else (and connection failures) Transport.

use async_trait::async_trait;
use graph_sync::gateway::{BulkSyncRequest, BulkSyncResponse, Gateway, GatewayError, Result};
use graph_sync::{CanonicalId, Edge, EdgePatch, NewEdge, NewNode, Node, NodePatch, RoomId, RoomSnapshot};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Request timeout for store calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PositionBody {
    position_x: f64,
    position_y: f64,
}

pub struct HttpGateway {
    base: Url,
    client: Client,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| GatewayError::Validation(format!("invalid gateway url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(GatewayError::Validation(format!(
                "gateway url {base_url} cannot be a base"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { base, client })
    }

    /// `base/rooms/{room}/{segments...}` with every segment percent-encoded.
    fn url(&self, room: &RoomId, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| GatewayError::Validation("gateway url cannot be a base".into()))?;
            path.pop_if_empty().push("rooms").push(room.as_str());
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!("{} {}", method, url);
        self.client.request(method, url)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = check(send(request).await?).await?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::Transport(format!("invalid response body: {e}")))
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<()> {
        check(send(request).await?).await.map(|_| ())
    }
}

async fn send(request: RequestBuilder) -> Result<Response> {
    request
        .send()
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))
}

/// Pass successful responses through; turn error statuses into `GatewayError`.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, &body))
}

/// Map an error status and its body onto the gateway taxonomy.
pub fn error_for_status(status: StatusCode, body: &str) -> GatewayError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.to_string()
            } else {
                body.to_string()
            }
        });

    match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(message),
        StatusCode::CONFLICT => GatewayError::Conflict(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => GatewayError::Validation(message),
        _ => GatewayError::Transport(format!("{status}: {message}")),
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn create_node(&self, room: &RoomId, node: &NewNode) -> Result<Node> {
        let url = self.url(room, &["nodes"])?;
        self.send_json(self.request(Method::POST, url).json(node)).await
    }

    async fn update_node(&self, room: &RoomId, id: &CanonicalId, patch: &NodePatch) -> Result<Node> {
        let url = self.url(room, &["nodes", id.as_str()])?;
        self.send_json(self.request(Method::PATCH, url).json(patch)).await
    }

    async fn update_node_position(&self, room: &RoomId, id: &CanonicalId, x: f64, y: f64) -> Result<Node> {
        let url = self.url(room, &["nodes", id.as_str(), "position"])?;
        let body = PositionBody {
            position_x: x,
            position_y: y,
        };
        self.send_json(self.request(Method::PATCH, url).json(&body)).await
    }

    async fn delete_node(&self, room: &RoomId, id: &CanonicalId) -> Result<()> {
        let url = self.url(room, &["nodes", id.as_str()])?;
        match self.send_empty(self.request(Method::DELETE, url)).await {
            Err(GatewayError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn create_edge(&self, room: &RoomId, edge: &NewEdge) -> Result<Edge> {
        let url = self.url(room, &["edges"])?;
        self.send_json(self.request(Method::POST, url).json(edge)).await
    }

    async fn update_edge(&self, room: &RoomId, id: &CanonicalId, patch: &EdgePatch) -> Result<Edge> {
        let url = self.url(room, &["edges", id.as_str()])?;
        self.send_json(self.request(Method::PATCH, url).json(patch)).await
    }

    async fn delete_edge(&self, room: &RoomId, id: &CanonicalId) -> Result<()> {
        let url = self.url(room, &["edges", id.as_str()])?;
        self.send_empty(self.request(Method::DELETE, url)).await
    }

    async fn bulk_sync(&self, room: &RoomId, request: &BulkSyncRequest) -> Result<BulkSyncResponse> {
        let url = self.url(room, &["bulk-sync"])?;
        self.send_json(self.request(Method::POST, url).json(request)).await
    }

    async fn room_snapshot(&self, room: &RoomId) -> Result<RoomSnapshot> {
        let url = self.url(room, &["snapshot"])?;
        self.send_json(self.request(Method::GET, url)).await
    }
}
