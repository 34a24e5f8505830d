//! JSON-lines command surface.
//!
//! Each stdin line is one command object tagged by `op`; each reply is one
//! JSON line tagged by `status`:
//!
//! ```text
//! {"op":"addNode","label":"A","positionX":0,"positionY":0}
//! {"status":"ok","result":{"id":{"kind":"ephemeral","value":"tmp_..."},...}}
//! ```
//!
//! Entity ids are given in their tagged form, exactly as they appear in
//! replies.

use graph_sync::{
    DrainReport, EdgePatch, EntityId, GatewayError, MutationError, NewNode, NodePatch, Payload,
    SessionError, SessionManager,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Command {
    AddNode {
        #[serde(flatten)]
        node: NewNode,
    },
    UpdateNode {
        id: EntityId,
        #[serde(flatten)]
        patch: NodePatch,
    },
    DeleteNode {
        id: EntityId,
    },
    AddEdge {
        #[serde(rename = "sourceId")]
        source_id: EntityId,
        #[serde(rename = "targetId")]
        target_id: EntityId,
        #[serde(default)]
        data: Payload,
    },
    UpdateEdge {
        id: EntityId,
        #[serde(flatten)]
        patch: EdgePatch,
    },
    DeleteEdge {
        id: EntityId,
    },
    /// Replay the offline queue now.
    Drain,
    /// Bulk-create ephemeral entities that nothing is queued for.
    Resync,
    /// Simulate network loss or recovery.
    SetNetwork {
        online: bool,
    },
    /// Current graph from the projection.
    Snapshot,
    Status,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid command: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No active session")]
    NotActive,

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Reply {
    Ok {
        #[serde(skip_serializing_if = "Value::is_null")]
        result: Value,
    },
    Error {
        error: String,
    },
}

impl Reply {
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({ "status": "error", "error": e.to_string() }).to_string()
        })
    }
}

impl From<Result<Value>> for Reply {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(result) => Reply::Ok { result },
            Err(e) => Reply::Error {
                error: e.to_string(),
            },
        }
    }
}

pub fn parse_line(line: &str) -> Result<Command> {
    Ok(serde_json::from_str(line)?)
}

/// Parse and run one input line, returning the reply line.
pub async fn handle_line(manager: &SessionManager, line: &str) -> String {
    let result = match parse_line(line) {
        Ok(command) => execute(manager, command).await,
        Err(e) => Err(e),
    };
    Reply::from(result).to_line()
}

pub async fn execute(manager: &SessionManager, command: Command) -> Result<Value> {
    debug!("Command: {:?}", command);
    let room = manager.room().ok_or(CommandError::NotActive)?;

    match command {
        Command::SetNetwork { online } => {
            let report = manager.set_network_reachable(online).await;
            return Ok(json!({ "online": online, "drained": report }));
        }
        Command::Status => return status(manager).await,
        Command::Snapshot => return snapshot(manager).await,
        Command::Drain => return Ok(to_value(manager.drain().await?)),
        _ => {}
    }

    let coordinator = manager.coordinator().await.ok_or(CommandError::NotActive)?;
    let value = match command {
        Command::AddNode { node } => to_value(coordinator.add_node(&room, node).await?),
        Command::UpdateNode { id, patch } => {
            to_value(coordinator.update_node(&room, &id, patch).await?)
        }
        Command::DeleteNode { id } => {
            coordinator.delete_node(&room, &id).await?;
            Value::Null
        }
        Command::AddEdge {
            source_id,
            target_id,
            data,
        } => to_value(coordinator.add_edge(&room, &source_id, &target_id, data).await?),
        Command::UpdateEdge { id, patch } => {
            to_value(coordinator.update_edge(&room, &id, patch).await?)
        }
        Command::DeleteEdge { id } => {
            coordinator.delete_edge(&room, &id).await?;
            Value::Null
        }
        Command::Resync => to_value::<DrainReport>(coordinator.sync_unsynced().await?),
        Command::SetNetwork { .. } | Command::Status | Command::Snapshot | Command::Drain => {
            Value::Null
        }
    };
    Ok(value)
}

async fn status(manager: &SessionManager) -> Result<Value> {
    let online = match manager.connectivity().await {
        Some(connectivity) => connectivity.is_online(),
        None => false,
    };
    let queued = match manager.coordinator().await {
        Some(coordinator) => coordinator.queue().len().await,
        None => 0,
    };
    Ok(json!({
        "state": manager.state(),
        "room": manager.room(),
        "online": online,
        "queued": queued,
    }))
}

async fn snapshot(manager: &SessionManager) -> Result<Value> {
    let projection = manager.projection().await.ok_or(CommandError::NotActive)?;
    Ok(json!({
        "room": manager.room(),
        "nodes": projection.nodes(),
        "edges": projection.edges(),
    }))
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
