//! graph-sync: offline-first reconciliation engine for collaboratively edited
//! room graphs, built on Loro CRDTs.
//!
//! This crate provides:
//! - A replicated room document of nodes and edges (`GraphDocument`)
//! - Optimistic mutations with online/offline persistence (`MutationCoordinator`)
//! - A durable offline queue replayed on reconnect (`OfflineQueue`)
//! - Ephemeral -> canonical id reconciliation, single and batched (`reconcile`)
//! - Session lifecycle management (`SessionManager`)
//! - Gateway, transport and blob-store trait abstractions with in-memory doubles

pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod document;
pub mod events;
pub mod gateway;
pub mod ids;
pub mod model;
pub mod offline_queue;
pub mod projection;
pub mod providers;
pub mod reconcile;
pub mod session;
pub mod storage;

pub use config::{DrainMode, SyncConfig};
pub use connectivity::{ConnectivityMonitor, Transition, TransportStatus};
pub use coordinator::{DrainReport, MutationCoordinator, MutationError};
pub use document::{DocumentEvent, GraphDocument};
pub use events::{EventBus, Subscription, SyncEvent};
pub use gateway::{Gateway, GatewayError, InMemoryGateway};
pub use ids::{CanonicalId, EntityId, EphemeralId, RoomId};
pub use model::{Edge, EdgePatch, NewEdge, NewNode, Node, NodePatch, Payload, Room, RoomSnapshot};
pub use offline_queue::{Mutation, OfflineOperation, OfflineQueue};
pub use projection::GraphProjection;
pub use providers::{DocumentCache, LoopbackHub, LoopbackTransport, RealtimeTransport, TransportEvent};
pub use session::{SessionError, SessionManager, SessionState};
pub use storage::{BlobStore, InMemoryBlobStore, StoreError};
