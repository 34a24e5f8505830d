//! graph-sync-daemon library: native implementations of the sync engine's
//! external collaborators, exposed for the binary and integration tests.

pub mod commands;
pub mod config;
pub mod fs_store;
pub mod http_gateway;
pub mod message;
pub mod relay;
pub mod relay_server;

// Re-export key types for convenience
pub use commands::{Command, Reply};
pub use config::{Config, ConfigError, Overrides};
pub use fs_store::FsBlobStore;
pub use http_gateway::HttpGateway;
pub use message::{HandshakeMessage, MAX_MESSAGE_SIZE};
pub use relay::{ReconnectConfig, RelayTransport};
pub use relay_server::{RelayHandle, RelayServer};
