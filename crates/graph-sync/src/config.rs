use serde::{Deserialize, Serialize};

/// How queued operations are sent to the store on reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainMode {
    /// One gateway call per queued operation.
    #[default]
    Sequential,
    /// Consecutive create operations are coalesced into a single bulk sync.
    Batched,
}

/// Tuning for a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub drain_mode: DrainMode,
    /// Put mutations whose online persistence failed with a transport error
    /// back on the offline queue.
    pub requeue_on_transport_failure: bool,
    /// Fail `initialize` when the initial snapshot cannot be fetched because
    /// the store is unreachable. Otherwise the session starts from the local cache.
    pub require_initial_snapshot: bool,
    /// Maximum number of pending offline operations per room.
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drain_mode: DrainMode::Sequential,
            requeue_on_transport_failure: true,
            require_initial_snapshot: false,
            queue_capacity: 10_000,
        }
    }
}
