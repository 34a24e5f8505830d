use graph_sync::{RoomId, SyncConfig};
use std::path::{Path, PathBuf};

pub const ENV_DATA_DIR: &str = "GRAPH_SYNC_DATA_DIR";
pub const ENV_ROOM: &str = "GRAPH_SYNC_ROOM";
pub const ENV_GATEWAY_URL: &str = "GRAPH_SYNC_GATEWAY_URL";
pub const ENV_RELAY_URL: &str = "GRAPH_SYNC_RELAY_URL";

/// Values given on the command line. They win over the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<String>,
    pub room: Option<String>,
    pub gateway_url: Option<String>,
    pub relay_url: Option<String>,
    pub config_file: Option<PathBuf>,
    pub peer_id: Option<String>,
}

/// Daemon configuration resolved from flags, environment variables and an
/// optional JSON file holding the session's `SyncConfig`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the offline queue and document cache
    pub data_dir: PathBuf,
    pub room: RoomId,
    /// Base URL of the persisted store's REST API
    pub gateway_url: String,
    /// Base `ws://` URL of the realtime relay (None = no realtime peers)
    pub relay_url: Option<String>,
    pub peer_id: String,
    pub sync: SyncConfig,
}

impl Config {
    /// Resolve against the process environment.
    pub fn from_env(overrides: Overrides) -> Result<Self, ConfigError> {
        Self::resolve(overrides, |key| std::env::var(key).ok())
    }

    /// Resolve with `env` standing in for the process environment.
    pub fn resolve(
        overrides: Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let pick = |flag: Option<String>, key: &str| {
            flag.or_else(|| env(key)).filter(|v| !v.trim().is_empty())
        };

        let data_dir = match pick(overrides.data_dir, ENV_DATA_DIR) {
            Some(dir) => expand_tilde(&dir),
            None => dirs::data_dir()
                .map(|dir| dir.join("graph-sync"))
                .ok_or(ConfigError::MissingDataDir)?,
        };

        let room = pick(overrides.room, ENV_ROOM).ok_or(ConfigError::MissingRoom)?;
        let room = RoomId::new(room).map_err(|e| ConfigError::InvalidRoom(e.to_string()))?;

        let gateway_url =
            pick(overrides.gateway_url, ENV_GATEWAY_URL).ok_or(ConfigError::MissingGatewayUrl)?;
        let relay_url = pick(overrides.relay_url, ENV_RELAY_URL);

        let sync = match &overrides.config_file {
            Some(path) => load_sync_config(path)?,
            None => SyncConfig::default(),
        };

        let peer_id = overrides
            .peer_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            data_dir,
            room,
            gateway_url,
            relay_url,
            peer_id,
            sync,
        })
    }
}

/// Read a `SyncConfig` from a JSON file. Missing fields take their defaults.
pub fn load_sync_config(path: &Path) -> Result<SyncConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::ParseFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No data directory: pass --data-dir or set GRAPH_SYNC_DATA_DIR")]
    MissingDataDir,

    #[error("No room: pass --room or set GRAPH_SYNC_ROOM")]
    MissingRoom,

    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    #[error("No gateway URL: pass --gateway-url or set GRAPH_SYNC_GATEWAY_URL")]
    MissingGatewayUrl,

    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    ParseFile {
        path: PathBuf,
        source: serde_json::Error,
    },
}
