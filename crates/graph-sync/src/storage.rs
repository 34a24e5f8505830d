//! Durable blob storage abstraction.
//!
//! Backs the offline-operation log and the local document cache.
//!
//! Implementations:
//! - `InMemoryBlobStore` - For testing
//! - `FsBlobStore` (in graph-sync-daemon) - Uses tokio::fs

use crate::ids::RoomId;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Keyed byte storage that survives process restarts.
///
/// Keys are `/`-separated relative paths such as `offline/room-1.json`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Replace a blob's contents
    async fn write(&self, key: &str, content: &[u8]) -> Result<()>;

    /// Delete a blob (missing keys are not an error)
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if a blob exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List keys starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read a blob, mapping a missing key to `None`.
pub async fn read_optional(store: &dyn BlobStore, key: &str) -> Result<Option<Vec<u8>>> {
    match store.read(key).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Storage key for a per-room blob, e.g. `offline/<room>.json`.
///
/// Room ids outside `[A-Za-z0-9._-]` are hex-encoded so they cannot escape
/// the directory.
pub fn room_key(dir: &str, room: &RoomId, extension: &str) -> String {
    let raw = room.as_str();
    let safe = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !raw.starts_with('.');
    let name = if safe {
        raw.to_string()
    } else {
        let hex: String = raw.bytes().map(|b| format!("{b:02x}")).collect();
        format!("x{hex}")
    };
    format!("{dir}/{name}.{extension}")
}

/// In-memory blob store for testing
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an IO error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn normalize_key(key: &str) -> String {
        key.trim_matches('/').to_string()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let key = Self::normalize_key(key);
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        blobs.get(&key).cloned().ok_or(StoreError::NotFound(key))
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(format!("write refused: {key}")));
        }
        let key = Self::normalize_key(key);
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        blobs.insert(key, content.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = Self::normalize_key(key);
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        blobs.remove(&key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = Self::normalize_key(key);
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.contains_key(&key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Self::normalize_key(prefix);
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(blobs
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete() {
        let store = InMemoryBlobStore::new();
        store.write("/offline/a.json", b"[]").await.unwrap();

        assert!(store.exists("offline/a.json").await.unwrap());
        assert_eq!(store.read("offline/a.json").await.unwrap(), b"[]");

        store.delete("offline/a.json").await.unwrap();
        assert!(!store.exists("offline/a.json").await.unwrap());
        assert!(matches!(
            store.read("offline/a.json").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_optional() {
        let store = InMemoryBlobStore::new();
        assert!(read_optional(&store, "missing").await.unwrap().is_none());
        store.write("present", b"x").await.unwrap();
        assert_eq!(read_optional(&store, "present").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = InMemoryBlobStore::new();
        store.write("cache/a.loro", b"1").await.unwrap();
        store.write("cache/b.loro", b"2").await.unwrap();
        store.write("offline/a.json", b"3").await.unwrap();

        let keys = store.list("cache/").await.unwrap();
        assert_eq!(keys, vec!["cache/a.loro", "cache/b.loro"]);
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = InMemoryBlobStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.write("k", b"v").await, Err(StoreError::Io(_))));
    }

    #[test]
    fn test_room_key_escapes_unsafe_ids() {
        let plain = RoomId::new("design-review_2").unwrap();
        assert_eq!(room_key("offline", &plain, "json"), "offline/design-review_2.json");

        let nested = RoomId::new("../etc").unwrap();
        let key = room_key("offline", &nested, "json");
        assert!(!key.contains(".."));
        assert!(key.starts_with("offline/x"));
    }
}
