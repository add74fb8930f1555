//! Durable key-value storage.
//!
//! Stores keep JSON documents under namespaced string keys such as
//! `@chasper/messages_general`. Two backends are provided:
//! - [`FileStorage`]: one JSON file per key, by default in the platform config
//!   directory:
//!   - Linux: `~/.config/chasper/`
//!   - macOS: `~/Library/Application Support/chasper/`
//!   - Windows: `%APPDATA%\chasper\`
//! - [`MemoryStorage`]: a process-local map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value could not be (de)serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Async key-value persistence. A missing key reads as `None`.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Load and decode a JSON value.
pub async fn load<T: DeserializeOwned>(
    storage: &dyn KeyValueStorage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get(key).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Encode and save a JSON value.
pub async fn save<T: Serialize + ?Sized>(
    storage: &dyn KeyValueStorage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let json = serde_json::to_string(value)?;
    storage.set(key, &json).await
}

// =========================================
// File-backed implementation
// =========================================

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage rooted at `<platform config dir>/chasper`.
    pub fn in_config_dir() -> Result<Self, StorageError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| StorageError::Unavailable("no platform config directory".to_string()))?;
        Ok(Self::new(config_dir.join("chasper")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|', '@'], "_");
        self.dir.join(format!("{safe_key}.json"))
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.file_path(key)).await {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.file_path(key), value).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.file_path(key)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

// =========================================
// In-memory implementation
// =========================================

/// Process-local storage. Writes can be made to fail to exercise the
/// degraded (cache-only) path of the stores.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Raw stored value, bypassing failure injection.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("reads disabled".to_string()));
        }
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_storage_round_trip_and_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested"));

        assert!(storage.get("@chasper/channels").await.unwrap().is_none());

        save(&storage, "@chasper/channels", &vec!["a", "b"]).await.unwrap();
        let loaded: Option<Vec<String>> = load(&storage, "@chasper/channels").await.unwrap();
        assert_eq!(loaded, Some(vec!["a".to_string(), "b".to_string()]));

        storage.remove("@chasper/channels").await.unwrap();
        storage.remove("@chasper/channels").await.unwrap();
        assert!(storage.get("@chasper/channels").await.unwrap().is_none());
    }

    #[test]
    fn file_names_are_sanitized() {
        let storage = FileStorage::new("/tmp/x");
        let path = storage.file_path("@chasper/messages_a:b");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("_chasper_messages_a_b.json"));
    }

    #[tokio::test]
    async fn memory_storage_failure_injection() {
        let storage = MemoryStorage::new();
        storage.set("k", "1").await.unwrap();
        storage.set_fail_writes(true);
        assert!(storage.set("k", "2").await.is_err());
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("1"));
        storage.set_fail_reads(true);
        assert!(storage.get("k").await.is_err());
    }
}
