//! Persistence contract and the on-disk record shape.
//!
//! The engine never implements a storage engine; it only consumes the
//! `{ load, save, delete, close }` interface and defines the plain shape
//! it persists through that interface. Deterministic serialization (a
//! `BTreeMap` for the operations table) follows
//! `examples/vsevex-carry/engine/src/snapshot.rs`'s `StoreSnapshot`.

use crate::operation::Operation;
use crate::{OperationId, StoreKey, Timestamp, Version};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Current persisted-record format. Bumped whenever the shape below
/// changes incompatibly; `from_json` rejects anything newer than this.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct StorageError(pub String);

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StorageError {}

/// External persistent key-value collaborator. One handle is opened per
/// store and closed on `destroy()`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn close(&self) -> Result<(), StorageError>;
}

/// The persisted shape of a Model Store: `{ id, groundTruth, operations,
/// version, cachedAt }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStoreSnapshot {
    pub format_version: u32,
    pub id: StoreKey,
    pub ground_truth: Vec<Value>,
    pub operations: BTreeMap<OperationId, Operation>,
    pub version: Version,
    pub cached_at: Timestamp,
}

/// The persisted shape of a Queryset Store: `{ id, groundTruthIds,
/// operations, version, cachedAt }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySetStoreSnapshot {
    pub format_version: u32,
    pub id: StoreKey,
    pub ground_truth_ids: Vec<Value>,
    pub operations: BTreeMap<OperationId, Operation>,
    pub version: Version,
    pub cached_at: Timestamp,
}

impl ModelStoreSnapshot {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, crate::Error> {
        let snapshot: Self = serde_json::from_slice(bytes)
            .map_err(|e| crate::Error::CacheCorrupt { store: String::new(), message: e.to_string() })?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(crate::Error::UnsupportedSnapshotVersion {
                got: snapshot.format_version,
                max: SNAPSHOT_FORMAT_VERSION,
            });
        }
        Ok(snapshot)
    }
}

impl QuerySetStoreSnapshot {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, crate::Error> {
        let snapshot: Self = serde_json::from_slice(bytes)
            .map_err(|e| crate::Error::CacheCorrupt { store: String::new(), message: e.to_string() })?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(crate::Error::UnsupportedSnapshotVersion {
                got: snapshot.format_version,
                max: SNAPSHOT_FORMAT_VERSION,
            });
        }
        Ok(snapshot)
    }
}

/// In-memory `Storage` implementation useful for tests and as a reference
/// adapter; not itself persistent across process restarts.
#[derive(Default)]
pub struct MemoryStorage {
    inner: tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.inner.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().await.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
