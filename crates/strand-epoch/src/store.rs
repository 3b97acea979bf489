//! The versioned key-value store the epoch store is built on.
//!
//! The abstraction mirrors a coordination service: versioned values,
//! "if-version" compare-and-swap writes, and an atomic multi-create for
//! provisioning.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version mismatch on {key}: expected {expected:?}, stored {actual:?}")]
    VersionMismatch {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    #[error("key not found: {key}")]
    NotFound { key: String },
    #[error("key already exists: {key}")]
    AlreadyExists { key: String },
    #[error("access denied: {key}")]
    Access { key: String },
    #[error("connection to coordination store failed: {reason}")]
    Connection { reason: String },
}

/// A value plus the version the store assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Bytes,
    pub version: u64,
}

/// Strongly-consistent versioned key-value store with CAS writes.
///
/// Implementations must be externally thread-safe; the epoch store is
/// shared across workers.
#[async_trait]
pub trait VersionedConfigStore: Send + Sync {
    /// Reads a key. `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError>;

    /// Writes `value` iff the stored version equals `base`
    /// (`base == None` creates the key). Returns the new version.
    async fn put_if_version(
        &self,
        key: &str,
        value: Bytes,
        base: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Atomically creates every entry; fails without side effects if any
    /// key already exists.
    async fn multi_create(&self, entries: Vec<(String, Bytes)>) -> Result<(), StoreError>;
}

/// In-memory implementation for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryVersionedStore {
    entries: Mutex<BTreeMap<String, VersionedValue>>,
}

impl InMemoryVersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl VersionedConfigStore for InMemoryVersionedStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: Bytes,
        base: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock();
        let actual = entries.get(key).map(|v| v.version);
        if actual != base {
            return Err(StoreError::VersionMismatch {
                key: key.to_string(),
                expected: base,
                actual,
            });
        }
        let version = actual.map_or(1, |v| v + 1);
        entries.insert(key.to_string(), VersionedValue { value, version });
        Ok(version)
    }

    async fn multi_create(&self, entries: Vec<(String, Bytes)>) -> Result<(), StoreError> {
        let mut map = self.entries.lock();
        if let Some((key, _)) = entries.iter().find(|(k, _)| map.contains_key(k)) {
            return Err(StoreError::AlreadyExists { key: key.clone() });
        }
        for (key, value) in entries {
            map.insert(key, VersionedValue { value, version: 1 });
        }
        Ok(())
    }
}
