//! Per-customer, per-log checkpoints: the last consumed LSN, stored
//! under compare-and-swap with a version carried inside the value.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_epoch::{StoreError, VersionedConfigStore};
use strand_record::{LogId, Lsn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint for customer {customer} log {log}")]
    NotFound { customer: String, log: LogId },
    #[error("update contention did not resolve within {0:?}")]
    Timeout(Duration),
    #[error("stored checkpoint value is malformed: {0}")]
    BadValue(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, customer: &str, log: LogId) -> Result<Option<Lsn>, CheckpointError>;

    async fn update(&self, customer: &str, log: LogId, lsn: Lsn) -> Result<(), CheckpointError>;

    /// Updates several logs' checkpoints in one CAS.
    async fn update_batch(
        &self,
        customer: &str,
        checkpoints: &BTreeMap<LogId, Lsn>,
    ) -> Result<(), CheckpointError>;

    async fn remove(&self, customer: &str, logs: &[LogId]) -> Result<(), CheckpointError>;

    async fn remove_all(&self, customer: &str) -> Result<(), CheckpointError>;
}

/// One value per customer: the version plus every log's checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CheckpointValue {
    /// Strictly increases on every mutation.
    version: u64,
    checkpoints: BTreeMap<u64, u64>,
}

/// Checkpoint store over a versioned CAS key-value store.
pub struct VersionedCheckpointStore {
    store: Arc<dyn VersionedConfigStore>,
    prefix: String,
    /// Total time budget for CAS retries per mutation.
    retry_budget: Duration,
}

impl VersionedCheckpointStore {
    pub fn new(store: Arc<dyn VersionedConfigStore>) -> Self {
        VersionedCheckpointStore {
            store,
            prefix: "/strand/checkpoints".to_string(),
            retry_budget: Duration::from_secs(5),
        }
    }

    pub fn with_retry_budget(mut self, budget: Duration) -> Self {
        self.retry_budget = budget;
        self
    }

    fn key(&self, customer: &str) -> String {
        format!("{}/{}", self.prefix, customer)
    }

    async fn read(
        &self,
        customer: &str,
    ) -> Result<Option<(CheckpointValue, u64)>, CheckpointError> {
        match self.store.get(&self.key(customer)).await? {
            None => Ok(None),
            Some(entry) => {
                let value: CheckpointValue = bincode::deserialize(&entry.value)
                    .map_err(|e| CheckpointError::BadValue(e.to_string()))?;
                Ok(Some((value, entry.version)))
            }
        }
    }

    /// Read-modify-write with CAS, retried under contention until the
    /// retry budget runs out.
    async fn mutate<F>(&self, customer: &str, mutate: F) -> Result<(), CheckpointError>
    where
        F: Fn(&mut CheckpointValue),
    {
        let key = self.key(customer);
        let deadline = Instant::now() + self.retry_budget;
        let mut delay = Duration::from_millis(2);
        loop {
            let (mut value, base) = match self.read(customer).await? {
                Some((value, version)) => (value, Some(version)),
                None => (CheckpointValue::default(), None),
            };
            mutate(&mut value);
            value.version += 1;
            let encoded =
                Bytes::from(bincode::serialize(&value).expect("checkpoint value serializes"));
            match self.store.put_if_version(&key, encoded, base).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionMismatch { .. }) => {
                    if Instant::now() >= deadline {
                        return Err(CheckpointError::Timeout(self.retry_budget));
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl CheckpointStore for VersionedCheckpointStore {
    async fn get(&self, customer: &str, log: LogId) -> Result<Option<Lsn>, CheckpointError> {
        Ok(self
            .read(customer)
            .await?
            .and_then(|(value, _)| value.checkpoints.get(&log.as_u64()).copied())
            .map(Lsn))
    }

    async fn update(&self, customer: &str, log: LogId, lsn: Lsn) -> Result<(), CheckpointError> {
        self.mutate(customer, |value| {
            value.checkpoints.insert(log.as_u64(), lsn.as_u64());
        })
        .await
    }

    async fn update_batch(
        &self,
        customer: &str,
        checkpoints: &BTreeMap<LogId, Lsn>,
    ) -> Result<(), CheckpointError> {
        self.mutate(customer, |value| {
            for (log, lsn) in checkpoints {
                value.checkpoints.insert(log.as_u64(), lsn.as_u64());
            }
        })
        .await
    }

    async fn remove(&self, customer: &str, logs: &[LogId]) -> Result<(), CheckpointError> {
        self.mutate(customer, |value| {
            for log in logs {
                value.checkpoints.remove(&log.as_u64());
            }
        })
        .await
    }

    async fn remove_all(&self, customer: &str) -> Result<(), CheckpointError> {
        self.mutate(customer, |value| value.checkpoints.clear()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_epoch::InMemoryVersionedStore;
    use strand_record::{Epoch, Esn};

    fn lsn(n: u32) -> Lsn {
        Lsn::new(Epoch(1), Esn(n))
    }

    fn store() -> VersionedCheckpointStore {
        VersionedCheckpointStore::new(Arc::new(InMemoryVersionedStore::new()))
    }

    #[tokio::test]
    async fn update_then_get() {
        let s = store();
        assert_eq!(s.get("c1", LogId::new(42)).await.unwrap(), None);
        s.update("c1", LogId::new(42), lsn(100)).await.unwrap();
        assert_eq!(s.get("c1", LogId::new(42)).await.unwrap(), Some(lsn(100)));

        // Customers are isolated.
        assert_eq!(s.get("c2", LogId::new(42)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn batch_update_and_remove() {
        let s = store();
        let mut batch = BTreeMap::new();
        batch.insert(LogId::new(1), lsn(10));
        batch.insert(LogId::new(2), lsn(20));
        s.update_batch("c1", &batch).await.unwrap();
        assert_eq!(s.get("c1", LogId::new(1)).await.unwrap(), Some(lsn(10)));
        assert_eq!(s.get("c1", LogId::new(2)).await.unwrap(), Some(lsn(20)));

        s.remove("c1", &[LogId::new(1)]).await.unwrap();
        assert_eq!(s.get("c1", LogId::new(1)).await.unwrap(), None);
        assert_eq!(s.get("c1", LogId::new(2)).await.unwrap(), Some(lsn(20)));

        s.remove_all("c1").await.unwrap();
        assert_eq!(s.get("c1", LogId::new(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn version_strictly_increases() {
        let s = store();
        s.update("c1", LogId::new(1), lsn(1)).await.unwrap();
        let (v1, _) = s.read("c1").await.unwrap().unwrap();
        s.update("c1", LogId::new(1), lsn(2)).await.unwrap();
        let (v2, _) = s.read("c1").await.unwrap().unwrap();
        assert!(v2.version > v1.version);
    }

    #[tokio::test]
    async fn concurrent_updates_serialize() {
        let backing = Arc::new(InMemoryVersionedStore::new());
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let backing = backing.clone();
            handles.push(tokio::spawn(async move {
                let s = VersionedCheckpointStore::new(backing);
                s.update("c1", LogId::new(i as u64), lsn(i)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let s = VersionedCheckpointStore::new(backing);
        for i in 0..8u32 {
            assert_eq!(s.get("c1", LogId::new(i as u64)).await.unwrap(), Some(lsn(i)));
        }
        // Eight mutations, eight version bumps.
        let (value, _) = s.read("c1").await.unwrap().unwrap();
        assert_eq!(value.version, 8);
    }

    #[tokio::test]
    async fn last_writer_wins_on_same_log() {
        let s = store();
        s.update("c1", LogId::new(7), lsn(5)).await.unwrap();
        s.update("c1", LogId::new(7), lsn(3)).await.unwrap();
        // No monotonicity requirement on the checkpoint itself; the
        // last update wins.
        assert_eq!(s.get("c1", LogId::new(7)).await.unwrap(), Some(lsn(3)));
    }
}
