//! In-memory log store for tests and simulation.

use crate::store::{LocalLogStore, LogState, LogStoreError, StoredRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use strand_membership::ShardId;
use strand_record::{Epoch, LogId, Lsn};

#[derive(Default)]
struct LogSlot {
    records: BTreeMap<Lsn, StoredRecord>,
    state: LogState,
}

struct Inner {
    logs: BTreeMap<LogId, LogSlot>,
    bytes_used: u64,
}

/// BTreeMap-backed store; "durable" for the lifetime of the process.
pub struct MemoryLogStore {
    shard: ShardId,
    inner: Mutex<Inner>,
    /// Byte capacity; writes past it fail with `NoSpace`.
    capacity: Option<u64>,
}

impl MemoryLogStore {
    pub fn new(shard: ShardId) -> Self {
        MemoryLogStore {
            shard,
            inner: Mutex::new(Inner {
                logs: BTreeMap::new(),
                bytes_used: 0,
            }),
            capacity: None,
        }
    }

    pub fn with_capacity(shard: ShardId, capacity: u64) -> Self {
        MemoryLogStore {
            capacity: Some(capacity),
            ..Self::new(shard)
        }
    }

    pub fn record_count(&self, log: LogId) -> usize {
        self.inner
            .lock()
            .logs
            .get(&log)
            .map(|slot| slot.records.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl LocalLogStore for MemoryLogStore {
    fn shard(&self) -> ShardId {
        self.shard
    }

    async fn write_record(&self, log: LogId, stored: StoredRecord) -> Result<(), LogStoreError> {
        let size = stored.record.payload.size() as u64;
        let mut inner = self.inner.lock();
        if let Some(cap) = self.capacity {
            if inner.bytes_used + size > cap {
                return Err(LogStoreError::NoSpace);
            }
        }
        inner.bytes_used += size;
        let slot = inner.logs.entry(log).or_default();
        slot.records.insert(stored.record.lsn, stored);
        Ok(())
    }

    async fn read_range(
        &self,
        log: LogId,
        lo: Lsn,
        hi: Lsn,
    ) -> Result<Vec<StoredRecord>, LogStoreError> {
        let inner = self.inner.lock();
        let Some(slot) = inner.logs.get(&log) else {
            return Ok(Vec::new());
        };
        Ok(slot
            .records
            .range(lo..=hi)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn log_state(&self, log: LogId) -> Result<LogState, LogStoreError> {
        Ok(self
            .inner
            .lock()
            .logs
            .get(&log)
            .map(|slot| slot.state)
            .unwrap_or_default())
    }

    async fn trim(&self, log: LogId, up_to: Lsn) -> Result<(), LogStoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = inner.logs.entry(log).or_default();
        if up_to <= slot.state.trim_point {
            return Ok(());
        }
        slot.state.trim_point = up_to;
        let keep = slot.records.split_off(&up_to.next());
        let dropped: u64 = slot
            .records
            .values()
            .map(|r| r.record.payload.size() as u64)
            .sum();
        slot.records = keep;
        inner.bytes_used = inner.bytes_used.saturating_sub(dropped);
        Ok(())
    }

    async fn seal(&self, log: LogId, epoch: Epoch) -> Result<Epoch, LogStoreError> {
        let mut inner = self.inner.lock();
        let slot = inner.logs.entry(log).or_default();
        let prev = slot.state.seal_epoch;
        if epoch > prev {
            slot.state.seal_epoch = epoch;
        }
        Ok(prev)
    }

    async fn set_last_released(&self, log: LogId, lsn: Lsn) -> Result<(), LogStoreError> {
        let mut inner = self.inner.lock();
        let slot = inner.logs.entry(log).or_default();
        if lsn > slot.state.last_released {
            slot.state.last_released = lsn;
        }
        Ok(())
    }

    async fn set_last_clean_epoch(&self, log: LogId, epoch: Epoch) -> Result<(), LogStoreError> {
        let mut inner = self.inner.lock();
        let slot = inner.logs.entry(log).or_default();
        if epoch > slot.state.last_clean_epoch {
            slot.state.last_clean_epoch = epoch;
        }
        Ok(())
    }

    async fn logs(&self) -> Result<Vec<LogId>, LogStoreError> {
        Ok(self.inner.lock().logs.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_record::{DataRecord, Esn, Payload};

    fn record(epoch: u32, esn: u32, payload: &str) -> StoredRecord {
        StoredRecord {
            record: DataRecord::new(
                LogId::new(1),
                Lsn::new(Epoch(epoch), Esn(esn)),
                0,
                Payload::flat(payload.as_bytes().to_vec()),
            ),
            copyset: vec![ShardId::new(0, 0)],
            wave: 1,
        }
    }

    fn store() -> MemoryLogStore {
        MemoryLogStore::new(ShardId::new(0, 0))
    }

    #[tokio::test]
    async fn write_and_read_in_lsn_order() {
        let s = store();
        let log = LogId::new(1);
        for esn in [3u32, 1, 2] {
            s.write_record(log, record(1, esn, "x")).await.unwrap();
        }
        let records = s.read_range(log, Lsn::OLDEST, Lsn::MAX).await.unwrap();
        let esns: Vec<u32> = records.iter().map(|r| r.record.lsn.esn().0).collect();
        assert_eq!(esns, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn overwrite_replaces_record() {
        let s = store();
        let log = LogId::new(1);
        s.write_record(log, record(1, 1, "first")).await.unwrap();
        s.write_record(log, record(1, 1, "second")).await.unwrap();
        let records = s.read_range(log, Lsn::OLDEST, Lsn::MAX).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.payload, Payload::flat(b"second".to_vec()));
    }

    #[tokio::test]
    async fn trim_reclaims_and_is_monotone() {
        let s = store();
        let log = LogId::new(1);
        for esn in 1..=5u32 {
            s.write_record(log, record(1, esn, "x")).await.unwrap();
        }
        s.trim(log, Lsn::new(Epoch(1), Esn(3))).await.unwrap();
        assert_eq!(s.record_count(log), 2);
        assert_eq!(
            s.log_state(log).await.unwrap().trim_point,
            Lsn::new(Epoch(1), Esn(3))
        );
        // Lower trim is a no-op.
        s.trim(log, Lsn::new(Epoch(1), Esn(1))).await.unwrap();
        assert_eq!(
            s.log_state(log).await.unwrap().trim_point,
            Lsn::new(Epoch(1), Esn(3))
        );
    }

    #[tokio::test]
    async fn seal_is_monotone_and_returns_previous() {
        let s = store();
        let log = LogId::new(1);
        assert_eq!(s.seal(log, Epoch(3)).await.unwrap(), Epoch::INVALID);
        assert_eq!(s.seal(log, Epoch(2)).await.unwrap(), Epoch(3));
        assert_eq!(s.log_state(log).await.unwrap().seal_epoch, Epoch(3));
    }

    #[tokio::test]
    async fn capacity_enforced() {
        let s = MemoryLogStore::with_capacity(ShardId::new(0, 0), 8);
        let log = LogId::new(1);
        s.write_record(log, record(1, 1, "1234")).await.unwrap();
        s.write_record(log, record(1, 2, "1234")).await.unwrap();
        assert!(matches!(
            s.write_record(log, record(1, 3, "x")).await,
            Err(LogStoreError::NoSpace)
        ));
        // Trimming frees space.
        s.trim(log, Lsn::new(Epoch(1), Esn(2))).await.unwrap();
        s.write_record(log, record(1, 3, "x")).await.unwrap();
    }

    #[tokio::test]
    async fn release_pointer_is_monotone() {
        let s = store();
        let log = LogId::new(1);
        s.set_last_released(log, Lsn::new(Epoch(1), Esn(5))).await.unwrap();
        s.set_last_released(log, Lsn::new(Epoch(1), Esn(3))).await.unwrap();
        assert_eq!(
            s.log_state(log).await.unwrap().last_released,
            Lsn::new(Epoch(1), Esn(5))
        );
    }
}
