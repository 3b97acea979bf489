//! One storage node: its shards, STORE admission, release and seal
//! handling.

use crate::read_stream::{ReadStreamParams, ServerReadStream};
use crate::store::{LocalLogStore, LogStoreError, StoredRecord};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_membership::{NodeIndex, ShardId};
use strand_observe::{Meter, NoopMeter, ShardEvt, ShardKind, StoreEvent};
use strand_record::{DataRecord, Epoch, LogId, Lsn, RecordFlags};
use strand_wire::Status;
use tokio::sync::watch;

/// A STORE as seen by the storage node (in-process form of the wire
/// message).
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub shard: ShardId,
    pub record: DataRecord,
    pub copyset: Vec<ShardId>,
    pub wave: u32,
}

/// The STORED response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReply {
    pub shard: ShardId,
    pub lsn: Lsn,
    pub wave: u32,
    pub status: Status,
    /// On `Preempted`, the epoch that sealed the log here.
    pub seal_epoch: Option<Epoch>,
}

pub struct StorageNode {
    node: NodeIndex,
    shards: parking_lot::RwLock<BTreeMap<u16, Arc<dyn LocalLogStore>>>,
    /// Set while the node refuses new stores (maintenance, draining).
    disabled: AtomicBool,
    /// Bumped on every store/release so read streams wake up.
    activity_tx: watch::Sender<u64>,
    meter: Arc<dyn Meter>,
}

impl StorageNode {
    pub fn new(node: NodeIndex) -> Self {
        Self::with_meter(node, Arc::new(NoopMeter))
    }

    pub fn with_meter(node: NodeIndex, meter: Arc<dyn Meter>) -> Self {
        let (activity_tx, _) = watch::channel(0);
        StorageNode {
            node,
            shards: parking_lot::RwLock::new(BTreeMap::new()),
            disabled: AtomicBool::new(false),
            activity_tx,
            meter,
        }
    }

    pub fn node_index(&self) -> NodeIndex {
        self.node
    }

    pub fn add_shard(&self, store: Arc<dyn LocalLogStore>) {
        let shard = store.shard();
        debug_assert_eq!(shard.node, self.node);
        self.shards.write().insert(shard.shard, store);
    }

    pub fn shard_store(&self, shard: u16) -> Option<Arc<dyn LocalLogStore>> {
        self.shards.read().get(&shard).cloned()
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }

    fn bump_activity(&self) {
        self.activity_tx.send_modify(|v| *v += 1);
    }

    /// STORE admission: seal/preemption check, checksum-bit check,
    /// space accounting, then the durable write.
    pub async fn store(&self, req: StoreRequest) -> StoreReply {
        let reply = |status, seal_epoch| StoreReply {
            shard: req.shard,
            lsn: req.record.lsn,
            wave: req.wave,
            status,
            seal_epoch,
        };

        if self.disabled.load(Ordering::Acquire) {
            return reply(Status::Disabled, None);
        }
        let Some(store) = self.shard_store(req.shard.shard) else {
            return reply(Status::Disabled, None);
        };

        // Invalid checksum-bit parity means the header was damaged in
        // flight.
        if req.record.flags.checksum_kind().is_none() {
            return reply(Status::ChecksumMismatch, None);
        }

        let log = req.record.log;
        let state = match store.log_state(log).await {
            Ok(state) => state,
            Err(_) => return reply(Status::Disabled, None),
        };
        let recovery = req.record.flags.contains(RecordFlags::WRITTEN_BY_RECOVERY);
        if req.record.lsn.epoch() < state.seal_epoch && !recovery {
            return reply(Status::Preempted, Some(state.seal_epoch));
        }

        let bytes = req.record.payload.size() as u64;
        let stored = StoredRecord {
            record: req.record.clone(),
            copyset: req.copyset.clone(),
            wave: req.wave,
        };
        match store.write_record(log, stored).await {
            Ok(()) => {
                self.meter.emit(StoreEvent::Store(ShardEvt {
                    node: self.node as u32,
                    shard: req.shard.shard as u32,
                    kind: ShardKind::Stored { bytes },
                }));
                self.bump_activity();
                reply(Status::Ok, None)
            }
            Err(LogStoreError::NoSpace) => reply(Status::NoSpace, None),
            Err(LogStoreError::PermanentError(_)) => reply(Status::Disabled, None),
            Err(e) => {
                tracing::error!(shard = %req.shard, error = %e, "store failed");
                reply(Status::Internal, None)
            }
        }
    }

    /// RELEASE: advance the release pointer on every shard of this node
    /// that carries the log.
    pub async fn release(&self, log: LogId, lsn: Lsn) {
        let stores: Vec<_> = self.shards.read().values().cloned().collect();
        for store in stores {
            let _ = store.set_last_released(log, lsn).await;
        }
        self.bump_activity();
    }

    /// Seals every epoch below `epoch` on one shard; normal stores into
    /// sealed epochs are rejected as preempted from here on.
    pub async fn seal(&self, shard: u16, log: LogId, epoch: Epoch) -> Result<Epoch, LogStoreError> {
        let store = self
            .shard_store(shard)
            .ok_or(LogStoreError::PermanentError(log))?;
        let prev = store.seal(log, epoch).await?;
        self.meter.emit(StoreEvent::Store(ShardEvt {
            node: self.node as u32,
            shard: shard as u32,
            kind: ShardKind::Sealed { epoch: epoch.as_u32() },
        }));
        Ok(prev)
    }

    /// Digest for recovery: every record this shard holds in `epoch`.
    pub async fn digest(
        &self,
        shard: u16,
        log: LogId,
        epoch: Epoch,
    ) -> Result<Vec<StoredRecord>, LogStoreError> {
        let store = self
            .shard_store(shard)
            .ok_or(LogStoreError::PermanentError(log))?;
        store
            .read_range(log, Lsn::first_in_epoch(epoch), Lsn::last_in_epoch(epoch))
            .await
    }

    pub async fn trim(&self, shard: u16, log: LogId, up_to: Lsn) -> Result<(), LogStoreError> {
        let store = self
            .shard_store(shard)
            .ok_or(LogStoreError::PermanentError(log))?;
        store.trim(log, up_to).await?;
        self.meter.emit(StoreEvent::Store(ShardEvt {
            node: self.node as u32,
            shard: shard as u32,
            kind: ShardKind::Trimmed,
        }));
        Ok(())
    }

    /// Opens the server side of one read sub-stream.
    pub fn open_read_stream(&self, params: ReadStreamParams) -> Option<ServerReadStream> {
        let store = self.shard_store(params.shard.shard)?;
        Some(ServerReadStream::new(
            store,
            params,
            self.activity_tx.subscribe(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLogStore;
    use strand_record::{Esn, Payload};

    fn node() -> StorageNode {
        let n = StorageNode::new(0);
        n.add_shard(Arc::new(MemoryLogStore::new(ShardId::new(0, 0))));
        n
    }

    fn request(epoch: u32, esn: u32) -> StoreRequest {
        let mut record = DataRecord::new(
            LogId::new(1),
            Lsn::new(Epoch(epoch), Esn(esn)),
            0,
            Payload::flat(b"x".to_vec()),
        );
        record.flags = record.flags.with_checksum(strand_record::ChecksumKind::Crc32);
        StoreRequest {
            shard: ShardId::new(0, 0),
            record,
            copyset: vec![ShardId::new(0, 0), ShardId::new(1, 0)],
            wave: 1,
        }
    }

    #[tokio::test]
    async fn store_and_release_flow() {
        let n = node();
        let reply = n.store(request(1, 1)).await;
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.lsn, Lsn::new(Epoch(1), Esn(1)));

        n.release(LogId::new(1), Lsn::new(Epoch(1), Esn(1))).await;
        let state = n
            .shard_store(0)
            .unwrap()
            .log_state(LogId::new(1))
            .await
            .unwrap();
        assert_eq!(state.last_released, Lsn::new(Epoch(1), Esn(1)));
    }

    #[tokio::test]
    async fn sealed_epoch_rejects_normal_stores() {
        let n = node();
        n.seal(0, LogId::new(1), Epoch(3)).await.unwrap();

        let reply = n.store(request(2, 1)).await;
        assert_eq!(reply.status, Status::Preempted);
        assert_eq!(reply.seal_epoch, Some(Epoch(3)));

        // The sealed epoch's successor is fine.
        let reply = n.store(request(3, 1)).await;
        assert_eq!(reply.status, Status::Ok);

        // Recovery writes pass through the seal.
        let mut req = request(2, 2);
        req.record.flags |= RecordFlags::WRITTEN_BY_RECOVERY;
        assert_eq!(n.store(req).await.status, Status::Ok);
    }

    #[tokio::test]
    async fn disabled_node_rejects_stores() {
        let n = node();
        n.set_disabled(true);
        assert_eq!(n.store(request(1, 1)).await.status, Status::Disabled);
        n.set_disabled(false);
        assert_eq!(n.store(request(1, 1)).await.status, Status::Ok);
    }

    #[tokio::test]
    async fn missing_shard_is_disabled() {
        let n = node();
        let mut req = request(1, 1);
        req.shard = ShardId::new(0, 5);
        assert_eq!(n.store(req).await.status, Status::Disabled);
    }

    #[tokio::test]
    async fn bad_checksum_bits_rejected() {
        let n = node();
        let mut req = request(1, 1);
        // CHECKSUM + PARITY set: even parity, invalid.
        req.record.flags = RecordFlags::CHECKSUM | RecordFlags::CHECKSUM_PARITY;
        assert_eq!(n.store(req).await.status, Status::ChecksumMismatch);
    }

    #[tokio::test]
    async fn no_space_surfaces() {
        let n = StorageNode::new(0);
        n.add_shard(Arc::new(MemoryLogStore::with_capacity(ShardId::new(0, 0), 0)));
        assert_eq!(n.store(request(1, 1)).await.status, Status::NoSpace);
    }

    #[tokio::test]
    async fn digest_returns_epoch_records() {
        let n = node();
        for esn in 1..=3 {
            assert_eq!(n.store(request(1, esn)).await.status, Status::Ok);
        }
        assert_eq!(n.store(request(2, 1)).await.status, Status::Ok);
        let digest = n.digest(0, LogId::new(1), Epoch(1)).await.unwrap();
        assert_eq!(digest.len(), 3);
        assert!(digest.iter().all(|r| r.record.lsn.epoch() == Epoch(1)));
    }
}
