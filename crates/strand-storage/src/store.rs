//! The local log store contract.
//!
//! An ordered store over `(log, lsn) → record` with separate keyspaces
//! for per-log metadata (trim point, seal epoch, last released, last
//! clean epoch) and per-shard metadata (cluster marker, rebuilding
//! flag). Writes are durable once acknowledged.

use async_trait::async_trait;
use strand_membership::ShardId;
use strand_record::{DataRecord, Epoch, LogId, Lsn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("shard is out of space")]
    NoSpace,
    #[error("log {0} is in permanent error state")]
    PermanentError(LogId),
    #[error("cluster marker mismatch: store belongs to {found}, expected {expected}")]
    ClusterMarkerMismatch { expected: String, found: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record decode failed: {0}")]
    Corrupt(#[from] strand_record::RecordError),
    #[error("store is shutting down")]
    Shutdown,
}

/// A record as stored on one shard: the record plus the copyset it was
/// stored to and the wave that stored it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: DataRecord,
    pub copyset: Vec<ShardId>,
    pub wave: u32,
}

/// Per-log metadata keys. Missing keys read as their zero values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogState {
    /// Records at or below this LSN are reclaimed.
    pub trim_point: Lsn,
    /// Epochs strictly below this are sealed; normal stores into them
    /// are rejected as preempted.
    pub seal_epoch: Epoch,
    /// Highest LSN released for delivery to readers.
    pub last_released: Lsn,
    /// Highest epoch known clean on this shard.
    pub last_clean_epoch: Epoch,
}

/// Ordered local store for one shard.
#[async_trait]
pub trait LocalLogStore: Send + Sync {
    fn shard(&self) -> ShardId;

    /// Durably stores one record. Overwrites an existing record at the
    /// same `(log, lsn)` (recovery writes authoritative copies this way).
    async fn write_record(&self, log: LogId, stored: StoredRecord) -> Result<(), LogStoreError>;

    /// Records in `lo ..= hi` in LSN order, excluding trimmed ones.
    async fn read_range(
        &self,
        log: LogId,
        lo: Lsn,
        hi: Lsn,
    ) -> Result<Vec<StoredRecord>, LogStoreError>;

    /// Current per-log metadata.
    async fn log_state(&self, log: LogId) -> Result<LogState, LogStoreError>;

    /// Raises the trim point (monotone) and reclaims covered records.
    async fn trim(&self, log: LogId, up_to: Lsn) -> Result<(), LogStoreError>;

    /// Seals every epoch below `epoch`; returns the previous seal.
    async fn seal(&self, log: LogId, epoch: Epoch) -> Result<Epoch, LogStoreError>;

    /// Advances the release pointer (monotone).
    async fn set_last_released(&self, log: LogId, lsn: Lsn) -> Result<(), LogStoreError>;

    /// Advances the shard-local last clean epoch (monotone).
    async fn set_last_clean_epoch(&self, log: LogId, epoch: Epoch) -> Result<(), LogStoreError>;

    /// Logs present on this shard.
    async fn logs(&self) -> Result<Vec<LogId>, LogStoreError>;
}
