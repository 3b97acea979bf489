//! Epoch metadata and tail records, as persisted in the epoch store.

use serde::{Deserialize, Serialize};
use strand_membership::{NodeIndex, ShardId};
use strand_placement::ReplicationProperty;
use strand_record::{Epoch, Lsn};

/// Per-log, per-epoch metadata written by the sequencer during
/// activation. Immutable for a given epoch once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetadata {
    /// The epoch this metadata is effective for.
    pub epoch: Epoch,
    /// Storage shards eligible for this epoch's records.
    pub nodeset: Vec<ShardId>,
    /// Replication property in effect for this epoch.
    pub replication: ReplicationProperty,
    /// First epoch this nodeset has been in effect since.
    pub effective_since: Epoch,
    /// Hash of the nodeset-selection inputs; unchanged inputs reuse the
    /// prior nodeset on reactivation.
    pub nodeset_params: u64,
    /// Node that wrote this metadata (the activating sequencer).
    pub writer_node: Option<NodeIndex>,
}

impl EpochMetadata {
    /// Whether `next` is a legal successor of `self`.
    pub fn valid_successor(&self, next: &EpochMetadata) -> bool {
        next.epoch > self.epoch && next.effective_since >= self.effective_since
    }
}

/// Byte-offset attributes attached to a tail record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OffsetMap {
    /// Bytes ever appended to the log up to and including the tail.
    pub byte_offset: u64,
    /// Set while the offset only counts within the current epoch.
    /// Tail records persisted at LCE advancement must have accumulated
    /// offsets, never within-epoch ones.
    pub within_epoch: bool,
}

/// The last released record of a log, persisted alongside the LCE.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TailRecord {
    pub lsn: Lsn,
    pub timestamp_ms: u64,
    pub offsets: OffsetMap,
}

impl TailRecord {
    pub fn new(lsn: Lsn, timestamp_ms: u64, byte_offset: u64) -> Self {
        TailRecord {
            lsn,
            timestamp_ms,
            offsets: OffsetMap {
                byte_offset,
                within_epoch: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_record::Esn;

    fn metadata(epoch: u32, since: u32) -> EpochMetadata {
        EpochMetadata {
            epoch: Epoch(epoch),
            nodeset: vec![ShardId::new(0, 0), ShardId::new(1, 0)],
            replication: ReplicationProperty::from_factor(2).unwrap(),
            effective_since: Epoch(since),
            nodeset_params: 0xfeed,
            writer_node: Some(0),
        }
    }

    #[test]
    fn successor_requires_higher_epoch() {
        let m = metadata(3, 1);
        assert!(m.valid_successor(&metadata(4, 1)));
        assert!(m.valid_successor(&metadata(4, 4)));
        assert!(!m.valid_successor(&metadata(3, 1)));
        assert!(!m.valid_successor(&metadata(2, 1)));
    }

    #[test]
    fn serde_roundtrip() {
        let m = metadata(5, 2);
        let bytes = bincode::serialize(&m).unwrap();
        let back: EpochMetadata = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, m);

        let tail = TailRecord::new(Lsn::new(Epoch(5), Esn(100)), 1234, 4096);
        let bytes = bincode::serialize(&tail).unwrap();
        let back: TailRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, tail);
        assert!(!back.offsets.within_epoch);
    }
}
