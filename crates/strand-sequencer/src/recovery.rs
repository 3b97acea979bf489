//! Epoch recovery.
//!
//! On activation for epoch `e`, every epoch in `(LCE, e)` is made
//! clean: the nodeset is sealed at `e`, each dirty epoch is digested
//! from its shards, partially-stored slots get authoritative copies,
//! missing slots become holes, and a bridge record closes the epoch.
//! Only then does the LCE advance.

use crate::appender::{AppendOutcome, Appender};
use crate::config::SequencerConfig;
use crate::shaping::{Priority, TrafficShaper};
use crate::transport::NodeTransport;
use std::collections::BTreeMap;
use std::sync::Arc;
use strand_epoch::{EpochMetadata, EpochStore, EpochStoreError, TailRecord};
use strand_membership::MembershipView;
use strand_record::{DataRecord, Epoch, Esn, LogId, Lsn, RecordFlags};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("could not seal the nodeset for epoch {epoch}")]
    SealFailed { epoch: Epoch },
    #[error("recovery of epoch {epoch} could not replicate slot {esn}")]
    Incomplete { epoch: Epoch, esn: Esn },
    #[error(transparent)]
    EpochStore(#[from] EpochStoreError),
}

pub struct EpochRecovery {
    pub log: LogId,
    /// The newly activated epoch; everything below it gets sealed.
    pub new_epoch: Epoch,
    pub metadata: EpochMetadata,
    pub config: SequencerConfig,
    pub now_ms: u64,
}

impl EpochRecovery {
    /// Recovers every epoch in `(lce, new_epoch)`; returns the tail of
    /// the last recovered epoch.
    pub async fn run(
        &self,
        lce: Epoch,
        view: &MembershipView,
        transport: Arc<dyn NodeTransport>,
        shaper: Arc<TrafficShaper>,
        epoch_store: &EpochStore,
    ) -> Result<Option<TailRecord>, RecoveryError> {
        let nodeset = &self.metadata.nodeset;

        // Seal first: from here on, stores into older epochs bounce.
        let mut sealed = 0usize;
        for &shard in nodeset {
            if transport.seal(shard, self.log, self.new_epoch).await.is_ok() {
                sealed += 1;
            }
        }
        if sealed == 0 {
            return Err(RecoveryError::SealFailed { epoch: self.new_epoch });
        }

        let mut last_tail = None;
        let mut epoch = lce.next();
        while epoch < self.new_epoch {
            let tail = self
                .recover_one(epoch, view, transport.clone(), shaper.clone())
                .await?;

            match epoch_store
                .set_last_clean_epoch(self.log, epoch, tail.clone())
                .await
            {
                Ok(()) => {}
                // Another recovery got there first; that is fine.
                Err(EpochStoreError::Stale { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            tracing::info!(log = %self.log, %epoch, "epoch recovered");
            last_tail = Some(tail);
            epoch = epoch.next();
        }
        Ok(last_tail)
    }

    /// Digest + re-store + bridge for one epoch.
    async fn recover_one(
        &self,
        epoch: Epoch,
        view: &MembershipView,
        transport: Arc<dyn NodeTransport>,
        shaper: Arc<TrafficShaper>,
    ) -> Result<TailRecord, RecoveryError> {
        let nodeset = &self.metadata.nodeset;

        // Digest: every copy any reachable shard holds.
        let mut found: BTreeMap<u32, DataRecord> = BTreeMap::new();
        for &shard in nodeset {
            let Ok(records) = transport.digest(shard, self.log, epoch).await else {
                continue;
            };
            for stored in records {
                let esn = stored.record.lsn.esn().as_u32();
                // An authoritative recovery copy beats a normal one.
                let keep = match found.get(&esn) {
                    None => true,
                    Some(existing) => {
                        !existing.flags.contains(RecordFlags::WRITTEN_BY_RECOVERY)
                            && stored.record.flags.contains(RecordFlags::WRITTEN_BY_RECOVERY)
                    }
                };
                if keep {
                    found.insert(esn, stored.record);
                }
            }
        }

        let max_esn = found.keys().next_back().copied().unwrap_or(0);
        let mut tail = TailRecord::default();

        for esn in 1..=max_esn {
            let record = match found.get(&esn) {
                Some(existing) => {
                    let mut record = existing.clone();
                    record.flags |= RecordFlags::WRITTEN_BY_RECOVERY;
                    if !record.is_hole() && !record.is_bridge() {
                        tail = TailRecord::new(record.lsn, record.timestamp_ms, 0);
                    }
                    record
                }
                None => DataRecord::hole(self.log, Lsn::new(epoch, Esn(esn)), self.now_ms),
            };
            self.replicate(record, view, transport.clone(), shaper.clone(), epoch)
                .await?;
        }

        // Bridge closes the epoch at the first unused esn.
        let bridge_lsn = Lsn::new(epoch, Esn(max_esn.saturating_add(1)));
        let bridge = DataRecord::bridge(self.log, bridge_lsn, self.now_ms);
        self.replicate(bridge, view, transport.clone(), shaper, epoch)
            .await?;

        // Everything recovered is releasable.
        for &shard in nodeset {
            let _ = transport.release(shard, self.log, bridge_lsn).await;
        }

        if tail.lsn == Lsn::INVALID {
            tail = TailRecord::new(Lsn::INVALID, self.now_ms, 0);
        }
        Ok(tail)
    }

    async fn replicate(
        &self,
        record: DataRecord,
        view: &MembershipView,
        transport: Arc<dyn NodeTransport>,
        shaper: Arc<TrafficShaper>,
        epoch: Epoch,
    ) -> Result<(), RecoveryError> {
        let esn = record.lsn.esn();
        let mut record = record;
        if record.flags.checksum_kind().is_none() {
            record.flags = record.flags.with_checksum(strand_record::ChecksumKind::Crc32);
        }
        let appender = Appender {
            record,
            nodeset: self.metadata.nodeset.clone(),
            property: self.metadata.replication.clone(),
            config: self.config.clone(),
            priority: Priority::Background,
        };
        match appender.run(view, transport, shaper).await {
            AppendOutcome::Stored { .. } => Ok(()),
            // A recovery store that bounces or cannot replicate leaves
            // the epoch dirty; the LCE must not advance.
            AppendOutcome::Preempted { .. } | AppendOutcome::Failed(_) => {
                Err(RecoveryError::Incomplete { epoch, esn })
            }
        }
    }
}
