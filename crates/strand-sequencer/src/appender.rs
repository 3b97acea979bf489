//! The per-record write coordinator.
//!
//! One appender drives replication of one LSN: pick a copyset, STORE to
//! every destination, tally STOREDs against the replication property,
//! and start a fresh wave (excluding failed destinations) if the
//! property cannot be met. Preemption aborts the record immediately.

use crate::config::SequencerConfig;
use crate::error::AppendError;
use crate::shaping::{Grant, Priority, TrafficShaper};
use crate::transport::{NodeTransport, TransportError};
use rand::Rng;
use std::collections::BTreeSet;
use std::hash::Hasher;
use std::sync::Arc;
use strand_membership::{MembershipView, ShardId};
use strand_placement::{CopysetSelector, FailureDomainTally, ReplicationProperty, SelectionInputs};
use strand_record::{DataRecord, Epoch};
use strand_storage::StoreRequest;
use strand_wire::Status;
use tokio::sync::mpsc;

/// Terminal outcome of one appender.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// Replicated; the copyset that satisfied the property.
    Stored { copyset: Vec<ShardId> },
    /// A storage node reported a higher epoch.
    Preempted { by: Epoch },
    Failed(AppendError),
}

pub struct Appender {
    pub record: DataRecord,
    pub nodeset: Vec<ShardId>,
    pub property: ReplicationProperty,
    pub config: SequencerConfig,
    pub priority: Priority,
}

impl Appender {
    /// Deterministic per-wave selection seed.
    fn wave_seed(&self, wave: u32) -> u64 {
        let mut hasher = twox_hash::XxHash64::with_seed(0xc0b5);
        hasher.write(&self.record.log.as_u64().to_le_bytes());
        hasher.write(&self.record.lsn.as_u64().to_le_bytes());
        hasher.write(&wave.to_le_bytes());
        hasher.finish()
    }

    /// Runs waves until the property is satisfied, the record is
    /// preempted, or the wave budget is exhausted.
    pub async fn run(
        self,
        view: &MembershipView,
        transport: Arc<dyn NodeTransport>,
        shaper: Arc<TrafficShaper>,
    ) -> AppendOutcome {
        let required = self.property.replication_factor();
        let mut graylist: BTreeSet<ShardId> = BTreeSet::new();
        let empty = BTreeSet::new();

        for wave in 1..=self.config.max_waves {
            // Refresh membership at each wave.
            let config = view.current();
            let mut copyset = CopysetSelector::select(&SelectionInputs {
                nodeset: &self.nodeset,
                property: &self.property,
                config: &config,
                exclusions: &empty,
                graylist: &graylist,
                existing: &empty,
                required,
                extras: self.config.copyset_extras,
                seed: self.wave_seed(wave),
            });
            if copyset.is_empty() && !graylist.is_empty() {
                // Every candidate failed at least once; start the wave
                // with a clean slate in case nodes came back.
                graylist.clear();
                copyset = CopysetSelector::select(&SelectionInputs {
                    nodeset: &self.nodeset,
                    property: &self.property,
                    config: &config,
                    exclusions: &empty,
                    graylist: &graylist,
                    existing: &empty,
                    required,
                    extras: self.config.copyset_extras,
                    seed: self.wave_seed(wave),
                });
            }
            if copyset.is_empty() {
                return AppendOutcome::Failed(AppendError::NoBufs);
            }

            let (reply_tx, mut reply_rx) = mpsc::channel(copyset.len());
            for &shard in &copyset {
                let req = StoreRequest {
                    shard,
                    record: self.record.clone(),
                    copyset: copyset.clone(),
                    wave,
                };
                let transport = transport.clone();
                let shaper = shaper.clone();
                let priority = self.priority;
                let timeout = self.config.store_timeout;
                let bytes = self.record.payload.size() as i64;
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    // Bandwidth throttling parks this destination only.
                    match shaper.acquire(priority, bytes) {
                        Grant::Granted => {}
                        Grant::Registered(rx) => {
                            if rx.await.is_err() {
                                let _ = reply_tx.send((shard, Err(TransportError::TimedOut(shard.node)))).await;
                                return;
                            }
                        }
                    }
                    let result =
                        match tokio::time::timeout(timeout, transport.store(req)).await {
                            Ok(result) => result,
                            Err(_) => Err(TransportError::TimedOut(shard.node)),
                        };
                    let _ = reply_tx.send((shard, result)).await;
                });
            }
            drop(reply_tx);

            let mut tally = FailureDomainTally::new(self.property.clone());
            let mut failed: Vec<ShardId> = Vec::new();
            while let Some((shard, result)) = reply_rx.recv().await {
                match result {
                    Ok(reply) => match reply.status {
                        Status::Ok => {
                            tally.add(shard, &config);
                            if tally.satisfied() {
                                return AppendOutcome::Stored { copyset };
                            }
                        }
                        Status::Preempted => {
                            return AppendOutcome::Preempted {
                                by: reply.seal_epoch.unwrap_or(Epoch::INVALID),
                            };
                        }
                        // Accepted elsewhere; not counted toward the
                        // property, not a destination failure either.
                        Status::Forward => {}
                        _ => failed.push(shard),
                    },
                    Err(_) => failed.push(shard),
                }
            }

            tracing::debug!(
                log = %self.record.log,
                lsn = %self.record.lsn,
                wave,
                stored = tally.len(),
                failed = failed.len(),
                "wave did not satisfy the replication property"
            );
            graylist.extend(failed);

            if wave < self.config.max_waves {
                // Jittered pause so rebroadcast waves from many
                // appenders do not land in lockstep.
                let pause = self.config.store_timeout.mul_f64(
                    rand::thread_rng().gen_range(0.05..0.25),
                );
                tokio::time::sleep(pause).await;
            }
        }

        AppendOutcome::Failed(AppendError::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessTransport;
    use strand_membership::{NodeConfig, NodesConfiguration};
    use strand_record::{ChecksumKind, Esn, LogId, Lsn, Payload};
    use strand_storage::{MemoryLogStore, StorageNode};

    fn cluster(n: u16) -> (Arc<MembershipView>, Arc<InProcessTransport>, Vec<Arc<StorageNode>>) {
        let mut config = NodesConfiguration::new(1);
        let transport = Arc::new(InProcessTransport::new());
        let mut nodes = Vec::new();
        for i in 0..n {
            config.nodes.insert(
                i,
                NodeConfig::storage_node(format!("n{i}"), format!("h{i}:4440"), 1),
            );
            let node = Arc::new(StorageNode::new(i));
            node.add_shard(Arc::new(MemoryLogStore::new(ShardId::new(i, 0))));
            transport.add_node(node.clone());
            nodes.push(node);
        }
        (Arc::new(MembershipView::new(config)), transport, nodes)
    }

    fn appender(n: u16, factor: usize) -> Appender {
        let mut record = DataRecord::new(
            LogId::new(1),
            Lsn::new(Epoch(1), Esn(1)),
            123,
            Payload::flat(b"payload".to_vec()),
        );
        record.flags = record.flags.with_checksum(ChecksumKind::Crc32);
        Appender {
            record,
            nodeset: (0..n).map(|i| ShardId::new(i, 0)).collect(),
            property: ReplicationProperty::from_factor(factor).unwrap(),
            config: SequencerConfig::fast(),
            priority: Priority::Client,
        }
    }

    #[tokio::test]
    async fn replicates_to_a_full_copyset() {
        let (view, transport, nodes) = cluster(4);
        let outcome = appender(4, 3)
            .run(&view, transport, Arc::new(TrafficShaper::unlimited()))
            .await;
        let AppendOutcome::Stored { copyset } = outcome else {
            panic!("expected stored, got {outcome:?}");
        };
        assert!(copyset.len() >= 3);
        // The record landed on at least the required number of shards.
        let mut found = 0;
        for node in &nodes {
            if let Some(store) = node.shard_store(0) {
                found += store
                    .read_range(LogId::new(1), Lsn::OLDEST, Lsn::MAX)
                    .await
                    .unwrap()
                    .len();
            }
        }
        assert!(found >= 3, "found {found} copies");
    }

    #[tokio::test]
    async fn second_wave_routes_around_failed_nodes() {
        let (view, transport, _nodes) = cluster(4);
        transport.set_down(0, true);
        let outcome = appender(4, 3)
            .run(&view, transport.clone(), Arc::new(TrafficShaper::unlimited()))
            .await;
        assert!(matches!(outcome, AppendOutcome::Stored { .. }));
    }

    #[tokio::test]
    async fn too_many_failures_time_out() {
        let (view, transport, _nodes) = cluster(3);
        transport.set_down(0, true);
        transport.set_down(1, true);
        let outcome = appender(3, 3)
            .run(&view, transport, Arc::new(TrafficShaper::unlimited()))
            .await;
        assert_eq!(outcome, AppendOutcome::Failed(AppendError::TimedOut));
    }

    #[tokio::test]
    async fn preemption_aborts_the_record() {
        let (view, transport, nodes) = cluster(3);
        // A later epoch sealed the log on every shard.
        for node in &nodes {
            node.seal(0, LogId::new(1), Epoch(5)).await.unwrap();
        }
        let outcome = appender(3, 2)
            .run(&view, transport, Arc::new(TrafficShaper::unlimited()))
            .await;
        assert_eq!(outcome, AppendOutcome::Preempted { by: Epoch(5) });
    }
}
