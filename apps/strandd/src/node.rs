//! One strand node, wired from a cluster configuration.
//!
//! Opens the local shards (with the cluster marker check), publishes
//! the membership view, starts the gossip detector, and runs per-log
//! sequencers against the epoch store. The data-plane transport to
//! remote nodes plugs into the same seams the in-process transport
//! uses.

use crate::config::ClusterConfig;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use strand_epoch::{EpochStore, EpochStoreConfig, InMemoryVersionedStore, VersionedConfigStore};
use strand_gossip::{ClusterState, GossipConfig, GossipDetector, GossipTransport};
use strand_membership::{MembershipView, NodeIndex, NodesConfiguration, ShardId};
use strand_placement::{RandomCrossDomainSelector, ReplicationProperty};
use strand_record::{LogId, Lsn, Payload};
use strand_reader::{ClientReadStream, ReadStreamConfig};
use strand_sequencer::{
    AppendError, InProcessTransport, Sequencer, SequencerConfig,
};
use strand_storage::{FileLogStore, StorageNode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node N{0} is not in the configuration")]
    NotInConfig(NodeIndex),
    #[error("log {0} is not covered by any log group")]
    UnknownLog(LogId),
    #[error("invalid replication property: {0}")]
    Replication(String),
    #[error(transparent)]
    Storage(#[from] strand_storage::LogStoreError),
    #[error(transparent)]
    Activation(#[from] strand_sequencer::ActivationError),
    #[error(transparent)]
    Append(#[from] AppendError),
}

pub struct Node {
    index: NodeIndex,
    config: ClusterConfig,
    view: Arc<MembershipView>,
    epoch_store: Arc<EpochStore>,
    storage: Arc<StorageNode>,
    transport: Arc<InProcessTransport>,
    gossip: Arc<ClusterState>,
    sequencers: parking_lot::Mutex<BTreeMap<LogId, Arc<Sequencer>>>,
    detector: parking_lot::Mutex<Option<Arc<GossipDetector>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("index", &self.index).finish_non_exhaustive()
    }
}

impl Node {
    /// Opens the node's shards under `data_dir` and wires the core.
    ///
    /// `coordinator` is the versioned store backing the epoch store; a
    /// fresh in-memory one is used when none is supplied (standalone
    /// mode).
    pub fn open(
        index: NodeIndex,
        config: ClusterConfig,
        data_dir: &Path,
        coordinator: Option<Arc<dyn VersionedConfigStore>>,
    ) -> Result<Self, NodeError> {
        let nodes = config.nodes.clone().unwrap_or_default();
        let node_config = nodes
            .get(&index)
            .ok_or(NodeError::NotInConfig(index))?
            .clone();

        let mut membership = NodesConfiguration::new(config.version);
        membership.nodes = nodes.clone();
        let view = Arc::new(MembershipView::new(membership));

        let storage = Arc::new(StorageNode::new(index));
        if let Some(storage_config) = &node_config.storage {
            for shard in 0..storage_config.num_shards() {
                let marker = format!("{}:N{}:S{}", config.cluster, index, shard);
                let dir = data_dir.join(format!("shard{shard}"));
                let (store, info) =
                    FileLogStore::open(&dir, ShardId::new(index, shard), &marker, false)?;
                if !info.poisoned_logs.is_empty() {
                    tracing::error!(
                        shard,
                        logs = ?info.poisoned_logs,
                        "shard has permanent-error logs"
                    );
                }
                storage.add_shard(Arc::new(store));
            }
        }

        let transport = Arc::new(InProcessTransport::new());
        transport.add_node(storage.clone());

        let zk_root = config
            .zookeeper
            .as_ref()
            .map(|z| z.root.clone())
            .unwrap_or_else(|| "/strand".to_string());
        let backing: Arc<dyn VersionedConfigStore> =
            coordinator.unwrap_or_else(|| Arc::new(InMemoryVersionedStore::new()));
        let epoch_store = Arc::new(EpochStore::new(
            backing,
            EpochStoreConfig {
                root: zk_root,
                ..Default::default()
            },
        ));

        let gossip = Arc::new(ClusterState::new(index, nodes.keys().copied()));

        Ok(Node {
            index,
            config,
            view,
            epoch_store,
            storage,
            transport,
            gossip,
            sequencers: parking_lot::Mutex::new(BTreeMap::new()),
            detector: parking_lot::Mutex::new(None),
        })
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn view(&self) -> Arc<MembershipView> {
        self.view.clone()
    }

    pub fn storage(&self) -> Arc<StorageNode> {
        self.storage.clone()
    }

    pub fn gossip(&self) -> Arc<ClusterState> {
        self.gossip.clone()
    }

    pub fn epoch_store(&self) -> Arc<EpochStore> {
        self.epoch_store.clone()
    }

    /// Starts gossiping over the given transport.
    pub fn start_gossip(&self, transport: Arc<dyn GossipTransport>) {
        let peers: BTreeMap<NodeIndex, std::net::SocketAddr> = self
            .view
            .current()
            .nodes
            .iter()
            .filter_map(|(idx, n)| n.gossip_addr.parse().ok().map(|a| (*idx, a)))
            .collect();
        let detector = Arc::new(GossipDetector::new(
            self.gossip.clone(),
            transport,
            peers,
            GossipConfig::default(),
        ));
        detector.start();
        *self.detector.lock() = Some(detector);
    }

    fn replication_for(&self, log: LogId) -> Result<ReplicationProperty, NodeError> {
        let group = self
            .config
            .log_group(log)
            .ok_or(NodeError::UnknownLog(log))?;
        ReplicationProperty::new(group.replication.clone())
            .map_err(|e| NodeError::Replication(e.to_string()))
    }

    /// The sequencer for a log, activating one on first use.
    pub async fn sequencer(&self, log: LogId) -> Result<Arc<Sequencer>, NodeError> {
        if let Some(seq) = self.sequencers.lock().get(&log) {
            return Ok(seq.clone());
        }
        let group = self
            .config
            .log_group(log)
            .ok_or(NodeError::UnknownLog(log))?;
        let replication = self.replication_for(log)?;
        let seq = Arc::new(Sequencer::new(
            log,
            self.index,
            replication,
            self.view.clone(),
            self.epoch_store.clone(),
            Box::new(RandomCrossDomainSelector),
            self.transport.clone(),
            SequencerConfig {
                nodeset_size: group.nodeset_size,
                window_size: group.max_writes_in_flight.unwrap_or(256),
                ..Default::default()
            },
        ));
        seq.activate("first use").await?;
        seq.spawn_release_rebroadcast();
        self.sequencers.lock().insert(log, seq.clone());
        Ok(seq)
    }

    /// Appends through this node's sequencer for the log.
    pub async fn append(&self, log: LogId, payload: Payload) -> Result<Lsn, NodeError> {
        let seq = self.sequencer(log).await?;
        Ok(seq.append(payload).await?)
    }

    /// Opens a read stream over the local storage set.
    pub fn read(&self, log: LogId, start: Lsn, until: Lsn) -> ClientReadStream {
        ClientReadStream::new(
            log,
            start,
            until,
            Arc::new(LocalSourceFactory {
                storage: self.storage.clone(),
            }),
            self.epoch_store.clone(),
            self.view.clone(),
            ReadStreamConfig::default(),
        )
    }

    pub fn shutdown(&self) {
        if let Some(detector) = self.detector.lock().take() {
            detector.shutdown();
        }
        for seq in self.sequencers.lock().values() {
            seq.shutdown();
        }
        self.epoch_store.shutdown();
    }
}

struct LocalSourceFactory {
    storage: Arc<StorageNode>,
}

#[async_trait::async_trait]
impl strand_reader::ShardSourceFactory for LocalSourceFactory {
    async fn open(
        &self,
        log: LogId,
        shard: ShardId,
        start: Lsn,
        until: Lsn,
        scd: bool,
        send_all: bool,
    ) -> Result<Box<dyn strand_reader::ShardSource>, strand_reader::ReadError> {
        let mut stream = self
            .storage
            .open_read_stream(strand_storage::ReadStreamParams {
                log,
                shard,
                start,
                until,
                window_bytes: 1 << 20,
                scd,
                filter: None,
            })
            .ok_or(strand_reader::ReadError::ShardUnavailable(shard))?;
        if send_all {
            stream.set_send_all(true);
        }
        Ok(Box::new(stream))
    }
}
