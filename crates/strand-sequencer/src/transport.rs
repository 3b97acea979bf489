//! How the sequencer reaches storage shards.
//!
//! The trait is the seam: production wires it to connections, tests and
//! single-process deployments use the in-process implementation over
//! `StorageNode` handles, with per-node fault injection.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strand_membership::{NodeIndex, ShardId};
use strand_record::{Epoch, LogId, Lsn};
use strand_storage::{StorageNode, StoreReply, StoreRequest, StoredRecord};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("node N{0} is unreachable")]
    Unreachable(NodeIndex),
    #[error("request to N{0} timed out")]
    TimedOut(NodeIndex),
}

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn store(&self, req: StoreRequest) -> Result<StoreReply, TransportError>;

    async fn release(&self, shard: ShardId, log: LogId, lsn: Lsn) -> Result<(), TransportError>;

    /// Seals epochs below `epoch` on the shard; returns the previous
    /// seal.
    async fn seal(
        &self,
        shard: ShardId,
        log: LogId,
        epoch: Epoch,
    ) -> Result<Epoch, TransportError>;

    /// Recovery digest: records the shard holds for `(log, epoch)`.
    async fn digest(
        &self,
        shard: ShardId,
        log: LogId,
        epoch: Epoch,
    ) -> Result<Vec<StoredRecord>, TransportError>;
}

/// In-process transport over storage node handles.
pub struct InProcessTransport {
    nodes: RwLock<BTreeMap<NodeIndex, Arc<StorageNode>>>,
    /// Nodes currently unreachable (simulated failures).
    down: RwLock<BTreeSet<NodeIndex>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        InProcessTransport {
            nodes: RwLock::new(BTreeMap::new()),
            down: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn add_node(&self, node: Arc<StorageNode>) {
        self.nodes.write().insert(node.node_index(), node);
    }

    /// Simulate a node failure: every request to it fails.
    pub fn set_down(&self, node: NodeIndex, down: bool) {
        if down {
            self.down.write().insert(node);
        } else {
            self.down.write().remove(&node);
        }
    }

    pub fn is_down(&self, node: NodeIndex) -> bool {
        self.down.read().contains(&node)
    }

    fn node(&self, idx: NodeIndex) -> Result<Arc<StorageNode>, TransportError> {
        if self.is_down(idx) {
            return Err(TransportError::Unreachable(idx));
        }
        self.nodes
            .read()
            .get(&idx)
            .cloned()
            .ok_or(TransportError::Unreachable(idx))
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeTransport for InProcessTransport {
    async fn store(&self, req: StoreRequest) -> Result<StoreReply, TransportError> {
        let node = self.node(req.shard.node)?;
        Ok(node.store(req).await)
    }

    async fn release(&self, shard: ShardId, log: LogId, lsn: Lsn) -> Result<(), TransportError> {
        let node = self.node(shard.node)?;
        node.release(log, lsn).await;
        Ok(())
    }

    async fn seal(
        &self,
        shard: ShardId,
        log: LogId,
        epoch: Epoch,
    ) -> Result<Epoch, TransportError> {
        let node = self.node(shard.node)?;
        node.seal(shard.shard, log, epoch)
            .await
            .map_err(|_| TransportError::Unreachable(shard.node))
    }

    async fn digest(
        &self,
        shard: ShardId,
        log: LogId,
        epoch: Epoch,
    ) -> Result<Vec<StoredRecord>, TransportError> {
        let node = self.node(shard.node)?;
        node.digest(shard.shard, log, epoch)
            .await
            .map_err(|_| TransportError::Unreachable(shard.node))
    }
}
