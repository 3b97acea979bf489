//! The versioned nodes configuration snapshot.

use crate::location::{FailureDomainScope, Location};
use crate::node::{NodeConfig, StorageState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Index of a node in the cluster.
pub type NodeIndex = u16;

/// One storage partition on a node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ShardId {
    pub node: NodeIndex,
    pub shard: u16,
}

impl ShardId {
    pub fn new(node: NodeIndex, shard: u16) -> Self {
        ShardId { node, shard }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}:S{}", self.node, self.shard)
    }
}

#[derive(Debug, Error)]
pub enum NodesConfigError {
    #[error("version must strictly increase (current {current}, proposed {proposed})")]
    VersionMismatch { current: u64, proposed: u64 },
    #[error("invalid node {node}: {reason}")]
    InvalidNode { node: NodeIndex, reason: String },
    #[error("duplicate data address {addr} on nodes {a} and {b}")]
    DuplicateAddress { addr: String, a: NodeIndex, b: NodeIndex },
}

/// Immutable snapshot of the cluster's nodes, monotonically versioned.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodesConfiguration {
    pub version: u64,
    pub nodes: BTreeMap<NodeIndex, NodeConfig>,
}

impl NodesConfiguration {
    pub fn new(version: u64) -> Self {
        NodesConfiguration {
            version,
            nodes: BTreeMap::new(),
        }
    }

    pub fn node(&self, idx: NodeIndex) -> Option<&NodeConfig> {
        self.nodes.get(&idx)
    }

    pub fn contains(&self, idx: NodeIndex) -> bool {
        self.nodes.contains_key(&idx)
    }

    pub fn location(&self, idx: NodeIndex) -> Location {
        self.node(idx).map(NodeConfig::location).unwrap_or_default()
    }

    /// Nodes carrying the sequencer role with positive weight.
    pub fn sequencer_nodes(&self) -> impl Iterator<Item = (NodeIndex, &NodeConfig)> {
        self.nodes.iter().filter_map(|(idx, n)| {
            let weight = n.sequencer.as_ref().map(|s| s.weight).unwrap_or(0.0);
            (n.is_sequencer() && weight > 0.0).then_some((*idx, n))
        })
    }

    /// Every shard in the cluster, with its membership state.
    pub fn all_shards(&self) -> impl Iterator<Item = (ShardId, StorageState)> + '_ {
        self.nodes.iter().flat_map(|(idx, n)| {
            n.storage
                .iter()
                .flat_map(move |s| {
                    s.shard_states
                        .iter()
                        .enumerate()
                        .map(move |(shard, state)| (ShardId::new(*idx, shard as u16), *state))
                })
        })
    }

    /// Shards currently accepting writes.
    pub fn writable_shards(&self) -> Vec<ShardId> {
        self.all_shards()
            .filter(|(_, state)| state.writable())
            .map(|(shard, _)| shard)
            .collect()
    }

    pub fn shard_state(&self, shard: ShardId) -> Option<StorageState> {
        self.node(shard.node)
            .and_then(|n| n.storage.as_ref())
            .and_then(|s| s.shard_states.get(shard.shard as usize).copied())
    }

    /// Location of the node a shard lives on.
    pub fn shard_location(&self, shard: ShardId) -> Location {
        self.location(shard.node)
    }

    /// The closest failure-domain scope shared by two nodes.
    pub fn closest_shared_scope(&self, a: NodeIndex, b: NodeIndex) -> FailureDomainScope {
        if a == b {
            return FailureDomainScope::Node;
        }
        self.location(a).closest_shared_scope(&self.location(b))
    }

    /// Validates node invariants and cross-node uniqueness.
    pub fn validate(&self) -> Result<(), NodesConfigError> {
        let mut seen_addr: BTreeMap<&str, NodeIndex> = BTreeMap::new();
        for (idx, node) in &self.nodes {
            node.validate()
                .map_err(|reason| NodesConfigError::InvalidNode { node: *idx, reason })?;
            if let Some(prev) = seen_addr.insert(node.data_addr.as_str(), *idx) {
                return Err(NodesConfigError::DuplicateAddress {
                    addr: node.data_addr.clone(),
                    a: prev,
                    b: *idx,
                });
            }
        }
        Ok(())
    }

    /// Nodes whose address or generation changed between `self` and
    /// `next`; connections to them must be closed.
    pub fn nodes_requiring_reconnect(&self, next: &NodesConfiguration) -> Vec<NodeIndex> {
        self.nodes
            .iter()
            .filter_map(|(idx, old)| {
                let new = next.node(*idx)?;
                (old.generation != new.generation
                    || old.data_addr != new.data_addr
                    || old.gossip_addr != new.gossip_addr
                    || old.ssl_addr != new.ssl_addr)
                    .then_some(*idx)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NodesConfiguration {
        let mut c = NodesConfiguration::new(1);
        c.nodes.insert(0, NodeConfig::both("n0", "h0:4440", 2).at("r1.d1.c1.w1.k1"));
        c.nodes.insert(1, NodeConfig::storage_node("n1", "h1:4440", 2).at("r1.d1.c1.w1.k2"));
        c.nodes.insert(2, NodeConfig::sequencer_node("n2", "h2:4440").at("r2.d1.c1.w1.k1"));
        c
    }

    #[test]
    fn shard_enumeration() {
        let c = config();
        let shards: Vec<_> = c.all_shards().collect();
        assert_eq!(shards.len(), 4);
        assert_eq!(c.writable_shards().len(), 4);
        assert_eq!(c.shard_state(ShardId::new(0, 1)), Some(StorageState::ReadWrite));
        assert_eq!(c.shard_state(ShardId::new(2, 0)), None);
    }

    #[test]
    fn sequencer_nodes_respect_weight() {
        let mut c = config();
        assert_eq!(c.sequencer_nodes().count(), 2);
        c.nodes.get_mut(&2).unwrap().sequencer.as_mut().unwrap().weight = 0.0;
        assert_eq!(c.sequencer_nodes().count(), 1);
    }

    #[test]
    fn closest_shared_scope_between_nodes() {
        let c = config();
        assert_eq!(c.closest_shared_scope(0, 1), FailureDomainScope::Row);
        assert_eq!(c.closest_shared_scope(0, 2), FailureDomainScope::Root);
        assert_eq!(c.closest_shared_scope(1, 1), FailureDomainScope::Node);
    }

    #[test]
    fn validate_rejects_duplicate_addresses() {
        let mut c = config();
        c.nodes.get_mut(&1).unwrap().data_addr = "h0:4440".to_string();
        assert!(matches!(
            c.validate(),
            Err(NodesConfigError::DuplicateAddress { .. })
        ));
    }

    #[test]
    fn reconnect_set_tracks_generation_and_address() {
        let old = config();
        let mut new = config();
        new.version = 2;
        new.nodes.get_mut(&0).unwrap().generation = 2;
        new.nodes.get_mut(&1).unwrap().data_addr = "h1b:4440".to_string();
        let mut require = old.nodes_requiring_reconnect(&new);
        require.sort_unstable();
        assert_eq!(require, vec![0, 1]);
    }
}
