//! Cluster membership mutations and their admin-facing error semantics.
//!
//! All mutations funnel through one `ClusterMembership` value under
//! `&mut self`; that exclusive reference is the serialization point for
//! index allocation.

use crate::node::NodeConfig;
use crate::nodes_config::{NodeIndex, NodesConfiguration, ShardId};
use thiserror::Error;

/// Sentinel index asking add-nodes to allocate the smallest free index.
pub const ANY_NODE_IDX: NodeIndex = NodeIndex::MAX;

/// Liveness oracle consulted before destructive operations. Implemented
/// by the gossip failure detector.
pub trait LivenessCheck {
    fn is_alive(&self, node: NodeIndex) -> bool;
}

/// A liveness oracle that considers every node dead. For bootstrap and
/// tests.
pub struct AllDead;
impl LivenessCheck for AllDead {
    fn is_alive(&self, _node: NodeIndex) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFailedReason {
    /// The node's gossip state is alive.
    NotDead,
    /// The node still has shards that are not disabled.
    NotDisabled,
}

#[derive(Debug, Error)]
pub enum MembershipOpError {
    #[error("cluster membership operation failed on N{node}: {reason:?}")]
    OperationFailed { node: NodeIndex, reason: OpFailedReason },
    #[error("node N{node} already exists (index or data address collision)")]
    AlreadyExists { node: NodeIndex },
    #[error("invalid nodes-config request: {reason}")]
    InvalidRequestNodesConfig { reason: String },
    #[error("node N{node} not found in configuration")]
    NoMatchInConfig { node: NodeIndex },
    #[error("invalid parameter: {reason}")]
    InvalidParam { reason: String },
}

/// Request to add one node; `index = ANY_NODE_IDX` allocates the
/// smallest free index.
#[derive(Debug, Clone)]
pub struct AddNodeRequest {
    pub index: NodeIndex,
    pub config: NodeConfig,
}

/// The mutable cluster-membership state machine. Wraps a nodes
/// configuration; every successful mutation bumps the version by one.
pub struct ClusterMembership {
    config: NodesConfiguration,
    bootstrapped: bool,
}

impl ClusterMembership {
    pub fn new(config: NodesConfiguration) -> Self {
        ClusterMembership {
            config,
            bootstrapped: false,
        }
    }

    pub fn config(&self) -> &NodesConfiguration {
        &self.config
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Adds nodes, allocating indexes for `ANY_NODE_IDX` requests.
    /// Returns the indexes actually used, in request order.
    pub fn add_nodes(
        &mut self,
        requests: Vec<AddNodeRequest>,
    ) -> Result<Vec<NodeIndex>, MembershipOpError> {
        // Validate the whole batch against the current config before
        // mutating anything.
        let mut staged = self.config.clone();
        let mut allocated = Vec::with_capacity(requests.len());
        for req in requests {
            let idx = if req.index == ANY_NODE_IDX {
                smallest_free_index(&staged)
            } else {
                req.index
            };
            if staged.contains(idx) {
                return Err(MembershipOpError::AlreadyExists { node: idx });
            }
            if let Some((other, _)) = staged
                .nodes
                .iter()
                .find(|(_, n)| n.data_addr == req.config.data_addr)
            {
                return Err(MembershipOpError::AlreadyExists { node: *other });
            }
            req.config
                .validate()
                .map_err(|reason| MembershipOpError::InvalidRequestNodesConfig { reason })?;
            staged.nodes.insert(idx, req.config);
            allocated.push(idx);
        }
        staged.version += 1;
        self.config = staged;
        Ok(allocated)
    }

    /// Replaces a node's configuration.
    ///
    /// `update.index` must match `target`; immutable attributes
    /// (location) must not change.
    pub fn update_node(
        &mut self,
        target: NodeIndex,
        update: AddNodeRequest,
    ) -> Result<(), MembershipOpError> {
        if update.index != target {
            return Err(MembershipOpError::InvalidRequestNodesConfig {
                reason: format!(
                    "request index N{} does not match target N{}",
                    update.index, target
                ),
            });
        }
        let existing = self
            .config
            .node(target)
            .ok_or(MembershipOpError::NoMatchInConfig { node: target })?;
        if existing.location != update.config.location {
            return Err(MembershipOpError::InvalidParam {
                reason: format!("location of N{} is immutable", target),
            });
        }
        update
            .config
            .validate()
            .map_err(|reason| MembershipOpError::InvalidRequestNodesConfig { reason })?;
        if let Some((other, _)) = self
            .config
            .nodes
            .iter()
            .find(|(idx, n)| **idx != target && n.data_addr == update.config.data_addr)
        {
            return Err(MembershipOpError::AlreadyExists { node: *other });
        }
        self.config.nodes.insert(target, update.config);
        self.config.version += 1;
        Ok(())
    }

    /// Removes nodes. Each must be dead per gossip and have all shards
    /// disabled.
    pub fn remove_nodes(
        &mut self,
        targets: &[NodeIndex],
        liveness: &dyn LivenessCheck,
    ) -> Result<(), MembershipOpError> {
        for &idx in targets {
            let node = self
                .config
                .node(idx)
                .ok_or(MembershipOpError::NoMatchInConfig { node: idx })?;
            if liveness.is_alive(idx) {
                return Err(MembershipOpError::OperationFailed {
                    node: idx,
                    reason: OpFailedReason::NotDead,
                });
            }
            if let Some(storage) = &node.storage {
                if storage.shard_states.iter().any(|s| !s.disabled()) {
                    return Err(MembershipOpError::OperationFailed {
                        node: idx,
                        reason: OpFailedReason::NotDisabled,
                    });
                }
            }
        }
        for &idx in targets {
            self.config.nodes.remove(&idx);
        }
        self.config.version += 1;
        Ok(())
    }

    /// Bumps a node's generation, forcing peers to reconnect.
    pub fn bump_node_generation(&mut self, target: NodeIndex) -> Result<u32, MembershipOpError> {
        let node = self
            .config
            .nodes
            .get_mut(&target)
            .ok_or(MembershipOpError::NoMatchInConfig { node: target })?;
        node.generation += 1;
        let generation = node.generation;
        self.config.version += 1;
        Ok(generation)
    }

    /// Transitions shards from PROVISIONING to NONE once their local
    /// stores exist.
    pub fn mark_shards_provisioned(
        &mut self,
        shards: &[ShardId],
    ) -> Result<(), MembershipOpError> {
        use crate::node::StorageState;
        for &shard in shards {
            let node = self
                .config
                .nodes
                .get_mut(&shard.node)
                .ok_or(MembershipOpError::NoMatchInConfig { node: shard.node })?;
            let storage = node.storage.as_mut().ok_or_else(|| {
                MembershipOpError::InvalidRequestNodesConfig {
                    reason: format!("N{} has no storage role", shard.node),
                }
            })?;
            let state = storage
                .shard_states
                .get_mut(shard.shard as usize)
                .ok_or_else(|| MembershipOpError::InvalidRequestNodesConfig {
                    reason: format!("no such shard {}", shard),
                })?;
            if *state == StorageState::Provisioning {
                *state = StorageState::None;
            }
        }
        self.config.version += 1;
        Ok(())
    }

    /// Finishes cluster bootstrap: every disabled shard becomes
    /// READ_WRITE and further bootstraps are rejected.
    pub fn bootstrap_cluster(&mut self) -> Result<(), MembershipOpError> {
        use crate::node::StorageState;
        if self.bootstrapped {
            return Err(MembershipOpError::InvalidRequestNodesConfig {
                reason: "cluster is already bootstrapped".into(),
            });
        }
        for node in self.config.nodes.values_mut() {
            if let Some(storage) = node.storage.as_mut() {
                for state in &mut storage.shard_states {
                    if state.disabled() {
                        *state = StorageState::ReadWrite;
                    }
                }
            }
        }
        self.bootstrapped = true;
        self.config.version += 1;
        Ok(())
    }
}

fn smallest_free_index(config: &NodesConfiguration) -> NodeIndex {
    let mut idx: NodeIndex = 0;
    while config.contains(idx) {
        idx += 1;
    }
    idx
}
