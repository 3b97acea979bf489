//! Cluster membership: the versioned nodes configuration, the atomically
//! swappable membership view, failure-domain locations, and the cluster
//! membership mutation operations with their admin-facing error semantics.
//!
//! The view is the sole source of truth for routing and copyset selection.

pub mod admin;
pub mod location;
pub mod node;
pub mod nodes_config;
pub mod view;

pub use admin::{
    AddNodeRequest, ClusterMembership, LivenessCheck, MembershipOpError, OpFailedReason,
    ANY_NODE_IDX,
};
pub use location::{FailureDomainScope, Location};
pub use node::{NodeConfig, NodeRole, SequencerNodeConfig, StorageNodeConfig, StorageState};
pub use nodes_config::{NodeIndex, NodesConfigError, NodesConfiguration, ShardId};
pub use view::{MembershipView, ViewError};
