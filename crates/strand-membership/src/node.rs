//! Per-node configuration: roles, addresses, storage and sequencer
//! attributes, and per-shard membership states.

use crate::location::Location;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Roles a node may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Sequencer,
    Storage,
}

/// Membership state of one storage shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageState {
    /// Newly added; not yet usable.
    Provisioning,
    /// Provisioned but taking no reads or writes.
    None,
    ReadOnly,
    ReadWrite,
    /// Being drained; reads only, data moving away.
    DataMigration,
    Invalid,
}

impl StorageState {
    /// True when the shard can take new writes.
    pub fn writable(self) -> bool {
        matches!(self, StorageState::ReadWrite)
    }

    /// True when the shard can serve reads.
    pub fn readable(self) -> bool {
        matches!(
            self,
            StorageState::ReadOnly | StorageState::ReadWrite | StorageState::DataMigration
        )
    }

    /// True when the shard holds no data the cluster depends on.
    pub fn disabled(self) -> bool {
        matches!(self, StorageState::None | StorageState::Provisioning)
    }
}

impl fmt::Display for StorageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageState::Provisioning => "PROVISIONING",
            StorageState::None => "NONE",
            StorageState::ReadOnly => "READ_ONLY",
            StorageState::ReadWrite => "READ_WRITE",
            StorageState::DataMigration => "DATA_MIGRATION",
            StorageState::Invalid => "INVALID",
        };
        write!(f, "{}", s)
    }
}

/// Sequencer-role attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerNodeConfig {
    /// Relative share of logs this node sequences; 0 disables placement.
    pub weight: f64,
}

/// Storage-role attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNodeConfig {
    /// Relative storage capacity.
    pub capacity: f64,
    /// One state per shard; the length is the shard count.
    pub shard_states: Vec<StorageState>,
    /// Membership state for metadata storage on this node.
    pub metadata_state: StorageState,
}

impl StorageNodeConfig {
    pub fn num_shards(&self) -> u16 {
        self.shard_states.len() as u16
    }
}

/// One node's entry in the nodes configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable name, unique in the cluster.
    pub name: String,
    /// Bumped when the node is replaced in place; an address or
    /// generation change requires closing existing connections.
    pub generation: u32,
    pub roles: BTreeSet<NodeRole>,
    /// Data-plane service address.
    pub data_addr: String,
    /// Gossip service address.
    pub gossip_addr: String,
    /// TLS data address, when the node terminates TLS separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_addr: Option<String>,
    /// Position in the failure-domain hierarchy. Immutable once added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencer: Option<SequencerNodeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageNodeConfig>,
}

impl NodeConfig {
    pub fn is_sequencer(&self) -> bool {
        self.roles.contains(&NodeRole::Sequencer)
    }

    pub fn is_storage(&self) -> bool {
        self.roles.contains(&NodeRole::Storage)
    }

    pub fn location(&self) -> Location {
        self.location.clone().unwrap_or_default()
    }

    /// Role attributes must be present for every declared role.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("node name must not be empty".into());
        }
        if self.data_addr.is_empty() {
            return Err("data address must not be empty".into());
        }
        if self.is_storage() && self.storage.is_none() {
            return Err(format!("node {} has storage role but no storage config", self.name));
        }
        if self.is_sequencer() && self.sequencer.is_none() {
            return Err(format!(
                "node {} has sequencer role but no sequencer config",
                self.name
            ));
        }
        if let Some(storage) = &self.storage {
            if storage.shard_states.is_empty() {
                return Err(format!("node {} declares zero shards", self.name));
            }
        }
        Ok(())
    }
}

/// Builder-ish helpers used by tests and the admin surface.
impl NodeConfig {
    pub fn storage_node(name: impl Into<String>, addr: impl Into<String>, shards: u16) -> Self {
        let addr = addr.into();
        NodeConfig {
            name: name.into(),
            generation: 1,
            roles: BTreeSet::from([NodeRole::Storage]),
            gossip_addr: format!("{}-gossip", addr),
            data_addr: addr,
            ssl_addr: None,
            location: None,
            sequencer: None,
            storage: Some(StorageNodeConfig {
                capacity: 1.0,
                shard_states: vec![StorageState::ReadWrite; shards as usize],
                metadata_state: StorageState::ReadWrite,
            }),
        }
    }

    pub fn sequencer_node(name: impl Into<String>, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        NodeConfig {
            name: name.into(),
            generation: 1,
            roles: BTreeSet::from([NodeRole::Sequencer]),
            gossip_addr: format!("{}-gossip", addr),
            data_addr: addr,
            ssl_addr: None,
            location: None,
            sequencer: Some(SequencerNodeConfig { weight: 1.0 }),
            storage: None,
        }
    }

    pub fn both(name: impl Into<String>, addr: impl Into<String>, shards: u16) -> Self {
        let mut n = Self::storage_node(name, addr, shards);
        n.roles.insert(NodeRole::Sequencer);
        n.sequencer = Some(SequencerNodeConfig { weight: 1.0 });
        n
    }

    pub fn at(mut self, location: &str) -> Self {
        self.location = Some(Location::parse(location));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_state_predicates() {
        assert!(StorageState::ReadWrite.writable());
        assert!(!StorageState::ReadOnly.writable());
        assert!(StorageState::DataMigration.readable());
        assert!(StorageState::Provisioning.disabled());
        assert!(StorageState::None.disabled());
        assert!(!StorageState::ReadWrite.disabled());
    }

    #[test]
    fn validate_requires_role_attributes() {
        let mut n = NodeConfig::storage_node("n0", "host0:4440", 2);
        n.storage = None;
        let err = n.validate().unwrap_err();
        assert!(err.contains("storage role"));

        let mut s = NodeConfig::sequencer_node("n1", "host1:4440");
        s.sequencer = None;
        assert!(s.validate().unwrap_err().contains("sequencer role"));
    }

    #[test]
    fn builders_produce_valid_nodes() {
        NodeConfig::storage_node("n0", "host0:4440", 4).validate().unwrap();
        NodeConfig::sequencer_node("n1", "host1:4440").validate().unwrap();
        NodeConfig::both("n2", "host2:4440", 1).at("rgn1.dc1.cl1.row1.rk1")
            .validate()
            .unwrap();
    }
}
