//! Gossip wire messages: pings, acks, and piggybacked health entries.

use crate::state::NodeHealth;
use crate::GossipError;
use serde::{Deserialize, Serialize};
use strand_membership::NodeIndex;

/// One node's health, as disseminated through gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEntry {
    pub node: NodeIndex,
    pub health: NodeHealth,
    /// Incarnation number for conflict resolution; a node refutes its
    /// own suspicion by bumping this.
    pub incarnation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Liveness probe.
    Ping {
        seq: u64,
        from: NodeIndex,
        entries: Vec<HealthEntry>,
    },
    /// Probe acknowledgment.
    Ack {
        seq: u64,
        from: NodeIndex,
        entries: Vec<HealthEntry>,
    },
}

impl GossipMessage {
    pub fn from_node(&self) -> NodeIndex {
        match self {
            GossipMessage::Ping { from, .. } | GossipMessage::Ack { from, .. } => *from,
        }
    }

    pub fn entries(&self) -> &[HealthEntry] {
        match self {
            GossipMessage::Ping { entries, .. } | GossipMessage::Ack { entries, .. } => entries,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, GossipError> {
        bincode::serialize(self).map_err(|e| GossipError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GossipError> {
        bincode::deserialize(bytes).map_err(|e| GossipError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let msg = GossipMessage::Ping {
            seq: 42,
            from: 3,
            entries: vec![HealthEntry {
                node: 1,
                health: NodeHealth::Suspect,
                incarnation: 7,
            }],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(GossipMessage::decode(&bytes).unwrap(), msg);
        assert_eq!(msg.from_node(), 3);
        assert_eq!(msg.entries().len(), 1);
    }
}
