//! Cluster health state with SWIM-style merge rules.
//!
//! Merge rules per node:
//! - higher incarnation always wins;
//! - same incarnation: Dead > Suspect > Alive;
//! - the local node refutes its own suspicion by bumping incarnation.

use crate::message::HealthEntry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use strand_membership::{LivenessCheck, NodeIndex};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
    Alive,
    Suspect,
    Dead,
}

impl NodeHealth {
    /// Precedence at equal incarnation.
    fn rank(self) -> u8 {
        match self {
            NodeHealth::Alive => 0,
            NodeHealth::Suspect => 1,
            NodeHealth::Dead => 2,
        }
    }
}

/// Emitted whenever a node's health changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthEvent {
    pub node: NodeIndex,
    pub health: NodeHealth,
    pub incarnation: u64,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    health: NodeHealth,
    incarnation: u64,
    /// When the node entered Suspect; drives promotion to Dead.
    suspected_at: Option<Instant>,
}

/// Shared, thread-safe health map for all known nodes.
pub struct ClusterState {
    local: NodeIndex,
    local_incarnation: AtomicU64,
    nodes: RwLock<BTreeMap<NodeIndex, NodeEntry>>,
    event_tx: broadcast::Sender<HealthEvent>,
}

impl ClusterState {
    /// All `nodes` start Alive; failure is detected, not assumed.
    pub fn new(local: NodeIndex, nodes: impl IntoIterator<Item = NodeIndex>) -> Self {
        let map = nodes
            .into_iter()
            .map(|n| {
                (
                    n,
                    NodeEntry {
                        health: NodeHealth::Alive,
                        incarnation: 0,
                        suspected_at: None,
                    },
                )
            })
            .collect();
        let (event_tx, _) = broadcast::channel(64);
        ClusterState {
            local,
            local_incarnation: AtomicU64::new(0),
            nodes: RwLock::new(map),
            event_tx,
        }
    }

    pub fn local(&self) -> NodeIndex {
        self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }

    pub fn health(&self, node: NodeIndex) -> NodeHealth {
        self.nodes
            .read()
            .get(&node)
            .map(|e| e.health)
            .unwrap_or(NodeHealth::Dead)
    }

    /// Snapshot of every node's health.
    pub fn view(&self) -> BTreeMap<NodeIndex, NodeHealth> {
        self.nodes.read().iter().map(|(n, e)| (*n, e.health)).collect()
    }

    /// Nodes to probe: everyone but the local node that is not dead.
    pub fn probe_targets(&self) -> Vec<NodeIndex> {
        self.nodes
            .read()
            .iter()
            .filter(|(n, e)| **n != self.local && e.health != NodeHealth::Dead)
            .map(|(n, _)| *n)
            .collect()
    }

    /// Health entries to piggyback on outgoing messages.
    pub fn gossip_entries(&self, limit: usize) -> Vec<HealthEntry> {
        let nodes = self.nodes.read();
        let mut entries: Vec<HealthEntry> = nodes
            .iter()
            .map(|(n, e)| HealthEntry {
                node: *n,
                health: e.health,
                incarnation: e.incarnation,
            })
            .collect();
        // Own alive claim always travels first.
        entries.sort_by_key(|e| (e.node != self.local, e.node));
        entries.truncate(limit);
        entries
    }

    /// Local suspicion after a failed probe.
    pub fn mark_suspect(&self, node: NodeIndex) {
        let incarnation = self
            .nodes
            .read()
            .get(&node)
            .map(|e| e.incarnation)
            .unwrap_or(0);
        self.apply(HealthEntry {
            node,
            health: NodeHealth::Suspect,
            incarnation,
        });
    }

    /// Direct evidence of life (an ack or any message from the node).
    pub fn mark_alive(&self, node: NodeIndex) {
        let incarnation = self
            .nodes
            .read()
            .get(&node)
            .map(|e| e.incarnation)
            .unwrap_or(0);
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(node).or_insert(NodeEntry {
            health: NodeHealth::Alive,
            incarnation,
            suspected_at: None,
        });
        if entry.health != NodeHealth::Alive {
            // Direct contact overrides gossip at the same incarnation.
            entry.health = NodeHealth::Alive;
            entry.suspected_at = None;
            let evt = HealthEvent {
                node,
                health: NodeHealth::Alive,
                incarnation: entry.incarnation,
            };
            drop(nodes);
            let _ = self.event_tx.send(evt);
        }
    }

    /// Merges one gossiped entry, applying the SWIM precedence rules.
    pub fn apply(&self, entry: HealthEntry) {
        if entry.node == self.local {
            self.maybe_refute(entry);
            return;
        }
        let mut nodes = self.nodes.write();
        let current = nodes.entry(entry.node).or_insert(NodeEntry {
            health: NodeHealth::Alive,
            incarnation: 0,
            suspected_at: None,
        });
        let wins = entry.incarnation > current.incarnation
            || (entry.incarnation == current.incarnation
                && entry.health.rank() > current.health.rank());
        if !wins {
            return;
        }
        let changed = current.health != entry.health;
        current.incarnation = entry.incarnation;
        current.health = entry.health;
        current.suspected_at = match entry.health {
            NodeHealth::Suspect => Some(Instant::now()),
            _ => None,
        };
        if changed {
            let evt = HealthEvent {
                node: entry.node,
                health: entry.health,
                incarnation: entry.incarnation,
            };
            drop(nodes);
            let _ = self.event_tx.send(evt);
        }
    }

    /// Applies every entry of an incoming message.
    pub fn apply_all(&self, entries: &[HealthEntry]) {
        for entry in entries {
            self.apply(*entry);
        }
    }

    /// Suspicion of the local node is refuted by bumping incarnation.
    fn maybe_refute(&self, entry: HealthEntry) {
        if entry.health == NodeHealth::Alive {
            return;
        }
        let ours = self.local_incarnation.load(Ordering::Acquire);
        if entry.incarnation >= ours {
            let next = entry.incarnation + 1;
            self.local_incarnation.store(next, Ordering::Release);
            let mut nodes = self.nodes.write();
            if let Some(e) = nodes.get_mut(&self.local) {
                e.incarnation = next;
                e.health = NodeHealth::Alive;
            }
            tracing::debug!(node = self.local, incarnation = next, "refuted own suspicion");
        }
    }

    /// Promotes suspects past the timeout to Dead. Returns the nodes
    /// declared dead.
    pub fn promote_expired(&self, timeout: std::time::Duration) -> Vec<NodeIndex> {
        let expired: Vec<(NodeIndex, u64)> = {
            let nodes = self.nodes.read();
            nodes
                .iter()
                .filter_map(|(n, e)| match (e.health, e.suspected_at) {
                    (NodeHealth::Suspect, Some(at)) if at.elapsed() >= timeout => {
                        Some((*n, e.incarnation))
                    }
                    _ => None,
                })
                .collect()
        };
        for (node, incarnation) in &expired {
            self.apply(HealthEntry {
                node: *node,
                health: NodeHealth::Dead,
                incarnation: *incarnation,
            });
        }
        expired.into_iter().map(|(n, _)| n).collect()
    }
}

impl LivenessCheck for ClusterState {
    fn is_alive(&self, node: NodeIndex) -> bool {
        self.health(node) != NodeHealth::Dead
    }
}
