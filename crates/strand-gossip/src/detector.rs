//! The gossip failure detector: probe loop, ack tracking, suspicion
//! promotion.

use crate::config::GossipConfig;
use crate::message::GossipMessage;
use crate::state::ClusterState;
use crate::transport::GossipTransport;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strand_membership::NodeIndex;
use tokio::sync::broadcast;

/// Runs the gossip protocol for one node.
///
/// Three background loops: probing a random live peer, receiving and
/// answering messages, and promoting expired suspects to dead.
pub struct GossipDetector {
    state: Arc<ClusterState>,
    transport: Arc<dyn GossipTransport>,
    config: GossipConfig,
    /// Gossip addresses of every peer.
    peers: BTreeMap<NodeIndex, SocketAddr>,
    seq: AtomicU64,
    /// Probe sequence numbers still waiting for an ack.
    pending_acks: Arc<Mutex<HashSet<u64>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GossipDetector {
    pub fn new(
        state: Arc<ClusterState>,
        transport: Arc<dyn GossipTransport>,
        peers: BTreeMap<NodeIndex, SocketAddr>,
        config: GossipConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        GossipDetector {
            state,
            transport,
            config,
            peers,
            seq: AtomicU64::new(0),
            pending_acks: Arc::new(Mutex::new(HashSet::new())),
            shutdown_tx,
        }
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.state.clone()
    }

    /// Spawns the probe, receive and suspicion loops.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.probe_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.probe_once().await,
                    _ = shutdown.recv() => break,
                }
            }
        });

        let this = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = this.transport.recv() => match incoming {
                        Ok((from, msg)) => this.handle(from, msg).await,
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });

        let this = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.probe_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for node in this.state.promote_expired(this.config.suspicion_timeout) {
                            tracing::warn!(node, "gossip declared node dead");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn probe_once(self: &Arc<Self>) {
        let targets = self.state.probe_targets();
        let target = {
            let mut rng = rand::thread_rng();
            targets.choose(&mut rng).copied()
        };
        let Some(target) = target else { return };
        let Some(&addr) = self.peers.get(&target) else { return };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.pending_acks.lock().insert(seq);

        let msg = GossipMessage::Ping {
            seq,
            from: self.state.local(),
            entries: self.state.gossip_entries(self.config.gossip_fanout),
        };
        if self.transport.send(addr, msg).await.is_err() {
            self.pending_acks.lock().remove(&seq);
            self.state.mark_suspect(target);
            return;
        }

        // Suspect the target if no ack lands within the timeout.
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.ack_timeout).await;
            if this.pending_acks.lock().remove(&seq) {
                tracing::debug!(node = target, seq, "probe timed out");
                this.state.mark_suspect(target);
            }
        });
    }

    async fn handle(&self, from_addr: SocketAddr, msg: GossipMessage) {
        let from = msg.from_node();
        self.state.apply_all(msg.entries());
        self.state.mark_alive(from);

        match msg {
            GossipMessage::Ping { seq, .. } => {
                let ack = GossipMessage::Ack {
                    seq,
                    from: self.state.local(),
                    entries: self.state.gossip_entries(self.config.gossip_fanout),
                };
                let _ = self.transport.send(from_addr, ack).await;
            }
            GossipMessage::Ack { seq, .. } => {
                self.pending_acks.lock().remove(&seq);
            }
        }
    }
}
