//! Gossip protocol configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// How often to probe a random peer.
    pub probe_interval: Duration,
    /// How long to wait for an ack before suspecting the peer.
    pub ack_timeout: Duration,
    /// How long a peer stays suspect before being declared dead.
    pub suspicion_timeout: Duration,
    /// Maximum health entries piggybacked per message.
    pub gossip_fanout: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            probe_interval: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(300),
            suspicion_timeout: Duration::from_secs(3),
            gossip_fanout: 16,
        }
    }
}

impl GossipConfig {
    /// Short timers for in-process tests.
    pub fn fast() -> Self {
        GossipConfig {
            probe_interval: Duration::from_millis(20),
            ack_timeout: Duration::from_millis(40),
            suspicion_timeout: Duration::from_millis(120),
            gossip_fanout: 16,
        }
    }
}
