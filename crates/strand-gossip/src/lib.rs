//! Best-effort node liveness via a SWIM-like gossip protocol.
//!
//! The detector feeds routing decisions only: the sequencer avoids
//! storing to dead nodes, the read streams account unresponsive shards,
//! and the admin surface refuses to remove nodes gossip still sees
//! alive. Nothing here is a source of correctness.

pub mod config;
pub mod detector;
pub mod message;
pub mod state;
pub mod transport;

pub use config::GossipConfig;
pub use detector::GossipDetector;
pub use message::{GossipMessage, HealthEntry};
pub use state::{ClusterState, HealthEvent, NodeHealth};
pub use transport::{create_transport_mesh, GossipTransport, InMemoryTransport, UdpTransport};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("shutdown")]
    Shutdown,
}
