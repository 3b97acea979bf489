//! The per-log sequencer and its write coordinator.
//!
//! A sequencer owns one log's write path for one epoch: it assigns
//! sequence numbers, drives replication through per-record appenders,
//! maintains the releasable-prefix cursor, recovers dirty epochs on
//! activation, and steps down when preempted by a higher epoch.

pub mod appender;
pub mod config;
pub mod error;
pub mod recovery;
pub mod sequencer;
pub mod shaping;
pub mod transport;
pub mod window;

pub use appender::{AppendOutcome, Appender};
pub use config::SequencerConfig;
pub use error::AppendError;
pub use recovery::{EpochRecovery, RecoveryError};
pub use sequencer::{
    ActivationError, AppendAttrs, Sequencer, SequencerState, SequencerStatus,
};
pub use shaping::{Grant, Priority, TrafficShaper};
pub use transport::{InProcessTransport, NodeTransport, TransportError};
pub use window::AppendWindow;
