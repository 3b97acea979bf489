//! Status codes carried in replies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a wire-level request. These travel between nodes; crate
/// error types on either side map into and out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// A higher-epoch sequencer exists; reply carries the redirect.
    Preempted,
    /// No active sequencer for the log.
    NoSequencer,
    /// Payload exceeds the configured maximum.
    TooBig,
    /// Sender or sequencer queue limit reached.
    NoBufs,
    /// Permission denied.
    Access,
    /// Deadline elapsed.
    TimedOut,
    /// Target shard does not accept stores.
    Disabled,
    /// Shard is out of space.
    NoSpace,
    /// Record checksum failed verification on the storage node.
    ChecksumMismatch,
    /// Store accepted on a forwarding node; does not count toward the
    /// replication property.
    Forward,
    /// Log or key unknown.
    NotFound,
    /// Peer protocol too old for this message.
    ProtoNoSupport,
    /// Connection could not be established.
    ConnFailed,
    /// Local shutdown in progress.
    Shutdown,
    /// Invariant violation; fail-closed.
    Internal,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
