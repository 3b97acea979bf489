//! Append errors, as surfaced to clients.

use strand_membership::NodeIndex;
use strand_wire::Status;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppendError {
    /// A higher-epoch sequencer took over; reroute to `redirect`.
    #[error("sequencer preempted (redirect: {redirect:?})")]
    Preempted { redirect: Option<NodeIndex> },
    #[error("no active sequencer for this log")]
    NoSequencer,
    #[error("payload of {size} bytes exceeds the maximum of {max}")]
    TooBig { size: usize, max: usize },
    #[error("sequencer window is full")]
    NoBufs,
    #[error("permission denied")]
    Access,
    #[error("replication did not finish before the deadline")]
    TimedOut,
    #[error("shutting down")]
    Shutdown,
}

impl AppendError {
    pub fn status(&self) -> Status {
        match self {
            AppendError::Preempted { .. } => Status::Preempted,
            AppendError::NoSequencer => Status::NoSequencer,
            AppendError::TooBig { .. } => Status::TooBig,
            AppendError::NoBufs => Status::NoBufs,
            AppendError::Access => Status::Access,
            AppendError::TimedOut => Status::TimedOut,
            AppendError::Shutdown => Status::Shutdown,
        }
    }
}
