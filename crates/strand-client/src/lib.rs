//! Client-side write path: the buffered writer, the checkpoint store,
//! and append routing to the current sequencer.

pub mod buffered_writer;
pub mod checkpoint;
pub mod router;

pub use buffered_writer::{
    BatchMode, BatchSink, BufferedWriter, BufferedWriterOptions, WriteResult,
};
pub use checkpoint::{CheckpointError, CheckpointStore, VersionedCheckpointStore};
pub use router::{
    AppendReply, AppendRouter, ClientError, RouterConfig, SequencerLocator, SequencerService,
    WeightedLocator,
};
