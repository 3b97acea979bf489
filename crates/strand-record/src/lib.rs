//! Core data model for the strand log store: log identifiers, sequence
//! numbers, records, payloads, and the record/batch codecs.
//!
//! Everything above this crate (membership, placement, storage, the
//! sequencer and the readers) speaks in these types.

pub mod batch;
pub mod payload;
pub mod record;
pub mod types;

pub use batch::{decode_batch, encode_batch, BatchError, Compression};
pub use payload::{Payload, PayloadGroup};
pub use record::{
    ChecksumKind, DataRecord, GapKind, GapRecord, KeyKind, RecordError, RecordFlags,
};
pub use types::{Epoch, Esn, LogId, Lsn};
