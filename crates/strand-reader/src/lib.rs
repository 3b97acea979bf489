//! Client-side read streams: fan out to the storage set, merge by LSN,
//! detect gaps, fail over from single-copy delivery, and follow epoch
//! boundaries through bridge records.

pub mod health;
pub mod stream;
pub mod stuck;

pub use health::read_health;
pub use stream::{
    ClientReadEvent, ClientReadStream, ReadError, ReadStreamConfig, ShardSource,
    ShardSourceFactory, StreamState,
};
pub use stuck::next_from_lsn_when_stuck;
