//! Epoch coordination: per-log epoch metadata and last-clean-epoch
//! state, kept in an external strongly-consistent versioned key-value
//! store with compare-and-swap writes.

pub mod backoff;
pub mod epoch_store;
pub mod metadata;
pub mod store;

pub use backoff::ExponentialBackoff;
pub use epoch_store::{EpochStore, EpochStoreConfig, EpochStoreError, MetadataUpdate, UpdateOutcome};
pub use metadata::{EpochMetadata, OffsetMap, TailRecord};
pub use store::{InMemoryVersionedStore, StoreError, VersionedConfigStore, VersionedValue};
