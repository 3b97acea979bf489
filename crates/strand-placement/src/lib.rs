//! Placement: replication properties over failure domains, copyset
//! selection, and nodeset selection.
//!
//! Selection is deterministic: identical inputs (including the seed)
//! produce identical outputs regardless of candidate iteration order.

pub mod copyset;
pub mod nodeset;
pub mod property;

pub use copyset::{CopysetSelector, SelectionInputs};
pub use nodeset::{
    ConsistentHashingSelector, NodesetError, NodesetSelection, NodesetSelector,
    RandomCrossDomainSelector, RandomSelector, SelectAllSelector,
};
pub use property::{FailureDomainTally, PropertyError, ReplicationProperty};

pub use strand_membership::FailureDomainScope;

use std::hash::Hasher;
use strand_membership::ShardId;
use twox_hash::XxHash64;

/// Deterministic shard ranking hash; candidate iteration order never
/// influences selection because candidates are re-ranked by this value.
pub fn shard_rank(seed: u64, shard: ShardId) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    hasher.write(&shard.node.to_le_bytes());
    hasher.write(&shard.shard.to_le_bytes());
    hasher.finish()
}
