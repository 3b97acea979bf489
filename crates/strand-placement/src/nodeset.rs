//! Nodeset selection: picking the storage set for a new epoch.
//!
//! Selectors are pure with respect to their inputs; when the inputs are
//! unchanged (same params hash) the prior nodeset is reused so epoch
//! bumps do not shuffle data placement for no reason.

use crate::property::ReplicationProperty;
use crate::shard_rank;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use crate::property::FailureDomainTally;
use std::collections::BTreeMap;
use std::hash::Hasher;
use strand_membership::{FailureDomainScope, NodesConfiguration, ShardId};
use strand_record::LogId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodesetError {
    #[error("not enough writable shards: need {needed}, have {available}")]
    Insufficient { needed: usize, available: usize },
    #[error("nodeset cannot satisfy replication property {property}")]
    Unsatisfiable { property: String },
}

/// The outcome of nodeset selection: the storage set plus a hash of the
/// inputs that produced it, stored in the epoch metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesetSelection {
    pub nodeset: Vec<ShardId>,
    pub params_hash: u64,
}

/// Strategy interface. The sequencer holds one `Box<dyn NodesetSelector>`
/// and never inspects the concrete type.
pub trait NodesetSelector: Send + Sync {
    fn select(
        &self,
        log: LogId,
        config: &NodesConfiguration,
        replication: &ReplicationProperty,
        size: usize,
        prior: Option<&NodesetSelection>,
    ) -> Result<NodesetSelection, NodesetError>;
}

/// Hash of everything that influences selection; if it matches the
/// prior selection's hash the prior nodeset is reused.
fn params_hash(
    log: LogId,
    shards: &[ShardId],
    replication: &ReplicationProperty,
    size: usize,
    tag: u8,
) -> u64 {
    let mut hasher = twox_hash::XxHash64::with_seed(0x5eed);
    hasher.write(&log.as_u64().to_le_bytes());
    hasher.write(&[tag]);
    hasher.write(&(size as u64).to_le_bytes());
    for (scope, r) in replication.scopes() {
        hasher.write(&[scope as u8, r as u8]);
    }
    for shard in shards {
        hasher.write(&shard.node.to_le_bytes());
        hasher.write(&shard.shard.to_le_bytes());
    }
    hasher.finish()
}

fn writable_sorted(config: &NodesConfiguration) -> Vec<ShardId> {
    let mut shards = config.writable_shards();
    shards.sort_unstable();
    shards
}

fn check_pool(pool: &[ShardId], size: usize) -> Result<(), NodesetError> {
    if pool.len() < size {
        return Err(NodesetError::Insufficient {
            needed: size,
            available: pool.len(),
        });
    }
    Ok(())
}

fn finish(
    log: LogId,
    pool: &[ShardId],
    replication: &ReplicationProperty,
    size: usize,
    tag: u8,
    prior: Option<&NodesetSelection>,
    build: impl FnOnce() -> Vec<ShardId>,
) -> Result<NodesetSelection, NodesetError> {
    let hash = params_hash(log, pool, replication, size, tag);
    if let Some(prior) = prior {
        if prior.params_hash == hash {
            return Ok(prior.clone());
        }
    }
    let nodeset = build();
    Ok(NodesetSelection {
        nodeset,
        params_hash: hash,
    })
}

/// Rendezvous hashing on (log, shard): stable under nodeset churn.
pub struct ConsistentHashingSelector;

impl NodesetSelector for ConsistentHashingSelector {
    fn select(
        &self,
        log: LogId,
        config: &NodesConfiguration,
        replication: &ReplicationProperty,
        size: usize,
        prior: Option<&NodesetSelection>,
    ) -> Result<NodesetSelection, NodesetError> {
        let pool = writable_sorted(config);
        check_pool(&pool, size)?;
        finish(log, &pool, replication, size, 0, prior, || {
            let mut ranked: Vec<(u64, ShardId)> = pool
                .iter()
                .map(|&s| (shard_rank(log.as_u64(), s), s))
                .collect();
            ranked.sort_unstable();
            let mut nodeset: Vec<ShardId> = ranked.into_iter().take(size).map(|(_, s)| s).collect();
            nodeset.sort_unstable();
            nodeset
        })
    }
}

/// Uniform sample, seeded by the selection inputs.
pub struct RandomSelector;

impl NodesetSelector for RandomSelector {
    fn select(
        &self,
        log: LogId,
        config: &NodesConfiguration,
        replication: &ReplicationProperty,
        size: usize,
        prior: Option<&NodesetSelection>,
    ) -> Result<NodesetSelection, NodesetError> {
        let pool = writable_sorted(config);
        check_pool(&pool, size)?;
        let seed = params_hash(log, &pool, replication, size, 1);
        finish(log, &pool, replication, size, 1, prior, || {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let mut nodeset: Vec<ShardId> = pool
                .choose_multiple(&mut rng, size)
                .copied()
                .collect();
            nodeset.sort_unstable();
            nodeset
        })
    }
}

/// Spreads the nodeset evenly across the property's widest constrained
/// scope before sampling within each domain.
pub struct RandomCrossDomainSelector;

impl NodesetSelector for RandomCrossDomainSelector {
    fn select(
        &self,
        log: LogId,
        config: &NodesConfiguration,
        replication: &ReplicationProperty,
        size: usize,
        prior: Option<&NodesetSelection>,
    ) -> Result<NodesetSelection, NodesetError> {
        let pool = writable_sorted(config);
        check_pool(&pool, size)?;
        let scope = replication
            .widest_constrained_scope()
            .unwrap_or(FailureDomainScope::Node);
        let seed = params_hash(log, &pool, replication, size, 2);

        // Partition by domain, deterministically ordered.
        let mut domains: BTreeMap<String, Vec<ShardId>> = BTreeMap::new();
        for &shard in &pool {
            domains
                .entry(FailureDomainTally::domain_of(shard, scope, config))
                .or_default()
                .push(shard);
        }
        if let Some(need) = replication.at(scope) {
            if domains.len() < need {
                return Err(NodesetError::Unsatisfiable {
                    property: replication.to_string(),
                });
            }
        }

        finish(log, &pool, replication, size, 2, prior, || {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let mut per_domain: Vec<Vec<ShardId>> = domains
                .into_values()
                .map(|mut shards| {
                    shards.shuffle(&mut rng);
                    shards
                })
                .collect();
            // Round-robin across domains until the target size is met.
            let mut nodeset = Vec::with_capacity(size);
            while nodeset.len() < size {
                let mut progressed = false;
                for domain in per_domain.iter_mut() {
                    if nodeset.len() >= size {
                        break;
                    }
                    if let Some(shard) = domain.pop() {
                        nodeset.push(shard);
                        progressed = true;
                    }
                }
                if !progressed {
                    break;
                }
            }
            nodeset.sort_unstable();
            nodeset
        })
    }
}

/// Every writable shard: used for small clusters and internal logs.
pub struct SelectAllSelector;

impl NodesetSelector for SelectAllSelector {
    fn select(
        &self,
        log: LogId,
        config: &NodesConfiguration,
        replication: &ReplicationProperty,
        _size: usize,
        prior: Option<&NodesetSelection>,
    ) -> Result<NodesetSelection, NodesetError> {
        let pool = writable_sorted(config);
        let size = pool.len();
        check_pool(&pool, replication.replication_factor())?;
        finish(log, &pool, replication, size, 3, prior, || pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_membership::NodeConfig;

    fn config(locs: &[&str]) -> NodesConfiguration {
        let mut c = NodesConfiguration::new(1);
        for (i, loc) in locs.iter().enumerate() {
            c.nodes.insert(
                i as u16,
                NodeConfig::storage_node(format!("n{i}"), format!("h{i}:4440"), 2).at(loc),
            );
        }
        c
    }

    fn rack_prop(r: usize) -> ReplicationProperty {
        ReplicationProperty::new([(FailureDomainScope::Rack, r)]).unwrap()
    }

    #[test]
    fn consistent_hashing_is_stable_and_log_dependent() {
        let c = config(&["r.d.c.w.k1", "r.d.c.w.k2", "r.d.c.w.k3", "r.d.c.w.k4"]);
        let p = rack_prop(2);
        let sel = ConsistentHashingSelector;
        let a = sel.select(LogId::new(1), &c, &p, 4, None).unwrap();
        let b = sel.select(LogId::new(1), &c, &p, 4, None).unwrap();
        assert_eq!(a, b);
        let other = sel.select(LogId::new(2), &c, &p, 4, None).unwrap();
        assert_eq!(other.nodeset.len(), 4);
        assert_ne!(a.params_hash, other.params_hash);
    }

    #[test]
    fn prior_reused_when_inputs_unchanged() {
        let c = config(&["r.d.c.w.k1", "r.d.c.w.k2", "r.d.c.w.k3", "r.d.c.w.k4"]);
        let p = rack_prop(2);
        let sel = RandomSelector;
        let first = sel.select(LogId::new(7), &c, &p, 3, None).unwrap();
        let again = sel.select(LogId::new(7), &c, &p, 3, Some(&first)).unwrap();
        assert_eq!(first, again);

        // Input change (different size) produces a fresh selection hash.
        let changed = sel.select(LogId::new(7), &c, &p, 4, Some(&first)).unwrap();
        assert_ne!(first.params_hash, changed.params_hash);
        assert_eq!(changed.nodeset.len(), 4);
    }

    #[test]
    fn random_selector_insufficient_pool() {
        let c = config(&["r.d.c.w.k1"]);
        let p = rack_prop(1);
        let err = RandomSelector
            .select(LogId::new(1), &c, &p, 5, None)
            .unwrap_err();
        assert!(matches!(err, NodesetError::Insufficient { needed: 5, available: 2 }));
    }

    #[test]
    fn cross_domain_spreads_over_racks() {
        let c = config(&[
            "r.d.c.w.k1",
            "r.d.c.w.k1",
            "r.d.c.w.k2",
            "r.d.c.w.k2",
            "r.d.c.w.k3",
            "r.d.c.w.k3",
        ]);
        let p = rack_prop(3);
        let selection = RandomCrossDomainSelector
            .select(LogId::new(5), &c, &p, 6, None)
            .unwrap();
        assert_eq!(selection.nodeset.len(), 6);
        assert!(p.satisfied_by(&selection.nodeset, &c));
    }

    #[test]
    fn cross_domain_rejects_too_few_domains() {
        let c = config(&["r.d.c.w.k1", "r.d.c.w.k1", "r.d.c.w.k1"]);
        let p = rack_prop(2);
        let err = RandomCrossDomainSelector
            .select(LogId::new(5), &c, &p, 4, None)
            .unwrap_err();
        assert!(matches!(err, NodesetError::Unsatisfiable { .. }));
    }

    #[test]
    fn select_all_takes_everything_writable() {
        let c = config(&["r.d.c.w.k1", "r.d.c.w.k2"]);
        let p = rack_prop(2);
        let selection = SelectAllSelector
            .select(LogId::new(3), &c, &p, 1, None)
            .unwrap();
        assert_eq!(selection.nodeset.len(), 4);
    }
}
