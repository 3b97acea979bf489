//! Reader health: can the responsive part of the storage set still make
//! progress under the epoch's failure-domain constraint?

use std::collections::BTreeSet;
use strand_membership::{NodesConfiguration, ShardId};
use strand_placement::{FailureDomainTally, ReplicationProperty};

/// A reader is healthy iff the responsive shards of the nodeset can
/// still satisfy the replication property: any fully replicated record
/// must then intersect them, so progress is possible in principle.
pub fn read_health(
    nodeset: &[ShardId],
    responsive: &BTreeSet<ShardId>,
    property: &ReplicationProperty,
    config: &NodesConfiguration,
) -> bool {
    let mut tally = FailureDomainTally::new(property.clone());
    for &shard in nodeset {
        if responsive.contains(&shard) {
            tally.add(shard, config);
        }
    }
    tally.satisfied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_membership::{FailureDomainScope, NodeConfig};

    fn config(locs: &[&str]) -> NodesConfiguration {
        let mut c = NodesConfiguration::new(1);
        for (i, loc) in locs.iter().enumerate() {
            c.nodes.insert(
                i as u16,
                NodeConfig::storage_node(format!("n{i}"), format!("h{i}:4440"), 1).at(loc),
            );
        }
        c
    }

    #[test]
    fn healthy_while_enough_domains_respond() {
        let c = config(&["r1.d.c.w.k", "r2.d.c.w.k", "r3.d.c.w.k"]);
        let nodeset: Vec<ShardId> = (0..3).map(|i| ShardId::new(i, 0)).collect();
        let p = ReplicationProperty::new([(FailureDomainScope::Region, 2)]).unwrap();

        let all: BTreeSet<ShardId> = nodeset.iter().copied().collect();
        assert!(read_health(&nodeset, &all, &p, &c));

        // One region down: still two distinct regions.
        let two: BTreeSet<ShardId> = nodeset[..2].iter().copied().collect();
        assert!(read_health(&nodeset, &two, &p, &c));

        // Two regions down: below the property.
        let one: BTreeSet<ShardId> = nodeset[..1].iter().copied().collect();
        assert!(!read_health(&nodeset, &one, &p, &c));
    }

    #[test]
    fn responsive_shards_outside_the_nodeset_do_not_count() {
        let c = config(&["r1", "r2"]);
        let nodeset = vec![ShardId::new(0, 0)];
        let p = ReplicationProperty::from_factor(1).unwrap();
        let responsive = BTreeSet::from([ShardId::new(1, 0)]);
        assert!(!read_health(&nodeset, &responsive, &p, &c));
    }
}
