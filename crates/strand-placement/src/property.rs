//! Replication properties: how many distinct failure domains of each
//! scope a copyset must span.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use strand_membership::{FailureDomainScope, NodesConfiguration, ShardId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("replication property must name at least one scope")]
    Empty,
    #[error("replication at {scope} must be at least 1")]
    ZeroRequirement { scope: FailureDomainScope },
    #[error("replication at {larger} ({larger_r}) exceeds replication at {smaller} ({smaller_r})")]
    NotMonotone {
        larger: FailureDomainScope,
        larger_r: usize,
        smaller: FailureDomainScope,
        smaller_r: usize,
    },
}

/// Mapping from failure-domain scope to the minimum number of distinct
/// domains of that scope a copyset must touch.
///
/// The overall copyset size (the replication factor) is the largest
/// requirement across scopes. A requirement at a larger scope can never
/// exceed one at a smaller scope: `{rack: 2, node: 3}` is fine (3 copies
/// across at least 2 racks), `{rack: 3, node: 2}` is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationProperty {
    scopes: BTreeMap<FailureDomainScope, usize>,
}

impl ReplicationProperty {
    pub fn new(
        scopes: impl IntoIterator<Item = (FailureDomainScope, usize)>,
    ) -> Result<Self, PropertyError> {
        let scopes: BTreeMap<_, _> = scopes.into_iter().collect();
        if scopes.is_empty() {
            return Err(PropertyError::Empty);
        }
        for (&scope, &r) in &scopes {
            if r == 0 {
                return Err(PropertyError::ZeroRequirement { scope });
            }
        }
        // Scopes iterate smallest-first; requirements must not grow.
        let mut prev: Option<(FailureDomainScope, usize)> = None;
        for (&scope, &r) in &scopes {
            if let Some((smaller, smaller_r)) = prev {
                if r > smaller_r {
                    return Err(PropertyError::NotMonotone {
                        larger: scope,
                        larger_r: r,
                        smaller,
                        smaller_r,
                    });
                }
            }
            prev = Some((scope, r));
        }
        Ok(ReplicationProperty { scopes })
    }

    /// Plain `r`-way replication with no cross-domain constraint.
    pub fn from_factor(r: usize) -> Result<Self, PropertyError> {
        Self::new([(FailureDomainScope::Node, r)])
    }

    /// Total number of copies: the largest requirement.
    pub fn replication_factor(&self) -> usize {
        *self.scopes.values().max().expect("property is never empty")
    }

    /// Requirement at `scope`, if any.
    pub fn at(&self, scope: FailureDomainScope) -> Option<usize> {
        self.scopes.get(&scope).copied()
    }

    pub fn scopes(&self) -> impl Iterator<Item = (FailureDomainScope, usize)> + '_ {
        self.scopes.iter().map(|(&s, &r)| (s, r))
    }

    /// The largest scope carrying a requirement above 1, if any. This is
    /// the scope cross-domain selection needs to spread over.
    pub fn widest_constrained_scope(&self) -> Option<FailureDomainScope> {
        self.scopes
            .iter()
            .rev()
            .find(|(_, &r)| r > 1)
            .map(|(&s, _)| s)
    }

    /// Whether `shards` satisfies every scope constraint simultaneously.
    pub fn satisfied_by(&self, shards: &[ShardId], config: &NodesConfiguration) -> bool {
        let mut tally = FailureDomainTally::new(self.clone());
        for &shard in shards {
            tally.add(shard, config);
        }
        tally.satisfied()
    }
}

impl fmt::Display for ReplicationProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .scopes
            .iter()
            .map(|(s, r)| format!("{}: {}", s, r))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Incremental distinct-domain counting for a candidate set against a
/// property. Used by the copyset selector, the appender's STORED tally,
/// and the reader health check.
#[derive(Debug, Clone)]
pub struct FailureDomainTally {
    property: ReplicationProperty,
    /// Distinct domain identities seen per constrained scope.
    domains: BTreeMap<FailureDomainScope, BTreeSet<String>>,
    members: BTreeSet<ShardId>,
}

impl FailureDomainTally {
    pub fn new(property: ReplicationProperty) -> Self {
        let domains = property.scopes().map(|(s, _)| (s, BTreeSet::new())).collect();
        FailureDomainTally {
            property,
            domains,
            members: BTreeSet::new(),
        }
    }

    /// Domain identity of a shard at a scope. A shard with no label at
    /// the scope counts as its own synthetic domain, which keeps nodes
    /// without locations from collapsing into one domain.
    pub fn domain_of(shard: ShardId, scope: FailureDomainScope, config: &NodesConfiguration) -> String {
        match scope {
            FailureDomainScope::Node => format!("node:{}", shard.node),
            FailureDomainScope::Root => String::new(),
            _ => config
                .shard_location(shard)
                .domain(scope)
                .unwrap_or_else(|| format!("unset-node:{}", shard.node)),
        }
    }

    pub fn add(&mut self, shard: ShardId, config: &NodesConfiguration) {
        if !self.members.insert(shard) {
            return;
        }
        for (scope, set) in self.domains.iter_mut() {
            set.insert(Self::domain_of(shard, *scope, config));
        }
    }

    /// Number of distinct domains this candidate would newly cover.
    pub fn gain(&self, shard: ShardId, config: &NodesConfiguration) -> usize {
        if self.members.contains(&shard) {
            return 0;
        }
        self.domains
            .iter()
            .filter(|(scope, set)| {
                let needed = self.property.at(**scope).unwrap_or(0);
                set.len() < needed && !set.contains(&Self::domain_of(shard, **scope, config))
            })
            .count()
    }

    pub fn distinct(&self, scope: FailureDomainScope) -> usize {
        self.domains.get(&scope).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn satisfied(&self) -> bool {
        self.len() >= self.property.replication_factor()
            && self
                .property
                .scopes()
                .all(|(scope, r)| self.distinct(scope) >= r)
    }
}
