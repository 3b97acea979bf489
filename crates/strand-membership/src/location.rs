//! Failure-domain scopes and node locations.
//!
//! A location is a path through the failure-domain hierarchy, written
//! `"region.data_center.cluster.row.rack"`. Empty labels are allowed and
//! mean "unspecified below this point".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure-domain scopes, smallest first.
///
/// `Node` is the implicit leaf (every node is its own domain); `Root`
/// covers the whole deployment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureDomainScope {
    Node,
    Rack,
    Row,
    Cluster,
    DataCenter,
    Region,
    Root,
}

impl FailureDomainScope {
    /// All scopes, smallest first.
    pub const ALL: [FailureDomainScope; 7] = [
        FailureDomainScope::Node,
        FailureDomainScope::Rack,
        FailureDomainScope::Row,
        FailureDomainScope::Cluster,
        FailureDomainScope::DataCenter,
        FailureDomainScope::Region,
        FailureDomainScope::Root,
    ];

    /// Index into a location's labels; `None` for Node and Root, which
    /// have no label of their own.
    fn label_index(self) -> Option<usize> {
        match self {
            FailureDomainScope::Region => Some(0),
            FailureDomainScope::DataCenter => Some(1),
            FailureDomainScope::Cluster => Some(2),
            FailureDomainScope::Row => Some(3),
            FailureDomainScope::Rack => Some(4),
            FailureDomainScope::Node | FailureDomainScope::Root => None,
        }
    }
}

impl fmt::Display for FailureDomainScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureDomainScope::Node => "node",
            FailureDomainScope::Rack => "rack",
            FailureDomainScope::Row => "row",
            FailureDomainScope::Cluster => "cluster",
            FailureDomainScope::DataCenter => "data_center",
            FailureDomainScope::Region => "region",
            FailureDomainScope::Root => "root",
        };
        write!(f, "{}", s)
    }
}

/// A node's position in the failure-domain hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location {
    /// `[region, data_center, cluster, row, rack]`; trailing labels may
    /// be empty.
    labels: [String; 5],
}

impl Location {
    /// Parses `"region.dc.cluster.row.rack"`; shorter forms leave the
    /// remaining labels empty.
    pub fn parse(s: &str) -> Self {
        let mut labels: [String; 5] = Default::default();
        for (i, part) in s.split('.').take(5).enumerate() {
            labels[i] = part.to_string();
        }
        Location { labels }
    }

    /// The domain label at `scope`, or `None` when unset.
    pub fn label(&self, scope: FailureDomainScope) -> Option<&str> {
        let idx = scope.label_index()?;
        let l = self.labels[idx].as_str();
        if l.is_empty() {
            None
        } else {
            Some(l)
        }
    }

    /// The full domain identity at `scope`: the label path from region
    /// down to `scope`, or `None` when any label on the path is unset.
    ///
    /// Two nodes are in the same `scope`-domain iff their identities at
    /// that scope are equal.
    pub fn domain(&self, scope: FailureDomainScope) -> Option<String> {
        match scope {
            FailureDomainScope::Root => return Some(String::new()),
            FailureDomainScope::Node => return None,
            _ => {}
        }
        let upto = scope.label_index().expect("scoped domains have labels");
        let mut out = String::new();
        for label in &self.labels[..=upto] {
            if label.is_empty() {
                return None;
            }
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(label);
        }
        Some(out)
    }

    /// The smallest scope at which `self` and `other` are in the same
    /// domain (longest shared prefix of domain labels). Two locations
    /// that share nothing are only together under `Root`.
    pub fn closest_shared_scope(&self, other: &Location) -> FailureDomainScope {
        let mut shared = FailureDomainScope::Root;
        for scope in [
            FailureDomainScope::Region,
            FailureDomainScope::DataCenter,
            FailureDomainScope::Cluster,
            FailureDomainScope::Row,
            FailureDomainScope::Rack,
        ] {
            match (self.label(scope), other.label(scope)) {
                (Some(a), Some(b)) if a == b => shared = scope,
                _ => break,
            }
        }
        shared
    }

    pub fn is_empty(&self) -> bool {
        self.labels.iter().all(String::is_empty)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self
            .labels
            .iter()
            .rposition(|l| !l.is_empty())
            .map(|i| i + 1)
            .unwrap_or(0);
        write!(f, "{}", self.labels[..last].join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let loc = Location::parse("rgn1.dc1.cl1.row1.rk1");
        assert_eq!(loc.to_string(), "rgn1.dc1.cl1.row1.rk1");
        let partial = Location::parse("rgn1.dc1");
        assert_eq!(partial.to_string(), "rgn1.dc1");
        assert_eq!(partial.label(FailureDomainScope::Rack), None);
    }

    #[test]
    fn domain_identity_is_prefix_path() {
        let loc = Location::parse("rgn1.dc1.cl1.row1.rk1");
        assert_eq!(loc.domain(FailureDomainScope::Region).unwrap(), "rgn1");
        assert_eq!(
            loc.domain(FailureDomainScope::Rack).unwrap(),
            "rgn1.dc1.cl1.row1.rk1"
        );
        assert_eq!(loc.domain(FailureDomainScope::Root).unwrap(), "");
        assert_eq!(loc.domain(FailureDomainScope::Node), None);
    }

    #[test]
    fn same_rack_name_in_different_rows_is_a_different_domain() {
        let a = Location::parse("rgn1.dc1.cl1.row1.rk1");
        let b = Location::parse("rgn1.dc1.cl1.row2.rk1");
        assert_ne!(
            a.domain(FailureDomainScope::Rack),
            b.domain(FailureDomainScope::Rack)
        );
    }

    #[test]
    fn closest_shared_scope_is_longest_prefix() {
        let a = Location::parse("rgn1.dc1.cl1.row1.rk1");
        assert_eq!(
            a.closest_shared_scope(&Location::parse("rgn1.dc1.cl1.row1.rk1")),
            FailureDomainScope::Rack
        );
        assert_eq!(
            a.closest_shared_scope(&Location::parse("rgn1.dc1.cl1.row1.rk2")),
            FailureDomainScope::Row
        );
        assert_eq!(
            a.closest_shared_scope(&Location::parse("rgn1.dc2.cl1.row1.rk1")),
            FailureDomainScope::Region
        );
        assert_eq!(
            a.closest_shared_scope(&Location::parse("rgn2")),
            FailureDomainScope::Root
        );
    }

    #[test]
    fn scope_ordering() {
        assert!(FailureDomainScope::Node < FailureDomainScope::Rack);
        assert!(FailureDomainScope::Rack < FailureDomainScope::Region);
        assert!(FailureDomainScope::Region < FailureDomainScope::Root);
    }
}
