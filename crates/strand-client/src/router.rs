//! Append routing: locate the right sequencer node for a log, follow
//! preemption redirects, and give up cleanly when nobody is reachable.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::hash::Hasher;
use std::sync::Arc;
use strand_membership::{FailureDomainScope, Location, MembershipView, NodeIndex};
use strand_record::{LogId, Lsn, Payload};
use strand_wire::Status;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("append failed with {status} (redirect: {redirect:?})")]
pub struct ClientError {
    pub status: Status,
    pub redirect: Option<NodeIndex>,
}

impl ClientError {
    pub fn status(status: Status) -> Self {
        ClientError {
            status,
            redirect: None,
        }
    }
}

/// A successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReply {
    pub lsn: Lsn,
    pub sequencer: NodeIndex,
}

/// Where the append actually goes: a connection to one node's
/// sequencer service.
#[async_trait]
pub trait SequencerService: Send + Sync {
    async fn append(
        &self,
        node: NodeIndex,
        log: LogId,
        payload: Payload,
    ) -> Result<Lsn, ClientError>;
}

/// Picks the sequencer node for a log.
pub trait SequencerLocator: Send + Sync {
    /// `None` when no eligible node remains.
    fn locate(
        &self,
        log: LogId,
        affinity: Option<&Location>,
        excluded: &BTreeSet<NodeIndex>,
    ) -> Option<NodeIndex>;
}

/// Weight-aware deterministic locator with region affinity.
///
/// Nodes sharing the affinity's region are preferred; when the region
/// is absent from the cluster every sequencer node is a legal choice.
/// Among eligible nodes the pick is rendezvous-style: stable per log,
/// spread across logs.
pub struct WeightedLocator {
    view: Arc<MembershipView>,
}

impl WeightedLocator {
    pub fn new(view: Arc<MembershipView>) -> Self {
        WeightedLocator { view }
    }
}

impl SequencerLocator for WeightedLocator {
    fn locate(
        &self,
        log: LogId,
        affinity: Option<&Location>,
        excluded: &BTreeSet<NodeIndex>,
    ) -> Option<NodeIndex> {
        let config = self.view.current();
        let candidates: Vec<NodeIndex> = config
            .sequencer_nodes()
            .map(|(idx, _)| idx)
            .filter(|idx| !excluded.contains(idx))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let preferred: Vec<NodeIndex> = match affinity {
            Some(affinity) => {
                let region = affinity.label(FailureDomainScope::Region);
                candidates
                    .iter()
                    .copied()
                    .filter(|&idx| {
                        config.location(idx).label(FailureDomainScope::Region) == region
                            && region.is_some()
                    })
                    .collect()
            }
            None => Vec::new(),
        };
        let pool = if preferred.is_empty() {
            &candidates
        } else {
            &preferred
        };

        pool.iter()
            .copied()
            .min_by_key(|&idx| {
                let mut hasher = twox_hash::XxHash64::with_seed(0x10ca);
                hasher.write(&log.as_u64().to_le_bytes());
                hasher.write(&idx.to_le_bytes());
                let weight = config
                    .node(idx)
                    .and_then(|n| n.sequencer.as_ref())
                    .map(|s| s.weight)
                    .unwrap_or(0.0);
                // Lower rank wins; weight scales the hash down.
                let rank = hasher.finish() as f64 / weight.max(f64::MIN_POSITIVE);
                (rank.to_bits(), idx)
            })
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Total routing attempts (initial + redirects + retries).
    pub max_attempts: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig { max_attempts: 4 }
    }
}

/// Routes appends: locate, send, follow redirects, exclude nodes that
/// turn out unreachable.
pub struct AppendRouter {
    locator: Box<dyn SequencerLocator>,
    service: Arc<dyn SequencerService>,
    config: RouterConfig,
}

impl AppendRouter {
    pub fn new(
        locator: Box<dyn SequencerLocator>,
        service: Arc<dyn SequencerService>,
        config: RouterConfig,
    ) -> Self {
        AppendRouter {
            locator,
            service,
            config,
        }
    }

    pub async fn append(
        &self,
        log: LogId,
        payload: Payload,
        affinity: Option<&Location>,
    ) -> Result<AppendReply, ClientError> {
        let mut excluded: BTreeSet<NodeIndex> = BTreeSet::new();
        let mut target: Option<NodeIndex> = None;
        let mut last_status = Status::NoSequencer;

        for _ in 0..self.config.max_attempts {
            let node = match target.take() {
                Some(node) => node,
                None => match self.locator.locate(log, affinity, &excluded) {
                    Some(node) => node,
                    None => {
                        return Err(ClientError {
                            status: Status::ConnFailed,
                            redirect: None,
                        })
                    }
                },
            };

            match self.service.append(node, log, payload.clone()).await {
                Ok(lsn) => return Ok(AppendReply { lsn, sequencer: node }),
                Err(err) => match err.status {
                    Status::Preempted => {
                        last_status = Status::Preempted;
                        match err.redirect {
                            // Follow the redirect unless that node
                            // already proved unreachable.
                            Some(redirect) if !excluded.contains(&redirect) => {
                                target = Some(redirect);
                            }
                            _ => return Err(ClientError::status(Status::ConnFailed)),
                        }
                    }
                    Status::ConnFailed | Status::TimedOut => {
                        last_status = err.status;
                        excluded.insert(node);
                    }
                    // Anything else surfaces immediately.
                    _ => return Err(err),
                },
            }
        }

        Err(ClientError {
            status: match last_status {
                Status::Preempted => Status::ConnFailed,
                other => other,
            },
            redirect: None,
        })
    }
}
