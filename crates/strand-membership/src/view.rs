//! The membership view: a read-mostly, atomically swappable snapshot of
//! the nodes configuration, with update notification.

use crate::nodes_config::{NodesConfigError, NodesConfiguration};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error(transparent)]
    Config(#[from] NodesConfigError),
}

/// Holds the current nodes configuration and notifies subscribers on
/// every adopted update. Published snapshots are never mutated.
pub struct MembershipView {
    current: RwLock<Arc<NodesConfiguration>>,
    update_tx: broadcast::Sender<Arc<NodesConfiguration>>,
}

impl MembershipView {
    pub fn new(initial: NodesConfiguration) -> Self {
        let (update_tx, _) = broadcast::channel(16);
        MembershipView {
            current: RwLock::new(Arc::new(initial)),
            update_tx,
        }
    }

    /// Cheap snapshot of the current configuration.
    pub fn current(&self) -> Arc<NodesConfiguration> {
        self.current.read().clone()
    }

    /// Subscribe to adopted configuration updates.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<NodesConfiguration>> {
        self.update_tx.subscribe()
    }

    /// Validates and adopts a new configuration.
    ///
    /// The proposed version must be strictly greater than the current
    /// one; the snapshot is swapped atomically and subscribers receive
    /// the new `Arc`.
    pub fn apply_update(
        &self,
        update: NodesConfiguration,
    ) -> Result<Arc<NodesConfiguration>, ViewError> {
        update.validate()?;
        let new = Arc::new(update);
        {
            let mut cur = self.current.write();
            if new.version <= cur.version {
                return Err(ViewError::Config(NodesConfigError::VersionMismatch {
                    current: cur.version,
                    proposed: new.version,
                }));
            }
            *cur = new.clone();
        }
        tracing::debug!(version = new.version, nodes = new.nodes.len(), "adopted nodes configuration");
        let _ = self.update_tx.send(new.clone());
        Ok(new)
    }
}
