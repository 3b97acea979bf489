//! The per-log sequencer state machine.
//!
//! States: Unprovisioned → Activating → Active → Draining, with
//! Preempted terminal for this instance. Activation bumps the epoch
//! through the epoch store, recovers dirty predecessor epochs, and only
//! then starts admitting appends.

use crate::appender::{AppendOutcome, Appender};
use crate::config::SequencerConfig;
use crate::error::AppendError;
use crate::recovery::{EpochRecovery, RecoveryError};
use crate::shaping::{Priority, TrafficShaper};
use crate::transport::NodeTransport;
use crate::window::AppendWindow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use strand_epoch::{
    EpochMetadata, EpochStore, EpochStoreError, MetadataUpdate,
};
use strand_membership::{MembershipView, NodeIndex};
use strand_placement::{NodesetError, NodesetSelection, NodesetSelector, ReplicationProperty};
use strand_record::{ChecksumKind, DataRecord, Epoch, KeyKind, LogId, Lsn, Payload, RecordFlags};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Unprovisioned,
    Activating,
    Active,
    Draining,
    Preempted { by: Epoch },
}

/// Snapshot of the sequencer, as reported to GET_SEQ_STATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerStatus {
    pub state: SequencerState,
    pub epoch: Epoch,
    pub last_released: Lsn,
    pub redirect: Option<NodeIndex>,
    pub recovering: bool,
}

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error(transparent)]
    EpochStore(#[from] EpochStoreError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Nodeset(#[from] NodesetError),
    #[error("sequencer is shutting down")]
    Shutdown,
}

/// Optional append attributes.
#[derive(Debug, Clone, Default)]
pub struct AppendAttrs {
    pub keys: BTreeMap<KeyKind, String>,
    pub counters: BTreeMap<u8, i64>,
    /// Mark the payload as a buffered-writer batch.
    pub batch: bool,
}

struct Inner {
    state: SequencerState,
    metadata: Option<EpochMetadata>,
    window: Option<AppendWindow>,
    redirect: Option<NodeIndex>,
    /// Highest epoch this instance ever tried to activate.
    last_attempt: Epoch,
    prior_selection: Option<NodesetSelection>,
    /// Set when an appender permanently failed; the next append
    /// reactivates into a fresh epoch first.
    needs_reactivation: bool,
}

pub struct Sequencer {
    log: LogId,
    node: NodeIndex,
    replication: ReplicationProperty,
    view: Arc<MembershipView>,
    epoch_store: Arc<EpochStore>,
    selector: Box<dyn NodesetSelector>,
    transport: Arc<dyn NodeTransport>,
    shaper: Arc<TrafficShaper>,
    config: SequencerConfig,
    inner: parking_lot::Mutex<Inner>,
    /// Serializes activations.
    activation: tokio::sync::Mutex<()>,
    recovering: AtomicBool,
    shutting_down: AtomicBool,
}

impl Sequencer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: LogId,
        node: NodeIndex,
        replication: ReplicationProperty,
        view: Arc<MembershipView>,
        epoch_store: Arc<EpochStore>,
        selector: Box<dyn NodesetSelector>,
        transport: Arc<dyn NodeTransport>,
        config: SequencerConfig,
    ) -> Self {
        Sequencer {
            log,
            node,
            replication,
            view,
            epoch_store,
            selector,
            transport,
            shaper: Arc::new(TrafficShaper::unlimited()),
            config,
            inner: parking_lot::Mutex::new(Inner {
                state: SequencerState::Unprovisioned,
                metadata: None,
                window: None,
                redirect: None,
                last_attempt: Epoch::INVALID,
                prior_selection: None,
                needs_reactivation: false,
            }),
            activation: tokio::sync::Mutex::new(()),
            recovering: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_shaper(mut self, shaper: Arc<TrafficShaper>) -> Self {
        self.shaper = shaper;
        self
    }

    pub fn log(&self) -> LogId {
        self.log
    }

    pub fn node(&self) -> NodeIndex {
        self.node
    }

    pub fn status(&self) -> SequencerStatus {
        let inner = self.inner.lock();
        SequencerStatus {
            state: inner.state,
            epoch: inner
                .metadata
                .as_ref()
                .map(|m| m.epoch)
                .unwrap_or(Epoch::INVALID),
            last_released: inner
                .window
                .as_ref()
                .map(|w| w.last_released())
                .unwrap_or(Lsn::INVALID),
            redirect: inner.redirect,
            recovering: self.recovering.load(Ordering::Acquire),
        }
    }

    /// Activation protocol: CAS the next epoch's metadata, recover
    /// everything below it, then open the append window.
    pub async fn activate(&self, reason: &str) -> Result<Epoch, ActivationError> {
        let _guard = self.activation.lock().await;
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ActivationError::Shutdown);
        }

        let (last_attempt, prior_selection) = {
            let mut inner = self.inner.lock();
            inner.state = SequencerState::Activating;
            (inner.last_attempt, inner.prior_selection.clone())
        };

        let config = self.view.current();
        let selector = &self.selector;
        let log = self.log;
        let node = self.node;
        let replication = self.replication.clone();
        let nodeset_size = self.config.nodeset_size;

        let outcome = self
            .epoch_store
            .create_or_update_metadata(log, |current| {
                let stored_epoch = current.map(|m| m.epoch).unwrap_or(Epoch::INVALID);
                let next_epoch = stored_epoch.max(last_attempt).next();

                // Reuse the stored nodeset when the selection inputs
                // are unchanged.
                let prior = current
                    .map(|m| NodesetSelection {
                        nodeset: m.nodeset.clone(),
                        params_hash: m.nodeset_params,
                    })
                    .or_else(|| prior_selection.clone());
                let selection = selector
                    .select(log, &config, &replication, nodeset_size, prior.as_ref())
                    .map_err(|e| EpochStoreError::InvalidParam(e.to_string()))?;

                let effective_since = match current {
                    Some(m) if m.nodeset == selection.nodeset => m.effective_since,
                    _ => next_epoch,
                };
                Ok(MetadataUpdate::Update(EpochMetadata {
                    epoch: next_epoch,
                    nodeset: selection.nodeset,
                    replication: replication.clone(),
                    effective_since,
                    nodeset_params: selection.params_hash,
                    writer_node: Some(node),
                }))
            })
            .await?;
        let metadata = outcome.metadata().clone();
        let epoch = metadata.epoch;

        {
            let mut inner = self.inner.lock();
            inner.last_attempt = epoch;
            inner.prior_selection = Some(NodesetSelection {
                nodeset: metadata.nodeset.clone(),
                params_hash: metadata.nodeset_params,
            });
        }

        // Recover every epoch below the new one before serving.
        self.recovering.store(true, Ordering::Release);
        let result = self.recover_below(&metadata).await;
        self.recovering.store(false, Ordering::Release);
        result?;

        {
            let mut inner = self.inner.lock();
            inner.state = SequencerState::Active;
            inner.metadata = Some(metadata);
            inner.window = Some(AppendWindow::new(epoch, self.config.window_size));
            inner.redirect = None;
            inner.needs_reactivation = false;
        }
        tracing::info!(log = %self.log, %epoch, reason, "sequencer active");
        Ok(epoch)
    }

    async fn recover_below(&self, metadata: &EpochMetadata) -> Result<(), ActivationError> {
        let lce = match self.epoch_store.get_last_clean_epoch(self.log).await {
            Ok((lce, _)) => lce,
            Err(EpochStoreError::NotFound(_)) => Epoch::INVALID,
            Err(e) => return Err(e.into()),
        };
        let recovery = EpochRecovery {
            log: self.log,
            new_epoch: metadata.epoch,
            metadata: metadata.clone(),
            config: self.config.clone(),
            now_ms: now_ms(),
        };
        recovery
            .run(
                lce,
                &self.view,
                self.transport.clone(),
                self.shaper.clone(),
                &self.epoch_store,
            )
            .await?;
        Ok(())
    }

    /// Appends one record; resolves once the record is fully replicated
    /// and released, with its LSN.
    pub async fn append(&self, payload: Payload) -> Result<Lsn, AppendError> {
        self.append_with_attrs(payload, AppendAttrs::default()).await
    }

    pub async fn append_with_attrs(
        &self,
        payload: Payload,
        attrs: AppendAttrs,
    ) -> Result<Lsn, AppendError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(AppendError::Shutdown);
        }
        if payload.size() > self.config.max_payload_size {
            return Err(AppendError::TooBig {
                size: payload.size(),
                max: self.config.max_payload_size,
            });
        }

        // A permanently failed slot dirties the epoch; move to a fresh
        // one before admitting more work.
        let reactivate = {
            let inner = self.inner.lock();
            inner.needs_reactivation && inner.state == SequencerState::Active
        };
        if reactivate {
            self.activate("append after failed slot")
                .await
                .map_err(|_| AppendError::NoSequencer)?;
        }

        let (lsn, metadata) = {
            let mut inner = self.inner.lock();
            match inner.state {
                SequencerState::Active => {}
                SequencerState::Preempted { .. } => {
                    return Err(AppendError::Preempted {
                        redirect: inner.redirect,
                    })
                }
                _ => return Err(AppendError::NoSequencer),
            }
            let window = inner.window.as_mut().expect("active sequencer has a window");
            let Some(lsn) = window.try_admit() else {
                return Err(AppendError::NoBufs);
            };
            (lsn, inner.metadata.clone().expect("active sequencer has metadata"))
        };

        let mut record = DataRecord::new(self.log, lsn, now_ms(), payload);
        record.keys = attrs.keys;
        record.counters = attrs.counters;
        if attrs.batch {
            record.flags |= RecordFlags::BUFFERED_WRITER_BATCH;
        }
        record.flags = record.flags.with_checksum(ChecksumKind::Crc32);

        let appender = Appender {
            record,
            nodeset: metadata.nodeset.clone(),
            property: metadata.replication.clone(),
            config: self.config.clone(),
            priority: Priority::Client,
        };
        let outcome = appender
            .run(&self.view, self.transport.clone(), self.shaper.clone())
            .await;

        match outcome {
            AppendOutcome::Stored { .. } => {
                let released = {
                    let mut inner = self.inner.lock();
                    match inner.window.as_mut() {
                        Some(window) if window.epoch() == lsn.epoch() => {
                            window.complete(lsn.esn())
                        }
                        _ => None,
                    }
                };
                if let Some(released) = released {
                    self.broadcast_release(&metadata, released);
                }
                Ok(lsn)
            }
            AppendOutcome::Preempted { by } => {
                self.note_preemption(by).await;
                let redirect = self.inner.lock().redirect;
                Err(AppendError::Preempted { redirect })
            }
            AppendOutcome::Failed(err) => {
                let mut inner = self.inner.lock();
                if let Some(window) = inner.window.as_mut() {
                    if window.epoch() == lsn.epoch() {
                        window.abandon(lsn.esn());
                    }
                }
                inner.needs_reactivation = true;
                Err(err)
            }
        }
    }

    /// A store (or a GET_SEQ_STATE peer) reported a higher epoch.
    pub async fn note_preemption(&self, by: Epoch) {
        {
            let mut inner = self.inner.lock();
            let current = inner
                .metadata
                .as_ref()
                .map(|m| m.epoch)
                .unwrap_or(Epoch::INVALID);
            if by <= current {
                return;
            }
            inner.state = SequencerState::Preempted { by };
        }
        // Best effort: learn who preempted us so clients can be
        // redirected.
        if let Ok(metadata) = self.epoch_store.read_metadata(self.log).await {
            let mut inner = self.inner.lock();
            if let SequencerState::Preempted { .. } = inner.state {
                inner.redirect = metadata.writer_node.filter(|&n| n != self.node);
            }
        }
        tracing::warn!(log = %self.log, by = %by, "sequencer preempted");
    }

    /// Stops admitting appends; in-flight appenders finish.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SequencerState::Active {
            inner.state = SequencerState::Draining;
        }
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    fn broadcast_release(&self, metadata: &EpochMetadata, released: Lsn) {
        let transport = self.transport.clone();
        let log = self.log;
        let nodeset = metadata.nodeset.clone();
        tokio::spawn(async move {
            for shard in nodeset {
                let _ = transport.release(shard, log, released).await;
            }
        });
    }

    /// Periodic RELEASE re-broadcast so shards that missed one catch
    /// up. Runs until the sequencer shuts down.
    pub fn spawn_release_rebroadcast(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::downgrade(self);
        let interval = self.config.release_rebroadcast_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(seq) = this.upgrade() else { break };
                if seq.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                let (metadata, released) = {
                    let inner = seq.inner.lock();
                    let released = inner
                        .window
                        .as_ref()
                        .map(|w| w.last_released())
                        .unwrap_or(Lsn::INVALID);
                    (inner.metadata.clone(), released)
                };
                if let (Some(metadata), true) = (metadata, released.is_valid()) {
                    for shard in &metadata.nodeset {
                        let _ = seq.transport.release(*shard, seq.log, released).await;
                    }
                }
            }
        })
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
