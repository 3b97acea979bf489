//! The epoch store: per-log coordination for epoch metadata and the
//! last-clean epoch, against a versioned CAS store.
//!
//! Keys are `{root}/{log-id}/epoch-metadata`, `{root}/{log-id}/last-clean-data`
//! and `{root}/{log-id}/last-clean-metadata`; the two last-clean keys
//! track the data log and its metadata log separately.

use crate::backoff::ExponentialBackoff;
use crate::metadata::{EpochMetadata, TailRecord};
use crate::store::{StoreError, VersionedConfigStore, VersionedValue};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_record::{Epoch, LogId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpochStoreError {
    /// Lost the CAS race more times than the retry cap allows; the
    /// caller should try again.
    #[error("lost the update race; try again")]
    Again,
    /// The stored value is malformed or has an unsupported format.
    #[error("bad epoch store value for {log}: {reason}")]
    BadMessage { log: LogId, reason: String },
    /// A set-last-clean-epoch with a non-increasing epoch; carries the
    /// stored value.
    #[error("last clean epoch is already {stored}")]
    Stale { stored: Epoch },
    #[error("log {0} is not provisioned in the epoch store")]
    NotFound(LogId),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("epoch store is shutting down")]
    Shutdown,
    #[error("updater declined to change the metadata")]
    Uptodate,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EpochStoreError {
    fn from(e: StoreError) -> Self {
        EpochStoreError::Store(e)
    }
}

/// What a metadata updater decided.
pub enum MetadataUpdate {
    /// Write this metadata (create or replace).
    Update(EpochMetadata),
    /// The stored value is already what it should be.
    Unchanged,
}

/// Result of `create_or_update_metadata`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(EpochMetadata),
    Unchanged(EpochMetadata),
}

impl UpdateOutcome {
    pub fn metadata(&self) -> &EpochMetadata {
        match self {
            UpdateOutcome::Updated(m) | UpdateOutcome::Unchanged(m) => m,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpochStoreConfig {
    /// Root path under which all per-log keys live.
    pub root: String,
    /// Whether absent logs may be provisioned on first write.
    pub allow_provisioning: bool,
    pub backoff: ExponentialBackoff,
}

impl Default for EpochStoreConfig {
    fn default() -> Self {
        EpochStoreConfig {
            root: "/strand".to_string(),
            allow_provisioning: true,
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// Persisted alongside the LCE: the epoch plus the tail of the log at
/// the end of that epoch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct LceValue {
    lce: Epoch,
    tail: TailRecord,
}

pub struct EpochStore {
    store: Arc<dyn VersionedConfigStore>,
    config: EpochStoreConfig,
    shutting_down: AtomicBool,
}

impl EpochStore {
    pub fn new(store: Arc<dyn VersionedConfigStore>, config: EpochStoreConfig) -> Self {
        EpochStore {
            store,
            config,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// After shutdown every pending and future operation fails with
    /// `Shutdown`; no completion is ever posted past this point.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    fn check_shutdown(&self) -> Result<(), EpochStoreError> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(EpochStoreError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn metadata_key(&self, log: LogId) -> String {
        format!("{}/{}/epoch-metadata", self.config.root, log.data_log().as_u64())
    }

    fn lce_key(&self, log: LogId) -> String {
        let kind = if log.is_metadata() {
            "last-clean-metadata"
        } else {
            "last-clean-data"
        };
        format!("{}/{}/{}", self.config.root, log.data_log().as_u64(), kind)
    }

    /// Reads the last clean epoch and the tail record frozen at it.
    pub async fn get_last_clean_epoch(
        &self,
        log: LogId,
    ) -> Result<(Epoch, TailRecord), EpochStoreError> {
        self.check_shutdown()?;
        let key = self.lce_key(log);
        let entry = self
            .store
            .get(&key)
            .await?
            .ok_or(EpochStoreError::NotFound(log))?;
        let value = decode_lce(log, &entry)?;
        Ok((value.lce, value.tail))
    }

    /// CAS-advances the last clean epoch. Accepted only if `lce` is
    /// strictly greater than the stored value; the tail record must not
    /// carry within-epoch offsets.
    pub async fn set_last_clean_epoch(
        &self,
        log: LogId,
        lce: Epoch,
        tail: TailRecord,
    ) -> Result<(), EpochStoreError> {
        if tail.offsets.within_epoch {
            return Err(EpochStoreError::InvalidParam(
                "tail record carries within-epoch offsets".to_string(),
            ));
        }
        let key = self.lce_key(log);
        let mut backoff = self.config.backoff.clone();
        loop {
            self.check_shutdown()?;
            let entry = self
                .store
                .get(&key)
                .await?
                .ok_or(EpochStoreError::NotFound(log))?;
            let stored = decode_lce(log, &entry)?;
            if lce <= stored.lce {
                return Err(EpochStoreError::Stale { stored: stored.lce });
            }
            let next = LceValue {
                lce,
                tail: tail.clone(),
            };
            let encoded = Bytes::from(bincode::serialize(&next).expect("lce value serializes"));
            match self
                .store
                .put_if_version(&key, encoded, Some(entry.version))
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionMismatch { .. }) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(%log, attempt = backoff.attempt(), "lce CAS lost, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(EpochStoreError::Again),
                },
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Reads the current epoch metadata for a log.
    pub async fn read_metadata(&self, log: LogId) -> Result<EpochMetadata, EpochStoreError> {
        self.check_shutdown()?;
        let key = self.metadata_key(log);
        let entry = self
            .store
            .get(&key)
            .await?
            .ok_or(EpochStoreError::NotFound(log))?;
        decode_metadata(log, &entry)
    }

    /// Read-modify-write of the epoch metadata.
    ///
    /// The updater is a pure function of the stored value (or absence);
    /// it is re-invoked after every lost CAS race, with exponential
    /// backoff up to a cap. When the log is absent and provisioning is
    /// allowed, the metadata key and both empty last-clean keys are
    /// created in one atomic multi-op.
    pub async fn create_or_update_metadata<F>(
        &self,
        log: LogId,
        updater: F,
    ) -> Result<UpdateOutcome, EpochStoreError>
    where
        F: Fn(Option<&EpochMetadata>) -> Result<MetadataUpdate, EpochStoreError>,
    {
        let key = self.metadata_key(log);
        let mut backoff = self.config.backoff.clone();
        loop {
            self.check_shutdown()?;
            match self.store.get(&key).await? {
                None => {
                    if !self.config.allow_provisioning {
                        return Err(EpochStoreError::NotFound(log));
                    }
                    let next = match updater(None)? {
                        MetadataUpdate::Update(next) => next,
                        MetadataUpdate::Unchanged => return Err(EpochStoreError::NotFound(log)),
                    };
                    let encoded =
                        Bytes::from(bincode::serialize(&next).expect("metadata serializes"));
                    let empty_lce = Bytes::from(
                        bincode::serialize(&LceValue::default()).expect("lce value serializes"),
                    );
                    match self
                        .store
                        .multi_create(vec![
                            (key.clone(), encoded),
                            (self.lce_key(log.data_log()), empty_lce.clone()),
                            (self.lce_key(log.metadata_log()), empty_lce),
                        ])
                        .await
                    {
                        Ok(()) => {
                            tracing::info!(%log, epoch = %next.epoch, "provisioned log in epoch store");
                            return Ok(UpdateOutcome::Updated(next));
                        }
                        // Someone else provisioned concurrently; re-read.
                        Err(StoreError::AlreadyExists { .. }) => {}
                        Err(other) => return Err(other.into()),
                    }
                }
                Some(entry) => {
                    let current = decode_metadata(log, &entry)?;
                    let next = match updater(Some(&current))? {
                        MetadataUpdate::Update(next) => next,
                        MetadataUpdate::Unchanged => {
                            return Ok(UpdateOutcome::Unchanged(current))
                        }
                    };
                    let encoded =
                        Bytes::from(bincode::serialize(&next).expect("metadata serializes"));
                    match self
                        .store
                        .put_if_version(&key, encoded, Some(entry.version))
                        .await
                    {
                        Ok(_) => return Ok(UpdateOutcome::Updated(next)),
                        Err(StoreError::VersionMismatch { .. }) => {}
                        Err(other) => return Err(other.into()),
                    }
                }
            }
            match backoff.next_delay() {
                Some(delay) => {
                    tracing::debug!(%log, attempt = backoff.attempt(), "metadata CAS lost, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(EpochStoreError::Again),
            }
        }
    }
}

fn decode_lce(log: LogId, entry: &VersionedValue) -> Result<LceValue, EpochStoreError> {
    if entry.value.is_empty() {
        // Provisioned but never written: epoch 0, empty tail.
        return Ok(LceValue::default());
    }
    bincode::deserialize(&entry.value).map_err(|e| EpochStoreError::BadMessage {
        log,
        reason: e.to_string(),
    })
}

fn decode_metadata(log: LogId, entry: &VersionedValue) -> Result<EpochMetadata, EpochStoreError> {
    bincode::deserialize(&entry.value).map_err(|e| EpochStoreError::BadMessage {
        log,
        reason: e.to_string(),
    })
}
