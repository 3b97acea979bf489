//! File-backed log store: one append-only journal per shard, replayed
//! into an in-memory index on open.
//!
//! Entry framing: `len: u32 LE`, body, `crc32c: u32 LE` over the body.
//! Body: `kind: u8`, `log: u64 LE`, then per kind:
//! - record: `wave: u32`, `copyset_len: u16`, copyset pairs, encoded record
//! - meta: `op: u8`, `value: u64 LE`
//!
//! A truncated or corrupt tail is cut off on open, like any journal.
//! An unparseable metadata entry poisons only the affected log: it is
//! flagged permanent-error and stays unreadable and unwritable while
//! the rest of the shard keeps serving.

use crate::store::{LocalLogStore, LogState, LogStoreError, StoredRecord};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use strand_membership::ShardId;
use strand_record::{DataRecord, Epoch, LogId, Lsn};

const KIND_RECORD: u8 = 0;
const KIND_META: u8 = 1;

const META_TRIM: u8 = 0;
const META_SEAL: u8 = 1;
const META_RELEASED: u8 = 2;
const META_LCE: u8 = 3;

const MARKER_FILE: &str = "CLUSTER_MARKER";
const JOURNAL_FILE: &str = "journal";

#[derive(Default)]
struct LogSlot {
    records: BTreeMap<Lsn, StoredRecord>,
    state: LogState,
}

struct Inner {
    file: std::fs::File,
    logs: BTreeMap<LogId, LogSlot>,
    poisoned: BTreeSet<LogId>,
}

/// Journal-per-shard store. Writes are fsynced before being
/// acknowledged.
pub struct FileLogStore {
    shard: ShardId,
    inner: Mutex<Inner>,
    dir: PathBuf,
}

impl std::fmt::Debug for FileLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLogStore")
            .field("shard", &self.shard)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// What `open` found while replaying.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OpenInfo {
    pub records_replayed: usize,
    pub truncated_bytes: usize,
    pub poisoned_logs: Vec<LogId>,
}

impl FileLogStore {
    /// Opens (or creates) the shard store in `dir`.
    ///
    /// `marker` is this node's cluster marker, e.g. `"cluster1:N3:S0"`.
    /// A store created under a different marker refuses to open unless
    /// `override_marker` is set.
    pub fn open(
        dir: &Path,
        shard: ShardId,
        marker: &str,
        override_marker: bool,
    ) -> Result<(Self, OpenInfo), LogStoreError> {
        std::fs::create_dir_all(dir)?;
        let marker_path = dir.join(MARKER_FILE);
        match std::fs::read_to_string(&marker_path) {
            Ok(found) => {
                let found = found.trim().to_string();
                if found != marker && !override_marker {
                    return Err(LogStoreError::ClusterMarkerMismatch {
                        expected: marker.to_string(),
                        found,
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::write(&marker_path, marker)?;
            }
            Err(e) => return Err(e.into()),
        }

        let journal_path = dir.join(JOURNAL_FILE);
        let existing = match std::fs::read(&journal_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut logs: BTreeMap<LogId, LogSlot> = BTreeMap::new();
        let mut poisoned: BTreeSet<LogId> = BTreeSet::new();
        let mut info = OpenInfo::default();
        let valid_len = replay(&existing, &mut logs, &mut poisoned, &mut info);
        if valid_len < existing.len() {
            info.truncated_bytes = existing.len() - valid_len;
            tracing::warn!(
                shard = %shard,
                truncated = info.truncated_bytes,
                "journal tail corrupt, truncating"
            );
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&journal_path)?;
        file.set_len(valid_len as u64)?;
        info.poisoned_logs = poisoned.iter().copied().collect();

        Ok((
            FileLogStore {
                shard,
                inner: Mutex::new(Inner {
                    file,
                    logs,
                    poisoned,
                }),
                dir: dir.to_path_buf(),
            },
            info,
        ))
    }

    fn append_entry(inner: &mut Inner, body: &[u8]) -> Result<(), LogStoreError> {
        let mut frame = Vec::with_capacity(body.len() + 8);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);
        frame.extend_from_slice(&crc32c::crc32c(body).to_le_bytes());
        use std::io::Seek;
        inner.file.seek(std::io::SeekFrom::End(0))?;
        inner.file.write_all(&frame)?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn check_poisoned(inner: &Inner, log: LogId) -> Result<(), LogStoreError> {
        if inner.poisoned.contains(&log) {
            Err(LogStoreError::PermanentError(log))
        } else {
            Ok(())
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_meta(&self, log: LogId, op: u8, value: u64) -> Result<(), LogStoreError> {
        let mut inner = self.inner.lock();
        Self::check_poisoned(&inner, log)?;
        let mut body = BytesMut::new();
        body.put_u8(KIND_META);
        body.put_u64_le(log.as_u64());
        body.put_u8(op);
        body.put_u64_le(value);
        Self::append_entry(&mut inner, &body)?;
        apply_meta(inner.logs.entry(log).or_default(), op, value);
        Ok(())
    }
}

fn apply_meta(slot: &mut LogSlot, op: u8, value: u64) {
    match op {
        META_TRIM => {
            let lsn = Lsn(value);
            if lsn > slot.state.trim_point {
                slot.state.trim_point = lsn;
                let keep = slot.records.split_off(&lsn.next());
                slot.records = keep;
            }
        }
        META_SEAL => {
            let epoch = Epoch(value as u32);
            if epoch > slot.state.seal_epoch {
                slot.state.seal_epoch = epoch;
            }
        }
        META_RELEASED => {
            let lsn = Lsn(value);
            if lsn > slot.state.last_released {
                slot.state.last_released = lsn;
            }
        }
        META_LCE => {
            let epoch = Epoch(value as u32);
            if epoch > slot.state.last_clean_epoch {
                slot.state.last_clean_epoch = epoch;
            }
        }
        _ => unreachable!("validated during replay"),
    }
}

/// Replays the journal; returns the length of the valid prefix.
fn replay(
    bytes: &[u8],
    logs: &mut BTreeMap<LogId, LogSlot>,
    poisoned: &mut BTreeSet<LogId>,
    info: &mut OpenInfo,
) -> usize {
    let mut offset = 0usize;
    while bytes.len() - offset >= 8 {
        let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let total = 4 + len + 4;
        if bytes.len() - offset < total {
            break;
        }
        let body = &bytes[offset + 4..offset + 4 + len];
        let crc = u32::from_le_bytes(bytes[offset + 4 + len..offset + total].try_into().unwrap());
        if crc32c::crc32c(body) != crc {
            break;
        }
        if !apply_entry(body, logs, poisoned, info) {
            break;
        }
        offset += total;
    }
    offset
}

/// Applies one journal body; false means the frame itself is garbage
/// and replay must stop.
fn apply_entry(
    body: &[u8],
    logs: &mut BTreeMap<LogId, LogSlot>,
    poisoned: &mut BTreeSet<LogId>,
    info: &mut OpenInfo,
) -> bool {
    if body.len() < 9 {
        return false;
    }
    let mut cursor = body;
    let kind = cursor.get_u8();
    let log = LogId::new(cursor.get_u64_le());
    match kind {
        KIND_RECORD => {
            if cursor.len() < 6 {
                return false;
            }
            let wave = cursor.get_u32_le();
            let n = cursor.get_u16_le() as usize;
            if cursor.len() < n * 4 {
                return false;
            }
            let mut copyset = Vec::with_capacity(n);
            for _ in 0..n {
                let node = cursor.get_u16_le();
                let shard = cursor.get_u16_le();
                copyset.push(ShardId::new(node, shard));
            }
            match DataRecord::decode(log, cursor) {
                Ok((record, _)) => {
                    let slot = logs.entry(log).or_default();
                    slot.records.insert(record.lsn, StoredRecord {
                        record,
                        copyset,
                        wave,
                    });
                    info.records_replayed += 1;
                    true
                }
                Err(_) => false,
            }
        }
        KIND_META => {
            if cursor.len() < 9 {
                return false;
            }
            let op = cursor.get_u8();
            let value = cursor.get_u64_le();
            if op > META_LCE {
                // Unknown metadata op: this log can no longer be
                // trusted, but the shard keeps serving the others.
                poisoned.insert(log);
                return true;
            }
            apply_meta(logs.entry(log).or_default(), op, value);
            true
        }
        _ => false,
    }
}

#[async_trait]
impl LocalLogStore for FileLogStore {
    fn shard(&self) -> ShardId {
        self.shard
    }

    async fn write_record(&self, log: LogId, stored: StoredRecord) -> Result<(), LogStoreError> {
        let mut inner = self.inner.lock();
        Self::check_poisoned(&inner, log)?;
        let mut body = BytesMut::new();
        body.put_u8(KIND_RECORD);
        body.put_u64_le(log.as_u64());
        body.put_u32_le(stored.wave);
        body.put_u16_le(stored.copyset.len() as u16);
        for shard in &stored.copyset {
            body.put_u16_le(shard.node);
            body.put_u16_le(shard.shard);
        }
        body.put_slice(&stored.record.encode());
        Self::append_entry(&mut inner, &body)?;
        let slot = inner.logs.entry(log).or_default();
        slot.records.insert(stored.record.lsn, stored);
        Ok(())
    }

    async fn read_range(
        &self,
        log: LogId,
        lo: Lsn,
        hi: Lsn,
    ) -> Result<Vec<StoredRecord>, LogStoreError> {
        let inner = self.inner.lock();
        Self::check_poisoned(&inner, log)?;
        let Some(slot) = inner.logs.get(&log) else {
            return Ok(Vec::new());
        };
        Ok(slot.records.range(lo..=hi).map(|(_, r)| r.clone()).collect())
    }

    async fn log_state(&self, log: LogId) -> Result<LogState, LogStoreError> {
        let inner = self.inner.lock();
        Self::check_poisoned(&inner, log)?;
        Ok(inner.logs.get(&log).map(|s| s.state).unwrap_or_default())
    }

    async fn trim(&self, log: LogId, up_to: Lsn) -> Result<(), LogStoreError> {
        self.write_meta(log, META_TRIM, up_to.as_u64())
    }

    async fn seal(&self, log: LogId, epoch: Epoch) -> Result<Epoch, LogStoreError> {
        let prev = self.log_state(log).await?.seal_epoch;
        self.write_meta(log, META_SEAL, epoch.as_u32() as u64)?;
        Ok(prev)
    }

    async fn set_last_released(&self, log: LogId, lsn: Lsn) -> Result<(), LogStoreError> {
        self.write_meta(log, META_RELEASED, lsn.as_u64())
    }

    async fn set_last_clean_epoch(&self, log: LogId, epoch: Epoch) -> Result<(), LogStoreError> {
        self.write_meta(log, META_LCE, epoch.as_u32() as u64)
    }

    async fn logs(&self) -> Result<Vec<LogId>, LogStoreError> {
        Ok(self.inner.lock().logs.keys().copied().collect())
    }
}
