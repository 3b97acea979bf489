//! The client read stream.
//!
//! One instance per (log, start, until, filter): opens a sub-stream per
//! shard of the storage set, merges the per-shard streams in LSN order,
//! emits typed gaps when a range can be proven missing, fails over from
//! single-copy delivery when a shard stops sending, and follows bridge
//! records across epoch boundaries.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_epoch::{EpochStore, EpochStoreError};
use strand_membership::{MembershipView, ShardId};
use strand_placement::ReplicationProperty;
use strand_record::{DataRecord, GapKind, GapRecord, LogId, Lsn, RecordFlags};
use strand_storage::{LogStoreError, ReadEvent, ServerReadStream};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("epoch metadata unavailable: {0}")]
    Metadata(#[from] EpochStoreError),
    #[error("shard {0} is unavailable")]
    ShardUnavailable(ShardId),
    #[error("read stream was stopped")]
    Stopped,
}

/// What the application receives.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientReadEvent {
    Record(DataRecord),
    Gap(GapRecord),
}

/// One per-shard sub-stream, as the client sees it.
#[async_trait]
pub trait ShardSource: Send {
    fn shard(&self) -> ShardId;
    async fn next(&mut self) -> Result<ReadEvent, LogStoreError>;
    /// Grant more outstanding bytes after a WindowFull.
    fn update_window(&mut self, bytes: u64);
}

#[async_trait]
impl ShardSource for ServerReadStream {
    fn shard(&self) -> ShardId {
        ServerReadStream::shard(self)
    }

    async fn next(&mut self) -> Result<ReadEvent, LogStoreError> {
        ServerReadStream::next(self).await
    }

    fn update_window(&mut self, bytes: u64) {
        ServerReadStream::update_window(self, bytes)
    }
}

/// Opens sub-streams; the seam between the reader and the transport.
#[async_trait]
pub trait ShardSourceFactory: Send + Sync {
    async fn open(
        &self,
        log: LogId,
        shard: ShardId,
        start: Lsn,
        until: Lsn,
        scd: bool,
        send_all: bool,
    ) -> Result<Box<dyn ShardSource>, ReadError>;
}

#[derive(Debug, Clone)]
pub struct ReadStreamConfig {
    /// Byte window granted to each sub-stream.
    pub window_bytes: u64,
    /// How long a missing LSN may stall the stream before failover and
    /// gap detection kick in.
    pub gap_grace: Duration,
    /// Per-source poll slice while filling buffers.
    pub poll_timeout: Duration,
    /// Single-copy delivery on by default.
    pub scd: bool,
}

impl Default for ReadStreamConfig {
    fn default() -> Self {
        ReadStreamConfig {
            window_bytes: 1 << 20,
            gap_grace: Duration::from_millis(300),
            poll_timeout: Duration::from_millis(10),
            scd: false,
        }
    }
}

impl ReadStreamConfig {
    pub fn fast() -> Self {
        ReadStreamConfig {
            gap_grace: Duration::from_millis(80),
            poll_timeout: Duration::from_millis(5),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initializing,
    Reading,
    Done,
}

struct SourceSlot {
    source: Box<dyn ShardSource>,
    buffered: Option<ReadEvent>,
    /// The source reported Done (past `until`).
    exhausted: bool,
}

pub struct ClientReadStream {
    log: LogId,
    until: Lsn,
    next_expected: Lsn,
    factory: Arc<dyn ShardSourceFactory>,
    epoch_store: Arc<EpochStore>,
    view: Arc<MembershipView>,
    config: ReadStreamConfig,

    nodeset: Vec<ShardId>,
    property: Option<ReplicationProperty>,
    slots: Vec<SourceSlot>,
    unresponsive: BTreeSet<ShardId>,

    send_all: bool,
    /// While in send-all mode: revert to primary-only once past this.
    caught_up_target: Lsn,
    stuck_since: Option<Instant>,
    pending_reopen: bool,
    state: StreamState,
    stopped: bool,
}

impl ClientReadStream {
    pub fn new(
        log: LogId,
        start: Lsn,
        until: Lsn,
        factory: Arc<dyn ShardSourceFactory>,
        epoch_store: Arc<EpochStore>,
        view: Arc<MembershipView>,
        config: ReadStreamConfig,
    ) -> Self {
        ClientReadStream {
            log,
            until,
            next_expected: start.max(Lsn::OLDEST),
            factory,
            epoch_store,
            view,
            config,
            nodeset: Vec::new(),
            property: None,
            slots: Vec::new(),
            unresponsive: BTreeSet::new(),
            send_all: false,
            caught_up_target: Lsn::INVALID,
            stuck_since: None,
            pending_reopen: false,
            state: StreamState::Initializing,
            stopped: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn next_expected(&self) -> Lsn {
        self.next_expected
    }

    /// Healthy iff the responsive part of the nodeset can still satisfy
    /// the replication property.
    pub fn is_healthy(&self) -> bool {
        let Some(property) = &self.property else {
            return true;
        };
        let responsive: BTreeSet<ShardId> = self
            .nodeset
            .iter()
            .copied()
            .filter(|s| !self.unresponsive.contains(s))
            .collect();
        crate::health::read_health(&self.nodeset, &responsive, property, &self.view.current())
    }

    /// Tears down every sub-stream. No events are produced after this
    /// returns.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.slots.clear();
        self.state = StreamState::Done;
    }

    /// The next record or gap in strict LSN order, `None` once the
    /// stream is done (or stopped).
    pub async fn next(&mut self) -> Result<Option<ClientReadEvent>, ReadError> {
        loop {
            if self.stopped {
                return Ok(None);
            }
            if self.next_expected > self.until {
                self.state = StreamState::Done;
                return Ok(None);
            }
            self.ensure_open().await?;
            self.fill_buffers().await;

            if let Some(event) = self.take_deliverable() {
                self.stuck_since = None;
                match self.deliver(event) {
                    Some(out) => return Ok(Some(out)),
                    // Swallowed (e.g. duplicate); keep going.
                    None => continue,
                }
            }

            match self.stuck_since {
                None => self.stuck_since = Some(Instant::now()),
                Some(since) if since.elapsed() >= self.config.gap_grace => {
                    self.stuck_since = None;
                    if self.config.scd && !self.send_all {
                        self.failover_to_send_all();
                        continue;
                    }
                    if let Some(gap) = self.detect_gap() {
                        self.next_expected = gap.hi.next();
                        return Ok(Some(ClientReadEvent::Gap(gap)));
                    }
                    // Cannot confirm the gap; retry unresponsive shards
                    // and keep waiting.
                    self.pending_reopen = true;
                }
                Some(_) => {}
            }
            // Nothing deliverable this round; pace the poll loop.
            tokio::time::sleep(self.config.poll_timeout).await;
        }
    }

    async fn ensure_open(&mut self) -> Result<(), ReadError> {
        if self.pending_reopen {
            self.slots.clear();
            self.unresponsive.clear();
            self.pending_reopen = false;
        }
        if !self.slots.is_empty() {
            return Ok(());
        }

        // The storage set comes from the epoch metadata.
        let metadata = self.epoch_store.read_metadata(self.log).await?;
        self.nodeset = metadata.nodeset;
        self.property = Some(metadata.replication);

        let factory = self.factory.clone();
        for &shard in &self.nodeset.clone() {
            let opened = factory
                .open(
                    self.log,
                    shard,
                    self.next_expected,
                    self.until,
                    self.config.scd,
                    self.send_all,
                )
                .await;
            match opened {
                Ok(source) => self.slots.push(SourceSlot {
                    source,
                    buffered: None,
                    exhausted: false,
                }),
                Err(_) => {
                    self.unresponsive.insert(shard);
                }
            }
        }
        self.state = StreamState::Reading;
        Ok(())
    }

    /// Polls every source that has no buffered event, with a short
    /// per-source slice so a silent shard cannot stall the merge.
    async fn fill_buffers(&mut self) {
        let window = self.config.window_bytes;
        let next_expected = self.next_expected;
        let mut failed: Vec<ShardId> = Vec::new();

        for slot in &mut self.slots {
            if slot.exhausted || slot.buffered.is_some() {
                continue;
            }
            loop {
                match tokio::time::timeout(self.config.poll_timeout, slot.source.next()).await {
                    Ok(Ok(ReadEvent::Record(record))) => {
                        if record.lsn < next_expected {
                            // Duplicate of something already delivered.
                            continue;
                        }
                        slot.buffered = Some(ReadEvent::Record(record));
                    }
                    Ok(Ok(ReadEvent::Gap(gap))) => {
                        if gap.hi < next_expected {
                            continue;
                        }
                        slot.buffered = Some(ReadEvent::Gap(gap));
                    }
                    Ok(Ok(ReadEvent::WindowFull)) => {
                        slot.source.update_window(window);
                        continue;
                    }
                    Ok(Ok(ReadEvent::Done)) => slot.exhausted = true,
                    Ok(Err(_)) => {
                        failed.push(slot.source.shard());
                        slot.exhausted = true;
                    }
                    Err(_) => {}
                }
                break;
            }
        }

        for shard in failed {
            self.unresponsive.insert(shard);
        }
    }

    /// Takes the buffered event that covers `next_expected`, if any.
    fn take_deliverable(&mut self) -> Option<ReadEvent> {
        let next = self.next_expected;
        let idx = self.slots.iter().position(|slot| match &slot.buffered {
            Some(ReadEvent::Record(r)) => r.lsn == next,
            Some(ReadEvent::Gap(g)) => g.lo <= next && next <= g.hi,
            _ => false,
        })?;
        self.slots[idx].buffered.take()
    }

    /// Converts a deliverable storage event into an application event,
    /// advancing the cursor. Returns `None` when the event is consumed
    /// silently.
    fn deliver(&mut self, event: ReadEvent) -> Option<ClientReadEvent> {
        match event {
            ReadEvent::Record(record) if record.flags.contains(RecordFlags::BRIDGE) => {
                // Epoch boundary: everything after the bridge in this
                // epoch is defined empty. Sub-streams reopen against
                // the next epoch's metadata.
                let epoch = record.lsn.epoch();
                let gap = GapRecord::new(
                    self.log,
                    record.lsn,
                    Lsn::last_in_epoch(epoch).min(self.until),
                    GapKind::Bridge,
                );
                self.next_expected = Lsn::first_in_epoch(epoch.next());
                self.pending_reopen = true;
                self.send_all = false;
                Some(ClientReadEvent::Gap(gap))
            }
            ReadEvent::Record(record) if record.flags.contains(RecordFlags::HOLE) => {
                let gap = GapRecord::new(self.log, record.lsn, record.lsn, GapKind::Hole);
                self.next_expected = record.lsn.next();
                Some(ClientReadEvent::Gap(gap))
            }
            ReadEvent::Record(record) => {
                self.next_expected = record.lsn.next();
                self.maybe_revert_send_all();
                Some(ClientReadEvent::Record(record))
            }
            ReadEvent::Gap(gap) => {
                self.next_expected = gap.hi.next();
                Some(ClientReadEvent::Gap(gap))
            }
            ReadEvent::WindowFull | ReadEvent::Done => None,
        }
    }

    /// SCD failover: rewind every sub-stream at the current position in
    /// send-all mode.
    fn failover_to_send_all(&mut self) {
        self.caught_up_target = self
            .slots
            .iter()
            .filter_map(|s| match &s.buffered {
                Some(ReadEvent::Record(r)) => Some(r.lsn),
                Some(ReadEvent::Gap(g)) => Some(g.hi),
                _ => None,
            })
            .max()
            .unwrap_or(self.next_expected);
        self.send_all = true;
        self.pending_reopen = true;
        tracing::debug!(log = %self.log, from = %self.next_expected, "scd failover to send-all");
    }

    fn maybe_revert_send_all(&mut self) {
        if self.config.scd && self.send_all && self.next_expected > self.caught_up_target {
            self.send_all = false;
            self.pending_reopen = true;
            tracing::debug!(log = %self.log, "scd caught up, reverting to primary-only");
        }
    }

    /// A gap at `next_expected` is proven once enough shards are past
    /// it that a fully replicated record would have to intersect them.
    fn detect_gap(&self) -> Option<GapRecord> {
        let property = self.property.as_ref()?;
        let n = self.nodeset.len();
        let r = property.replication_factor();
        let needed = n.saturating_sub(r) + 1;

        let confirmed = self
            .slots
            .iter()
            .filter(|slot| match &slot.buffered {
                Some(ReadEvent::Record(rec)) => rec.lsn > self.next_expected,
                Some(ReadEvent::Gap(g)) => g.lo > self.next_expected,
                None => slot.exhausted && !self.unresponsive.contains(&slot.source.shard()),
                _ => false,
            })
            .count();
        if confirmed < needed {
            return None;
        }

        // The gap ends right before the earliest thing anyone holds.
        let hi = self
            .slots
            .iter()
            .filter_map(|slot| match &slot.buffered {
                Some(ReadEvent::Record(rec)) => Some(rec.lsn.prev()),
                Some(ReadEvent::Gap(g)) => Some(g.lo.prev()),
                None => None,
                _ => None,
            })
            .min()
            .unwrap_or(self.until)
            .min(self.until)
            .max(self.next_expected);

        Some(GapRecord::new(
            self.log,
            self.next_expected,
            hi,
            GapKind::Dataloss,
        ))
    }
}
