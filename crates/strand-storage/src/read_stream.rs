//! Server side of a read sub-stream.
//!
//! Iterates local records in LSN order within the released range,
//! applies single-copy-delivery rotation and filters, emits trim gaps,
//! and respects the client's rolling byte window.

use crate::store::{LocalLogStore, LogStoreError};
use std::collections::VecDeque;
use std::sync::Arc;
use strand_membership::ShardId;
use strand_record::{DataRecord, GapKind, GapRecord, LogId, Lsn};
use strand_wire::message::ReadFilter;
use tokio::sync::watch;

/// Parameters of one START request.
#[derive(Debug, Clone)]
pub struct ReadStreamParams {
    pub log: LogId,
    pub shard: ShardId,
    pub start: Lsn,
    /// Inclusive upper bound.
    pub until: Lsn,
    pub window_bytes: u64,
    /// Single-copy delivery: skip records whose rotation primary is
    /// another shard.
    pub scd: bool,
    pub filter: Option<ReadFilter>,
}

/// What the stream produces, in LSN order.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadEvent {
    Record(DataRecord),
    Gap(GapRecord),
    /// The byte window is exhausted; call `update_window` to resume.
    WindowFull,
    /// The stream passed `until`.
    Done,
}

/// The rotation primary for a record: the copyset entry picked by its
/// esn. Every shard computes the same answer from the stored copyset.
pub fn scd_primary(copyset: &[ShardId], lsn: Lsn) -> Option<ShardId> {
    if copyset.is_empty() {
        return None;
    }
    Some(copyset[lsn.esn().as_u32() as usize % copyset.len()])
}

pub struct ServerReadStream {
    store: Arc<dyn LocalLogStore>,
    params: ReadStreamParams,
    next: Lsn,
    budget: i64,
    send_all: bool,
    activity: watch::Receiver<u64>,
    buffered: VecDeque<ReadEvent>,
    done: bool,
}

impl ServerReadStream {
    pub fn new(
        store: Arc<dyn LocalLogStore>,
        params: ReadStreamParams,
        activity: watch::Receiver<u64>,
    ) -> Self {
        let next = params.start;
        let budget = params.window_bytes as i64;
        ServerReadStream {
            store,
            params,
            next,
            budget,
            send_all: false,
            activity,
            buffered: VecDeque::new(),
            done: false,
        }
    }

    pub fn shard(&self) -> ShardId {
        self.params.shard
    }

    /// The client granted more outstanding bytes.
    pub fn update_window(&mut self, bytes: u64) {
        self.budget += bytes as i64;
    }

    /// Failover: the client detected a gap and asked everyone to send.
    pub fn set_send_all(&mut self, send_all: bool) {
        self.send_all = send_all;
    }

    /// Next event in LSN order. Blocks until the release pointer moves
    /// when the stream is caught up.
    pub async fn next(&mut self) -> Result<ReadEvent, LogStoreError> {
        loop {
            if let Some(event) = self.buffered.pop_front() {
                return Ok(event);
            }
            if self.done {
                return Ok(ReadEvent::Done);
            }
            if self.budget <= 0 {
                return Ok(ReadEvent::WindowFull);
            }
            if self.next > self.params.until {
                self.done = true;
                return Ok(ReadEvent::Done);
            }

            let state = self.store.log_state(self.params.log).await?;

            // Trimmed prefix becomes one trim gap.
            if self.next <= state.trim_point {
                let hi = state.trim_point.min(self.params.until);
                let gap = GapRecord::new(self.params.log, self.next, hi, GapKind::Trim);
                self.next = hi.next();
                return Ok(ReadEvent::Gap(gap));
            }

            let upper = self.params.until.min(state.last_released);
            if self.next > upper {
                // Caught up; wait for a store/release to land.
                if self.activity.changed().await.is_err() {
                    return Err(LogStoreError::Shutdown);
                }
                continue;
            }

            self.fill_batch(upper).await?;
            self.next = upper.next();
        }
    }

    /// Reads `next ..= upper` and buffers the deliverable events.
    async fn fill_batch(&mut self, upper: Lsn) -> Result<(), LogStoreError> {
        let records = self
            .store
            .read_range(self.params.log, self.next, upper)
            .await?;

        // Consecutive filtered-out records coalesce into one hole gap.
        let mut filtered: Option<(Lsn, Lsn)> = None;
        for stored in records {
            let lsn = stored.record.lsn;

            if self.params.scd && !self.send_all {
                if let Some(primary) = scd_primary(&stored.copyset, lsn) {
                    if primary != self.params.shard {
                        continue;
                    }
                }
            }

            if !passes_filter(&self.params.filter, &stored.record) {
                filtered = match filtered {
                    None => Some((lsn, lsn)),
                    Some((lo, _)) => Some((lo, lsn)),
                };
                continue;
            }

            if let Some((lo, hi)) = filtered.take() {
                self.buffered.push_back(ReadEvent::Gap(GapRecord::new(
                    self.params.log,
                    lo,
                    hi,
                    GapKind::Hole,
                )));
            }

            self.budget -= stored.record.payload.size() as i64;
            self.buffered.push_back(ReadEvent::Record(stored.record));
            if self.budget <= 0 {
                self.buffered.push_back(ReadEvent::WindowFull);
            }
        }
        if let Some((lo, hi)) = filtered {
            self.buffered.push_back(ReadEvent::Gap(GapRecord::new(
                self.params.log,
                lo,
                hi,
                GapKind::Hole,
            )));
        }
        Ok(())
    }
}

fn passes_filter(filter: &Option<ReadFilter>, record: &DataRecord) -> bool {
    match filter {
        None => true,
        Some(ReadFilter::Key { kind, value }) => {
            record.keys.get(kind).map(String::as_str) == Some(value.as_str())
        }
        Some(ReadFilter::CounterAtLeast { counter, min }) => {
            record.counters.get(counter).is_some_and(|v| v >= min)
        }
    }
}
