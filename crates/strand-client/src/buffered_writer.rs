//! The buffered writer: accumulate appends per log, flush on size/time
//! triggers, compress, and send one large append per batch.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use strand_record::{batch, Compression, LogId, Lsn, Payload};
use strand_wire::Status;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Multiple batches may be in flight concurrently.
    Independent,
    /// Strictly one in-flight batch per log; order preserved.
    OneAtATime,
}

#[derive(Debug, Clone)]
pub struct BufferedWriterOptions {
    /// Flush when the building batch reaches this many payload bytes.
    pub size_trigger: Option<usize>,
    /// Flush when the building batch has been open this long.
    pub time_trigger: Option<Duration>,
    pub compression: Compression,
    pub mode: BatchMode,
    /// Retries per batch after the first attempt.
    pub retry_count: usize,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    /// Free input payload memory after encoding instead of handing the
    /// payloads back in the results.
    pub destroy_payloads: bool,
    /// Hard cap on one batch's aggregate payload bytes.
    pub max_batch_bytes: usize,
}

impl Default for BufferedWriterOptions {
    fn default() -> Self {
        BufferedWriterOptions {
            size_trigger: None,
            time_trigger: None,
            compression: Compression::None,
            mode: BatchMode::OneAtATime,
            retry_count: 2,
            retry_initial_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(1),
            destroy_payloads: false,
            max_batch_bytes: 1 << 20,
        }
    }
}

/// Per-record result of a flushed batch.
#[derive(Debug)]
pub struct WriteResult {
    /// LSN of the batch record holding this payload.
    pub lsn: Lsn,
    /// Position of this payload within the batch.
    pub offset: usize,
    /// The original payload, unless `destroy_payloads` was set.
    pub payload: Option<Payload>,
}

/// Where encoded batches go: an append to the log, marked as a
/// buffered-writer batch.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn append_batch(
        &self,
        log: LogId,
        encoded: Payload,
        count: usize,
    ) -> Result<Lsn, Status>;
}

type Waiter = oneshot::Sender<Result<WriteResult, Status>>;

struct Entry {
    payload: Payload,
    tx: Waiter,
}

struct Inner {
    building: Vec<Entry>,
    building_bytes: usize,
    in_flight: bool,
    /// Bumped whenever a batch opens or flushes; stale timers no-op.
    generation: u64,
}

struct Shared {
    log: LogId,
    sink: Arc<dyn BatchSink>,
    opts: BufferedWriterOptions,
    inner: Mutex<Inner>,
}

pub struct BufferedWriter {
    shared: Arc<Shared>,
}

impl BufferedWriter {
    pub fn new(log: LogId, sink: Arc<dyn BatchSink>, opts: BufferedWriterOptions) -> Self {
        BufferedWriter {
            shared: Arc::new(Shared {
                log,
                sink,
                opts,
                inner: Mutex::new(Inner {
                    building: Vec::new(),
                    building_bytes: 0,
                    in_flight: false,
                    generation: 0,
                }),
            }),
        }
    }

    /// Queues one payload. The receiver resolves when the batch holding
    /// it is acknowledged (or permanently fails).
    pub fn append(
        &self,
        payload: Payload,
    ) -> Result<oneshot::Receiver<Result<WriteResult, Status>>, Status> {
        let size = payload.size();
        if size > self.shared.opts.max_batch_bytes {
            return Err(Status::TooBig);
        }
        let (tx, rx) = oneshot::channel();

        // A record that would blow the batch cap flushes the current
        // batch first.
        let flush_before = {
            let inner = self.shared.inner.lock();
            !inner.building.is_empty()
                && inner.building_bytes + size > self.shared.opts.max_batch_bytes
        };
        if flush_before {
            Self::try_flush(&self.shared);
        }

        let mut timer_generation = None;
        let flush_after = {
            let mut inner = self.shared.inner.lock();
            Self::push(&self.shared, &mut inner, payload, size, tx, &mut timer_generation);
            self.shared
                .opts
                .size_trigger
                .is_some_and(|trigger| inner.building_bytes >= trigger)
        };

        if let Some(generation) = timer_generation {
            self.spawn_time_trigger(generation);
        }
        if flush_after {
            Self::try_flush(&self.shared);
        }
        Ok(rx)
    }

    fn push(
        shared: &Arc<Shared>,
        inner: &mut Inner,
        payload: Payload,
        size: usize,
        tx: Waiter,
        timer_generation: &mut Option<u64>,
    ) {
        if inner.building.is_empty() {
            inner.generation += 1;
            if shared.opts.time_trigger.is_some() {
                *timer_generation = Some(inner.generation);
            }
        }
        inner.building.push(Entry { payload, tx });
        inner.building_bytes += size;
    }

    fn spawn_time_trigger(&self, generation: u64) {
        let Some(delay) = self.shared.opts.time_trigger else {
            return;
        };
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fire = {
                let inner = shared.inner.lock();
                inner.generation == generation && !inner.building.is_empty()
            };
            if fire {
                BufferedWriter::try_flush(&shared);
            }
        });
    }

    /// Flushes the building batch immediately.
    pub fn flush(&self) {
        Self::try_flush(&self.shared);
    }

    /// Payload bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.inner.lock().building_bytes
    }

    fn try_flush(shared: &Arc<Shared>) {
        let entries = {
            let mut inner = shared.inner.lock();
            if inner.building.is_empty() {
                return;
            }
            if shared.opts.mode == BatchMode::OneAtATime && inner.in_flight {
                // Queued appends coalesce into the next batch once the
                // in-flight one completes.
                return;
            }
            if shared.opts.mode == BatchMode::OneAtATime {
                inner.in_flight = true;
            }
            inner.generation += 1;
            inner.building_bytes = 0;
            std::mem::take(&mut inner.building)
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            Self::send_batch(&shared, entries).await;
            if shared.opts.mode == BatchMode::OneAtATime {
                let flush_next = {
                    let mut inner = shared.inner.lock();
                    inner.in_flight = false;
                    !inner.building.is_empty()
                };
                if flush_next {
                    Self::try_flush(&shared);
                }
            }
        });
    }

    async fn send_batch(shared: &Arc<Shared>, entries: Vec<Entry>) {
        let payloads: Vec<Payload> = entries.iter().map(|e| e.payload.clone()).collect();
        let encoded = match batch::encode_batch(&payloads, shared.opts.compression) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(log = %shared.log, error = %e, "batch encode failed");
                for entry in entries {
                    let _ = entry.tx.send(Err(Status::Internal));
                }
                return;
            }
        };
        // Input memory is released right after encoding when asked to.
        let returned: Vec<Option<Payload>> = if shared.opts.destroy_payloads {
            entries.iter().map(|_| None).collect()
        } else {
            payloads.into_iter().map(Some).collect()
        };

        let count = entries.len();
        let mut delay = shared.opts.retry_initial_delay;
        let mut attempt = 0usize;
        let result = loop {
            match shared
                .sink
                .append_batch(shared.log, Payload::flat(encoded.clone()), count)
                .await
            {
                Ok(lsn) => break Ok(lsn),
                Err(status) if attempt < shared.opts.retry_count && retryable(status) => {
                    attempt += 1;
                    tokio::time::sleep(jittered(delay)).await;
                    delay = (delay * 2).min(shared.opts.retry_max_delay);
                }
                Err(status) => break Err(status),
            }
        };

        match result {
            Ok(lsn) => {
                for (offset, (entry, payload)) in
                    entries.into_iter().zip(returned).enumerate()
                {
                    let _ = entry.tx.send(Ok(WriteResult {
                        lsn,
                        offset,
                        payload,
                    }));
                }
            }
            Err(status) => {
                tracing::warn!(log = %shared.log, %status, attempts = attempt + 1, "batch failed");
                for entry in entries {
                    let _ = entry.tx.send(Err(status));
                }
            }
        }
    }
}

fn retryable(status: Status) -> bool {
    matches!(
        status,
        Status::TimedOut
            | Status::NoBufs
            | Status::NoSequencer
            | Status::ConnFailed
            | Status::Preempted
    )
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    delay.mul_f64(factor)
}
