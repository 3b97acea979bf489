//! Per-priority traffic shaping for outbound stores.
//!
//! A token bucket per priority class. When a class is out of budget the
//! caller registers a callback and parks; the send resumes when the
//! refill task hands it tokens. Only that destination's send is parked,
//! the rest of the wave proceeds.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Client appends.
    Client,
    /// Recovery and rebuilding traffic.
    Background,
}

/// Outcome of a bandwidth request.
pub enum Grant {
    /// Budget was available; go ahead.
    Granted,
    /// Out of budget: the callback fires when tokens arrive.
    Registered(oneshot::Receiver<()>),
}

struct Bucket {
    tokens: i64,
    capacity: i64,
    refill_per_tick: i64,
    waiters: VecDeque<(i64, oneshot::Sender<()>)>,
}

impl Bucket {
    fn new(capacity: i64, refill_per_tick: i64) -> Self {
        Bucket {
            tokens: capacity,
            capacity,
            refill_per_tick,
            waiters: VecDeque::new(),
        }
    }

    fn refill(&mut self) {
        self.tokens = (self.tokens + self.refill_per_tick).min(self.capacity);
        while let Some((cost, _)) = self.waiters.front() {
            if self.tokens < *cost {
                break;
            }
            let (cost, tx) = self.waiters.pop_front().unwrap();
            self.tokens -= cost;
            let _ = tx.send(());
        }
    }
}

pub struct TrafficShaper {
    client: Mutex<Bucket>,
    background: Mutex<Bucket>,
    tick: Duration,
}

impl TrafficShaper {
    pub fn new(
        client_bytes_per_sec: i64,
        background_bytes_per_sec: i64,
        tick: Duration,
    ) -> Self {
        let ticks_per_sec = (1000 / tick.as_millis().max(1)) as i64;
        let per_tick = |rate: i64| (rate / ticks_per_sec.max(1)).max(1);
        TrafficShaper {
            client: Mutex::new(Bucket::new(client_bytes_per_sec, per_tick(client_bytes_per_sec))),
            background: Mutex::new(Bucket::new(
                background_bytes_per_sec,
                per_tick(background_bytes_per_sec),
            )),
            tick,
        }
    }

    /// An effectively unlimited shaper.
    pub fn unlimited() -> Self {
        Self::new(i64::MAX / 4, i64::MAX / 4, Duration::from_millis(100))
    }

    fn bucket(&self, priority: Priority) -> &Mutex<Bucket> {
        match priority {
            Priority::Client => &self.client,
            Priority::Background => &self.background,
        }
    }

    /// Requests `bytes` of budget at `priority`.
    pub fn acquire(&self, priority: Priority, bytes: i64) -> Grant {
        let mut bucket = self.bucket(priority).lock();
        if bucket.tokens >= bytes && bucket.waiters.is_empty() {
            bucket.tokens -= bytes;
            Grant::Granted
        } else {
            let (tx, rx) = oneshot::channel();
            bucket.waiters.push_back((bytes, tx));
            Grant::Registered(rx)
        }
    }

    /// Runs the refill clock until the shaper is dropped elsewhere.
    pub fn spawn_refill_task(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = std::sync::Arc::downgrade(self);
        let tick = self.tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let Some(shaper) = this.upgrade() else { break };
                shaper.client.lock().refill();
                shaper.background.lock().refill();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn grants_within_budget() {
        let shaper = TrafficShaper::new(1000, 1000, Duration::from_millis(10));
        assert!(matches!(shaper.acquire(Priority::Client, 600), Grant::Granted));
        assert!(matches!(shaper.acquire(Priority::Client, 400), Grant::Granted));
        // Budget exhausted: next acquire parks.
        assert!(matches!(
            shaper.acquire(Priority::Client, 1),
            Grant::Registered(_)
        ));
        // Background budget is independent.
        assert!(matches!(
            shaper.acquire(Priority::Background, 500),
            Grant::Granted
        ));
    }

    #[test]
    fn waiters_keep_fifo_order() {
        // 1s tick: one refill restores the full budget.
        let shaper = TrafficShaper::new(10, 10, Duration::from_secs(1));
        assert!(matches!(shaper.acquire(Priority::Client, 10), Grant::Granted));
        let Grant::Registered(mut first) = shaper.acquire(Priority::Client, 5) else {
            panic!("expected registration");
        };
        let Grant::Registered(mut second) = shaper.acquire(Priority::Client, 5) else {
            panic!("expected registration");
        };
        shaper.client.lock().refill();
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_task_wakes_waiters() {
        let shaper = Arc::new(TrafficShaper::new(100, 100, Duration::from_millis(10)));
        let _task = shaper.spawn_refill_task();
        assert!(matches!(shaper.acquire(Priority::Client, 100), Grant::Granted));
        let Grant::Registered(rx) = shaper.acquire(Priority::Client, 50) else {
            panic!("expected registration");
        };
        rx.await.expect("waiter must be woken by the refill task");
    }
}
