//! Periodic connection health classification.
//!
//! Each worker walks its connections on a timer and classifies them.
//! Stalled and sufficiently net-slow sockets are closed (rate-limited);
//! idle client-outbound sockets past the keep-alive window are closed.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionActivity {
    /// Moving bytes in both directions.
    Active,
    /// Nothing queued, nothing flowing.
    Idle,
    /// We have nothing to send; the application is the bottleneck.
    AppLimited,
    /// The peer is reading slower than we produce.
    RecvSlow,
    /// The network is draining our queue slowly.
    NetSlow,
    /// Bytes queued and nothing drained for a long time.
    Stalled,
}

/// Per-connection counters sampled by the monitor.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Bytes waiting in the send queue.
    pub bytes_pending: u64,
    /// When the send queue last drained any bytes.
    pub last_progress: Instant,
    /// When anything was last sent or received.
    pub last_activity: Instant,
    /// The peer's receive window is closed (it is not reading).
    pub peer_window_closed: bool,
    /// Outbound client connection (subject to keep-alive closing).
    pub client_outbound: bool,
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// No queue progress for this long with bytes pending: stalled.
    pub stall_after: Duration,
    /// Queue progress slower than this with bytes pending: net-slow.
    pub slow_after: Duration,
    /// Idle client-outbound connections past this get closed.
    pub keep_alive: Duration,
    /// Maximum closes per sweep.
    pub max_closes_per_sweep: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        HealthMonitorConfig {
            stall_after: Duration::from_secs(30),
            slow_after: Duration::from_secs(5),
            keep_alive: Duration::from_secs(120),
            max_closes_per_sweep: 2,
        }
    }
}

/// Classifies one connection from its counters.
pub fn classify(stats: &ConnectionStats, now: Instant, config: &HealthMonitorConfig) -> ConnectionActivity {
    if stats.bytes_pending > 0 {
        let since_progress = now.saturating_duration_since(stats.last_progress);
        if since_progress >= config.stall_after {
            return ConnectionActivity::Stalled;
        }
        if stats.peer_window_closed {
            return ConnectionActivity::RecvSlow;
        }
        if since_progress >= config.slow_after {
            return ConnectionActivity::NetSlow;
        }
        return ConnectionActivity::Active;
    }
    let since_activity = now.saturating_duration_since(stats.last_activity);
    if since_activity < config.slow_after {
        if stats.client_outbound {
            ConnectionActivity::AppLimited
        } else {
            ConnectionActivity::Active
        }
    } else {
        ConnectionActivity::Idle
    }
}

/// What a sweep decided for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepDecision {
    Keep(ConnectionActivity),
    Close(ConnectionActivity),
}

/// Stateless sweep logic; the caller owns the sockets.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Self {
        HealthMonitor { config }
    }

    /// One pass over the worker's connections. Closes are rate-limited
    /// per sweep so a bad network cannot mass-disconnect a worker.
    pub fn sweep(&self, connections: &[ConnectionStats], now: Instant) -> Vec<SweepDecision> {
        let mut closes = 0usize;
        connections
            .iter()
            .map(|stats| {
                let activity = classify(stats, now, &self.config);
                let should_close = match activity {
                    ConnectionActivity::Stalled | ConnectionActivity::NetSlow => true,
                    ConnectionActivity::Idle => {
                        stats.client_outbound
                            && now.saturating_duration_since(stats.last_activity)
                                >= self.config.keep_alive
                    }
                    _ => false,
                };
                if should_close && closes < self.config.max_closes_per_sweep {
                    closes += 1;
                    tracing::info!(?activity, "closing unhealthy connection");
                    SweepDecision::Close(activity)
                } else {
                    SweepDecision::Keep(activity)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthMonitorConfig {
        HealthMonitorConfig {
            stall_after: Duration::from_secs(30),
            slow_after: Duration::from_secs(5),
            keep_alive: Duration::from_secs(120),
            max_closes_per_sweep: 2,
        }
    }

    fn stats(pending: u64, progress_ago: u64, activity_ago: u64) -> ConnectionStats {
        let now = Instant::now();
        ConnectionStats {
            bytes_pending: pending,
            last_progress: now - Duration::from_secs(progress_ago),
            last_activity: now - Duration::from_secs(activity_ago),
            peer_window_closed: false,
            client_outbound: false,
        }
    }

    #[test]
    fn classification_matrix() {
        let c = config();
        let now = Instant::now();

        assert_eq!(classify(&stats(100, 0, 0), now, &c), ConnectionActivity::Active);
        assert_eq!(classify(&stats(100, 10, 0), now, &c), ConnectionActivity::NetSlow);
        assert_eq!(classify(&stats(100, 40, 0), now, &c), ConnectionActivity::Stalled);
        assert_eq!(classify(&stats(0, 0, 60), now, &c), ConnectionActivity::Idle);
        assert_eq!(classify(&stats(0, 0, 0), now, &c), ConnectionActivity::Active);

        let mut recv_slow = stats(100, 1, 0);
        recv_slow.peer_window_closed = true;
        assert_eq!(classify(&recv_slow, now, &c), ConnectionActivity::RecvSlow);

        let mut app_limited = stats(0, 0, 0);
        app_limited.client_outbound = true;
        assert_eq!(classify(&app_limited, now, &c), ConnectionActivity::AppLimited);
    }

    #[test]
    fn stalled_connections_are_closed_rate_limited() {
        let monitor = HealthMonitor::new(config());
        let conns = vec![stats(10, 40, 0), stats(10, 40, 0), stats(10, 40, 0)];
        let decisions = monitor.sweep(&conns, Instant::now());
        let closed = decisions
            .iter()
            .filter(|d| matches!(d, SweepDecision::Close(_)))
            .count();
        assert_eq!(closed, 2, "closes are capped per sweep");
        assert!(matches!(
            decisions[2],
            SweepDecision::Keep(ConnectionActivity::Stalled)
        ));
    }

    #[test]
    fn idle_client_connections_close_after_keep_alive() {
        let monitor = HealthMonitor::new(config());
        let mut idle_client = stats(0, 0, 200);
        idle_client.client_outbound = true;
        let mut idle_server = stats(0, 0, 200);
        idle_server.client_outbound = false;

        let decisions = monitor.sweep(&[idle_client, idle_server], Instant::now());
        assert!(matches!(decisions[0], SweepDecision::Close(ConnectionActivity::Idle)));
        assert!(matches!(decisions[1], SweepDecision::Keep(ConnectionActivity::Idle)));
    }

    #[test]
    fn healthy_connections_are_kept() {
        let monitor = HealthMonitor::new(config());
        let decisions = monitor.sweep(&[stats(0, 0, 0), stats(50, 1, 0)], Instant::now());
        assert!(decisions
            .iter()
            .all(|d| matches!(d, SweepDecision::Keep(_))));
    }
}
