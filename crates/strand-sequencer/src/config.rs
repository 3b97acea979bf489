//! Sequencer configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Maximum appenders in flight per sequencer; admission past this
    /// fails with NOBUFS.
    pub window_size: usize,
    /// Hard cap on one record's payload.
    pub max_payload_size: usize,
    /// Target nodeset size for new epochs.
    pub nodeset_size: usize,
    /// Extra copyset slots an appender may use past the replication
    /// factor.
    pub copyset_extras: usize,
    /// Per-destination STORE deadline.
    pub store_timeout: Duration,
    /// Maximum store waves per record before giving up.
    pub max_waves: u32,
    /// Interval of the periodic RELEASE re-broadcast.
    pub release_rebroadcast_interval: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        SequencerConfig {
            window_size: 256,
            max_payload_size: 1 << 20,
            nodeset_size: 8,
            copyset_extras: 1,
            store_timeout: Duration::from_millis(500),
            max_waves: 3,
            release_rebroadcast_interval: Duration::from_secs(30),
        }
    }
}

impl SequencerConfig {
    /// Short timeouts for in-process tests.
    pub fn fast() -> Self {
        SequencerConfig {
            store_timeout: Duration::from_millis(100),
            release_rebroadcast_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }
}
