//! strandd: the strand storage daemon.
//!
//! Wires the core crates into one node: configuration, membership,
//! gossip, the epoch store client, local shards, per-log sequencers,
//! and the connection health monitor.

pub mod config;
pub mod conn_health;
pub mod node;

pub use config::{ClusterConfig, ConfigError, LogGroupConfig};
pub use conn_health::{
    classify, ConnectionActivity, ConnectionStats, HealthMonitor, HealthMonitorConfig,
    SweepDecision,
};
pub use node::{Node, NodeError};
