//! The text configuration surface.
//!
//! JSON with a fixed set of known top-level keys; unknown keys are
//! preserved as custom fields and survive a parse/to_string round trip.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use strand_membership::{FailureDomainScope, NodeConfig, NodeIndex};
use strand_record::LogId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("config version must strictly increase (current {current}, proposed {proposed})")]
    StaleVersion { current: u64, proposed: u64 },
}

/// One named range of user logs sharing attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogGroupConfig {
    pub name: String,
    /// Inclusive id range `[lo, hi]`.
    pub id_range: (u64, u64),
    /// Replication property: scope name → distinct-domain minimum.
    pub replication: BTreeMap<FailureDomainScope, usize>,
    #[serde(default = "default_nodeset_size")]
    pub nodeset_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog_seconds: Option<u64>,
    /// Preferred sequencer region, e.g. `"rgn1"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencer_affinity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_writes_in_flight: Option<usize>,
}

fn default_nodeset_size() -> usize {
    8
}

impl LogGroupConfig {
    pub fn contains(&self, log: LogId) -> bool {
        let id = log.as_u64();
        self.id_range.0 <= id && id <= self.id_range.1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZookeeperConfig {
    pub quorum: Vec<String>,
    #[serde(default = "default_zk_root")]
    pub root: String,
}

fn default_zk_root() -> String {
    "/strand".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficShapingConfig {
    #[serde(default)]
    pub client_bytes_per_sec: Option<i64>,
    #[serde(default)]
    pub background_bytes_per_sec: Option<i64>,
}

/// The whole cluster configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name; part of every cluster marker.
    pub cluster: String,
    /// Strictly monotone across published configs.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<BTreeMap<NodeIndex, NodeConfig>>,
    /// Replication and nodeset settings of the metadata logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_logs: Option<LogGroupConfig>,
    #[serde(default)]
    pub logs: Vec<LogGroupConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub security_information: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_shaping: Option<TrafficShapingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_throttling: Option<TrafficShapingConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub server_settings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub client_settings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zookeeper: Option<ZookeeperConfig>,
    #[serde(default = "default_delimiter")]
    pub log_namespace_delimiter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_creation_time: Option<u64>,
    /// Unknown top-level keys, preserved verbatim.
    #[serde(flatten)]
    pub custom: BTreeMap<String, Value>,
}

fn default_delimiter() -> String {
    "/".to_string()
}

impl ClusterConfig {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The log group covering a log id.
    pub fn log_group(&self, log: LogId) -> Option<&LogGroupConfig> {
        self.logs.iter().find(|g| g.contains(log))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.is_empty() {
            return Err(ConfigError::Invalid("cluster name must not be empty".into()));
        }
        if self.version == 0 {
            return Err(ConfigError::Invalid("version must be positive".into()));
        }
        if self.log_namespace_delimiter.chars().count() != 1 {
            return Err(ConfigError::Invalid(
                "log_namespace_delimiter must be a single character".into(),
            ));
        }

        let mut seen_names: BTreeMap<&str, &LogGroupConfig> = BTreeMap::new();
        let mut ranges: Vec<(u64, u64, &str)> = Vec::new();
        for group in &self.logs {
            let (lo, hi) = group.id_range;
            if lo == 0 || lo > hi {
                return Err(ConfigError::Invalid(format!(
                    "log group '{}' has an empty or invalid id range",
                    group.name
                )));
            }
            if LogId::new(lo).is_internal() || LogId::new(hi).is_internal() || hi > LogId::MAX_USER.as_u64()
            {
                return Err(ConfigError::Invalid(format!(
                    "log group '{}' overlaps the reserved internal range",
                    group.name
                )));
            }
            if seen_names.insert(group.name.as_str(), group).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate log group name '{}'",
                    group.name
                )));
            }
            for &(olo, ohi, oname) in &ranges {
                if lo <= ohi && olo <= hi {
                    return Err(ConfigError::Invalid(format!(
                        "log groups '{}' and '{}' have overlapping id ranges",
                        oname, group.name
                    )));
                }
            }
            ranges.push((lo, hi, group.name.as_str()));
            if group.replication.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "log group '{}' has no replication property",
                    group.name
                )));
            }
        }
        Ok(())
    }

    /// Version check when adopting a newer config.
    pub fn validate_successor(&self, next: &ClusterConfig) -> Result<(), ConfigError> {
        if next.version <= self.version {
            return Err(ConfigError::StaleVersion {
                current: self.version,
                proposed: next.version,
            });
        }
        next.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, lo: u64, hi: u64) -> LogGroupConfig {
        LogGroupConfig {
            name: name.to_string(),
            id_range: (lo, hi),
            replication: BTreeMap::from([(FailureDomainScope::Node, 2)]),
            nodeset_size: 4,
            backlog_seconds: Some(86400),
            sequencer_affinity: None,
            max_writes_in_flight: None,
        }
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            cluster: "test-cluster".to_string(),
            version: 3,
            nodes: None,
            metadata_logs: Some(group("metadata", 1, 1)),
            logs: vec![group("payments", 1, 100), group("events", 101, 200)],
            principals: vec![],
            security_information: BTreeMap::new(),
            traffic_shaping: None,
            read_throttling: None,
            server_settings: BTreeMap::from([("store-timeout".into(), "500ms".into())]),
            client_settings: BTreeMap::new(),
            zookeeper: Some(ZookeeperConfig {
                quorum: vec!["zk1:2181".into()],
                root: "/strand".into(),
            }),
            log_namespace_delimiter: "/".to_string(),
            cluster_creation_time: Some(1_700_000_000),
            custom: BTreeMap::new(),
        }
    }

    #[test]
    fn roundtrip_identity() {
        let original = config();
        let text = original.to_string().unwrap();
        let parsed = ClusterConfig::parse(&text).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn custom_fields_are_preserved() {
        let text = r#"{
            "cluster": "c",
            "version": 1,
            "logs": [],
            "my_vendor_extension": {"a": [1, 2, 3]}
        }"#;
        let parsed = ClusterConfig::parse(text).unwrap();
        assert!(parsed.custom.contains_key("my_vendor_extension"));
        let reparsed = ClusterConfig::parse(&parsed.to_string().unwrap()).unwrap();
        assert_eq!(reparsed, parsed);
    }

    #[test]
    fn metadata_log_group_is_optional() {
        let mut c = config();
        c.metadata_logs = None;
        let text = c.to_string().unwrap();
        assert!(!text.contains("metadata_logs"));
        assert_eq!(ClusterConfig::parse(&text).unwrap(), c);
    }

    #[test]
    fn overlapping_ranges_rejected() {
        let mut c = config();
        c.logs = vec![group("a", 1, 100), group("b", 50, 150)];
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut c = config();
        c.logs = vec![group("a", 1, 100), group("a", 200, 300)];
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn internal_range_references_rejected() {
        let mut c = config();
        c.logs = vec![group("internal", LogId::INTERNAL_MIN.as_u64(), LogId::INTERNAL_MIN.as_u64() + 5)];
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn delimiter_must_be_single_char() {
        let mut c = config();
        c.log_namespace_delimiter = "::".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
        c.log_namespace_delimiter = "".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn version_must_strictly_increase() {
        let current = config();
        let mut next = config();
        next.version = 3;
        assert!(matches!(
            current.validate_successor(&next),
            Err(ConfigError::StaleVersion { current: 3, proposed: 3 })
        ));
        next.version = 4;
        current.validate_successor(&next).unwrap();
    }

    #[test]
    fn log_group_lookup() {
        let c = config();
        assert_eq!(c.log_group(LogId::new(42)).unwrap().name, "payments");
        assert_eq!(c.log_group(LogId::new(150)).unwrap().name, "events");
        assert!(c.log_group(LogId::new(500)).is_none());
    }
}
