//! cluster.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hostlist::{expand_all, expand_hostlist};
use crate::types::{Granularity, NodeHardware, SHARED_FORCE, SharedPolicy};

/// Default number of job completions between automatic job-table sweeps.
pub const DEFAULT_SWEEP_INTERVAL: u32 = 2000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid hostlist expression: {0:?}")]
    Hostlist(String),
    #[error("hostlist pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),
    #[error("partition {partition} names unknown node {node}")]
    UnknownNode { partition: String, node: String },
    #[error("invalid hardware for node {node}: {reason}")]
    Hardware { node: String, reason: String },
    #[error("partition {0} has max_share = 0")]
    ZeroShare(String),
    #[error("duplicate partition name: {0}")]
    DuplicatePartition(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub select: SelectConfig,
    pub state: Option<StateConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SelectConfig {
    pub granularity: Granularity,
    #[serde(default = "default_fast_schedule")]
    pub fast_schedule: bool,
}

fn default_fast_schedule() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub dir: PathBuf,
    pub sweep_interval: Option<u32>,
}

/// One `[[nodes]]` entry; `name` may be a hostlist expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub cpus: u16,
    #[serde(default = "one")]
    pub sockets: u16,
    #[serde(default = "one")]
    pub cores: u16,
    #[serde(default = "one")]
    pub threads: u16,
    #[serde(default)]
    pub real_memory: u32,
}

fn one() -> u16 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    pub nodes: Vec<String>,
    pub shared: SharedPolicy,
    #[serde(default = "one")]
    pub max_share: u16,
}

impl PartitionConfig {
    /// `max_share` with the force bit applied, as the selector stores it.
    pub fn max_share_raw(&self) -> u16 {
        let share = self.max_share & !SHARED_FORCE;
        match self.shared {
            SharedPolicy::Force => share | SHARED_FORCE,
            _ => share,
        }
    }

    /// Number of sharing rows this partition gets on each node.
    pub fn num_rows(&self) -> u16 {
        match self.shared {
            SharedPolicy::Exclusive | SharedPolicy::No => 1,
            SharedPolicy::Yes | SharedPolicy::Force => (self.max_share_raw() & !SHARED_FORCE).max(1),
        }
    }
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn sweep_interval(&self) -> u32 {
        self.state
            .as_ref()
            .and_then(|s| s.sweep_interval)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL)
    }

    /// Expanded node inventory in configuration order.
    pub fn topology(&self) -> Result<Vec<NodeHardware>, ConfigError> {
        let mut nodes = Vec::new();
        for entry in &self.nodes {
            for name in expand_hostlist(&entry.name)? {
                nodes.push(NodeHardware {
                    name,
                    cpus: entry.cpus,
                    sockets: entry.sockets,
                    cores: entry.cores,
                    threads: entry.threads,
                    real_memory: entry.real_memory,
                });
            }
        }
        Ok(nodes)
    }

    /// Expanded member names of a partition.
    pub fn partition_nodes(&self, part: &PartitionConfig) -> Result<Vec<String>, ConfigError> {
        expand_all(&part.nodes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let topology = self.topology()?;
        let mut seen = HashSet::new();
        for hw in &topology {
            if !seen.insert(hw.name.as_str()) {
                return Err(ConfigError::DuplicateNode(hw.name.clone()));
            }
            validate_hardware(hw)?;
        }

        let mut part_names = HashSet::new();
        for part in &self.partitions {
            if !part_names.insert(part.name.as_str()) {
                return Err(ConfigError::DuplicatePartition(part.name.clone()));
            }
            if part.max_share & !SHARED_FORCE == 0 {
                return Err(ConfigError::ZeroShare(part.name.clone()));
            }
            for node in self.partition_nodes(part)? {
                if !seen.contains(node.as_str()) {
                    return Err(ConfigError::UnknownNode {
                        partition: part.name.clone(),
                        node,
                    });
                }
            }
        }
        Ok(())
    }
}

pub fn validate_hardware(hw: &NodeHardware) -> Result<(), ConfigError> {
    let fail = |reason: &str| ConfigError::Hardware {
        node: hw.name.clone(),
        reason: reason.to_string(),
    };
    if hw.sockets == 0 || hw.cores == 0 || hw.threads == 0 {
        return Err(fail("sockets, cores and threads must be non-zero"));
    }
    if hw.cpus == 0 {
        return Err(fail("cpus must be non-zero"));
    }
    let logical = hw.total_cores() * u32::from(hw.threads);
    if u32::from(hw.cpus) > logical {
        return Err(fail("cpus exceeds sockets * cores * threads"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[select]
granularity = "CORE_MEMORY"
fast_schedule = false

[state]
dir = "/tmp/consres"

[[nodes]]
name = "n[0-3]"
cpus = 4
sockets = 2
cores = 2
threads = 1
real_memory = 4096

[[partitions]]
name = "batch"
nodes = ["n[0-3]"]
shared = "YES"
max_share = 2

[[partitions]]
name = "debug"
nodes = ["n0", "n1"]
shared = "FORCE"
max_share = 4
"#;

    #[test]
    fn parses_sample() {
        let config = ClusterConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.select.granularity, Granularity::CoreMemory);
        assert!(!config.select.fast_schedule);
        assert_eq!(config.topology().unwrap().len(), 4);
        assert_eq!(config.sweep_interval(), DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn rows_follow_policy() {
        let config = ClusterConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.partitions[0].num_rows(), 2);
        assert_eq!(config.partitions[1].num_rows(), 4);
        assert_eq!(config.partitions[1].max_share_raw(), 4 | SHARED_FORCE);

        let mut exclusive = config.partitions[0].clone();
        exclusive.shared = SharedPolicy::Exclusive;
        assert_eq!(exclusive.num_rows(), 1);
    }

    #[test]
    fn rejects_unknown_partition_node() {
        let bad = SAMPLE.replace(r#"nodes = ["n0", "n1"]"#, r#"nodes = ["n9"]"#);
        let err = ClusterConfig::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("unknown node n9"));
    }

    #[test]
    fn rejects_oversubscribed_cpus() {
        let bad = SAMPLE.replace("cpus = 4", "cpus = 8");
        assert!(ClusterConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn rejects_zero_share() {
        let bad = SAMPLE.replace("max_share = 2", "max_share = 0");
        assert!(ClusterConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ClusterConfig::from_toml_str(SAMPLE).unwrap();
        let text = config.to_toml_string().unwrap();
        let again = ClusterConfig::from_toml_str(&text).unwrap();
        assert_eq!(again.partitions.len(), 2);
    }
}
