/// Configuration - tunables for the registry, IKC layer and lifecycle
///
/// Every field has a default so a partial TOML file is enough.

use crate::types::ChipTopology;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Host-side IHK configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IhkConfig {
    /// Concurrent OS instance slots
    pub max_os_instances: usize,
    /// Upper bound on chunks in one reserve/release call
    pub max_mem_chunks: usize,
    /// Memory reservations are rounded up to this many bytes
    pub mem_granule: u64,
    /// Pages backing each IKC queue
    pub ikc_queue_pages: usize,
    /// Vector the per-CPU IKC dispatcher is registered on
    pub ikc_vector: u32,
    pub nmi_vector: u32,
    /// Host CPU that receives master-channel and unmapped IKC interrupts
    pub host_ikc_cpu: u32,
    /// Polls of the boot-parameter status before a boot is declared hung
    pub boot_poll_limit: u64,
    pub shutdown_timeout_ms: u64,
    /// Attempts per core before a forced kill is declared failed
    pub kill_retry_budget: u32,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

impl Default for IhkConfig {
    fn default() -> Self {
        Self {
            max_os_instances: 4,
            max_mem_chunks: 1024,
            mem_granule: 4 << 20,
            ikc_queue_pages: 4,
            ikc_vector: 0xd1,
            nmi_vector: 2,
            host_ikc_cpu: 0,
            boot_poll_limit: 1_000_000,
            shutdown_timeout_ms: 2000,
            kill_retry_budget: 8,
            owner_uid: 0,
            owner_gid: 0,
        }
    }
}

impl IhkConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

/// `[topology]` table used by the simulation runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub num_cpus: u32,
    pub numa_nodes: u32,
    /// Bytes of memory per NUMA node
    pub mem_per_node: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            num_cpus: 16,
            numa_nodes: 2,
            mem_per_node: 4 << 30,
        }
    }
}

impl TopologyConfig {
    pub fn build(&self) -> ChipTopology {
        ChipTopology::uniform(self.num_cpus, self.numa_nodes, self.mem_per_node)
    }
}

/// Complete configuration file for `ihk-sim`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub ihk: IhkConfig,
    pub topology: TopologyConfig,
}

impl SimConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = IhkConfig::from_toml_str("max_os_instances = 2\nikc_queue_pages = 1\n").unwrap();
        assert_eq!(cfg.max_os_instances, 2);
        assert_eq!(cfg.ikc_queue_pages, 1);
        assert_eq!(cfg.max_mem_chunks, 1024);
        assert_eq!(cfg.ikc_vector, 0xd1);
    }

    #[test]
    fn sim_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[ihk]\nhost_ikc_cpu = 1\n\n[topology]\nnum_cpus = 8\nnuma_nodes = 1\nmem_per_node = 1073741824"
        )
        .unwrap();

        let cfg = SimConfig::load(file.path()).unwrap();
        assert_eq!(cfg.ihk.host_ikc_cpu, 1);
        let topo = cfg.topology.build();
        assert_eq!(topo.num_cpus(), 8);
        assert_eq!(topo.num_nodes(), 1);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = IhkConfig::from_toml_str("max_os_instances = \"four\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = IhkConfig::load("/nonexistent/ihk.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
