//! Node configuration loaded from a Toml file with environment overrides.

use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Which backing store implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sled,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            path: "./data".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfig {
    pub capacity: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig { capacity: 50_000 }
    }
}

/// Protocol feature flags recorded in the database version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub state_root_in_header: bool,
    pub p2p_sig_extensions: bool,
    pub keep_only_latest_state: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Wire magic distinguishing networks.
    pub magic: u32,
    pub ping_timeout_secs: u64,
    pub proto_tick_secs: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            magic: 0x4e45_4f00,
            ping_timeout_secs: 30,
            proto_tick_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mempool: MempoolConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub p2p: P2pConfig,
}

impl NodeConfig {
    /// Loads the Toml file and merges `NODE_*` environment overrides, e.g.
    /// `NODE_MEMPOOL_CAPACITY=1000`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("NODE_").split("_"))
            .extract()
            .context("failed to load node configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert!(cfg.mempool.capacity > 0);
        assert!(!cfg.protocol.p2p_sig_extensions);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).expect("create config");
        writeln!(
            file,
            "[storage]\nbackend = \"sled\"\npath = \"/tmp/db\"\n\n[mempool]\ncapacity = 123"
        )
        .expect("write config");

        let cfg = NodeConfig::from_path(&path).expect("load");
        assert_eq!(cfg.storage.backend, StorageBackend::Sled);
        assert_eq!(cfg.storage.path, "/tmp/db");
        assert_eq!(cfg.mempool.capacity, 123);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.p2p.ping_timeout_secs, 30);
    }
}
