use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{FragError, Result};

/// Which shard keys a node stores.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FragmentRole {
    /// Holds every record.
    Central,
    /// Holds records whose shard key is below the threshold.
    Below,
    /// Holds records whose shard key is at or above the threshold.
    AtOrAbove,
}

impl FragmentRole {
    /// Whether a node with this role stores `shard_key`. An absent key
    /// (broadcast read) involves every node.
    pub fn owns(self, shard_key: Option<i64>, threshold: i64) -> bool {
        match (self, shard_key) {
            (_, None) | (FragmentRole::Central, _) => true,
            (FragmentRole::Below, Some(key)) => key < threshold,
            (FragmentRole::AtOrAbove, Some(key)) => key >= threshold,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub address: String,
    pub role: FragmentRole,
}

fn default_shard_threshold() -> i64 {
    2000
}
fn default_wal_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_fsync() -> bool {
    true
}
fn default_lock_timeout_ms() -> u64 {
    5_000
}
fn default_pending_timeout_ms() -> u64 {
    10_000
}
fn default_sweep_interval_ms() -> u64 {
    10_000
}
fn default_history_ttl_ms() -> u64 {
    600_000
}
fn default_rpc_timeout_ms() -> u64 {
    5_000
}

/// Per-node configuration. Loading it from the environment or a file is
/// the embedder's business; `from_json` covers the common case.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub address: String,
    pub role: FragmentRole,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_shard_threshold")]
    pub shard_threshold: i64,
    #[serde(default = "default_wal_dir")]
    pub wal_dir: PathBuf,
    #[serde(default = "default_fsync")]
    pub fsync: bool,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_history_ttl_ms")]
    pub history_ttl_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl NodeConfig {
    /// A node with default timings and no peers.
    pub fn new(address: impl Into<String>, role: FragmentRole, wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            role,
            peers: Vec::new(),
            shard_threshold: default_shard_threshold(),
            wal_dir: wal_dir.into(),
            fsync: default_fsync(),
            lock_timeout_ms: default_lock_timeout_ms(),
            pending_timeout_ms: default_pending_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            history_ttl_ms: default_history_ttl_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }

    pub fn with_peer(mut self, address: impl Into<String>, role: FragmentRole) -> Self {
        self.peers.push(PeerConfig {
            address: address.into(),
            role,
        });
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects duplicate addresses and topologies that leave some shard key
    /// without an owner.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        seen.insert(self.address.as_str());
        for peer in &self.peers {
            if !seen.insert(peer.address.as_str()) {
                return Err(FragError::Config(format!(
                    "address {} appears more than once",
                    peer.address
                )));
            }
        }
        let roles: Vec<FragmentRole> = std::iter::once(self.role)
            .chain(self.peers.iter().map(|peer| peer.role))
            .collect();
        let covers = |key: i64| roles.iter().any(|role| role.owns(Some(key), self.shard_threshold));
        if !covers(self.shard_threshold - 1) || !covers(self.shard_threshold) {
            return Err(FragError::Config(
                "some shard keys are not owned by any node".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_millis(self.history_ttl_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
