//! # config
//!
//! why: describe one replica's place in the cluster and its tuning knobs
//! relations: consumed by replica.rs (identity, peers, channel capacity) and the kv-replica binary
//! what: ReplicaConfig, its json loader and validation, ConfigError

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use raft_core::{NodeId, RaftConfig};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_ch_capacity() -> usize {
    100
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Per-replica configuration.
///
/// `server_list` holds every replica's `host:port`, this one included;
/// a replica's [`NodeId`] is its position in that list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub server_id: NodeId,
    pub server_list: Vec<String>,
    /// capacity of the result channel handed back by `Replica::start`
    #[serde(default = "default_ch_capacity")]
    pub ch_capacity: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub tracing_server_addr: Option<String>,
    #[serde(default)]
    pub tracing_identity: Option<String>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl ReplicaConfig {
    /// Config for replica `server_id` of `server_list` with default tuning
    pub fn for_cluster(server_id: NodeId, server_list: Vec<String>) -> Self {
        Self {
            server_id,
            server_list,
            ch_capacity: default_ch_capacity(),
            data_dir: default_data_dir(),
            tracing_server_addr: None,
            tracing_identity: None,
            raft: RaftConfig::default(),
        }
    }

    /// Read, parse and validate a json config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_list.is_empty() {
            return Err(ConfigError::Invalid("server_list is empty".into()));
        }
        if self.server_id as usize >= self.server_list.len() {
            return Err(ConfigError::Invalid(format!(
                "server_id {} is out of range for {} servers",
                self.server_id,
                self.server_list.len()
            )));
        }
        if self.ch_capacity == 0 {
            return Err(ConfigError::Invalid("ch_capacity must be positive".into()));
        }
        if self.raft.election_timeout_min > self.raft.election_timeout_max {
            return Err(ConfigError::Invalid(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.raft.election_timeout_min, self.raft.election_timeout_max
            )));
        }
        if self.raft.heartbeat_interval == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval must be positive".into()));
        }
        Ok(())
    }

    /// Every replica id in the cluster, this one included
    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        (0..self.server_list.len() as NodeId).collect()
    }

    /// The address this replica listens on
    pub fn listen_addr(&self) -> Option<&str> {
        self.server_list.get(self.server_id as usize).map(String::as_str)
    }

    /// Addresses of every other replica, keyed by id
    pub fn peer_addrs(&self) -> HashMap<NodeId, String> {
        self.server_list
            .iter()
            .enumerate()
            .map(|(i, addr)| (i as NodeId, addr.clone()))
            .filter(|(id, _)| *id != self.server_id)
            .collect()
    }
}
