//! # config
//!
//! why: collect the timing knobs that keep elections live without flapping
//! relations: owned by node.rs, read by the raft-kv timers
//! what: RaftConfig with defaults and randomized election timeouts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Raft timing configuration (milliseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout (randomized between min and max)
    pub election_timeout_min: u64,
    /// Maximum election timeout
    pub election_timeout_max: u64,
    /// Heartbeat interval (must be well below the election timeout)
    pub heartbeat_interval: u64,
    /// Upper bound on a single outbound rpc
    pub rpc_timeout: u64,
    /// Max entries per AppendEntries rpc
    pub max_entries_per_rpc: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_entries_per_rpc: 64,
        }
    }
}

impl RaftConfig {
    /// Returns a fresh election timeout drawn uniformly from the configured window
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min;
        let max = self.election_timeout_max.max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}
