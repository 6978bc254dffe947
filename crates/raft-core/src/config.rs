//! # config
//!
//! why: collect the timing and batching knobs of a replica in one place
//! relations: read by node.rs (batch sizes) and by the raft-server runtime (timers, deadlines)
//! what: RaftConfig with defaults, validation, json loading and randomized election timeouts

use crate::error::{RaftError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and batching configuration. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// How often a leader contacts each follower when idle.
    /// Must stay below `election_timeout_min`.
    pub heartbeat_interval: u64,
    /// Cap on entries shipped in one AppendEntries
    pub max_entries_per_append: usize,
    /// Deadline for a single outbound rpc
    pub rpc_timeout: u64,
    /// How long a client request may wait for commitment
    pub client_timeout: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_append: 64,
            rpc_timeout: 100,
            client_timeout: 2000,
        }
    }
}

impl RaftConfig {
    /// Parse a json document; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RaftConfig = serde_json::from_str(json).map_err(|e| RaftError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config {
                reason: format!(
                    "heartbeat_interval ({}ms) must be < election_timeout_min ({}ms)",
                    self.heartbeat_interval, self.election_timeout_min
                ),
            });
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::Config {
                reason: format!(
                    "election_timeout_min ({}ms) must be < election_timeout_max ({}ms)",
                    self.election_timeout_min, self.election_timeout_max
                ),
            });
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::Config {
                reason: "max_entries_per_append must be > 0".to_string(),
            });
        }
        if self.rpc_timeout == 0 {
            return Err(RaftError::Config {
                reason: "rpc_timeout must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// A fresh election timeout drawn uniformly from `[min, max]`.
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn client_deadline(&self) -> Duration {
        Duration::from_millis(self.client_timeout)
    }
}
