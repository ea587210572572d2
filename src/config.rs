//! Node configuration

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ConsensusError, NodeId, Result};

/// Timing and identity configuration for a consensus node.
///
/// The heartbeat interval must be strictly less than the minimum election
/// timeout, otherwise followers time out between heartbeats and elections
/// never settle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Node identity; generated at construction when absent
    pub id: Option<NodeId>,

    /// Minimum election timeout in milliseconds
    pub election_timeout_min: u64,

    /// Maximum election timeout in milliseconds
    pub election_timeout_max: u64,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            id: None,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }
}

impl RaftConfig {
    /// Draw a randomized election timeout from
    /// `[election_timeout_min, election_timeout_max]`.
    pub fn election_timeout(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let timeout_ms = rng.gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    /// Get the heartbeat interval as a Duration
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConsensusError::Config(
                "election_timeout_min must be less than election_timeout_max".to_string(),
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConsensusError::Config(
                "heartbeat_interval must be less than election_timeout_min".to_string(),
            ));
        }

        Ok(())
    }
}
