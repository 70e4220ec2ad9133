//! Hub Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the communication hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Messages kept in the history ring buffer (oldest evicted first)
    pub history_capacity: usize,
    /// Bound of each agent's inbound mailbox
    pub mailbox_capacity: usize,
    /// Expected interval between agent heartbeats (ms)
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before an agent is marked offline
    pub max_missed_heartbeats: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            mailbox_capacity: 64,
            heartbeat_interval_ms: 5_000,
            max_missed_heartbeats: 3,
        }
    }
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
