//! Agent Runtime Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by every agent runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRuntimeConfig {
    /// Internal deadline for one `handle` / `cast_vote` call (ms)
    pub handler_timeout_ms: u64,
    /// Interval between heartbeats sent to the hub (ms)
    pub heartbeat_interval_ms: u64,
    /// Decisions kept per agent (oldest evicted first)
    pub decision_log_capacity: usize,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 8_000,
            heartbeat_interval_ms: 5_000,
            decision_log_capacity: 256,
        }
    }
}

impl AgentRuntimeConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
