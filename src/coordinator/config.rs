//! Coordinator Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::consensus::TimeoutPolicy;

/// Configuration for the workflow orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Id the orchestrator uses as message sender and proposal initiator
    pub coordinator_id: String,
    /// Deadline of a step unless the step overrides it (ms)
    pub step_timeout_ms: u64,
    /// Deadline of one agent's answer within a step (ms)
    pub agent_timeout_ms: u64,
    /// Agents a step dispatches to unless the step overrides it
    pub max_parallel_agents: usize,
    /// How consensus steps treat a `timed_out` proposal
    pub consensus_timeout_policy: TimeoutPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordinator_id: "coordinator".to_string(),
            step_timeout_ms: 30_000,
            agent_timeout_ms: 10_000,
            max_parallel_agents: 5,
            consensus_timeout_policy: TimeoutPolicy::Fail,
        }
    }
}

impl CoordinatorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }
}
