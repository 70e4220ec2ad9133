//! Agent descriptors kept by the hub

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::{Capability, CapabilitySet};

/// Health reported through heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Offline,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Registry entry describing a live agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub capabilities: CapabilitySet,
    pub health: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Consecutive heartbeat intervals without a heartbeat
    #[serde(default)]
    pub missed_heartbeats: u32,
}

impl AgentDescriptor {
    pub fn new(agent_id: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: capabilities.into_iter().collect(),
            health: HealthStatus::Healthy,
            last_heartbeat: Utc::now(),
            missed_heartbeats: 0,
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthStatus::Healthy
    }

    pub fn is_offline(&self) -> bool {
        self.health == HealthStatus::Offline
    }
}
