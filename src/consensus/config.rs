//! Consensus Configuration

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::proposal::VotingMethod;

/// Configuration for the consensus engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Method used when a caller does not name one
    pub default_method: VotingMethod,
    /// Proposal lifetime when a caller does not set one (ms)
    pub default_deadline_ms: u64,
    /// How long `collect` waits for one agent's ballot (ms)
    pub ballot_timeout_ms: u64,
    /// Fraction of total eligible weight approvals must exceed
    pub weighted_threshold: Decimal,
    /// Weight of a vote cast without one
    pub default_weight: Decimal,
    /// How long a settled proposal stays queryable before it is dropped (ms)
    pub settled_retention_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_method: VotingMethod::Majority,
            default_deadline_ms: 30_000,
            ballot_timeout_ms: 5_000,
            weighted_threshold: Decimal::new(5, 1),
            default_weight: Decimal::ONE,
            settled_retention_ms: 60_000,
        }
    }
}

impl ConsensusConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn ballot_timeout(&self) -> Duration {
        Duration::from_millis(self.ballot_timeout_ms)
    }

    pub fn settled_retention(&self) -> Duration {
        Duration::from_millis(self.settled_retention_ms)
    }
}
