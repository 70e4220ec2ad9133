use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agents::AgentRuntimeConfig;
use crate::consensus::ConsensusConfig;
use crate::coordinator::CoordinatorConfig;
use crate::error::{MeshError, Result};
use crate::hub::HubConfig;
use crate::persistence::StoreConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub hub: HubConfig,
    pub consensus: ConsensusConfig,
    pub coordinator: CoordinatorConfig,
    pub agents: AgentRuntimeConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rolling log files here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("MESH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (MESH_HUB__HISTORY_CAPACITY, etc.)
            .add_source(
                Environment::with_prefix("MESH")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("hub.history_capacity", self.hub.history_capacity as u64),
            ("hub.mailbox_capacity", self.hub.mailbox_capacity as u64),
            ("hub.heartbeat_interval_ms", self.hub.heartbeat_interval_ms),
            ("hub.max_missed_heartbeats", self.hub.max_missed_heartbeats as u64),
            ("consensus.default_deadline_ms", self.consensus.default_deadline_ms),
            ("consensus.ballot_timeout_ms", self.consensus.ballot_timeout_ms),
            ("coordinator.step_timeout_ms", self.coordinator.step_timeout_ms),
            ("coordinator.agent_timeout_ms", self.coordinator.agent_timeout_ms),
            ("coordinator.max_parallel_agents", self.coordinator.max_parallel_agents as u64),
            ("agents.handler_timeout_ms", self.agents.handler_timeout_ms),
            ("agents.heartbeat_interval_ms", self.agents.heartbeat_interval_ms),
            ("agents.decision_log_capacity", self.agents.decision_log_capacity as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(MeshError::Validation(format!("{} must be positive", key)));
            }
        }

        let threshold = self.consensus.weighted_threshold;
        if threshold <= Decimal::ZERO || threshold > Decimal::ONE {
            return Err(MeshError::Validation(format!(
                "consensus.weighted_threshold {} outside (0, 1]",
                threshold
            )));
        }
        if self.consensus.default_weight < Decimal::ZERO {
            return Err(MeshError::Validation(
                "consensus.default_weight must not be negative".into(),
            ));
        }
        if self.coordinator.coordinator_id.trim().is_empty() {
            return Err(MeshError::Validation("coordinator.coordinator_id is empty".into()));
        }
        Ok(())
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| MeshError::Internal(format!("config encode: {}", e)))
    }
}
