use thiserror::Error;
use uuid::Uuid;

use crate::domain::Capability;

/// Main error type for the coordination core
#[derive(Error, Debug)]
pub enum MeshError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Registry / routing errors
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Agent offline: {0}")]
    AgentOffline(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Agent {0} already registered with a different capability set")]
    DuplicateAgent(String),

    #[error("No response from {agent_id} within {timeout_ms}ms")]
    ResponseTimeout { agent_id: String, timeout_ms: u64 },

    // Consensus errors
    #[error("Agent {agent_id} is not eligible to vote on proposal {proposal_id}")]
    NotEligible { proposal_id: Uuid, agent_id: String },

    #[error("Proposal closed: {0}")]
    ProposalClosed(Uuid),

    #[error("No eligible voters for capability {0}")]
    NoEligibleVoters(Capability),

    #[error("Unknown proposal: {0}")]
    UnknownProposal(Uuid),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    // Workflow errors
    #[error("Step {step} timed out")]
    StepTimeout { step: String },

    #[error("Step {step} produced no usable result")]
    NoUsableResult { step: String },

    #[error("Unknown workflow template: {0}")]
    UnknownTemplate(String),

    #[error("Unknown workflow run: {0}")]
    UnknownWorkflow(Uuid),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    /// Timeouts of any kind, as opposed to outright failures
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            MeshError::ResponseTimeout { .. } | MeshError::StepTimeout { .. }
        )
    }
}

/// Result type alias for MeshError
pub type Result<T> = std::result::Result<T, MeshError>;
