//! Workflow Orchestrator
//!
//! Interprets workflow templates over the agent mesh: dispatch steps go to
//! capability-matching agents through the hub, consensus checkpoints go to
//! the consensus engine, and every run keeps its own results and audit trail.

pub mod config;
pub mod coordinator;
pub mod state;
pub mod template;

pub use config::CoordinatorConfig;
pub use coordinator::Orchestrator;
pub use state::{
    AgentOutcome, AgentResult, AuditEntry, ConsensusOutcome, FailureReason, OrchestratorStats,
    StepResult, WorkflowInstance, WorkflowStatus, WorkflowSummary,
};
pub use template::{builtin_templates, ExecutionMode, InputMapping, StepSpec, WorkflowTemplate};
