//! Workflow run state: instances, step results and the audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::consensus::{Resolution, Verdict};
use crate::domain::Capability;
use crate::error::MeshError;

use super::template::ExecutionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::PartiallyCompleted => write!(f, "partially_completed"),
        }
    }
}

/// Why a run ended `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// A required step got no answer from any agent before its deadline
    StepTimeout { step: String },
    /// A required step finished without a single usable result
    NoUsableResult { step: String },
    /// A required consensus checkpoint was voted down
    ConsensusRejected { step: String },
    Cancelled,
}

impl FailureReason {
    pub fn step(&self) -> Option<&str> {
        match self {
            FailureReason::StepTimeout { step }
            | FailureReason::NoUsableResult { step }
            | FailureReason::ConsensusRejected { step } => Some(step),
            FailureReason::Cancelled => None,
        }
    }
}

impl From<FailureReason> for MeshError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::StepTimeout { step } => MeshError::StepTimeout { step },
            FailureReason::NoUsableResult { step } => MeshError::NoUsableResult { step },
            FailureReason::ConsensusRejected { step } => {
                MeshError::Validation(format!("consensus rejected at step {}", step))
            }
            FailureReason::Cancelled => MeshError::Cancelled,
        }
    }
}

/// What happened to one agent dispatched for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Succeeded,
    /// Answered, but with reduced fidelity
    Degraded,
    /// Answered with an error
    Failed,
    /// Exceeded its own per-agent deadline
    TimedOut,
    /// Still silent when the step deadline passed
    NoResponse,
    /// Could not be reached through the hub
    Unreachable,
}

impl AgentOutcome {
    /// Whether the agent's answer counts toward the step result
    pub fn is_usable(&self) -> bool {
        matches!(self, AgentOutcome::Succeeded | AgentOutcome::Degraded)
    }

    pub fn is_silence(&self) -> bool {
        matches!(self, AgentOutcome::TimedOut | AgentOutcome::NoResponse)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub outcome: AgentOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Consensus checkpoint outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub proposal_id: Uuid,
    pub resolution: Resolution,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub capability: Capability,
    pub mode: ExecutionMode,
    pub input: Value,
    /// Per-agent outcomes keyed by agent id
    pub agents: BTreeMap<String, AgentResult>,
    /// Usable outputs keyed by agent id (or the tally of a consensus step)
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn usable_count(&self) -> usize {
        match &self.consensus {
            Some(consensus) => usize::from(consensus.verdict == Verdict::Approved),
            None => self
                .agents
                .values()
                .filter(|r| r.outcome.is_usable())
                .count(),
        }
    }

    /// Every dispatched agent answered cleanly
    pub fn is_full_success(&self) -> bool {
        match &self.consensus {
            Some(consensus) => consensus.verdict == Verdict::Approved,
            None => {
                !self.agents.is_empty()
                    && self
                        .agents
                        .values()
                        .all(|r| r.outcome == AgentOutcome::Succeeded)
            }
        }
    }
}

/// One (step, agent, error) tuple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub step_id: String,
    /// None when the error concerns the step rather than one agent
    pub agent_id: Option<String>,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub run_id: Uuid,
    pub template: String,
    pub payload: Value,
    pub current_step: usize,
    pub total_steps: usize,
    /// Keyed by step id
    pub step_results: BTreeMap<String, StepResult>,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Capabilities whose last step did not fully succeed
    #[serde(default)]
    pub coverage_gaps: BTreeSet<Capability>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(template: &str, total_steps: usize, payload: Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            template: template.to_string(),
            payload,
            current_step: 0,
            total_steps,
            step_results: BTreeMap::new(),
            status: WorkflowStatus::Running,
            failure: None,
            coverage_gaps: BTreeSet::new(),
            audit: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn audit(&mut self, step_id: &str, agent_id: Option<&str>, error: impl Into<String>) {
        self.audit.push(AuditEntry {
            step_id: step_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            error: error.into(),
            at: Utc::now(),
        });
    }

    pub fn fail(&mut self, reason: FailureReason) {
        self.status = WorkflowStatus::Failed;
        self.failure = Some(reason);
        self.ended_at = Some(Utc::now());
    }

    /// Completed, or partially completed while coverage gaps remain
    pub fn finish(&mut self) {
        self.status = if self.coverage_gaps.is_empty() {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::PartiallyCompleted
        };
        self.ended_at = Some(Utc::now());
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            run_id: self.run_id,
            template: self.template.clone(),
            status: self.status,
            current_step: self.current_step,
            total_steps: self.total_steps,
            failure: self.failure.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub run_id: Uuid,
    pub template: String,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub failure: Option<FailureReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Smoothing factor of the execution time moving average
const EXECUTION_EMA_ALPHA: f64 = 0.1;

/// Snapshot of orchestrator activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub active_runs: usize,
    pub submitted: u64,
    pub finished: u64,
    pub completed: u64,
    pub partially_completed: u64,
    /// Failures other than cancellation
    pub failed: u64,
    pub cancelled: u64,
    /// Share of finished runs that completed fully
    pub success_rate: f64,
    /// Exponential moving average of run duration (ms)
    pub avg_execution_ms: f64,
    /// Runs submitted per template
    pub templates: BTreeMap<String, u64>,
}

/// Running counters behind `OrchestratorStats`
#[derive(Debug, Default)]
pub(crate) struct RunMetrics {
    stats: OrchestratorStats,
}

impl RunMetrics {
    pub(crate) fn record_submitted(&mut self, template: &str) {
        self.stats.submitted += 1;
        *self.stats.templates.entry(template.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn record_finished(&mut self, instance: &WorkflowInstance) {
        let stats = &mut self.stats;
        stats.finished += 1;
        match (instance.status, &instance.failure) {
            (WorkflowStatus::Completed, _) => stats.completed += 1,
            (WorkflowStatus::PartiallyCompleted, _) => stats.partially_completed += 1,
            (_, Some(FailureReason::Cancelled)) => stats.cancelled += 1,
            _ => stats.failed += 1,
        }
        stats.success_rate = stats.completed as f64 / stats.finished as f64;

        let ended_at = instance.ended_at.unwrap_or_else(Utc::now);
        let elapsed_ms = (ended_at - instance.started_at).num_milliseconds().max(0) as f64;
        stats.avg_execution_ms = if stats.finished == 1 {
            elapsed_ms
        } else {
            (1.0 - EXECUTION_EMA_ALPHA) * stats.avg_execution_ms + EXECUTION_EMA_ALPHA * elapsed_ms
        };
    }

    pub(crate) fn snapshot(&self, active_runs: usize) -> OrchestratorStats {
        OrchestratorStats {
            active_runs,
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finish_reflects_coverage_gaps() {
        let mut run = WorkflowInstance::new("t", 2, json!({}));
        run.finish();
        assert_eq!(run.status, WorkflowStatus::Completed);

        let mut run = WorkflowInstance::new("t", 2, json!({}));
        run.coverage_gaps.insert(Capability::RiskAssessment);
        run.finish();
        assert_eq!(run.status, WorkflowStatus::PartiallyCompleted);
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_metrics_split_outcomes_and_smooth_duration() {
        let mut metrics = RunMetrics::default();
        metrics.record_submitted("daily-cash-management");
        metrics.record_submitted("daily-cash-management");
        metrics.record_submitted("crisis-response");

        let mut done = WorkflowInstance::new("daily-cash-management", 1, json!({}));
        done.finish();
        done.ended_at = Some(done.started_at + chrono::Duration::milliseconds(1_000));
        metrics.record_finished(&done);

        let mut cancelled = WorkflowInstance::new("crisis-response", 1, json!({}));
        cancelled.fail(FailureReason::Cancelled);
        cancelled.ended_at = Some(cancelled.started_at + chrono::Duration::milliseconds(2_000));
        metrics.record_finished(&cancelled);

        let stats = metrics.snapshot(1);
        assert_eq!(stats.active_runs, 1);
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.finished, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.success_rate, 0.5);
        assert!((stats.avg_execution_ms - 1_100.0).abs() < 1e-6);
        assert_eq!(stats.templates["daily-cash-management"], 2);
    }

    #[test]
    fn test_failure_reason_serializes_tagged() {
        let reason = FailureReason::StepTimeout {
            step: "cash-forecast".into(),
        };
        assert_eq!(
            serde_json::to_value(&reason).unwrap(),
            json!({"reason": "step_timeout", "step": "cash-forecast"})
        );
        assert_eq!(
            serde_json::to_value(FailureReason::Cancelled).unwrap(),
            json!({"reason": "cancelled"})
        );
    }
}
