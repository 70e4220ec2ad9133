//! Workflow templates and the built-in treasury catalog

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::consensus::VotingMethod;
use crate::domain::Capability;
use crate::error::{MeshError, Result};

/// How a step dispatches to the agents it selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Exactly one agent, the hub's most responsive pick
    Sequential,
    /// Every selected agent, concurrently
    ParallelGroup,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Sequential
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::ParallelGroup => write!(f, "parallel-group"),
        }
    }
}

/// Where one input value of a step comes from.
///
/// `step: None` reads the run's initial payload. `pointer` is a JSON
/// pointer into the source (`""` or absent selects the whole value).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

impl InputMapping {
    pub fn payload() -> Self {
        Self::default()
    }

    pub fn step(step: &str) -> Self {
        Self {
            step: Some(step.to_string()),
            pointer: None,
        }
    }

    pub fn at(mut self, pointer: &str) -> Self {
        self.pointer = Some(pointer.to_string());
        self
    }

    /// Select this mapping's value out of `source`; missing paths are null
    pub fn select(&self, source: &Value) -> Value {
        match self.pointer.as_deref() {
            None | Some("") => source.clone(),
            Some(pointer) => source.pointer(pointer).cloned().unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub capability: Capability,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub is_consensus: bool,
    /// Voting method of a consensus step; the engine default otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_method: Option<VotingMethod>,
    /// Zero usable results fail the whole run
    #[serde(default)]
    pub all_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agents: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Input key -> source. Empty means the step receives the initial payload.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputMapping>,
}

impl StepSpec {
    pub fn new(id: &str, capability: Capability) -> Self {
        Self {
            id: id.to_string(),
            capability,
            mode: ExecutionMode::Sequential,
            is_consensus: false,
            consensus_method: None,
            all_required: false,
            max_agents: None,
            timeout_ms: None,
            inputs: BTreeMap::new(),
        }
    }

    pub fn parallel(mut self) -> Self {
        self.mode = ExecutionMode::ParallelGroup;
        self
    }

    pub fn consensus(mut self, method: VotingMethod) -> Self {
        self.is_consensus = true;
        self.consensus_method = Some(method);
        self
    }

    pub fn required(mut self) -> Self {
        self.all_required = true;
        self
    }

    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.max_agents = Some(max_agents);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn input(mut self, key: &str, mapping: InputMapping) -> Self {
        self.inputs.insert(key.to_string(), mapping);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepSpec>,
}

impl WorkflowTemplate {
    pub fn new(name: &str, description: &str, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            steps,
        }
    }

    /// Reject templates the orchestrator could not run in order
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MeshError::Validation("template name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(MeshError::Validation(format!(
                "template {} has no steps",
                self.name
            )));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(MeshError::Validation(format!(
                    "template {} has a step without id",
                    self.name
                )));
            }
            if step.max_agents == Some(0) || step.timeout_ms == Some(0) {
                return Err(MeshError::Validation(format!(
                    "step {} of {} needs a positive agent count and timeout",
                    step.id, self.name
                )));
            }
            for (key, mapping) in &step.inputs {
                if let Some(source) = mapping.step.as_deref() {
                    if !seen.contains(source) {
                        return Err(MeshError::Validation(format!(
                            "input {} of step {} reads {} which does not run before it",
                            key, step.id, source
                        )));
                    }
                }
            }
            if !seen.insert(step.id.as_str()) {
                return Err(MeshError::Validation(format!(
                    "duplicate step id {} in {}",
                    step.id, self.name
                )));
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// The built-in treasury workflows
pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    use Capability::*;

    vec![
        WorkflowTemplate::new(
            "daily-cash-management",
            "Daily cash position management",
            vec![
                StepSpec::new("cash-position-analysis", CashForecasting)
                    .parallel()
                    .required(),
                StepSpec::new("risk-assessment", RiskAssessment).parallel(),
                StepSpec::new("liquidity-optimization", LiquidityManagement)
                    .required()
                    .input("position", InputMapping::step("cash-position-analysis"))
                    .input("risk", InputMapping::step("risk-assessment")),
                StepSpec::new("compliance-check", ComplianceCheck)
                    .required()
                    .input("plan", InputMapping::step("liquidity-optimization")),
                StepSpec::new("reporting", Reporting)
                    .input("plan", InputMapping::step("liquidity-optimization"))
                    .input("compliance", InputMapping::step("compliance-check")),
            ],
        ),
        WorkflowTemplate::new(
            "payment-optimization",
            "Payment scheduling and cash flow optimization",
            vec![
                StepSpec::new("payment-analysis", PaymentPrioritization)
                    .parallel()
                    .required(),
                StepSpec::new("liquidity-impact", LiquidityManagement).parallel(),
                StepSpec::new("risk-assessment", RiskAssessment)
                    .input("payments", InputMapping::step("payment-analysis"))
                    .input("liquidity", InputMapping::step("liquidity-impact")),
                StepSpec::new("compliance-approval", ComplianceCheck)
                    .required()
                    .input("payments", InputMapping::step("payment-analysis")),
                StepSpec::new("execution-planning", CashForecasting)
                    .input("payments", InputMapping::step("payment-analysis"))
                    .input("approval", InputMapping::step("compliance-approval")),
            ],
        ),
        WorkflowTemplate::new(
            "investment-planning",
            "Investment allocation ending in a consensus decision",
            vec![
                StepSpec::new("cash-forecast", CashForecasting).required(),
                StepSpec::new("investment-analysis", InvestmentAdvice)
                    .parallel()
                    .required()
                    .input("forecast", InputMapping::step("cash-forecast")),
                StepSpec::new("risk-assessment", RiskAssessment)
                    .parallel()
                    .input("forecast", InputMapping::step("cash-forecast")),
                StepSpec::new("compliance-review", ComplianceCheck)
                    .required()
                    .input("analysis", InputMapping::step("investment-analysis")),
                StepSpec::new("consensus-decision", InvestmentAdvice)
                    .consensus(VotingMethod::Majority)
                    .required()
                    .input("analysis", InputMapping::step("investment-analysis"))
                    .input("amount", InputMapping::payload().at("/amount")),
            ],
        ),
        WorkflowTemplate::new(
            "collections-campaign",
            "Collections strategy and execution",
            vec![
                StepSpec::new("collections-analysis", CollectionsStrategy).required(),
                StepSpec::new("risk-profiling", RiskAssessment)
                    .input("analysis", InputMapping::step("collections-analysis")),
                StepSpec::new("cash-impact-forecast", CashForecasting)
                    .input("analysis", InputMapping::step("collections-analysis")),
                StepSpec::new("compliance-review", ComplianceCheck)
                    .required()
                    .input("analysis", InputMapping::step("collections-analysis")),
                StepSpec::new("execution-coordination", CollectionsStrategy)
                    .required()
                    .input("risk", InputMapping::step("risk-profiling"))
                    .input("forecast", InputMapping::step("cash-impact-forecast")),
            ],
        ),
        WorkflowTemplate::new(
            "crisis-response",
            "Emergency treasury response with a supermajority checkpoint",
            vec![
                StepSpec::new("situation-assessment", RiskAssessment)
                    .parallel()
                    .required(),
                StepSpec::new("liquidity-analysis", LiquidityManagement)
                    .parallel()
                    .required(),
                StepSpec::new("scenario-planning", ScenarioAnalysis)
                    .input("situation", InputMapping::step("situation-assessment"))
                    .input("liquidity", InputMapping::step("liquidity-analysis")),
                StepSpec::new("emergency-consensus", RiskAssessment)
                    .consensus(VotingMethod::Supermajority)
                    .required()
                    .input("scenarios", InputMapping::step("scenario-planning"))
                    .input("amount", InputMapping::payload().at("/amount")),
                StepSpec::new("crisis-execution", LiquidityManagement)
                    .required()
                    .input("decision", InputMapping::step("emergency-consensus")),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_templates_are_valid() {
        let templates = builtin_templates();
        assert_eq!(templates.len(), 5);
        for template in &templates {
            template.validate().unwrap();
        }
        let crisis = templates.iter().find(|t| t.name == "crisis-response").unwrap();
        let checkpoint = crisis.step("emergency-consensus").unwrap();
        assert!(checkpoint.is_consensus);
        assert_eq!(checkpoint.consensus_method, Some(VotingMethod::Supermajority));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let template = WorkflowTemplate::new(
            "bad",
            "",
            vec![
                StepSpec::new("a", Capability::Reporting).input("x", InputMapping::step("b")),
                StepSpec::new("b", Capability::Reporting),
            ],
        );
        assert!(matches!(template.validate(), Err(MeshError::Validation(_))));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let template = WorkflowTemplate::new(
            "dup",
            "",
            vec![
                StepSpec::new("a", Capability::Reporting),
                StepSpec::new("a", Capability::RiskAssessment),
            ],
        );
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_input_pointer_selection() {
        let source = json!({"amount": 250, "nested": {"k": "v"}});
        assert_eq!(InputMapping::payload().select(&source), source);
        assert_eq!(InputMapping::payload().at("/nested/k").select(&source), json!("v"));
        assert_eq!(InputMapping::payload().at("/missing").select(&source), Value::Null);
    }

    #[test]
    fn test_step_spec_deserializes_with_defaults() {
        let step: StepSpec = serde_json::from_value(json!({
            "id": "check",
            "capability": "compliance-check",
            "mode": "parallel-group"
        }))
        .unwrap();
        assert_eq!(step.mode, ExecutionMode::ParallelGroup);
        assert!(!step.all_required);
        assert!(step.inputs.is_empty());
    }
}
