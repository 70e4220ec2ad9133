//! Orchestrator: drives workflow runs across the agent mesh
//!
//! The Orchestrator owns the template catalog and every live run. Each run is
//! a tokio task that walks its template in order:
//!   - dispatch steps go through the hub to capability-matching agents, each
//!     agent bounded by its own deadline and the whole step by the step deadline
//!   - consensus steps open a proposal and collect ballots from the same agents
//!   - results, coverage gaps and the audit trail land on the run's instance
//!
//! Callers use a clonable `Orchestrator` handle; a run's instance is only
//! mutated while it is `running`, so cancellation wins over late results.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::cancel_notice;
use crate::consensus::{ConsensusEngine, ProposalStatus, Verdict};
use crate::domain::{Message, MessagePriority, ReplyStatus, ResponseBody};
use crate::error::{MeshError, Result};
use crate::hub::CommunicationHub;
use crate::persistence::{InMemoryWorkflowStore, WorkflowStore};

use super::config::CoordinatorConfig;
use super::state::{
    AgentOutcome, AgentResult, ConsensusOutcome, FailureReason, OrchestratorStats, RunMetrics,
    StepResult, WorkflowInstance, WorkflowStatus, WorkflowSummary,
};
use super::template::{builtin_templates, ExecutionMode, StepSpec, WorkflowTemplate};

/// Live state of one run
struct RunSlot {
    template: Arc<WorkflowTemplate>,
    instance: RwLock<WorkflowInstance>,
    cancel_tx: watch::Sender<bool>,
    status_tx: watch::Sender<WorkflowStatus>,
    /// (request or proposal id, agent id) still owed an answer
    outstanding: DashSet<(Uuid, String)>,
}

/// A finished step before it is applied to the instance
struct StepOutcome {
    result: StepResult,
    audit: Vec<(Option<String>, String)>,
}

struct OrchestratorInner {
    hub: CommunicationHub,
    consensus: ConsensusEngine,
    config: CoordinatorConfig,
    templates: DashMap<String, Arc<WorkflowTemplate>>,
    /// Running runs only; ended runs are served from the store
    runs: DashMap<Uuid, Arc<RunSlot>>,
    store: Arc<dyn WorkflowStore>,
    metrics: Mutex<RunMetrics>,
}

/// Clonable handle to the workflow orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Create an orchestrator preloaded with the built-in templates
    pub fn new(
        hub: CommunicationHub,
        consensus: ConsensusEngine,
        config: CoordinatorConfig,
        store: Arc<dyn WorkflowStore>,
    ) -> Self {
        let templates = DashMap::new();
        for template in builtin_templates() {
            templates.insert(template.name.clone(), Arc::new(template));
        }

        Self {
            inner: Arc::new(OrchestratorInner {
                hub,
                consensus,
                config,
                templates,
                runs: DashMap::new(),
                store,
                metrics: Mutex::new(RunMetrics::default()),
            }),
        }
    }

    pub fn with_memory_store(
        hub: CommunicationHub,
        consensus: ConsensusEngine,
        config: CoordinatorConfig,
    ) -> Self {
        Self::new(hub, consensus, config, Arc::new(InMemoryWorkflowStore::new()))
    }

    pub fn hub(&self) -> &CommunicationHub {
        &self.inner.hub
    }

    pub fn consensus(&self) -> &ConsensusEngine {
        &self.inner.consensus
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    // ==================== Templates ====================

    /// Add or replace a template
    pub fn register_template(&self, template: WorkflowTemplate) -> Result<()> {
        template.validate()?;
        info!(template = %template.name, steps = template.steps.len(), "Registered workflow template");
        self.inner
            .templates
            .insert(template.name.clone(), Arc::new(template));
        Ok(())
    }

    pub fn template(&self, name: &str) -> Option<WorkflowTemplate> {
        self.inner.templates.get(name).map(|t| t.as_ref().clone())
    }

    /// All templates, ordered by name
    pub fn templates(&self) -> Vec<WorkflowTemplate> {
        let mut all: Vec<_> = self
            .inner
            .templates
            .iter()
            .map(|t| t.value().as_ref().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // ==================== Runs ====================

    /// Start a run of `template_name`; returns its run id immediately
    pub async fn submit_workflow(&self, template_name: &str, payload: Value) -> Result<Uuid> {
        let template = self
            .inner
            .templates
            .get(template_name)
            .map(|t| t.value().clone())
            .ok_or_else(|| MeshError::UnknownTemplate(template_name.to_string()))?;

        let instance = WorkflowInstance::new(&template.name, template.steps.len(), payload);
        let run_id = instance.run_id;
        self.persist(&instance).await;

        let (cancel_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(WorkflowStatus::Running);
        self.inner.metrics.lock().await.record_submitted(&template.name);
        let slot = Arc::new(RunSlot {
            template: template.clone(),
            instance: RwLock::new(instance),
            cancel_tx,
            status_tx,
            outstanding: DashSet::new(),
        });
        self.inner.runs.insert(run_id, slot.clone());

        info!(run_id = %run_id, template = %template.name, "Workflow submitted");
        tokio::spawn(self.clone().drive(slot));
        Ok(run_id)
    }

    /// Snapshot of a run, live or stored
    pub async fn get_workflow_status(&self, run_id: Uuid) -> Result<WorkflowInstance> {
        if let Some(slot) = self.slot(run_id) {
            return Ok(slot.instance.read().await.clone());
        }
        self.inner
            .store
            .load(run_id)
            .await?
            .ok_or(MeshError::UnknownWorkflow(run_id))
    }

    /// Mark a running run `failed/cancelled` at once and notify agents still
    /// working on it. In-flight answers are not awaited.
    pub async fn cancel_workflow(&self, run_id: Uuid) -> Result<WorkflowInstance> {
        let Some(slot) = self.slot(run_id) else {
            return self.get_workflow_status(run_id).await;
        };

        let snapshot = {
            let mut instance = slot.instance.write().await;
            if instance.status.is_terminal() {
                debug!(run_id = %run_id, status = %instance.status, "Cancel ignored; run already ended");
                return Ok(instance.clone());
            }
            let step_id = slot
                .template
                .steps
                .get(instance.current_step)
                .map(|s| s.id.clone())
                .unwrap_or_default();
            instance.audit(&step_id, None, "run cancelled by owner");
            instance.fail(FailureReason::Cancelled);
            self.conclude(&slot, &instance).await;
            instance.clone()
        };
        slot.cancel_tx.send_replace(true);

        let outstanding: Vec<(Uuid, String)> = slot.outstanding.iter().map(|e| e.key().clone()).collect();
        slot.outstanding.clear();
        for (request_id, agent_id) in outstanding {
            self.inner.hub.cancel_request(request_id);
            let notice = cancel_notice(&self.inner.config.coordinator_id, &agent_id, request_id, run_id);
            let hub = self.inner.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = hub.route(notice).await {
                    debug!(agent_id = %agent_id, error = %e, "Cancellation notice not delivered");
                }
            });
        }

        warn!(run_id = %run_id, "Workflow cancelled");
        Ok(snapshot)
    }

    /// Summaries of every known run, oldest first
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let mut summaries: HashMap<Uuid, WorkflowSummary> = HashMap::new();
        for stored in self.inner.store.list().await? {
            summaries.insert(stored.run_id, stored.summary());
        }

        let live: Vec<Arc<RunSlot>> = self.inner.runs.iter().map(|e| e.value().clone()).collect();
        for slot in live {
            let summary = slot.instance.read().await.summary();
            summaries.insert(summary.run_id, summary);
        }

        let mut all: Vec<_> = summaries.into_values().collect();
        all.sort_by_key(|s| s.started_at);
        Ok(all)
    }

    /// Wait until a run leaves `running` and return its final snapshot
    pub async fn wait_for_completion(&self, run_id: Uuid) -> Result<WorkflowInstance> {
        let Some(slot) = self.slot(run_id) else {
            return self.get_workflow_status(run_id).await;
        };

        let mut status = slot.status_tx.subscribe();
        loop {
            if status.borrow_and_update().is_terminal() {
                break;
            }
            // The run may have ended before we subscribed
            if slot.instance.read().await.status.is_terminal() {
                break;
            }
            status
                .changed()
                .await
                .map_err(|_| MeshError::Internal(format!("run {} status channel closed", run_id)))?;
        }
        let snapshot = slot.instance.read().await.clone();
        Ok(snapshot)
    }

    /// Run counts, success rate and execution time
    pub async fn stats(&self) -> OrchestratorStats {
        let active = self.inner.runs.len();
        self.inner.metrics.lock().await.snapshot(active)
    }

    fn slot(&self, run_id: Uuid) -> Option<Arc<RunSlot>> {
        self.inner.runs.get(&run_id).map(|s| s.value().clone())
    }

    async fn persist(&self, instance: &WorkflowInstance) -> bool {
        match self.inner.store.save(instance).await {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %instance.run_id, error = %e, "Failed to persist workflow run");
                false
            }
        }
    }

    /// Persist an ended run, publish its status and retire its live slot.
    /// The slot stays live when the store could not take the final state.
    async fn conclude(&self, slot: &RunSlot, instance: &WorkflowInstance) {
        let persisted = self.persist(instance).await;
        self.inner.metrics.lock().await.record_finished(instance);
        if persisted {
            self.inner.runs.remove(&instance.run_id);
        }
        slot.status_tx.send_replace(instance.status);
    }

    // ==================== Run driver ====================

    async fn drive(self, slot: Arc<RunSlot>) {
        let template = slot.template.clone();
        let mut cancel_rx = slot.cancel_tx.subscribe();

        for (index, step) in template.steps.iter().enumerate() {
            let input = {
                let mut instance = slot.instance.write().await;
                if instance.status.is_terminal() {
                    return;
                }
                instance.current_step = index;
                resolve_input(&instance, step)
            };

            let run_id = slot.instance.read().await.run_id;
            debug!(run_id = %run_id, step = %step.id, index, "Executing step");

            let execution = async {
                if step.is_consensus {
                    self.run_consensus_step(&slot, run_id, step, input).await
                } else {
                    self.run_dispatch_step(&slot, run_id, step, input).await
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx) => {
                    debug!(run_id = %run_id, step = %step.id, "Run driver stopped by cancellation");
                    return;
                }
                outcome = execution => outcome,
            };

            if !self.apply_step(&slot, step, outcome).await {
                return;
            }
        }

        let mut instance = slot.instance.write().await;
        if instance.status.is_terminal() {
            return;
        }
        instance.finish();
        info!(
            run_id = %instance.run_id,
            status = %instance.status,
            gaps = ?instance.coverage_gaps,
            "Workflow finished"
        );
        self.conclude(&slot, &instance).await;
    }

    /// Apply a step outcome; false when the run is over
    async fn apply_step(&self, slot: &RunSlot, step: &StepSpec, outcome: StepOutcome) -> bool {
        let mut instance = slot.instance.write().await;
        if instance.status.is_terminal() {
            return false;
        }

        for (agent_id, error) in outcome.audit {
            instance.audit(&step.id, agent_id.as_deref(), error);
        }

        let result = outcome.result;
        let usable = result.usable_count();
        let full_success = result.is_full_success();
        let all_silent = !result.agents.is_empty() && result.agents.values().all(|r| r.outcome.is_silence());

        let failure = match &result.consensus {
            Some(consensus) if step.all_required && consensus.verdict == Verdict::Rejected => {
                Some(FailureReason::ConsensusRejected {
                    step: step.id.clone(),
                })
            }
            Some(_) => None,
            None if step.all_required && usable == 0 => Some(if all_silent {
                FailureReason::StepTimeout {
                    step: step.id.clone(),
                }
            } else {
                FailureReason::NoUsableResult {
                    step: step.id.clone(),
                }
            }),
            None => None,
        };
        instance.step_results.insert(step.id.clone(), result);

        match failure {
            Some(reason) => {
                warn!(run_id = %instance.run_id, step = %step.id, reason = ?reason, "Workflow failed");
                instance.fail(reason);
            }
            None if full_success => {
                if instance.coverage_gaps.remove(&step.capability) {
                    info!(run_id = %instance.run_id, step = %step.id, capability = %step.capability, "Coverage recovered");
                }
            }
            None => {
                debug!(run_id = %instance.run_id, step = %step.id, usable, "Step incomplete; coverage gap opened");
                instance.coverage_gaps.insert(step.capability);
            }
        }

        if instance.status.is_terminal() {
            self.conclude(slot, &instance).await;
            return false;
        }
        self.persist(&instance).await;
        true
    }

    async fn run_dispatch_step(
        &self,
        slot: &RunSlot,
        run_id: Uuid,
        step: &StepSpec,
        input: Value,
    ) -> StepOutcome {
        let config = &self.inner.config;
        let started_at = Utc::now();
        let mut audit = Vec::new();

        let max_agents = match step.mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::ParallelGroup => step.max_agents.unwrap_or(config.max_parallel_agents),
        };
        let selected = self.inner.hub.select_by_capability(step.capability, max_agents);
        if selected.is_empty() {
            audit.push((None, format!("no healthy agent offers {}", step.capability)));
        }

        let deadline = Instant::now() + step.timeout().unwrap_or_else(|| config.step_timeout());
        let agent_timeout = config.agent_timeout();
        let payload = json!({
            "run_id": run_id,
            "step_id": step.id,
            "capability": step.capability,
            "input": input,
        });

        let mut dispatched: BTreeMap<String, Uuid> = BTreeMap::new();
        let mut pending = FuturesUnordered::new();
        for descriptor in &selected {
            let request = Message::request(&config.coordinator_id, &descriptor.agent_id, payload.clone())
                .with_priority(MessagePriority::High);
            let request_id = request.id;
            let agent_id = descriptor.agent_id.clone();
            slot.outstanding.insert((request_id, agent_id.clone()));
            dispatched.insert(agent_id.clone(), request_id);

            let hub = self.inner.hub.clone();
            pending.push(async move {
                let started = Instant::now();
                let reply = hub.request(request, agent_timeout).await;
                (agent_id, request_id, started.elapsed(), reply)
            });
        }

        let mut agents = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((agent_id, request_id, elapsed, reply))) => {
                    slot.outstanding.remove(&(request_id, agent_id.clone()));
                    let result = classify(reply, elapsed);
                    if result.outcome != AgentOutcome::Succeeded {
                        audit.push((
                            Some(agent_id.clone()),
                            result.error.clone().unwrap_or_else(|| format!("{:?}", result.outcome)),
                        ));
                    }
                    agents.insert(agent_id, result);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(run_id = %run_id, step = %step.id, "Step deadline reached");
                    break;
                }
            }
        }
        drop(pending);

        let step_elapsed = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        for (agent_id, request_id) in dispatched {
            if agents.contains_key(&agent_id) {
                continue;
            }
            self.inner.hub.cancel_request(request_id);
            slot.outstanding.remove(&(request_id, agent_id.clone()));
            let error = "no response before the step deadline".to_string();
            audit.push((Some(agent_id.clone()), error.clone()));
            agents.insert(
                agent_id,
                AgentResult {
                    outcome: AgentOutcome::NoResponse,
                    output: None,
                    error: Some(error),
                    elapsed_ms: step_elapsed,
                },
            );
        }

        let output: Map<String, Value> = agents
            .iter()
            .filter(|(_, r)| r.outcome.is_usable())
            .map(|(id, r)| (id.clone(), r.output.clone().unwrap_or(Value::Null)))
            .collect();

        StepOutcome {
            result: StepResult {
                step_id: step.id.clone(),
                capability: step.capability,
                mode: step.mode,
                input,
                agents,
                output: Value::Object(output),
                consensus: None,
                started_at,
                finished_at: Utc::now(),
            },
            audit,
        }
    }

    async fn run_consensus_step(
        &self,
        slot: &RunSlot,
        run_id: Uuid,
        step: &StepSpec,
        input: Value,
    ) -> StepOutcome {
        let config = &self.inner.config;
        let consensus = &self.inner.consensus;
        let started_at = Utc::now();
        let mut audit = Vec::new();
        let mut agents = BTreeMap::new();

        let deadline = step.timeout().unwrap_or_else(|| config.step_timeout());
        let mut request = consensus
            .request(
                &config.coordinator_id,
                step.capability,
                json!({"run_id": run_id, "step_id": step.id, "input": input}),
            )
            .with_deadline(deadline);
        if let Some(method) = step.consensus_method {
            request.method = method;
        }

        let mut outcome = None;
        match consensus.open(request) {
            Err(e) => audit.push((None, e.to_string())),
            Ok(proposal_id) => {
                let voters = consensus
                    .proposal(proposal_id)
                    .map(|p| p.eligible)
                    .unwrap_or_default();
                for voter in &voters {
                    slot.outstanding.insert((proposal_id, voter.clone()));
                }

                let collected = consensus.collect(proposal_id).await;
                for voter in &voters {
                    slot.outstanding.remove(&(proposal_id, voter.clone()));
                }

                match collected {
                    Err(e) => audit.push((None, e.to_string())),
                    Ok(resolution) => {
                        let elapsed_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                        for vote in &resolution.summary.votes {
                            agents.insert(
                                vote.voter.clone(),
                                AgentResult {
                                    outcome: AgentOutcome::Succeeded,
                                    output: Some(json!({
                                        "decision": vote.decision,
                                        "weight": vote.weight,
                                        "rationale": vote.rationale,
                                    })),
                                    error: None,
                                    elapsed_ms,
                                },
                            );
                        }
                        // Silent voters only matter if the proposal was still waiting on them
                        if resolution.status == ProposalStatus::TimedOut {
                            let silent: Vec<String> = voters
                                .iter()
                                .filter(|v| !agents.contains_key(*v))
                                .cloned()
                                .collect();
                            for voter in silent {
                                audit.push((Some(voter.clone()), "no ballot before the proposal deadline".into()));
                                agents.insert(
                                    voter,
                                    AgentResult {
                                        outcome: AgentOutcome::NoResponse,
                                        output: None,
                                        error: Some("no ballot".into()),
                                        elapsed_ms,
                                    },
                                );
                            }
                        }

                        let verdict = config.consensus_timeout_policy.apply(&resolution);
                        if verdict != Verdict::Approved {
                            audit.push((
                                None,
                                format!("proposal {} {}; verdict {:?}", proposal_id, resolution.status, verdict),
                            ));
                        }
                        info!(
                            run_id = %run_id,
                            step = %step.id,
                            proposal_id = %proposal_id,
                            status = %resolution.status,
                            verdict = ?verdict,
                            "Consensus checkpoint resolved"
                        );
                        outcome = Some(ConsensusOutcome {
                            proposal_id,
                            resolution,
                            verdict,
                        });
                    }
                }
            }
        }

        let output = match &outcome {
            Some(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            None => Value::Null,
        };

        StepOutcome {
            result: StepResult {
                step_id: step.id.clone(),
                capability: step.capability,
                mode: step.mode,
                input,
                agents,
                output,
                consensus: outcome,
                started_at,
                finished_at: Utc::now(),
            },
            audit,
        }
    }
}

/// Resolves once the run's cancel flag is raised
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Build a step's input from the initial payload and earlier step outputs
fn resolve_input(instance: &WorkflowInstance, step: &StepSpec) -> Value {
    if step.inputs.is_empty() {
        return instance.payload.clone();
    }

    let mut input = Map::new();
    for (key, mapping) in &step.inputs {
        let source = match mapping.step.as_deref() {
            None => Some(&instance.payload),
            Some(step_id) => instance.step_results.get(step_id).map(|r| &r.output),
        };
        let value = source.map(|s| mapping.select(s)).unwrap_or(Value::Null);
        input.insert(key.clone(), value);
    }
    Value::Object(input)
}

fn classify(reply: Result<Message>, elapsed: Duration) -> AgentResult {
    let elapsed_ms = elapsed.as_millis() as u64;
    match reply {
        Ok(response) => {
            let body = ResponseBody::from_payload(&response.payload);
            let outcome = match body.status {
                ReplyStatus::Ok => AgentOutcome::Succeeded,
                ReplyStatus::Degraded => AgentOutcome::Degraded,
                ReplyStatus::Error => AgentOutcome::Failed,
            };
            AgentResult {
                output: (outcome != AgentOutcome::Failed).then_some(body.body),
                error: body.error,
                outcome,
                elapsed_ms,
            }
        }
        Err(e) => {
            let outcome = match &e {
                MeshError::ResponseTimeout { .. } => AgentOutcome::TimedOut,
                MeshError::UnknownAgent(_) | MeshError::AgentOffline(_) | MeshError::AgentUnavailable(_) => {
                    AgentOutcome::Unreachable
                }
                _ => AgentOutcome::Failed,
            };
            AgentResult {
                outcome,
                output: None,
                error: Some(e.to_string()),
                elapsed_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentHandle, AgentRuntime, AgentRuntimeConfig, ReferenceAgent};
    use crate::consensus::ConsensusConfig;
    use crate::domain::Capability;
    use crate::hub::HubConfig;

    fn mesh(config: CoordinatorConfig) -> Orchestrator {
        let hub = CommunicationHub::new(HubConfig::default());
        let consensus = ConsensusEngine::new(hub.clone(), ConsensusConfig::default());
        Orchestrator::with_memory_store(hub, consensus, config)
    }

    fn spawn(orchestrator: &Orchestrator, agent: ReferenceAgent) -> AgentHandle {
        AgentRuntime::spawn(agent, orchestrator.hub().clone(), AgentRuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_resolve_input_defaults_to_payload() {
        let instance = WorkflowInstance::new("t", 1, json!({"amount": 5}));
        let step = StepSpec::new("a", Capability::Reporting);
        assert_eq!(resolve_input(&instance, &step), json!({"amount": 5}));
    }

    #[test]
    fn test_classify_maps_errors_to_outcomes() {
        let timeout = classify(
            Err(MeshError::ResponseTimeout {
                agent_id: "a".into(),
                timeout_ms: 10,
            }),
            Duration::from_millis(10),
        );
        assert_eq!(timeout.outcome, AgentOutcome::TimedOut);

        let gone = classify(Err(MeshError::AgentUnavailable("a".into())), Duration::ZERO);
        assert_eq!(gone.outcome, AgentOutcome::Unreachable);
    }

    #[tokio::test]
    async fn test_unknown_template_rejected() {
        let orchestrator = mesh(CoordinatorConfig::default());
        let err = orchestrator
            .submit_workflow("no-such-flow", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::UnknownTemplate(_)));
    }

    #[tokio::test]
    async fn test_single_step_run_completes() {
        let orchestrator = mesh(CoordinatorConfig::default());
        orchestrator
            .register_template(WorkflowTemplate::new(
                "report",
                "",
                vec![StepSpec::new("report", Capability::Reporting).required()],
            ))
            .unwrap();
        let agent = spawn(&orchestrator, ReferenceAgent::new("reporter", [Capability::Reporting]));

        let run_id = orchestrator.submit_workflow("report", json!({"amount": 1})).await.unwrap();
        let run = orchestrator.wait_for_completion(run_id).await.unwrap();

        assert_eq!(run.status, WorkflowStatus::Completed);
        let step = &run.step_results["report"];
        assert_eq!(step.agents["reporter"].outcome, AgentOutcome::Succeeded);
        assert!(step.output.get("reporter").is_some());
        assert!(run.audit.is_empty());
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_required_step_without_agents_fails() {
        let orchestrator = mesh(CoordinatorConfig::default());
        orchestrator
            .register_template(WorkflowTemplate::new(
                "lonely",
                "",
                vec![StepSpec::new("check", Capability::ComplianceCheck).required()],
            ))
            .unwrap();

        let run_id = orchestrator.submit_workflow("lonely", json!({})).await.unwrap();
        let run = orchestrator.wait_for_completion(run_id).await.unwrap();

        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(
            run.failure,
            Some(FailureReason::NoUsableResult {
                step: "check".into()
            })
        );
        assert_eq!(run.audit.len(), 1);
        assert!(run.audit[0].agent_id.is_none());
    }

    #[tokio::test]
    async fn test_wait_after_run_ended_returns_final_state() {
        let orchestrator = mesh(CoordinatorConfig::default());
        orchestrator
            .register_template(WorkflowTemplate::new(
                "lonely",
                "",
                vec![StepSpec::new("check", Capability::ComplianceCheck).required()],
            ))
            .unwrap();

        let run_id = orchestrator.submit_workflow("lonely", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let run = tokio::time::timeout(Duration::from_secs(2), orchestrator.wait_for_completion(run_id))
            .await
            .expect("wait_for_completion hung on an ended run")
            .unwrap();
        assert_eq!(run.status, WorkflowStatus::Failed);

        // Ended runs leave the live table and are served from the store
        let stats = orchestrator.stats().await;
        assert_eq!(stats.active_runs, 0);
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.templates["lonely"], 1);
        assert_eq!(orchestrator.get_workflow_status(run_id).await.unwrap().status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_ended_runs_do_not_accumulate() {
        let orchestrator = mesh(CoordinatorConfig::default());
        orchestrator
            .register_template(WorkflowTemplate::new(
                "report",
                "",
                vec![StepSpec::new("report", Capability::Reporting)],
            ))
            .unwrap();
        let agent = spawn(&orchestrator, ReferenceAgent::new("reporter", [Capability::Reporting]));

        for _ in 0..10 {
            let run_id = orchestrator.submit_workflow("report", json!({})).await.unwrap();
            orchestrator.wait_for_completion(run_id).await.unwrap();
        }

        let stats = orchestrator.stats().await;
        assert_eq!(stats.active_runs, 0);
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(orchestrator.list_workflows().await.unwrap().len(), 10);
        agent.stop().await;
    }
}
