use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

use crate::agents::{AgentHandle, AgentRuntime, ReferenceAgent, VotePolicy};
use crate::config::AppConfig;
use crate::consensus::ConsensusEngine;
use crate::coordinator::{Orchestrator, WorkflowInstance, WorkflowTemplate};
use crate::domain::Capability;
use crate::error::{MeshError, Result};
use crate::hub::CommunicationHub;
use crate::persistence::build_store;
use crate::supervisor::HeartbeatMonitor;

/// Reference agents spun up per capability by `run`
const AGENTS_PER_CAPABILITY: usize = 3;

#[derive(Parser)]
#[command(name = "treasury-mesh")]
#[command(version = "0.1.0")]
#[command(about = "Multi-agent treasury coordination mesh", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory
    #[arg(short, long, default_value = "config", env = "MESH_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List built-in workflow templates and their steps
    Templates,
    /// Run one workflow against in-process reference agents
    Run {
        /// Template name (e.g. daily-cash-management)
        #[arg(short, long)]
        template: String,
        /// Initial payload as JSON
        #[arg(short, long, default_value = "{}")]
        payload: String,
        /// Agent ids that never answer (e.g. risk-assessment-1)
        #[arg(long = "silent-agent")]
        silent_agents: Vec<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// Human-readable template listing
pub fn render_templates(templates: &[WorkflowTemplate]) -> String {
    let mut out = String::new();
    for template in templates {
        out.push_str(&format!("{}  {}\n", template.name, template.description));
        for (index, step) in template.steps.iter().enumerate() {
            let mut flags = Vec::new();
            if step.all_required {
                flags.push("required".to_string());
            }
            if step.is_consensus {
                let method = step
                    .consensus_method
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "default".to_string());
                flags.push(format!("consensus:{}", method));
            }
            out.push_str(&format!(
                "  {}. {:<26} {:<24} {:<15} {}\n",
                index + 1,
                step.id,
                step.capability,
                step.mode,
                flags.join(" ")
            ));
        }
        out.push('\n');
    }
    out
}

/// Id of the n-th reference agent serving `capability`
pub fn reference_agent_id(capability: Capability, index: usize) -> String {
    format!("{}-{}", capability, index + 1)
}

/// Run one workflow to completion (or until interrupted) with reference
/// agents for every capability in the vocabulary.
pub async fn run_workflow(
    config: &AppConfig,
    template_name: &str,
    payload: &str,
    silent_agents: &[String],
) -> Result<WorkflowInstance> {
    let payload: Value = serde_json::from_str(payload)?;

    let hub = CommunicationHub::new(config.hub.clone());
    let consensus = ConsensusEngine::new(hub.clone(), config.consensus.clone());
    let store = build_store(&config.store).await?;
    let orchestrator = Orchestrator::new(hub.clone(), consensus, config.coordinator.clone(), store);

    let template = orchestrator
        .template(template_name)
        .ok_or_else(|| MeshError::UnknownTemplate(template_name.to_string()))?;

    let capabilities: BTreeSet<Capability> = Capability::ALL.into_iter().collect();
    let known: BTreeSet<String> = capabilities
        .iter()
        .flat_map(|cap| (0..AGENTS_PER_CAPABILITY).map(move |i| reference_agent_id(*cap, i)))
        .collect();
    if let Some(unknown) = silent_agents.iter().find(|id| !known.contains(*id)) {
        return Err(MeshError::Validation(format!(
            "--silent-agent {} is not one of: {}",
            unknown,
            known.iter().cloned().collect::<Vec<_>>().join(", ")
        )));
    }

    let monitor = HeartbeatMonitor::new(hub.clone());
    let monitor_task = monitor.start();

    // Silent agents must outlive the step deadline instead of degrading
    let silent_runtime = config
        .agents
        .clone()
        .with_handler_timeout(config.coordinator.step_timeout() * 2);

    let mut handles: Vec<AgentHandle> = Vec::new();
    for capability in &capabilities {
        for index in 0..AGENTS_PER_CAPABILITY {
            let id = reference_agent_id(*capability, index);
            let mut agent = ReferenceAgent::new(id.clone(), [*capability]);
            if index == AGENTS_PER_CAPABILITY - 1 {
                agent = agent.with_vote_policy(VotePolicy::ApproveUpTo(dec!(1_000_000)));
            }

            let runtime = if silent_agents.contains(&id) {
                warn!(agent_id = %id, "Agent configured silent");
                agent = agent.silent();
                silent_runtime.clone()
            } else {
                config.agents.clone()
            };
            handles.push(AgentRuntime::spawn(agent, hub.clone(), runtime)?);
        }
    }
    info!(agents = handles.len(), template = %template.name, "Reference agents running");

    let run_id = orchestrator.submit_workflow(&template.name, payload).await?;
    let outcome = tokio::select! {
        result = orchestrator.wait_for_completion(run_id) => result,
        _ = shutdown_signal() => {
            warn!(run_id = %run_id, "Interrupted; cancelling workflow");
            orchestrator.cancel_workflow(run_id).await
        }
    };

    for handle in handles {
        handle.stop().await;
    }
    monitor.stop();
    monitor_task.abort();

    // Give cancellation notices a moment to drain before the runtime exits
    tokio::time::sleep(Duration::from_millis(10)).await;
    outcome
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{builtin_templates, WorkflowStatus};

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "treasury-mesh",
            "run",
            "--template",
            "crisis-response",
            "--silent-agent",
            "risk-assessment-1",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                template,
                payload,
                silent_agents,
            } => {
                assert_eq!(template, "crisis-response");
                assert_eq!(payload, "{}");
                assert_eq!(silent_agents, vec!["risk-assessment-1".to_string()]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_render_lists_every_step() {
        let rendered = render_templates(&builtin_templates());
        assert!(rendered.contains("investment-planning"));
        assert!(rendered.contains("consensus:supermajority"));
        assert!(rendered.contains("parallel-group"));
    }

    #[tokio::test]
    async fn test_run_workflow_with_reference_agents() {
        let mut config = AppConfig::default();
        config.coordinator.step_timeout_ms = 2_000;
        config.agents.heartbeat_interval_ms = 100;

        let run = run_workflow(&config, "investment-planning", r#"{"amount": 25000}"#, &[])
            .await
            .unwrap();
        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(run.step_results.len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_silent_agent_rejected() {
        let err = run_workflow(&AppConfig::default(), "crisis-response", "{}", &["ghost".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));
    }
}
