//! Agent runtime: mailbox loop, heartbeats and decision logging
//!
//! `AgentRuntime::spawn` registers an agent with the hub and drives it as a
//! set of tokio tasks until `AgentHandle::stop` is called.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consensus::{Ballot, Proposal};
use crate::domain::{AgentDescriptor, Message, MessageKind, ResponseBody};
use crate::error::{MeshError, Result};
use crate::hub::{CommunicationHub, Delivery};

use super::config::AgentRuntimeConfig;
use super::decision_log::{AgentStats, DecisionLog, DecisionRecord};
use super::traits::Agent;

/// Notification event asking an agent to abandon an in-flight request
pub const CANCEL_EVENT: &str = "cancel";

/// Build the best-effort cancellation notice for one outstanding request
pub fn cancel_notice(sender: &str, agent_id: &str, request_id: Uuid, run_id: Uuid) -> Message {
    Message::notification(
        sender,
        Some(agent_id),
        serde_json::json!({
            "event": CANCEL_EVENT,
            "request_id": request_id,
            "run_id": run_id,
        }),
    )
}

fn cancelled_request(message: &Message) -> Option<Uuid> {
    if message.kind != MessageKind::Notification {
        return None;
    }
    if message.payload.get("event").and_then(Value::as_str) != Some(CANCEL_EVENT) {
        return None;
    }
    message
        .payload
        .get("request_id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
}

type InFlight = Arc<DashMap<Uuid, AbortHandle>>;

struct RuntimeShared<A: Agent> {
    agent: A,
    hub: CommunicationHub,
    config: AgentRuntimeConfig,
    log: Arc<Mutex<DecisionLog>>,
    in_flight: InFlight,
}

pub struct AgentRuntime;

impl AgentRuntime {
    /// Register `agent` with `hub` and start its mailbox and heartbeat tasks
    pub fn spawn<A: Agent>(
        agent: A,
        hub: CommunicationHub,
        config: AgentRuntimeConfig,
    ) -> Result<AgentHandle> {
        let agent_id = agent.id().to_string();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(hub.config().mailbox_capacity.max(1));

        let mut descriptor = AgentDescriptor::new(agent_id.clone(), agent.capabilities());
        descriptor.health = agent.health();
        let descriptor = hub.register(descriptor, mailbox_tx)?;

        let log = Arc::new(Mutex::new(DecisionLog::new(config.decision_log_capacity)));
        let in_flight: InFlight = Arc::new(DashMap::new());
        let shared = Arc::new(RuntimeShared {
            log: log.clone(),
            in_flight: in_flight.clone(),
            agent,
            hub: hub.clone(),
            config,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mailbox_task = tokio::spawn(run_mailbox(shared.clone(), mailbox_rx, shutdown_rx.clone()));
        let heartbeat_task = tokio::spawn(run_heartbeat(shared.clone(), shutdown_rx));

        info!(
            agent_id = %agent_id,
            capabilities = ?descriptor.capabilities,
            "Agent runtime started"
        );

        Ok(AgentHandle {
            agent_id,
            hub,
            shutdown_tx,
            tasks: vec![mailbox_task, heartbeat_task],
            log,
            in_flight,
        })
    }
}

/// Owner handle of a running agent.
///
/// Dropping the handle without `stop` ends the agent's tasks but leaves its
/// registration behind; the hub then reports it `AgentUnavailable`.
pub struct AgentHandle {
    agent_id: String,
    hub: CommunicationHub,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    log: Arc<Mutex<DecisionLog>>,
    in_flight: InFlight,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn decisions(&self) -> Vec<DecisionRecord> {
        self.log.lock().await.records()
    }

    pub async fn stats(&self) -> AgentStats {
        self.log.lock().await.stats()
    }

    /// Requests currently being handled
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Deregister the agent and stop its tasks
    pub async fn stop(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.hub.deregister(&self.agent_id) {
            debug!(agent_id = %self.agent_id, error = %e, "Agent already deregistered");
        }
        for entry in self.in_flight.iter() {
            entry.value().abort();
        }
        self.in_flight.clear();
        for task in self.tasks {
            let _ = task.await;
        }
        info!(agent_id = %self.agent_id, "Agent runtime stopped");
    }
}

async fn run_mailbox<A: Agent>(
    shared: Arc<RuntimeShared<A>>,
    mut mailbox: mpsc::Receiver<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            delivery = mailbox.recv() => {
                let Some(delivery) = delivery else { break };
                dispatch(&shared, delivery).await;
            }
        }
    }
    debug!(agent_id = %shared.agent.id(), "Mailbox loop exited");
}

async fn dispatch<A: Agent>(shared: &Arc<RuntimeShared<A>>, delivery: Delivery) {
    match delivery {
        Delivery::Message(message) if message.kind == MessageKind::Request => {
            let request_id = message.id;
            let task_shared = shared.clone();
            // The task only starts once its abort handle is tracked, so its own
            // removal can never run ahead of the insert
            let (tracked_tx, tracked_rx) = oneshot::channel::<()>();
            let task = tokio::spawn(async move {
                if tracked_rx.await.is_err() {
                    return;
                }
                answer_request(&task_shared, message).await;
                task_shared.in_flight.remove(&request_id);
            });
            shared.in_flight.insert(request_id, task.abort_handle());
            let _ = tracked_tx.send(());
        }
        Delivery::Message(message) => {
            if let Some(request_id) = cancelled_request(&message) {
                if let Some((_, handle)) = shared.in_flight.remove(&request_id) {
                    handle.abort();
                    info!(
                        agent_id = %shared.agent.id(),
                        request_id = %request_id,
                        "Abandoned cancelled request"
                    );
                }
            }
            shared.agent.on_message(&message).await;
        }
        Delivery::Ballot {
            request: _,
            proposal,
            reply,
        } => {
            let task_shared = shared.clone();
            tokio::spawn(async move {
                let ballot = cast_ballot(&task_shared, &proposal).await;
                if reply.send(ballot).is_err() {
                    debug!(
                        agent_id = %task_shared.agent.id(),
                        proposal_id = %proposal.id,
                        "Ballot arrived after collection ended"
                    );
                }
            });
        }
    }
}

async fn answer_request<A: Agent>(shared: &RuntimeShared<A>, request: Message) {
    let agent_id = shared.agent.id();
    let started = Instant::now();
    let timeout = shared.config.handler_timeout();

    let body = match tokio::time::timeout(timeout, shared.agent.handle(&request)).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            warn!(agent_id = %agent_id, request_id = %request.id, error = %e, "Handler failed");
            ResponseBody::error(e.to_string())
        }
        Err(_) => {
            warn!(
                agent_id = %agent_id,
                request_id = %request.id,
                timeout_ms = timeout.as_millis() as u64,
                "Handler overran its deadline; replying degraded"
            );
            ResponseBody::degraded(
                Value::Null,
                format!("handler timed out after {}ms", timeout.as_millis()),
            )
        }
    };

    shared.log.lock().await.record_response(
        request.id,
        body.status,
        started.elapsed(),
        body.error.clone(),
    );

    let response = request.reply(agent_id, body.into_payload());
    if let Err(e) = shared.hub.respond(response).await {
        debug!(agent_id = %agent_id, request_id = %request.id, error = %e, "Response not delivered");
    }
}

async fn cast_ballot<A: Agent>(shared: &RuntimeShared<A>, proposal: &Proposal) -> Ballot {
    let started = Instant::now();
    let timeout = shared.config.handler_timeout();

    let ballot = match tokio::time::timeout(timeout, shared.agent.cast_vote(proposal)).await {
        Ok(ballot) => ballot,
        Err(_) => {
            warn!(agent_id = %shared.agent.id(), proposal_id = %proposal.id, "Vote overran its deadline; abstaining");
            Ballot::abstain().because("vote timed out")
        }
    };

    shared.log.lock().await.record_vote(
        proposal.id,
        ballot.decision,
        started.elapsed(),
        ballot.rationale.clone(),
    );
    ballot
}

async fn run_heartbeat<A: Agent>(shared: Arc<RuntimeShared<A>>, mut shutdown: watch::Receiver<bool>) {
    let agent_id = shared.agent.id().to_string();
    let mut interval = tokio::time::interval(shared.config.heartbeat_interval());

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                match shared.hub.heartbeat(&agent_id, shared.agent.health()) {
                    Ok(()) => {}
                    Err(MeshError::UnknownAgent(_)) => {
                        debug!(agent_id = %agent_id, "Agent no longer registered; stopping heartbeats");
                        break;
                    }
                    Err(e) => warn!(agent_id = %agent_id, error = %e, "Heartbeat failed"),
                }
            }
        }
    }
}
