//! Communication Hub: agent registry and message router
//!
//! The hub owns the descriptor table, routes point-to-point and broadcast
//! messages into agent mailboxes, correlates responses with the requests
//! they answer, and keeps a bounded message history.
//!
//! Every table is keyed per entity (agent id, request slot), so concurrent
//! callers only serialize on the entry they touch.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consensus::{Ballot, Proposal};
use crate::domain::{
    AgentDescriptor, Capability, HealthStatus, Message, MessageKind, MessagePriority, ReplyStatus,
    ResponseBody,
};
use crate::error::{MeshError, Result};

use super::config::HubConfig;
use super::history::{HistoryFilter, MessageHistory, MessageLog};

/// What the hub drops into an agent's mailbox
#[derive(Debug)]
pub enum Delivery {
    /// Request, response, notification or status message
    Message(Message),
    /// Vote request; the agent answers through `reply`
    Ballot {
        request: Message,
        proposal: Proposal,
        reply: oneshot::Sender<Ballot>,
    },
}

/// Sending half of an agent mailbox
pub type Mailbox = mpsc::Sender<Delivery>;

#[derive(Debug)]
struct AgentEntry {
    descriptor: AgentDescriptor,
    mailbox: Mailbox,
}

#[derive(Debug)]
struct PendingReply {
    sent_at: Instant,
    tx: oneshot::Sender<Result<Message>>,
}

/// Reply slot key: (request id, responding agent)
type PendingKey = (Uuid, String);

#[derive(Debug, Default)]
struct HubCounters {
    routed: AtomicU64,
    broadcasts: AtomicU64,
    dropped: AtomicU64,
    responses: AtomicU64,
}

/// Snapshot of hub activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubStats {
    pub registered_agents: usize,
    pub healthy_agents: usize,
    pub messages_routed: u64,
    pub broadcasts: u64,
    pub responses_correlated: u64,
    pub dropped_deliveries: u64,
    pub pending_replies: usize,
    pub history_size: usize,
    pub history_evicted: u64,
    pub capabilities: BTreeMap<Capability, usize>,
}

struct HubInner {
    config: HubConfig,
    agents: DashMap<String, AgentEntry>,
    latencies: DashMap<String, Duration>,
    pending: DashMap<PendingKey, PendingReply>,
    history: RwLock<MessageLog>,
    counters: HubCounters,
}

/// Clonable handle to one coordination domain's hub
#[derive(Clone)]
pub struct CommunicationHub {
    inner: Arc<HubInner>,
}

impl CommunicationHub {
    pub fn new(config: HubConfig) -> Self {
        let history = MessageLog::new(config.history_capacity);
        Self {
            inner: Arc::new(HubInner {
                config,
                agents: DashMap::new(),
                latencies: DashMap::new(),
                pending: DashMap::new(),
                history: RwLock::new(history),
                counters: HubCounters::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    // ==================== Registry ====================

    /// Add or refresh an agent.
    ///
    /// Re-registering an id with the identical capability set refreshes the
    /// descriptor and replaces the mailbox; a different capability set is
    /// rejected with `DuplicateAgent`.
    pub fn register(&self, descriptor: AgentDescriptor, mailbox: Mailbox) -> Result<AgentDescriptor> {
        if descriptor.agent_id.trim().is_empty() {
            return Err(MeshError::Validation("agent id is empty".into()));
        }
        if descriptor.capabilities.is_empty() {
            return Err(MeshError::Validation(format!(
                "agent {} declares no capabilities",
                descriptor.agent_id
            )));
        }

        match self.inner.agents.entry(descriptor.agent_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.descriptor.capabilities != descriptor.capabilities {
                    return Err(MeshError::DuplicateAgent(descriptor.agent_id));
                }
                entry.descriptor.health = descriptor.health;
                entry.descriptor.last_heartbeat = Utc::now();
                entry.descriptor.missed_heartbeats = 0;
                entry.mailbox = mailbox;
                debug!(agent_id = %descriptor.agent_id, "Agent re-registered");
                Ok(entry.descriptor.clone())
            }
            Entry::Vacant(vacant) => {
                info!(
                    agent_id = %descriptor.agent_id,
                    capabilities = ?descriptor.capabilities,
                    "Registering agent"
                );
                let stored = descriptor.clone();
                vacant.insert(AgentEntry {
                    descriptor: stored,
                    mailbox,
                });
                Ok(descriptor)
            }
        }
    }

    /// Remove an agent; replies still owed by it resolve as `AgentUnavailable`.
    pub fn deregister(&self, agent_id: &str) -> Result<AgentDescriptor> {
        let (_, entry) = self
            .inner
            .agents
            .remove(agent_id)
            .ok_or_else(|| MeshError::UnknownAgent(agent_id.to_string()))?;
        self.inner.latencies.remove(agent_id);

        let owed: Vec<PendingKey> = self
            .inner
            .pending
            .iter()
            .filter(|slot| slot.key().1 == agent_id)
            .map(|slot| slot.key().clone())
            .collect();
        for key in owed {
            if let Some((_, pending)) = self.inner.pending.remove(&key) {
                let _ = pending
                    .tx
                    .send(Err(MeshError::AgentUnavailable(agent_id.to_string())));
            }
        }

        info!(agent_id = %agent_id, "Agent deregistered");
        Ok(entry.descriptor)
    }

    pub fn descriptor(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.inner
            .agents
            .get(agent_id)
            .map(|entry| entry.descriptor.clone())
    }

    /// All descriptors, ordered by agent id
    pub fn agents(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<_> = self
            .inner
            .agents
            .iter()
            .map(|entry| entry.descriptor.clone())
            .collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    /// Most recent successful response latency of an agent
    pub fn latency(&self, agent_id: &str) -> Option<Duration> {
        self.inner.latencies.get(agent_id).map(|l| *l)
    }

    /// Up to `max_count` healthy agents with `capability`, most responsive first.
    ///
    /// Agents with a measured latency come first (fastest first), agents not
    /// yet measured follow; remaining ties break on agent id.
    pub fn select_by_capability(&self, capability: Capability, max_count: usize) -> Vec<AgentDescriptor> {
        let mut candidates: Vec<(Option<Duration>, AgentDescriptor)> = self
            .inner
            .agents
            .iter()
            .filter(|entry| entry.descriptor.is_healthy() && entry.descriptor.has_capability(capability))
            .map(|entry| (self.latency(entry.key()), entry.descriptor.clone()))
            .collect();

        candidates.sort_by(|(la, a), (lb, b)| {
            let by_latency = match (la, lb) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            };
            by_latency.then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        candidates
            .into_iter()
            .take(max_count)
            .map(|(_, descriptor)| descriptor)
            .collect()
    }

    /// Agents allowed to vote on proposals for `capability` (anything not offline)
    pub fn eligible_voters(&self, capability: Capability) -> BTreeSet<String> {
        self.inner
            .agents
            .iter()
            .filter(|entry| !entry.descriptor.is_offline() && entry.descriptor.has_capability(capability))
            .map(|entry| entry.key().clone())
            .collect()
    }

    // ==================== Health ====================

    /// Record a heartbeat; resets the missed-heartbeat counter
    pub fn heartbeat(&self, agent_id: &str, status: HealthStatus) -> Result<()> {
        let mut entry = self
            .inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| MeshError::UnknownAgent(agent_id.to_string()))?;

        if entry.descriptor.health != status {
            info!(
                agent_id = %agent_id,
                from = %entry.descriptor.health,
                to = %status,
                "Agent health changed"
            );
        }
        entry.descriptor.health = status;
        entry.descriptor.last_heartbeat = Utc::now();
        entry.descriptor.missed_heartbeats = 0;
        Ok(())
    }

    /// Count missed heartbeat intervals as of `now` and take agents offline
    /// once they reach the configured limit. Returns the newly offline ids.
    pub fn sweep_heartbeats(&self, now: DateTime<Utc>) -> Vec<String> {
        let interval_ms = self.inner.config.heartbeat_interval_ms.max(1) as i64;
        let limit = self.inner.config.max_missed_heartbeats.max(1);
        let mut newly_offline = Vec::new();

        for mut entry in self.inner.agents.iter_mut() {
            let elapsed_ms = now
                .signed_duration_since(entry.descriptor.last_heartbeat)
                .num_milliseconds()
                .max(0);
            let missed = (elapsed_ms / interval_ms).min(u32::MAX as i64) as u32;
            entry.descriptor.missed_heartbeats = missed;

            if missed >= limit && !entry.descriptor.is_offline() {
                entry.descriptor.health = HealthStatus::Offline;
                warn!(
                    agent_id = %entry.key(),
                    missed,
                    last_heartbeat = %entry.descriptor.last_heartbeat,
                    "Agent missed heartbeats; marking offline"
                );
                newly_offline.push(entry.key().clone());
            }
        }

        newly_offline.sort();
        newly_offline
    }

    // ==================== Routing ====================

    /// Deliver a message.
    ///
    /// Targeted messages go to exactly that agent (`UnknownAgent` /
    /// `AgentOffline` otherwise). Broadcasts go to every other agent whose
    /// capabilities intersect the message filter; offline agents and full
    /// mailboxes are skipped. Returns the agent ids actually reached.
    pub async fn route(&self, message: Message) -> Result<Vec<String>> {
        if message.kind == MessageKind::Response && message.correlation_id.is_none() {
            return Err(MeshError::Validation(format!(
                "response {} carries no correlation id",
                message.id
            )));
        }

        let recipients = match message.target.clone() {
            Some(target) => {
                if self.complete_pending(&message) {
                    vec![target]
                } else if message.kind == MessageKind::Response
                    && !self.inner.agents.contains_key(&target)
                {
                    // Late answer to a caller that already gave up
                    debug!(
                        message_id = %message.id,
                        responder = %message.sender,
                        "Dropping uncorrelated response"
                    );
                    Vec::new()
                } else {
                    self.deliver_to(&target, &message).await?;
                    vec![target]
                }
            }
            None => {
                self.inner.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
                self.deliver_broadcast(&message)
            }
        };

        debug!(
            message_id = %message.id,
            kind = %message.kind,
            sender = %message.sender,
            recipients = recipients.len(),
            "Routed message"
        );
        self.record(message).await;
        Ok(recipients)
    }

    /// Route a response; it must answer a prior request
    pub async fn respond(&self, response: Message) -> Result<()> {
        if response.kind != MessageKind::Response {
            return Err(MeshError::Validation(format!(
                "message {} is a {}, not a response",
                response.id, response.kind
            )));
        }
        self.route(response).await.map(|_| ())
    }

    /// Send a targeted request and wait for the correlated response
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Message> {
        let target = match (&message.target, message.kind) {
            (Some(target), MessageKind::Request) => target.clone(),
            _ => {
                return Err(MeshError::Validation(format!(
                    "message {} is not a targeted request",
                    message.id
                )))
            }
        };

        let key = (message.id, target.clone());
        let rx = self.open_slot(key.clone());

        let exchange = async {
            self.route(message).await?;
            rx.await
                .unwrap_or_else(|_| Err(MeshError::AgentUnavailable(target.clone())))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => {
                if result.is_err() {
                    self.inner.pending.remove(&key);
                }
                result
            }
            Err(_) => {
                self.inner.pending.remove(&key);
                Err(MeshError::ResponseTimeout {
                    agent_id: target,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Broadcast a request and wait until every recipient answered or
    /// `timeout` elapsed. Outcomes are keyed by agent id.
    pub async fn gather(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<BTreeMap<String, Result<Message>>> {
        if message.kind != MessageKind::Request || !message.is_broadcast() {
            return Err(MeshError::Validation(format!(
                "message {} is not a broadcast request",
                message.id
            )));
        }

        let request_id = message.id;
        let candidates = self.broadcast_candidates(&message);
        let slots: Vec<_> = candidates
            .into_iter()
            .map(|(agent_id, _)| {
                let rx = self.open_slot((request_id, agent_id.clone()));
                (agent_id, rx)
            })
            .collect();

        let reached: HashSet<String> = match self.route(message).await {
            Ok(reached) => reached.into_iter().collect(),
            Err(e) => {
                self.cancel_request(request_id);
                return Err(e);
            }
        };

        let deadline = Instant::now() + timeout;
        let waits = slots.into_iter().map(|(agent_id, rx)| {
            let was_reached = reached.contains(&agent_id);
            async move {
                if !was_reached {
                    self.inner.pending.remove(&(request_id, agent_id.clone()));
                    let err = MeshError::AgentUnavailable(agent_id.clone());
                    return (agent_id, Err(err));
                }
                let outcome = match tokio::time::timeout_at(deadline, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(MeshError::AgentUnavailable(agent_id.clone())),
                    Err(_) => {
                        self.inner.pending.remove(&(request_id, agent_id.clone()));
                        Err(MeshError::ResponseTimeout {
                            agent_id: agent_id.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                };
                (agent_id, outcome)
            }
        });

        Ok(join_all(waits).await.into_iter().collect())
    }

    /// Ask one agent to vote on a proposal
    pub async fn request_ballot(
        &self,
        agent_id: &str,
        proposal: &Proposal,
        timeout: Duration,
    ) -> Result<Ballot> {
        let mailbox = self.mailbox_for(agent_id)?;
        let request = Message::request(
            &proposal.initiator,
            agent_id,
            json!({
                "proposal_id": proposal.id,
                "method": proposal.method,
                "capability": proposal.capability,
                "subject": proposal.subject,
            }),
        )
        .with_priority(MessagePriority::High);

        let (tx, rx) = oneshot::channel();
        let started = Instant::now();
        let delivery = Delivery::Ballot {
            request: request.clone(),
            proposal: proposal.clone(),
            reply: tx,
        };

        let exchange = async {
            mailbox
                .send(delivery)
                .await
                .map_err(|_| MeshError::AgentUnavailable(agent_id.to_string()))?;
            self.record(request.clone()).await;
            rx.await
                .map_err(|_| MeshError::AgentUnavailable(agent_id.to_string()))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(ballot)) => {
                self.inner
                    .latencies
                    .insert(agent_id.to_string(), started.elapsed());
                self.inner.counters.responses.fetch_add(1, Ordering::Relaxed);
                let payload = serde_json::to_value(&ballot)?;
                self.record(request.reply(agent_id, payload)).await;
                Ok(ballot)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MeshError::ResponseTimeout {
                agent_id: agent_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Drop every outstanding reply slot of a request
    pub fn cancel_request(&self, request_id: Uuid) {
        self.inner.pending.retain(|key, _| key.0 != request_id);
    }

    // ==================== History & stats ====================

    /// Messages matching `filter`, oldest first
    pub async fn history(&self, filter: HistoryFilter) -> MessageHistory {
        let snapshot = self.inner.history.read().await.snapshot();
        MessageHistory::new(snapshot, filter)
    }

    pub async fn stats(&self) -> HubStats {
        let mut capabilities = BTreeMap::new();
        let mut healthy = 0;
        for entry in self.inner.agents.iter() {
            if entry.descriptor.is_healthy() {
                healthy += 1;
            }
            for cap in &entry.descriptor.capabilities {
                *capabilities.entry(*cap).or_insert(0) += 1;
            }
        }

        let history = self.inner.history.read().await;
        HubStats {
            registered_agents: self.inner.agents.len(),
            healthy_agents: healthy,
            messages_routed: self.inner.counters.routed.load(Ordering::Relaxed),
            broadcasts: self.inner.counters.broadcasts.load(Ordering::Relaxed),
            responses_correlated: self.inner.counters.responses.load(Ordering::Relaxed),
            dropped_deliveries: self.inner.counters.dropped.load(Ordering::Relaxed),
            pending_replies: self.inner.pending.len(),
            history_size: history.len(),
            history_evicted: history.evicted(),
            capabilities,
        }
    }

    // ==================== Internals ====================

    fn open_slot(&self, key: PendingKey) -> oneshot::Receiver<Result<Message>> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            key,
            PendingReply {
                sent_at: Instant::now(),
                tx,
            },
        );
        rx
    }

    /// Hand a response to whoever awaits it. False when nobody does.
    fn complete_pending(&self, message: &Message) -> bool {
        if message.kind != MessageKind::Response {
            return false;
        }
        let Some(correlation_id) = message.correlation_id else {
            return false;
        };

        let key = (correlation_id, message.sender.clone());
        let Some((_, pending)) = self.inner.pending.remove(&key) else {
            return false;
        };

        // Only successful answers feed the selection tie-break
        if ResponseBody::from_payload(&message.payload).status == ReplyStatus::Ok {
            self.inner
                .latencies
                .insert(message.sender.clone(), pending.sent_at.elapsed());
        }
        self.inner.counters.responses.fetch_add(1, Ordering::Relaxed);
        if pending.tx.send(Ok(message.clone())).is_err() {
            debug!(
                correlation_id = %correlation_id,
                responder = %message.sender,
                "Response arrived after the requester gave up"
            );
        }
        true
    }

    fn mailbox_for(&self, agent_id: &str) -> Result<Mailbox> {
        let entry = self
            .inner
            .agents
            .get(agent_id)
            .ok_or_else(|| MeshError::UnknownAgent(agent_id.to_string()))?;
        if entry.descriptor.is_offline() {
            return Err(MeshError::AgentOffline(agent_id.to_string()));
        }
        Ok(entry.mailbox.clone())
    }

    async fn deliver_to(&self, target: &str, message: &Message) -> Result<()> {
        let mailbox = self.mailbox_for(target)?;
        mailbox
            .send(Delivery::Message(message.clone()))
            .await
            .map_err(|_| {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                MeshError::AgentUnavailable(target.to_string())
            })
    }

    fn broadcast_candidates(&self, message: &Message) -> Vec<(String, Mailbox)> {
        let mut candidates: Vec<_> = self
            .inner
            .agents
            .iter()
            .filter(|entry| entry.key() != &message.sender)
            .filter(|entry| !entry.descriptor.is_offline())
            .filter(|entry| message.matches_capabilities(&entry.descriptor.capabilities))
            .map(|entry| (entry.key().clone(), entry.mailbox.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates
    }

    /// Non-blocking fan-out: a full or closed mailbox never stalls the others
    fn deliver_broadcast(&self, message: &Message) -> Vec<String> {
        let mut reached = Vec::new();
        for (agent_id, mailbox) in self.broadcast_candidates(message) {
            match mailbox.try_send(Delivery::Message(message.clone())) {
                Ok(()) => reached.push(agent_id),
                Err(e) => {
                    self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        agent_id = %agent_id,
                        message_id = %message.id,
                        "Broadcast delivery skipped: {}",
                        e
                    );
                }
            }
        }
        reached
    }

    async fn record(&self, message: Message) {
        self.inner.counters.routed.fetch_add(1, Ordering::Relaxed);
        self.inner.history.write().await.push(message);
    }
}
