//! Consensus Engine
//!
//! Opens proposals among the agents advertising a capability, records votes,
//! and resolves each proposal under its voting method. One proposal is one
//! DashMap entry, so votes on different proposals never contend.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::Capability;
use crate::error::{MeshError, Result};
use crate::hub::CommunicationHub;

use super::config::ConsensusConfig;
use super::proposal::{
    Ballot, Decision, DecisionSummary, Proposal, ProposalRequest, ProposalStatus, Resolution,
    Tally, Vote,
};

struct ProposalRecord {
    proposal: Proposal,
    votes: HashMap<String, Vote>,
    status_tx: watch::Sender<ProposalStatus>,
    settled_at: Option<DateTime<Utc>>,
}

impl ProposalRecord {
    fn tally(&self, default_weight: Decimal) -> Tally {
        Tally::compute(&self.proposal, &self.votes, default_weight)
    }

    /// Re-evaluate an open proposal; terminal statuses never change
    fn settle(&mut self, default_weight: Decimal, expired: bool) -> Resolution {
        let tally = self.tally(default_weight);
        let threshold = self.proposal.weighted_threshold;

        if self.proposal.status.is_open() {
            let status = tally.evaluate(self.proposal.method, threshold, expired);
            if status != ProposalStatus::Open {
                self.proposal.status = status;
                self.settled_at = Some(Utc::now());
                self.status_tx.send_replace(status);
                info!(
                    proposal_id = %self.proposal.id,
                    method = %self.proposal.method,
                    status = %status,
                    approvals = tally.approvals,
                    rejections = tally.rejections,
                    abstentions = tally.abstentions,
                    eligible = tally.eligible,
                    "Proposal settled"
                );
            }
        }

        Resolution {
            proposal_id: self.proposal.id,
            method: self.proposal.method,
            status: self.proposal.status,
            provisional_pass: tally.provisional_pass(self.proposal.method, threshold),
            tally,
            summary: DecisionSummary::new(
                &self.votes,
                self.proposal.created_at,
                self.settled_at.unwrap_or_else(Utc::now),
            ),
        }
    }
}

struct EngineInner {
    hub: CommunicationHub,
    config: ConsensusConfig,
    /// Open proposals, and settled ones until their retention lapses
    proposals: DashMap<Uuid, ProposalRecord>,
}

/// Clonable handle to the consensus engine of one coordination domain
#[derive(Clone)]
pub struct ConsensusEngine {
    inner: Arc<EngineInner>,
}

impl ConsensusEngine {
    pub fn new(hub: CommunicationHub, config: ConsensusConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                hub,
                config,
                proposals: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.inner.config
    }

    /// Proposal request filled from the configured defaults
    pub fn request(&self, initiator: &str, capability: Capability, subject: Value) -> ProposalRequest {
        ProposalRequest::new(initiator, capability, self.inner.config.default_method, subject)
            .with_deadline(self.inner.config.default_deadline())
    }

    /// Open a proposal and start its deadline timer.
    ///
    /// Voters are the non-offline agents advertising the requested
    /// capability, excluding the initiator.
    pub fn open(&self, request: ProposalRequest) -> Result<Uuid> {
        if request.deadline.is_zero() {
            return Err(MeshError::InvalidProposal("deadline must be positive".into()));
        }
        let threshold = request
            .weighted_threshold
            .unwrap_or(self.inner.config.weighted_threshold);
        if threshold <= Decimal::ZERO || threshold > Decimal::ONE {
            return Err(MeshError::InvalidProposal(format!(
                "weighted threshold {} outside (0, 1]",
                threshold
            )));
        }

        let mut eligible = self.inner.hub.eligible_voters(request.capability);
        eligible.remove(&request.initiator);
        if eligible.is_empty() {
            return Err(MeshError::NoEligibleVoters(request.capability));
        }

        let created_at = Utc::now();
        let deadline = created_at
            + chrono::Duration::from_std(request.deadline)
                .map_err(|e| MeshError::InvalidProposal(format!("deadline out of range: {}", e)))?;

        let proposal = Proposal {
            id: Uuid::new_v4(),
            initiator: request.initiator,
            subject: request.subject,
            method: request.method,
            capability: request.capability,
            eligible,
            weighted_threshold: threshold,
            created_at,
            deadline,
            status: ProposalStatus::Open,
        };
        let id = proposal.id;

        info!(
            proposal_id = %id,
            initiator = %proposal.initiator,
            method = %proposal.method,
            capability = %proposal.capability,
            voters = proposal.eligible.len(),
            "Proposal opened"
        );

        let (status_tx, mut status_rx) = watch::channel(ProposalStatus::Open);
        self.inner.proposals.insert(
            id,
            ProposalRecord {
                proposal,
                votes: HashMap::new(),
                status_tx,
                settled_at: None,
            },
        );

        // Without a runtime the deadline is still enforced lazily by `resolve`
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let engine = self.clone();
            let lifetime = request.deadline;
            let retention = self.inner.config.settled_retention();
            runtime.spawn(async move {
                let settled = async {
                    while status_rx.borrow_and_update().is_open() {
                        if status_rx.changed().await.is_err() {
                            break;
                        }
                    }
                };
                if tokio::time::timeout(lifetime, settled).await.is_err() {
                    engine.expire(id);
                }
                tokio::time::sleep(retention).await;
                engine.forget(id);
            });
        }

        Ok(id)
    }

    /// Record a vote. A voter's later vote replaces its earlier one.
    pub fn vote(
        &self,
        proposal_id: Uuid,
        agent_id: &str,
        decision: Decision,
        weight: Option<Decimal>,
    ) -> Result<Resolution> {
        self.cast(proposal_id, agent_id, Ballot { decision, weight, rationale: None })
    }

    /// Record a full ballot, keeping the voter's rationale
    pub fn cast(&self, proposal_id: Uuid, agent_id: &str, ballot: Ballot) -> Result<Resolution> {
        let Ballot {
            decision,
            weight,
            rationale,
        } = ballot;
        let default_weight = self.inner.config.default_weight;
        let mut record = self
            .inner
            .proposals
            .get_mut(&proposal_id)
            .ok_or(MeshError::UnknownProposal(proposal_id))?;

        if !record.proposal.is_eligible(agent_id) {
            return Err(MeshError::NotEligible {
                proposal_id,
                agent_id: agent_id.to_string(),
            });
        }
        if let Some(w) = weight {
            if w < Decimal::ZERO {
                return Err(MeshError::Validation(format!(
                    "negative vote weight {} from {}",
                    w, agent_id
                )));
            }
        }

        let now = Utc::now();
        if record.proposal.status.is_open() && record.proposal.deadline_elapsed(now) {
            record.settle(default_weight, true);
        }
        if !record.proposal.status.is_open() {
            return Err(MeshError::ProposalClosed(proposal_id));
        }

        let previous = record.votes.insert(
            agent_id.to_string(),
            Vote {
                proposal_id,
                voter: agent_id.to_string(),
                decision,
                weight,
                rationale,
                timestamp: now,
            },
        );
        debug!(
            proposal_id = %proposal_id,
            voter = %agent_id,
            decision = ?decision,
            replaced = previous.is_some(),
            "Vote recorded"
        );

        Ok(record.settle(default_weight, false))
    }

    /// Current tally and status; settles the proposal if it is decided or
    /// its deadline has passed.
    pub fn resolve(&self, proposal_id: Uuid) -> Result<Resolution> {
        let default_weight = self.inner.config.default_weight;
        let mut record = self
            .inner
            .proposals
            .get_mut(&proposal_id)
            .ok_or(MeshError::UnknownProposal(proposal_id))?;
        let expired = record.proposal.deadline_elapsed(Utc::now());
        Ok(record.settle(default_weight, expired))
    }

    /// Poll every eligible voter through the hub and record their ballots
    /// until the proposal is decided or its deadline passes.
    pub async fn collect(&self, proposal_id: Uuid) -> Result<Resolution> {
        let (proposal, pending_voters, mut status_rx) = {
            let record = self
                .inner
                .proposals
                .get(&proposal_id)
                .ok_or(MeshError::UnknownProposal(proposal_id))?;
            let pending: Vec<String> = record
                .proposal
                .eligible
                .iter()
                .filter(|voter| !record.votes.contains_key(*voter))
                .cloned()
                .collect();
            (record.proposal.clone(), pending, record.status_tx.subscribe())
        };

        if !proposal.status.is_open() {
            return self.resolve(proposal_id);
        }

        let remaining = (proposal.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + remaining;
        let ballot_timeout = self.inner.config.ballot_timeout().min(remaining);

        let mut ballots: FuturesUnordered<_> = pending_voters
            .into_iter()
            .map(|voter| {
                let hub = self.inner.hub.clone();
                let proposal = &proposal;
                async move {
                    let ballot = hub.request_ballot(&voter, proposal, ballot_timeout).await;
                    (voter, ballot)
                }
            })
            .collect();

        let mut settled = None;
        let gather = async {
            while let Some((voter, ballot)) = ballots.next().await {
                match ballot {
                    Ok(ballot) => {
                        match self.cast(proposal_id, &voter, ballot) {
                            Ok(resolution) if !resolution.status.is_open() => {
                                settled = Some(resolution);
                                return;
                            }
                            Ok(_) => {}
                            Err(MeshError::ProposalClosed(_)) => return,
                            Err(e) => warn!(proposal_id = %proposal_id, voter = %voter, error = %e, "Ballot rejected"),
                        }
                    }
                    Err(e) => {
                        warn!(proposal_id = %proposal_id, voter = %voter, error = %e, "No ballot");
                    }
                }
            }

            // Out of ballots; external votes may still settle it before the deadline
            while status_rx.borrow().is_open() {
                if status_rx.changed().await.is_err() {
                    break;
                }
            }
        };

        if tokio::time::timeout_at(deadline, gather).await.is_err() {
            debug!(proposal_id = %proposal_id, "Ballot collection hit the proposal deadline");
        }

        match settled {
            Some(resolution) => Ok(resolution),
            None => self.resolve(proposal_id),
        }
    }

    /// Subscribe to status changes of a proposal
    pub fn watch(&self, proposal_id: Uuid) -> Result<watch::Receiver<ProposalStatus>> {
        self.inner
            .proposals
            .get(&proposal_id)
            .map(|record| record.status_tx.subscribe())
            .ok_or(MeshError::UnknownProposal(proposal_id))
    }

    pub fn proposal(&self, proposal_id: Uuid) -> Option<Proposal> {
        self.inner
            .proposals
            .get(&proposal_id)
            .map(|record| record.proposal.clone())
    }

    /// Votes recorded so far, ordered by voter
    pub fn votes(&self, proposal_id: Uuid) -> Result<Vec<Vote>> {
        let record = self
            .inner
            .proposals
            .get(&proposal_id)
            .ok_or(MeshError::UnknownProposal(proposal_id))?;
        let mut votes: Vec<Vote> = record.votes.values().cloned().collect();
        votes.sort_by(|a, b| a.voter.cmp(&b.voter));
        Ok(votes)
    }

    /// Proposals currently held, open or within retention
    pub fn proposal_count(&self) -> usize {
        self.inner.proposals.len()
    }

    fn forget(&self, proposal_id: Uuid) {
        if let Some((_, record)) = self.inner.proposals.remove(&proposal_id) {
            debug!(proposal_id = %proposal_id, status = %record.proposal.status, "Settled proposal dropped");
        }
    }

    /// Move a still-open proposal to `timed_out`
    fn expire(&self, proposal_id: Uuid) {
        let default_weight = self.inner.config.default_weight;
        if let Some(mut record) = self.inner.proposals.get_mut(&proposal_id) {
            if record.proposal.status.is_open() {
                let resolution = record.settle(default_weight, true);
                if resolution.status == ProposalStatus::TimedOut {
                    warn!(
                        proposal_id = %proposal_id,
                        participated = resolution.tally.participated,
                        eligible = resolution.tally.eligible,
                        "Proposal timed out"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::VotingMethod;
    use crate::domain::{AgentDescriptor, HealthStatus};
    use crate::hub::{Delivery, HubConfig};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup(voters: &[&str]) -> (CommunicationHub, ConsensusEngine, Vec<mpsc::Receiver<Delivery>>) {
        let hub = CommunicationHub::new(HubConfig::default());
        let mut mailboxes = Vec::new();
        for id in voters {
            let (tx, rx) = mpsc::channel(8);
            hub.register(AgentDescriptor::new(*id, [Capability::RiskAssessment]), tx)
                .unwrap();
            mailboxes.push(rx);
        }
        let engine = ConsensusEngine::new(hub.clone(), ConsensusConfig::default());
        (hub, engine, mailboxes)
    }

    fn open(engine: &ConsensusEngine, method: VotingMethod) -> Uuid {
        engine
            .open(ProposalRequest::new(
                "coordinator",
                Capability::RiskAssessment,
                method,
                json!({"action": "approve_investment"}),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_without_voters_fails() {
        let (_hub, engine, _rx) = setup(&[]);
        let err = engine
            .open(ProposalRequest::new(
                "coordinator",
                Capability::ComplianceCheck,
                VotingMethod::Majority,
                Value::Null,
            ))
            .unwrap_err();
        assert!(matches!(err, MeshError::NoEligibleVoters(Capability::ComplianceCheck)));
    }

    #[tokio::test]
    async fn test_offline_agents_are_not_eligible() {
        let (hub, engine, _rx) = setup(&["a", "b"]);
        hub.heartbeat("b", HealthStatus::Offline).unwrap();
        let id = open(&engine, VotingMethod::Majority);

        let err = engine.vote(id, "b", Decision::Approve, None).unwrap_err();
        assert!(matches!(err, MeshError::NotEligible { .. }));
    }

    #[tokio::test]
    async fn test_majority_settles_early_and_closes() {
        let (_hub, engine, _rx) = setup(&["a", "b", "c", "d", "e"]);
        let id = open(&engine, VotingMethod::Majority);

        engine.vote(id, "a", Decision::Approve, None).unwrap();
        engine.vote(id, "b", Decision::Approve, None).unwrap();
        assert_eq!(engine.resolve(id).unwrap().status, ProposalStatus::Open);

        let resolution = engine.vote(id, "c", Decision::Approve, None).unwrap();
        assert_eq!(resolution.status, ProposalStatus::Passed);

        let err = engine.vote(id, "d", Decision::Reject, None).unwrap_err();
        assert!(matches!(err, MeshError::ProposalClosed(_)));
    }

    #[tokio::test]
    async fn test_resubmitted_vote_overwrites() {
        let (_hub, engine, _rx) = setup(&["a", "b", "c"]);
        let id = open(&engine, VotingMethod::Unanimous);

        engine.vote(id, "a", Decision::Approve, None).unwrap();
        engine.vote(id, "a", Decision::Approve, Some(dec!(2))).unwrap();
        assert_eq!(engine.votes(id).unwrap().len(), 1);
        assert_eq!(engine.resolve(id).unwrap().tally.approvals, 1);
    }

    #[tokio::test]
    async fn test_unanimous_single_reject_fails() {
        let (_hub, engine, _rx) = setup(&["a", "b", "c"]);
        let id = open(&engine, VotingMethod::Unanimous);

        let resolution = engine.vote(id, "b", Decision::Reject, None).unwrap();
        assert_eq!(resolution.status, ProposalStatus::Failed);
    }

    #[tokio::test]
    async fn test_deadline_times_out_with_partial_tally() {
        let (_hub, engine, _rx) = setup(&["a", "b", "c"]);
        let id = engine
            .open(
                ProposalRequest::new(
                    "coordinator",
                    Capability::RiskAssessment,
                    VotingMethod::Majority,
                    Value::Null,
                )
                .with_deadline(Duration::from_millis(30)),
            )
            .unwrap();
        engine.vote(id, "a", Decision::Approve, None).unwrap();

        let mut status = engine.watch(id).unwrap();
        tokio::time::timeout(Duration::from_secs(2), status.changed())
            .await
            .unwrap()
            .unwrap();

        let resolution = engine.resolve(id).unwrap();
        assert_eq!(resolution.status, ProposalStatus::TimedOut);
        assert_eq!(resolution.tally.approvals, 1);
        assert!(resolution.provisional_pass);
    }

    #[tokio::test]
    async fn test_collect_polls_voters_through_hub() {
        let (_hub, engine, mailboxes) = setup(&["a", "b", "c"]);
        for (i, mut rx) in mailboxes.into_iter().enumerate() {
            tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    if let Delivery::Ballot { reply, .. } = delivery {
                        let ballot = if i == 0 { Ballot::reject() } else { Ballot::approve() };
                        let _ = reply.send(ballot);
                    }
                }
            });
        }

        let id = open(&engine, VotingMethod::Majority);
        let resolution = engine.collect(id).await.unwrap();
        assert_eq!(resolution.status, ProposalStatus::Passed);
        assert_eq!(resolution.tally.approvals, 2);
    }

    #[tokio::test]
    async fn test_watch_reports_status_settled_before_subscribing() {
        let (_hub, engine, _rx) = setup(&["a", "b"]);
        let id = open(&engine, VotingMethod::Unanimous);
        engine.vote(id, "a", Decision::Reject, None).unwrap();

        assert_eq!(*engine.watch(id).unwrap().borrow(), ProposalStatus::Failed);
    }

    #[tokio::test]
    async fn test_settled_proposals_dropped_after_retention() {
        let hub = CommunicationHub::new(HubConfig::default());
        let (tx, _rx) = mpsc::channel(8);
        hub.register(AgentDescriptor::new("a", [Capability::RiskAssessment]), tx)
            .unwrap();
        let config = ConsensusConfig {
            settled_retention_ms: 0,
            ..ConsensusConfig::default()
        };
        let engine = ConsensusEngine::new(hub, config);

        for _ in 0..20 {
            let id = open(&engine, VotingMethod::Majority);
            engine.vote(id, "a", Decision::Approve, None).unwrap();
        }
        let timed_out = engine
            .open(
                ProposalRequest::new("coordinator", Capability::RiskAssessment, VotingMethod::Majority, Value::Null)
                    .with_deadline(Duration::from_millis(20)),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.proposal_count(), 0);
        assert!(matches!(engine.resolve(timed_out), Err(MeshError::UnknownProposal(_))));
    }

    #[tokio::test]
    async fn test_collect_keeps_ballot_rationales() {
        let (_hub, engine, mailboxes) = setup(&["a", "b", "c"]);
        for (i, mut rx) in mailboxes.into_iter().enumerate() {
            tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    if let Delivery::Ballot { reply, .. } = delivery {
                        let ballot = if i == 0 {
                            Ballot::reject().because("amount exceeds limit")
                        } else {
                            Ballot::approve()
                        };
                        let _ = reply.send(ballot);
                    }
                }
            });
        }

        let id = open(&engine, VotingMethod::Unanimous);
        let resolution = engine.collect(id).await.unwrap();
        assert_eq!(resolution.status, ProposalStatus::Failed);

        let reasons: Vec<_> = resolution.summary.rationales().collect();
        assert_eq!(reasons, vec![("a", Decision::Reject, "amount exceeds limit")]);
        let recorded = engine.votes(id).unwrap();
        assert_eq!(recorded[0].rationale.as_deref(), Some("amount exceeds limit"));

        let json = serde_json::to_value(&resolution).unwrap();
        assert_eq!(json["summary"]["votes"][0]["rationale"], "amount exceeds limit");
    }

    #[tokio::test]
    async fn test_invalid_threshold_rejected() {
        let (_hub, engine, _rx) = setup(&["a"]);
        let err = engine
            .open(
                ProposalRequest::new(
                    "coordinator",
                    Capability::RiskAssessment,
                    VotingMethod::Weighted,
                    Value::Null,
                )
                .with_threshold(dec!(1.5)),
            )
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidProposal(_)));
    }
}
