//! Voting rules end to end through the consensus engine

use rust_decimal_macros::dec;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use treasury_mesh::agents::{AgentRuntime, AgentRuntimeConfig, ReferenceAgent, VotePolicy};
use treasury_mesh::consensus::{
    ConsensusConfig, ConsensusEngine, Decision, ProposalRequest, ProposalStatus, TimeoutPolicy,
    Verdict, VotingMethod,
};
use treasury_mesh::domain::{AgentDescriptor, Capability};
use treasury_mesh::hub::{CommunicationHub, Delivery};
use treasury_mesh::MeshError;

fn voters(hub: &CommunicationHub, ids: &[&str]) -> Vec<mpsc::Receiver<Delivery>> {
    ids.iter()
        .map(|id| {
            let (tx, rx) = mpsc::channel(8);
            hub.register(AgentDescriptor::new(*id, [Capability::InvestmentAdvice]), tx)
                .unwrap();
            rx
        })
        .collect()
}

fn proposal(method: VotingMethod) -> ProposalRequest {
    ProposalRequest::new(
        "coordinator",
        Capability::InvestmentAdvice,
        method,
        json!({"action": "allocate", "amount": 250000}),
    )
    .with_deadline(Duration::from_secs(5))
}

#[tokio::test]
async fn majority_of_five_passes_with_three_approvals() {
    let hub = CommunicationHub::with_defaults();
    let _rx = voters(&hub, &["v1", "v2", "v3", "v4", "v5"]);
    let engine = ConsensusEngine::new(hub, ConsensusConfig::default());

    let id = engine.open(proposal(VotingMethod::Majority)).unwrap();
    engine.vote(id, "v1", Decision::Reject, None).unwrap();
    engine.vote(id, "v2", Decision::Approve, None).unwrap();
    engine.vote(id, "v3", Decision::Approve, None).unwrap();
    let resolution = engine.vote(id, "v4", Decision::Approve, None).unwrap();

    assert_eq!(resolution.status, ProposalStatus::Passed);
    assert_eq!(resolution.tally.approvals, 3);
    assert_eq!(resolution.tally.remaining(), 1);

    let late = engine.vote(id, "v5", Decision::Reject, None).unwrap_err();
    assert!(matches!(late, MeshError::ProposalClosed(_)));
}

#[tokio::test]
async fn unanimous_fails_on_a_single_rejection() {
    let hub = CommunicationHub::with_defaults();
    let _rx = voters(&hub, &["v1", "v2", "v3"]);
    let engine = ConsensusEngine::new(hub, ConsensusConfig::default());

    let id = engine.open(proposal(VotingMethod::Unanimous)).unwrap();
    engine.vote(id, "v1", Decision::Approve, None).unwrap();
    let resolution = engine.vote(id, "v2", Decision::Reject, None).unwrap();
    assert_eq!(resolution.status, ProposalStatus::Failed);
    assert_eq!(*engine.watch(id).unwrap().borrow(), ProposalStatus::Failed);
}

#[tokio::test]
async fn weighted_vote_needs_share_of_total_weight() {
    let hub = CommunicationHub::with_defaults();
    let _rx = voters(&hub, &["big", "small-1", "small-2"]);
    let engine = ConsensusEngine::new(hub, ConsensusConfig::default());

    let id = engine.open(proposal(VotingMethod::Weighted)).unwrap();
    engine.vote(id, "big", Decision::Approve, Some(dec!(3))).unwrap();
    engine.vote(id, "small-1", Decision::Reject, Some(dec!(1))).unwrap();
    let resolution = engine.vote(id, "small-2", Decision::Reject, Some(dec!(1))).unwrap();

    assert_eq!(resolution.status, ProposalStatus::Passed);
    assert_eq!(resolution.tally.approve_weight, dec!(3));
    assert_eq!(resolution.tally.total_weight, dec!(5));
}

#[tokio::test]
async fn ineligible_and_unknown_votes_rejected() {
    let hub = CommunicationHub::with_defaults();
    let _rx = voters(&hub, &["v1"]);
    let engine = ConsensusEngine::new(hub, ConsensusConfig::default());

    let id = engine.open(proposal(VotingMethod::Majority)).unwrap();
    assert!(matches!(
        engine.vote(id, "outsider", Decision::Approve, None),
        Err(MeshError::NotEligible { .. })
    ));
    assert!(matches!(
        engine.vote(uuid::Uuid::new_v4(), "v1", Decision::Approve, None),
        Err(MeshError::UnknownProposal(_))
    ));
}

#[tokio::test]
async fn silent_voters_time_out_and_policy_decides() {
    let hub = CommunicationHub::with_defaults();
    let _rx = voters(&hub, &["v1", "v2", "v3"]);
    let engine = ConsensusEngine::new(hub, ConsensusConfig::default());

    let id = engine
        .open(proposal(VotingMethod::Majority).with_deadline(Duration::from_millis(100)))
        .unwrap();
    engine.vote(id, "v1", Decision::Approve, None).unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let resolution = engine.resolve(id).unwrap();
    assert_eq!(resolution.status, ProposalStatus::TimedOut);
    assert!(resolution.provisional_pass);

    assert_eq!(TimeoutPolicy::Fail.apply(&resolution), Verdict::Rejected);
    assert_eq!(TimeoutPolicy::UseTally.apply(&resolution), Verdict::Approved);
    assert_eq!(TimeoutPolicy::Escalate.apply(&resolution), Verdict::Escalated);
}

#[tokio::test]
async fn collect_polls_live_agents_for_ballots() {
    let hub = CommunicationHub::with_defaults();
    let mut handles = Vec::new();
    for (id, policy) in [
        ("advisor-1", VotePolicy::Approve),
        ("advisor-2", VotePolicy::ApproveUpTo(dec!(100000))),
        ("advisor-3", VotePolicy::Approve),
    ] {
        let agent = ReferenceAgent::new(id, [Capability::InvestmentAdvice]).with_vote_policy(policy);
        handles.push(AgentRuntime::spawn(agent, hub.clone(), AgentRuntimeConfig::default()).unwrap());
    }
    let engine = ConsensusEngine::new(hub, ConsensusConfig::default());

    let id = engine.open(proposal(VotingMethod::Supermajority)).unwrap();
    let resolution = engine.collect(id).await.unwrap();
    assert_eq!(resolution.status, ProposalStatus::Passed);

    let votes = engine.votes(id).unwrap();
    let advisor_2 = votes.iter().find(|v| v.voter == "advisor-2");
    if let Some(vote) = advisor_2 {
        assert_eq!(vote.decision, Decision::Reject);
    }

    for handle in handles {
        handle.stop().await;
    }
}
