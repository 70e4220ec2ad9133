//! Proposals, votes and the tally rules for each voting method

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::Capability;

/// Voting rule applied to a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingMethod {
    /// Approvals > rejections
    Majority,
    /// Approvals >= 2/3 of eligible voters
    Supermajority,
    /// Every eligible voter approves
    Unanimous,
    /// Approval weight > threshold fraction of total eligible weight
    Weighted,
}

impl Default for VotingMethod {
    fn default() -> Self {
        Self::Majority
    }
}

impl std::fmt::Display for VotingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VotingMethod::Majority => write!(f, "majority"),
            VotingMethod::Supermajority => write!(f, "supermajority"),
            VotingMethod::Unanimous => write!(f, "unanimous"),
            VotingMethod::Weighted => write!(f, "weighted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Open,
    Passed,
    Failed,
    TimedOut,
}

impl ProposalStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ProposalStatus::Open)
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalStatus::Open => write!(f, "open"),
            ProposalStatus::Passed => write!(f, "passed"),
            ProposalStatus::Failed => write!(f, "failed"),
            ProposalStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Abstain,
}

/// What a caller asks the engine to put to a vote
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    pub initiator: String,
    pub subject: Value,
    pub method: VotingMethod,
    /// Voters are the agents advertising this capability
    pub capability: Capability,
    /// Time from opening until the proposal times out
    pub deadline: Duration,
    /// Overrides the configured threshold for weighted votes
    pub weighted_threshold: Option<Decimal>,
}

impl ProposalRequest {
    pub fn new(initiator: &str, capability: Capability, method: VotingMethod, subject: Value) -> Self {
        Self {
            initiator: initiator.to_string(),
            subject,
            method,
            capability,
            deadline: Duration::from_secs(30),
            weighted_threshold: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_threshold(mut self, threshold: Decimal) -> Self {
        self.weighted_threshold = Some(threshold);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub initiator: String,
    pub subject: Value,
    pub method: VotingMethod,
    pub capability: Capability,
    pub eligible: BTreeSet<String>,
    pub weighted_threshold: Decimal,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: ProposalStatus,
}

impl Proposal {
    pub fn is_eligible(&self, agent_id: &str) -> bool {
        self.eligible.contains(agent_id)
    }

    pub fn deadline_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// A recorded vote; one per (proposal, voter)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub proposal_id: Uuid,
    pub voter: String,
    pub decision: Decision,
    pub weight: Option<Decimal>,
    #[serde(default)]
    pub rationale: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An agent's answer to a vote request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub decision: Decision,
    #[serde(default)]
    pub weight: Option<Decimal>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl Ballot {
    pub fn approve() -> Self {
        Self::new(Decision::Approve)
    }

    pub fn reject() -> Self {
        Self::new(Decision::Reject)
    }

    pub fn abstain() -> Self {
        Self::new(Decision::Abstain)
    }

    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            weight: None,
            rationale: None,
        }
    }

    pub fn weighted(mut self, weight: Decimal) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn because(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// Vote counts for a proposal at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub eligible: usize,
    pub participated: usize,
    pub approvals: usize,
    pub rejections: usize,
    pub abstentions: usize,
    pub approve_weight: Decimal,
    pub reject_weight: Decimal,
    pub total_weight: Decimal,
}

impl Tally {
    /// Count `votes` against `proposal`. Non-voters contribute
    /// `default_weight` to the total eligible weight.
    pub fn compute(proposal: &Proposal, votes: &HashMap<String, Vote>, default_weight: Decimal) -> Self {
        let mut tally = Tally {
            eligible: proposal.eligible.len(),
            ..Default::default()
        };

        for voter in &proposal.eligible {
            let Some(vote) = votes.get(voter) else {
                tally.total_weight += default_weight;
                continue;
            };
            let weight = vote.weight.unwrap_or(default_weight);
            tally.participated += 1;
            tally.total_weight += weight;
            match vote.decision {
                Decision::Approve => {
                    tally.approvals += 1;
                    tally.approve_weight += weight;
                }
                Decision::Reject => {
                    tally.rejections += 1;
                    tally.reject_weight += weight;
                }
                Decision::Abstain => tally.abstentions += 1,
            }
        }

        tally
    }

    pub fn remaining(&self) -> usize {
        self.eligible.saturating_sub(self.participated)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Outcome the votes received so far point to, ignoring missing voters.
    pub fn provisional_pass(&self, method: VotingMethod, threshold: Decimal) -> bool {
        match method {
            VotingMethod::Majority => self.approvals > self.rejections,
            VotingMethod::Supermajority => self.approvals * 3 >= self.eligible * 2,
            VotingMethod::Unanimous => self.eligible > 0 && self.approvals == self.eligible,
            VotingMethod::Weighted => {
                self.total_weight > Decimal::ZERO
                    && self.approve_weight > threshold * self.total_weight
            }
        }
    }

    /// Status under `method`.
    ///
    /// Majority, supermajority and unanimous settle as soon as the missing
    /// votes can no longer change the result; weighted settles on full
    /// participation. An undecided proposal past its deadline is `TimedOut`.
    pub fn evaluate(&self, method: VotingMethod, threshold: Decimal, expired: bool) -> ProposalStatus {
        let remaining = self.remaining();

        let decided = match method {
            VotingMethod::Majority => {
                if self.approvals > self.rejections + remaining {
                    Some(ProposalStatus::Passed)
                } else if self.approvals + remaining <= self.rejections {
                    Some(ProposalStatus::Failed)
                } else {
                    None
                }
            }
            VotingMethod::Supermajority => {
                if self.approvals * 3 >= self.eligible * 2 {
                    Some(ProposalStatus::Passed)
                } else if (self.approvals + remaining) * 3 < self.eligible * 2 {
                    Some(ProposalStatus::Failed)
                } else {
                    None
                }
            }
            VotingMethod::Unanimous => {
                if self.rejections > 0 || self.abstentions > 0 {
                    Some(ProposalStatus::Failed)
                } else if self.approvals == self.eligible {
                    Some(ProposalStatus::Passed)
                } else {
                    None
                }
            }
            VotingMethod::Weighted => {
                if self.is_complete() {
                    if self.provisional_pass(method, threshold) {
                        Some(ProposalStatus::Passed)
                    } else {
                        Some(ProposalStatus::Failed)
                    }
                } else {
                    None
                }
            }
        };

        match decided {
            Some(status) => status,
            None if expired => ProposalStatus::TimedOut,
            None => ProposalStatus::Open,
        }
    }
}

/// Result of resolving a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub proposal_id: Uuid,
    pub method: VotingMethod,
    pub status: ProposalStatus,
    pub tally: Tally,
    /// Whether the votes received so far favour the proposal
    pub provisional_pass: bool,
    #[serde(default)]
    pub summary: DecisionSummary,
}

/// Who voted how, and why
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    /// Recorded votes ordered by voter
    pub votes: Vec<Vote>,
    /// From opening to settlement, or to now while still open (ms)
    pub decision_time_ms: u64,
}

impl DecisionSummary {
    pub fn new(votes: &HashMap<String, Vote>, created_at: DateTime<Utc>, settled_at: DateTime<Utc>) -> Self {
        let mut votes: Vec<Vote> = votes.values().cloned().collect();
        votes.sort_by(|a, b| a.voter.cmp(&b.voter));
        Self {
            votes,
            decision_time_ms: (settled_at - created_at).num_milliseconds().max(0) as u64,
        }
    }

    /// (voter, decision, rationale) for every vote that gave a reason
    pub fn rationales(&self) -> impl Iterator<Item = (&str, Decision, &str)> {
        self.votes.iter().filter_map(|vote| {
            vote.rationale
                .as_deref()
                .map(|rationale| (vote.voter.as_str(), vote.decision, rationale))
        })
    }
}

/// How a caller treats a timed-out proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    Pass,
    Fail,
    /// Decide from the partial tally as if the received votes were final
    UseTally,
    Escalate,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::Fail
    }
}

/// Caller-side verdict after applying a timeout policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
    Escalated,
    Undecided,
}

impl TimeoutPolicy {
    pub fn apply(&self, resolution: &Resolution) -> Verdict {
        match resolution.status {
            ProposalStatus::Passed => Verdict::Approved,
            ProposalStatus::Failed => Verdict::Rejected,
            ProposalStatus::Open => Verdict::Undecided,
            ProposalStatus::TimedOut => match self {
                TimeoutPolicy::Pass => Verdict::Approved,
                TimeoutPolicy::Fail => Verdict::Rejected,
                TimeoutPolicy::Escalate => Verdict::Escalated,
                TimeoutPolicy::UseTally if resolution.provisional_pass => Verdict::Approved,
                TimeoutPolicy::UseTally => Verdict::Rejected,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn proposal(method: VotingMethod, voters: &[&str]) -> Proposal {
        let now = Utc::now();
        Proposal {
            id: Uuid::new_v4(),
            initiator: "coordinator".into(),
            subject: Value::Null,
            method,
            capability: Capability::RiskAssessment,
            eligible: voters.iter().map(|v| v.to_string()).collect(),
            weighted_threshold: dec!(0.5),
            created_at: now,
            deadline: now + chrono::Duration::seconds(30),
            status: ProposalStatus::Open,
        }
    }

    fn votes(p: &Proposal, cast: &[(&str, Decision, Option<Decimal>)]) -> HashMap<String, Vote> {
        cast.iter()
            .map(|(voter, decision, weight)| {
                (
                    voter.to_string(),
                    Vote {
                        proposal_id: p.id,
                        voter: voter.to_string(),
                        decision: *decision,
                        weight: *weight,
                        rationale: None,
                        timestamp: Utc::now(),
                    },
                )
            })
            .collect()
    }

    fn status(p: &Proposal, cast: &[(&str, Decision, Option<Decimal>)], expired: bool) -> ProposalStatus {
        Tally::compute(p, &votes(p, cast), Decimal::ONE).evaluate(p.method, p.weighted_threshold, expired)
    }

    use Decision::{Abstain, Approve, Reject};

    #[test]
    fn test_majority_three_of_five_passes() {
        let p = proposal(VotingMethod::Majority, &["a", "b", "c", "d", "e"]);
        let cast = [
            ("a", Approve, None),
            ("b", Approve, None),
            ("c", Approve, None),
            ("d", Reject, None),
            ("e", Reject, None),
        ];
        assert_eq!(status(&p, &cast, false), ProposalStatus::Passed);
    }

    #[test]
    fn test_majority_waits_while_outcome_can_change() {
        let p = proposal(VotingMethod::Majority, &["a", "b", "c", "d", "e"]);
        let cast = [("a", Approve, None), ("b", Approve, None), ("c", Reject, None)];
        assert_eq!(status(&p, &cast, false), ProposalStatus::Open);
        assert_eq!(status(&p, &cast, true), ProposalStatus::TimedOut);
    }

    #[test]
    fn test_majority_tie_fails_on_completion() {
        let p = proposal(VotingMethod::Majority, &["a", "b", "c"]);
        let cast = [("a", Approve, None), ("b", Reject, None), ("c", Abstain, None)];
        assert_eq!(status(&p, &cast, false), ProposalStatus::Failed);
    }

    #[test]
    fn test_supermajority_counts_against_eligible_voters() {
        let p = proposal(VotingMethod::Supermajority, &["a", "b", "c"]);
        assert_eq!(
            status(&p, &[("a", Approve, None), ("b", Approve, None)], false),
            ProposalStatus::Passed
        );
        assert_eq!(
            status(&p, &[("a", Reject, None), ("b", Abstain, None)], false),
            ProposalStatus::Failed
        );
        assert_eq!(status(&p, &[("a", Approve, None)], false), ProposalStatus::Open);
    }

    #[test]
    fn test_unanimous_single_reject_fails_regardless() {
        let p = proposal(VotingMethod::Unanimous, &["a", "b", "c", "d"]);
        let cast = [
            ("a", Approve, None),
            ("b", Approve, None),
            ("c", Approve, None),
            ("d", Reject, None),
        ];
        assert_eq!(status(&p, &cast, false), ProposalStatus::Failed);
        assert_eq!(status(&p, &[("b", Reject, None)], false), ProposalStatus::Failed);
        assert_eq!(status(&p, &[("b", Reject, None)], true), ProposalStatus::Failed);
    }

    #[test]
    fn test_unanimous_abstention_fails() {
        let p = proposal(VotingMethod::Unanimous, &["a", "b"]);
        assert_eq!(
            status(&p, &[("a", Approve, None), ("b", Abstain, None)], false),
            ProposalStatus::Failed
        );
    }

    #[test]
    fn test_weighted_threshold_against_total_weight() {
        let p = proposal(VotingMethod::Weighted, &["a", "b", "c"]);
        // approve 3 of total 5 -> 0.6 > 0.5
        let cast = [
            ("a", Approve, Some(dec!(3))),
            ("b", Reject, Some(dec!(1))),
            ("c", Abstain, None),
        ];
        assert_eq!(status(&p, &cast, false), ProposalStatus::Passed);

        // approve 2 of total 4 -> exactly half does not exceed
        let cast = [
            ("a", Approve, Some(dec!(2))),
            ("b", Reject, Some(dec!(1))),
            ("c", Abstain, None),
        ];
        assert_eq!(status(&p, &cast, false), ProposalStatus::Failed);
    }

    #[test]
    fn test_abstentions_count_toward_participation_only() {
        let p = proposal(VotingMethod::Weighted, &["a", "b"]);
        let tally = Tally::compute(
            &p,
            &votes(&p, &[("a", Abstain, Some(dec!(4))), ("b", Approve, None)]),
            Decimal::ONE,
        );
        assert_eq!(tally.participated, 2);
        assert_eq!(tally.abstentions, 1);
        assert_eq!(tally.approve_weight, dec!(1));
        assert_eq!(tally.reject_weight, Decimal::ZERO);
    }

    #[test]
    fn test_summary_keeps_rationales_in_voter_order() {
        let p = proposal(VotingMethod::Majority, &["a", "b", "c"]);
        let mut cast = votes(&p, &[("b", Reject, None), ("a", Approve, None)]);
        if let Some(vote) = cast.get_mut("b") {
            vote.rationale = Some("amount exceeds limit".into());
        }

        let summary = DecisionSummary::new(&cast, p.created_at, p.created_at + chrono::Duration::milliseconds(40));
        assert_eq!(summary.decision_time_ms, 40);
        assert_eq!(summary.votes[0].voter, "a");
        let reasons: Vec<_> = summary.rationales().collect();
        assert_eq!(reasons, vec![("b", Reject, "amount exceeds limit")]);
    }

    #[test]
    fn test_timeout_policy_is_caller_side() {
        let p = proposal(VotingMethod::Majority, &["a", "b", "c"]);
        let tally = Tally::compute(&p, &votes(&p, &[("a", Approve, None)]), Decimal::ONE);
        let resolution = Resolution {
            proposal_id: p.id,
            method: p.method,
            status: tally.evaluate(p.method, p.weighted_threshold, true),
            provisional_pass: tally.provisional_pass(p.method, p.weighted_threshold),
            tally,
            summary: DecisionSummary::default(),
        };
        assert_eq!(resolution.status, ProposalStatus::TimedOut);
        assert_eq!(TimeoutPolicy::Pass.apply(&resolution), Verdict::Approved);
        assert_eq!(TimeoutPolicy::Fail.apply(&resolution), Verdict::Rejected);
        assert_eq!(TimeoutPolicy::Escalate.apply(&resolution), Verdict::Escalated);
        assert_eq!(TimeoutPolicy::UseTally.apply(&resolution), Verdict::Approved);
    }
}
