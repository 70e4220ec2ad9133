//! Rule-based reference agent
//!
//! Stands in for the specialized treasury agents in demos and tests. It
//! answers every request with a summary of what it was asked, after a
//! configurable latency, and votes according to a fixed policy.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;

use crate::consensus::{Ballot, Proposal};
use crate::domain::{Capability, CapabilitySet, HealthStatus, Message, ResponseBody};
use crate::error::{MeshError, Result};

use super::traits::Agent;

/// How a reference agent votes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotePolicy {
    Approve,
    Reject,
    Abstain,
    /// Approve when the subject's `amount` is at most the limit
    ApproveUpTo(Decimal),
}

impl Default for VotePolicy {
    fn default() -> Self {
        Self::Approve
    }
}

/// `amount` at the top of the subject, or inside a workflow step's `input`
fn subject_amount(subject: &Value) -> Option<Decimal> {
    let amount = subject
        .get("amount")
        .or_else(|| subject.get("input").and_then(|input| input.get("amount")))?;
    match amount {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceAgent {
    id: String,
    capabilities: CapabilitySet,
    latency: Duration,
    vote_policy: VotePolicy,
    vote_weight: Option<Decimal>,
    health: HealthStatus,
    failing: bool,
}

impl ReferenceAgent {
    pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            latency: Duration::ZERO,
            vote_policy: VotePolicy::default(),
            vote_weight: None,
            health: HealthStatus::Healthy,
            failing: false,
        }
    }

    /// Time spent on each request before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_vote_policy(mut self, policy: VotePolicy) -> Self {
        self.vote_policy = policy;
        self
    }

    pub fn with_vote_weight(mut self, weight: Decimal) -> Self {
        self.vote_weight = Some(weight);
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    /// Every request fails with an error response
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Never answers within any realistic deadline
    pub fn silent(self) -> Self {
        self.with_latency(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl Agent for ReferenceAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn handle(&self, request: &Message) -> Result<ResponseBody> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing {
            return Err(MeshError::Internal(format!("{} could not process request", self.id)));
        }

        let capability = request
            .payload
            .get("capability")
            .and_then(Value::as_str)
            .and_then(|tag| Capability::from_str(tag).ok());
        if let Some(cap) = capability {
            if !self.capabilities.contains(&cap) {
                return Ok(ResponseBody::error(format!(
                    "{} does not serve {}",
                    self.id, cap
                )));
            }
        }

        let body = json!({
            "agent_id": self.id,
            "capability": capability,
            "received": request.payload.get("input").cloned().unwrap_or(Value::Null),
        });

        Ok(match self.health {
            HealthStatus::Healthy => ResponseBody::ok(body),
            _ => ResponseBody::degraded(body, format!("{} running {}", self.id, self.health)),
        })
    }

    async fn cast_vote(&self, proposal: &Proposal) -> Ballot {
        let ballot = match &self.vote_policy {
            VotePolicy::Approve => Ballot::approve(),
            VotePolicy::Reject => Ballot::reject(),
            VotePolicy::Abstain => Ballot::abstain(),
            VotePolicy::ApproveUpTo(limit) => match subject_amount(&proposal.subject) {
                Some(amount) if amount <= *limit => {
                    Ballot::approve().because(format!("{} within limit {}", amount, limit))
                }
                Some(amount) => Ballot::reject().because(format!("{} exceeds limit {}", amount, limit)),
                None => Ballot::abstain().because("subject carries no amount"),
            },
        };

        match self.vote_weight {
            Some(weight) => ballot.weighted(weight),
            None => ballot,
        }
    }

    fn health(&self) -> HealthStatus {
        self.health
    }
}
