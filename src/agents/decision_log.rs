//! Bounded per-agent decision log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use crate::consensus::Decision;
use crate::domain::ReplyStatus;

/// Smoothing factor of the response-time moving average
const RESPONSE_TIME_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionKind {
    /// Answered a request
    Response { request_id: Uuid, status: ReplyStatus },
    /// Voted on a proposal
    Vote { proposal_id: Uuid, decision: Decision },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    #[serde(flatten)]
    pub kind: DecisionKind,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Counters derived from the decision stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub requests_handled: u64,
    pub degraded_responses: u64,
    pub error_responses: u64,
    pub votes_cast: u64,
    /// Exponential moving average of handler time
    pub avg_response_ms: Option<f64>,
}

#[derive(Debug)]
pub struct DecisionLog {
    records: VecDeque<DecisionRecord>,
    capacity: usize,
    stats: AgentStats,
}

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            stats: AgentStats::default(),
        }
    }

    pub fn record_response(
        &mut self,
        request_id: Uuid,
        status: ReplyStatus,
        elapsed: Duration,
        note: Option<String>,
    ) {
        self.stats.requests_handled += 1;
        match status {
            ReplyStatus::Ok => {}
            ReplyStatus::Degraded => self.stats.degraded_responses += 1,
            ReplyStatus::Error => self.stats.error_responses += 1,
        }

        let ms = elapsed.as_secs_f64() * 1000.0;
        self.stats.avg_response_ms = Some(match self.stats.avg_response_ms {
            Some(avg) => RESPONSE_TIME_ALPHA * ms + (1.0 - RESPONSE_TIME_ALPHA) * avg,
            None => ms,
        });

        self.push(DecisionRecord {
            kind: DecisionKind::Response { request_id, status },
            elapsed_ms: elapsed.as_millis() as u64,
            note,
            at: Utc::now(),
        });
    }

    pub fn record_vote(
        &mut self,
        proposal_id: Uuid,
        decision: Decision,
        elapsed: Duration,
        note: Option<String>,
    ) {
        self.stats.votes_cast += 1;
        self.push(DecisionRecord {
            kind: DecisionKind::Vote {
                proposal_id,
                decision,
            },
            elapsed_ms: elapsed.as_millis() as u64,
            note,
            at: Utc::now(),
        });
    }

    fn push(&mut self, record: DecisionRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Records, oldest first
    pub fn records(&self) -> Vec<DecisionRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn stats(&self) -> AgentStats {
        self.stats.clone()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
