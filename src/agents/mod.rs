//! Agents: the execution contract and the runtime that drives it
//!
//! Each agent implements `Agent`; `AgentRuntime::spawn` registers it with a
//! hub and owns its mailbox loop and heartbeats.

pub mod config;
pub mod decision_log;
pub mod reference;
pub mod runtime;
pub mod traits;

pub use config::AgentRuntimeConfig;
pub use decision_log::{AgentStats, DecisionKind, DecisionLog, DecisionRecord};
pub use reference::{ReferenceAgent, VotePolicy};
pub use runtime::{cancel_notice, AgentHandle, AgentRuntime, CANCEL_EVENT};
pub use traits::Agent;
