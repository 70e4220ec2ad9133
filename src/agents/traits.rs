//! Agent trait: the execution contract every specialized agent implements
//!
//! The runtime owns the mailbox loop and heartbeats; an implementation only
//! declares its capabilities and answers requests and vote requests.

use async_trait::async_trait;

use crate::consensus::{Ballot, Proposal};
use crate::domain::{CapabilitySet, HealthStatus, Message, ResponseBody};
use crate::error::Result;

/// A specialized decision-making unit.
///
/// `capabilities()` is queried once, at registration. `handle` and
/// `cast_vote` run under the runtime's handler timeout; a handler that
/// overruns it is answered with a `degraded` response on the agent's behalf.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Unique identifier for this agent instance
    fn id(&self) -> &str;

    /// Capability tags this agent serves
    fn capabilities(&self) -> CapabilitySet;

    /// Answer a request routed to this agent
    async fn handle(&self, request: &Message) -> Result<ResponseBody>;

    /// Vote on a proposal for one of this agent's capabilities
    async fn cast_vote(&self, proposal: &Proposal) -> Ballot;

    /// Health reported with each heartbeat
    fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    /// Notifications, status updates and uncorrelated responses
    async fn on_message(&self, _message: &Message) {}
}
