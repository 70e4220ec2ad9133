//! Coordination core for a mesh of treasury agents.
//!
//! Agents register capabilities with a [`CommunicationHub`], exchange
//! messages through it, settle decisions via the [`ConsensusEngine`] and are
//! driven through multi-step workflows by the [`Orchestrator`].

pub mod agents;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod supervisor;

pub use agents::{Agent, AgentHandle, AgentRuntime, AgentRuntimeConfig, ReferenceAgent};
pub use config::AppConfig;
pub use consensus::{ConsensusEngine, Proposal, ProposalStatus, VotingMethod};
pub use coordinator::{Orchestrator, WorkflowInstance, WorkflowStatus, WorkflowTemplate};
pub use domain::{AgentDescriptor, Capability, HealthStatus, Message};
pub use error::{MeshError, Result};
pub use hub::{CommunicationHub, HubConfig};
pub use persistence::{InMemoryWorkflowStore, JsonFileWorkflowStore, WorkflowStore};
pub use supervisor::{HeartbeatEvent, HeartbeatMonitor};
