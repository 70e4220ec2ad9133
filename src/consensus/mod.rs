//! Consensus: proposals, votes and group decisions among agents

pub mod config;
pub mod engine;
pub mod proposal;

pub use config::ConsensusConfig;
pub use engine::ConsensusEngine;
pub use proposal::{
    Ballot, Decision, DecisionSummary, Proposal, ProposalRequest, ProposalStatus, Resolution,
    Tally, TimeoutPolicy, Verdict, Vote, VotingMethod,
};
