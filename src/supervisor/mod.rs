//! Supervisor Layer
//!
//! Periodic heartbeat sweeps over the hub's registry. Agents that miss too
//! many heartbeats are marked offline and announced to subscribers.

pub mod heartbeat;

pub use heartbeat::{HeartbeatEvent, HeartbeatMonitor};
