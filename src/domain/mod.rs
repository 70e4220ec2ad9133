//! Domain types shared across the coordination core

pub mod agent;
pub mod capability;
pub mod message;

pub use agent::{AgentDescriptor, HealthStatus};
pub use capability::{parse_capabilities, Capability, CapabilitySet};
pub use message::{Message, MessageKind, MessagePriority, ReplyStatus, ResponseBody};
