//! Communication hub: agent registry, message routing and history

pub mod config;
pub mod history;
mod hub;

pub use config::HubConfig;
pub use history::{HistoryFilter, HistoryIter, MessageHistory};
pub use hub::{CommunicationHub, Delivery, HubStats, Mailbox};
