//! Persistence Layer for Workflow Runs
//!
//! Workflow instances are saved after every state change so a run's last
//! known state survives a restart:
//! - In-memory store for single-process deployments and tests
//! - JSON file store, one document per run

pub mod store;

pub use store::{
    build_store, InMemoryWorkflowStore, JsonFileWorkflowStore, StoreBackend, StoreConfig,
    WorkflowStore,
};
