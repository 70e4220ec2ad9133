//! Workflow instance stores

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::WorkflowInstance;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Json,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Memory
    }
}

/// Configuration for workflow persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Directory of the JSON backend
    pub directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            directory: PathBuf::from("data/workflows"),
        }
    }
}

/// Storage for workflow instance snapshots
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or replace the snapshot of a run
    async fn save(&self, instance: &WorkflowInstance) -> Result<()>;

    async fn load(&self, run_id: Uuid) -> Result<Option<WorkflowInstance>>;

    /// All stored runs, oldest first
    async fn list(&self) -> Result<Vec<WorkflowInstance>>;
}

/// Build the store selected by `config`
pub async fn build_store(config: &StoreConfig) -> Result<Arc<dyn WorkflowStore>> {
    Ok(match config.backend {
        StoreBackend::Memory => Arc::new(InMemoryWorkflowStore::new()),
        StoreBackend::Json => Arc::new(JsonFileWorkflowStore::open(&config.directory).await?),
    })
}

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    runs: DashMap<Uuid, WorkflowInstance>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        self.runs.insert(instance.run_id, instance.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<WorkflowInstance>> {
        Ok(self.runs.get(&run_id).map(|r| r.clone()))
    }

    async fn list(&self) -> Result<Vec<WorkflowInstance>> {
        let mut all: Vec<_> = self.runs.iter().map(|r| r.clone()).collect();
        all.sort_by_key(|r| r.started_at);
        Ok(all)
    }
}

/// One pretty-printed JSON document per run: `<directory>/<run_id>.json`
#[derive(Debug)]
pub struct JsonFileWorkflowStore {
    directory: PathBuf,
}

impl JsonFileWorkflowStore {
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;
        info!(directory = %directory.display(), "Workflow store opened");
        Ok(Self { directory })
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.directory.join(format!("{}.json", run_id))
    }
}

#[async_trait]
impl WorkflowStore for JsonFileWorkflowStore {
    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        let path = self.path_for(instance.run_id);
        let tmp = path.with_extension("json.tmp");
        let doc = serde_json::to_vec_pretty(instance)?;

        // Readers only ever see complete documents
        tokio::fs::write(&tmp, doc).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(run_id = %instance.run_id, status = %instance.status, "Saved workflow run");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<WorkflowInstance>> {
        match tokio::fs::read(self.path_for(run_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<WorkflowInstance>> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<WorkflowInstance>(&bytes) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable workflow document"),
            }
        }

        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }
}
