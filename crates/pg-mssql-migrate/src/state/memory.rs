//! In-memory checkpoint store.
//!
//! Used when no state file is configured: a run still tracks per-table
//! progress, but cannot be resumed after the process exits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CheckpointStore, CopyCheckpoint, RunStatus};
use crate::error::Result;

pub struct MemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<String, CopyCheckpoint>>,
    status: Mutex<RunStatus>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: Mutex::new(BTreeMap::new()),
            status: Mutex::new(RunStatus::Running),
        }
    }

    /// Copy of all checkpoints.
    pub async fn checkpoints(&self) -> BTreeMap<String, CopyCheckpoint> {
        self.checkpoints.lock().await.clone()
    }

    pub async fn status(&self) -> RunStatus {
        *self.status.lock().await
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, table: &str) -> Result<Option<CopyCheckpoint>> {
        Ok(self.checkpoints.lock().await.get(table).cloned())
    }

    async fn save(&self, table: &str, checkpoint: &CopyCheckpoint) -> Result<()> {
        self.checkpoints
            .lock()
            .await
            .insert(table.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.checkpoints.lock().await.clear();
        Ok(())
    }

    async fn mark_run(&self, status: RunStatus) -> Result<()> {
        *self.status.lock().await = status;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("public.t").await.unwrap().is_none());

        store.save("public.t", &CopyCheckpoint::new(10)).await.unwrap();
        assert_eq!(store.load("public.t").await.unwrap().unwrap().expected_rows, 10);

        store.mark_run(RunStatus::Completed).await.unwrap();
        assert_eq!(store.status().await, RunStatus::Completed);

        store.clear_all().await.unwrap();
        assert!(store.checkpoints().await.is_empty());
    }
}
