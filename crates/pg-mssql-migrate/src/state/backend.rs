//! Checkpoint persistence trait.
//!
//! The copy engine works with `Arc<dyn CheckpointStore>` and does not know
//! where checkpoints live. Implementations:
//!
//! - **File**: [`FileCheckpointStore`](super::FileCheckpointStore), signed JSON
//! - **Memory**: [`MemoryCheckpointStore`](super::MemoryCheckpointStore), for
//!   dry runs and tests

use async_trait::async_trait;

use super::{CopyCheckpoint, RunStatus};
use crate::error::Result;

/// Storage for per-table copy checkpoints.
///
/// Each table has a single writer, so implementations only need to keep
/// concurrent saves for different tables from corrupting each other.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Checkpoint of a table, keyed by qualified source name.
    async fn load(&self, table: &str) -> Result<Option<CopyCheckpoint>>;

    /// Persist a checkpoint. Must be durable when this returns.
    async fn save(&self, table: &str, checkpoint: &CopyCheckpoint) -> Result<()>;

    /// Remove every checkpoint.
    async fn clear_all(&self) -> Result<()>;

    /// Record the overall run status.
    async fn mark_run(&self, status: RunStatus) -> Result<()>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

/// Helper function to convert RunStatus to string representation.
pub fn run_status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Partial => "partial",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}
