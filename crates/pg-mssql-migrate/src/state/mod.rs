//! Copy checkpoints for resume capability.

mod backend;
mod file;
mod memory;

pub use backend::{run_status_to_str, CheckpointStore};
pub use file::{CheckpointFile, FileCheckpointStore};
pub use memory::MemoryCheckpointStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::schema::Boundary;

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    /// Finished with failed or skipped tables.
    Partial,
    Failed,
    Cancelled,
}

/// Durable copy position of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyCheckpoint {
    /// Position after the last committed batch. `None` before the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary: Option<Boundary>,

    /// Rows committed so far.
    pub rows_copied: u64,

    /// Batches committed so far.
    pub batches: u64,

    /// Source row count captured at extraction.
    pub expected_rows: u64,

    /// Source exhausted and every batch committed.
    pub complete: bool,

    pub updated_at: DateTime<Utc>,
}

impl CopyCheckpoint {
    pub fn new(expected_rows: u64) -> Self {
        Self {
            boundary: None,
            rows_copied: 0,
            batches: 0,
            expected_rows,
            complete: false,
            updated_at: Utc::now(),
        }
    }

    /// Record one committed batch.
    pub fn advance(&mut self, boundary: Boundary, rows: u64) {
        self.boundary = Some(boundary);
        self.rows_copied += rows;
        self.batches += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
        self.updated_at = Utc::now();
    }
}
