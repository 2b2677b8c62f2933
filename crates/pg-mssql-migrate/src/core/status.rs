//! Per-table copy state machine.

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Status of one table within a run.
///
/// Allowed transitions:
///
/// ```text
/// Pending -> Copying -> Copying ... -> Committed
///                                   -> Failed
/// Pending -> Committed   (checkpoint already complete)
/// Pending -> Failed      (structure phase failed)
/// Pending -> Skipped     (a parent table did not commit)
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TableStatus {
    #[default]
    Pending,
    Copying { batches: u64, rows: u64 },
    Committed { rows: u64 },
    Failed { error: String, kind: String, retries: u32 },
    Skipped { ancestor: String },
}

impl TableStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TableStatus::Pending => "pending",
            TableStatus::Copying { .. } => "copying",
            TableStatus::Committed { .. } => "committed",
            TableStatus::Failed { .. } => "failed",
            TableStatus::Skipped { .. } => "skipped",
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, TableStatus::Committed { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TableStatus::Committed { .. } | TableStatus::Failed { .. } | TableStatus::Skipped { .. }
        )
    }

    pub fn can_transition_to(&self, next: &TableStatus) -> bool {
        use TableStatus::*;
        matches!(
            (self, next),
            (Pending, Copying { .. })
                | (Pending, Committed { .. })
                | (Pending, Failed { .. })
                | (Pending, Skipped { .. })
                | (Copying { .. }, Copying { .. })
                | (Copying { .. }, Committed { .. })
                | (Copying { .. }, Failed { .. })
        )
    }

    /// Move to `next`, rejecting transitions outside the diagram above.
    pub fn transition(&mut self, table: &str, next: TableStatus) -> Result<()> {
        if !self.can_transition_to(&next) {
            return Err(MigrateError::IllegalTransition {
                table: table.to_string(),
                from: self.name(),
                to: next.name(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Build a failed status from an error.
    pub fn failed(error: &MigrateError, retries: u32) -> Self {
        TableStatus::Failed {
            error: error.to_string(),
            kind: error.kind().to_string(),
            retries,
        }
    }
}
