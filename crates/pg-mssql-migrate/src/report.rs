//! Run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactReport;
use crate::core::status::TableStatus;
use crate::error::Result;
use crate::plan::{DeferredForeignKey, ExternalForeignKey, MigrationPlan};
use crate::schema::ConstraintResult;
use crate::state::RunStatus;

/// Terminal state of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableReport {
    /// Qualified source table name.
    pub table: String,

    /// Qualified target table name.
    pub target: String,

    /// Wave index in the plan.
    pub wave: usize,

    #[serde(flatten)]
    pub status: TableStatus,

    /// Source row count captured at extraction.
    pub expected_rows: u64,

    pub rows_copied: u64,
    pub batches: u64,
    pub retries: u32,

    /// Copy continued from a checkpoint of an earlier run.
    #[serde(default)]
    pub resumed: bool,

    pub duration_seconds: f64,
}

impl TableReport {
    /// A report for a table that never reached the copy engine.
    pub fn without_copy(table: &str, target: String, wave: usize, expected_rows: u64, status: TableStatus) -> Self {
        Self {
            table: table.to_string(),
            target,
            wave,
            status,
            expected_rows,
            rows_copied: 0,
            batches: 0,
            retries: 0,
            resumed: false,
            duration_seconds: 0.0,
        }
    }

    /// Committed with a different row count than extraction reported.
    pub fn count_mismatch(&self) -> bool {
        matches!(self.status, TableStatus::Committed { rows } if rows != self.expected_rows)
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub tables_total: usize,
    pub tables_committed: usize,
    pub tables_failed: usize,
    pub tables_skipped: usize,

    /// Total rows transferred in this run.
    pub rows_transferred: u64,

    /// Average throughput (rows/second).
    pub rows_per_second: u64,

    /// Tables in plan order.
    pub tables: Vec<TableReport>,

    /// Committed tables whose copied row count differs from the count taken
    /// at extraction.
    #[serde(default)]
    pub row_count_mismatches: Vec<String>,

    pub waves: Vec<Vec<String>>,

    #[serde(default)]
    pub constraints: Vec<ConstraintResult>,

    #[serde(default)]
    pub deferred_foreign_keys: Vec<DeferredForeignKey>,

    #[serde(default)]
    pub external_foreign_keys: Vec<ExternalForeignKey>,

    #[serde(default)]
    pub cycles: Vec<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactReport>,
}

impl MigrationReport {
    /// Assemble the report and derive the counters and overall status.
    pub fn build(
        run_id: String,
        started_at: DateTime<Utc>,
        plan: &MigrationPlan,
        tables: Vec<TableReport>,
        constraints: Vec<ConstraintResult>,
        artifacts: Option<ArtifactReport>,
        cancelled: bool,
    ) -> Self {
        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let count = |pred: fn(&TableStatus) -> bool| tables.iter().filter(|t| pred(&t.status)).count();
        let tables_committed = count(|s| s.is_committed());
        let tables_failed = count(|s| matches!(s, TableStatus::Failed { .. }));
        let tables_skipped = count(|s| matches!(s, TableStatus::Skipped { .. }));
        let rows_transferred: u64 = tables.iter().map(|t| t.rows_copied).sum();
        let row_count_mismatches = tables
            .iter()
            .filter(|t| t.count_mismatch())
            .map(|t| t.table.clone())
            .collect();

        let rows_per_second = if duration > 0.0 {
            (rows_transferred as f64 / duration) as u64
        } else {
            0
        };

        let status = if cancelled {
            RunStatus::Cancelled
        } else if tables_committed == tables.len() {
            RunStatus::Completed
        } else if tables_committed == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };

        Self {
            run_id,
            status,
            started_at,
            completed_at,
            duration_seconds: duration,
            tables_total: tables.len(),
            tables_committed,
            tables_failed,
            tables_skipped,
            rows_transferred,
            rows_per_second,
            tables,
            row_count_mismatches,
            waves: plan.waves().to_vec(),
            constraints,
            deferred_foreign_keys: plan.deferred().to_vec(),
            external_foreign_keys: plan.external().to_vec(),
            cycles: plan.cycles().to_vec(),
            artifacts,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// Failed and skipped tables, in plan order.
    pub fn rerun_candidates(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| matches!(t.status, TableStatus::Failed { .. } | TableStatus::Skipped { .. }))
            .map(|t| t.table.as_str())
            .collect()
    }

    /// Every table committed and no constraint failed.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && !self.constraints.iter().any(|c| c.is_failed())
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Output of a dry run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub tables_total: usize,
    pub waves: Vec<Vec<String>>,
    pub deferred_foreign_keys: Vec<DeferredForeignKey>,
    pub external_foreign_keys: Vec<ExternalForeignKey>,
    pub cycles: Vec<Vec<String>>,
    /// Structure-phase DDL in execution order.
    pub statements: Vec<String>,
    pub artifacts: usize,
}

impl PlanReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Source vs target row count of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCountCheck {
    pub table: String,
    pub source_rows: u64,
    /// `None` when the target table could not be counted.
    pub target_rows: Option<u64>,
}

impl RowCountCheck {
    pub fn matches(&self) -> bool {
        self.target_rows == Some(self.source_rows)
    }
}
