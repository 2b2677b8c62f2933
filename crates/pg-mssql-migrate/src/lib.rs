//! # pg-mssql-migrate
//!
//! PostgreSQL to SQL Server schema and data migration library.
//!
//! A run goes through these stages:
//!
//! - **Extraction** of tables, keys, indexes, foreign keys and artifacts
//! - **Type mapping** with a widening check per column
//! - **Dependency resolution** into parallel waves, breaking foreign-key cycles
//! - **Schema apply**: tables first, indexes and foreign keys after the copy
//! - **Data copy** in checkpointed batches, resumable after a crash
//! - **Artifact export** of views, routines and triggers as SQL files
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_mssql_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pg_mssql_migrate::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let orchestrator = Orchestrator::new(config).await?;
//! let report = orchestrator.run(CancellationToken::new()).await?;
//! println!("Migrated {} rows", report.rows_transferred);
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
pub mod config;
pub mod core;
pub mod dialect;
pub mod drivers;
pub mod error;
pub mod extract;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod schema;
pub mod state;
pub mod transfer;
pub mod typemap;

#[cfg(test)]
mod testing;

pub use artifacts::{ArtifactExporter, ArtifactReport};
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use crate::core::{SchemaSnapshot, SourceReader, TableStatus, TargetWriter};
pub use error::{MigrateError, Result};
pub use orchestrator::Orchestrator;
pub use plan::MigrationPlan;
pub use report::{MigrationReport, PlanReport, RowCountCheck, TableReport};
pub use state::RunStatus;
