//! Migration orchestrator - main workflow coordinator.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactExporter, ArtifactReport};
use crate::config::Config;
use crate::core::schema::SchemaSnapshot;
use crate::core::status::TableStatus;
use crate::core::traits::{SourceReader, TargetWriter};
use crate::drivers::{MssqlWriter, PostgresReader};
use crate::error::{MigrateError, Result};
use crate::extract::extract;
use crate::plan::MigrationPlan;
use crate::report::{MigrationReport, PlanReport, RowCountCheck, TableReport};
use crate::schema::{ApplyOptions, SchemaApplier, StructureOutcome};
use crate::state::{
    run_status_to_str, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
use crate::transfer::{CopyConfig, CopyEngine, TableOutcome};
use crate::typemap::TypeMapper;

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    state_file: Option<PathBuf>,
    resume: bool,
}

impl Orchestrator {
    /// Connect to both databases.
    pub async fn new(config: Config) -> Result<Self> {
        let source = PostgresReader::new(
            &config.source,
            config.migration.get_max_source_connections(),
        )
        .await?;
        let target = MssqlWriter::new(
            &config.target,
            config.migration.get_max_target_connections(),
        )
        .await?;

        Ok(Self::with_components(config, Arc::new(source), Arc::new(target)))
    }

    /// Build an orchestrator around existing readers and writers.
    pub fn with_components(
        config: Config,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            state_file: None,
            resume: false,
        }
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Continue from the checkpoints in the state file instead of starting over.
    pub fn resume(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Extract, map and order. Every fatal error surfaces here, before the
    /// target is touched.
    async fn prepare(&self) -> Result<(SchemaSnapshot, MigrationPlan)> {
        info!("Extracting schema from {}", self.config.source.display_target());
        let snapshot = extract(
            self.source.as_ref(),
            &self.config.source.schemas,
            &self.config.migration,
        )
        .await?;
        info!(
            "Found {} tables and {} artifacts",
            snapshot.len(),
            snapshot.artifacts().len()
        );

        let mapper = TypeMapper::from_config(&self.config.migration)?;
        let snapshot = mapper.map_snapshot(snapshot)?;

        let plan = MigrationPlan::resolve(&snapshot)?;
        plan.validate()?;
        Ok((snapshot, plan))
    }

    fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            target_schema: self.config.target.schema.clone(),
            create_indexes: self.config.migration.create_indexes,
            create_foreign_keys: self.config.migration.create_foreign_keys,
        }
    }

    /// Open the checkpoint store and return it with the run id.
    async fn open_checkpoints(&self) -> Result<(Arc<dyn CheckpointStore>, String)> {
        let hash = self.config.resume_hash();
        match (&self.state_file, self.resume) {
            (Some(path), true) => {
                let store = FileCheckpointStore::resume(path, &hash).await?;
                let run_id = store.run_id().await;
                Ok((Arc::new(store), run_id))
            }
            (Some(path), false) => {
                let run_id = uuid::Uuid::new_v4().to_string();
                let store = FileCheckpointStore::create(path, run_id.clone(), hash).await?;
                Ok((Arc::new(store), run_id))
            }
            (None, true) => Err(MigrateError::Config(
                "resume requires a state file".into(),
            )),
            (None, false) => Ok((
                Arc::new(MemoryCheckpointStore::new()),
                uuid::Uuid::new_v4().to_string(),
            )),
        }
    }

    /// Dry run: plan and structure DDL without touching the target.
    pub async fn plan(&self) -> Result<PlanReport> {
        let (snapshot, plan) = self.prepare().await?;
        let applier = SchemaApplier::new(self.target.clone(), self.apply_options());
        let statements = applier
            .structure_statements(&snapshot, &plan)?
            .into_iter()
            .map(|s| s.sql)
            .collect();

        Ok(PlanReport {
            tables_total: snapshot.len(),
            waves: plan.waves().to_vec(),
            deferred_foreign_keys: plan.deferred().to_vec(),
            external_foreign_keys: plan.external().to_vec(),
            cycles: plan.cycles().to_vec(),
            statements,
            artifacts: snapshot.artifacts().len(),
        })
    }

    /// Run the migration.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MigrationReport> {
        let started_at = Utc::now();

        info!("Phase 1: Extracting, mapping and planning");
        let (snapshot, plan) = self.prepare().await?;
        let (checkpoints, run_id) = self.open_checkpoints().await?;
        debug!("Checkpoints kept in {} store", checkpoints.backend_type());
        info!(
            "Starting migration run {}: {} tables in {} waves",
            run_id,
            snapshot.len(),
            plan.waves().len()
        );

        info!("Phase 2: Creating target structure");
        let applier = SchemaApplier::new(self.target.clone(), self.apply_options());
        let structure = applier.apply_structure(&snapshot, &plan).await?;

        info!("Phase 3: Copying data");
        let reports = self
            .copy_waves(&snapshot, &plan, &structure, checkpoints.clone(), &cancel)
            .await?;
        let statuses: BTreeMap<String, TableStatus> = reports
            .iter()
            .map(|(name, r)| (name.clone(), r.status.clone()))
            .collect();

        let cancelled = cancel.is_cancelled();
        let (constraints, artifacts) = if cancelled {
            warn!("Cancelled: skipping constraints and artifact export");
            (Vec::new(), None)
        } else {
            info!("Phase 4: Creating indexes and foreign keys");
            let constraints = applier.apply_constraints(&snapshot, &plan, &statuses).await?;

            info!("Phase 5: Exporting artifacts");
            let exporter = ArtifactExporter::new(&self.config.migration.export_dir);
            (constraints, Some(exporter.export(snapshot.artifacts()).await))
        };

        let ordered = plan
            .tables()
            .filter_map(|name| reports.get(name).cloned())
            .collect();
        let report = MigrationReport::build(
            run_id,
            started_at,
            &plan,
            ordered,
            constraints,
            artifacts,
            cancelled,
        );

        checkpoints.mark_run(report.status).await?;
        if report.is_success() && self.config.migration.cleanup_checkpoints {
            info!("Removing checkpoints after successful run");
            checkpoints.clear_all().await?;
        }

        info!(
            "Migration {}: {}/{} tables committed, {} failed, {} skipped, {} rows in {:.1}s ({} rows/s)",
            run_status_to_str(report.status),
            report.tables_committed,
            report.tables_total,
            report.tables_failed,
            report.tables_skipped,
            report.rows_transferred,
            report.duration_seconds,
            report.rows_per_second
        );
        for name in report.rerun_candidates() {
            warn!("{}: not committed, rerun with resume", name);
        }

        Ok(report)
    }

    /// Copy every table wave by wave. Tables within a wave run in parallel on
    /// a bounded worker pool; the next wave starts when all have finished.
    async fn copy_waves(
        &self,
        snapshot: &SchemaSnapshot,
        plan: &MigrationPlan,
        structure: &StructureOutcome,
        checkpoints: Arc<dyn CheckpointStore>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, TableReport>> {
        let workers = self.config.migration.get_workers();
        let semaphore = Arc::new(Semaphore::new(workers));
        let engine = Arc::new(CopyEngine::new(
            self.source.clone(),
            self.target.clone(),
            checkpoints,
            CopyConfig::from_config(&self.config.migration),
        ));
        let dialect = self.target.dialect();

        let mut reports: BTreeMap<String, TableReport> = BTreeMap::new();

        for (wave_index, wave) in plan.waves().iter().enumerate() {
            info!("Wave {}: {} tables with {} workers", wave_index, wave.len(), workers);
            let (tx, mut rx) = mpsc::channel::<TableOutcome>(wave.len().max(1));

            for name in wave {
                let table = snapshot.table(name).ok_or_else(|| {
                    MigrateError::State(format!("planned table {} missing from snapshot", name))
                })?;
                let target_schema = self.config.target.schema_for(&table.schema).to_string();
                let target_name = dialect.qualify(&target_schema, &table.name);
                let not_copied = |status| {
                    TableReport::without_copy(name, target_name.clone(), wave_index, table.row_count, status)
                };

                if let Some(e) = structure.failed.get(name) {
                    reports.insert(name.clone(), not_copied(TableStatus::failed(e, 0)));
                    continue;
                }
                if let Some(ancestor) = blocking_ancestor(plan, name, &reports) {
                    let reason = MigrateError::SkippedDueToDependency {
                        table: name.clone(),
                        ancestor: ancestor.clone(),
                    };
                    warn!("{}", reason);
                    reports.insert(name.clone(), not_copied(TableStatus::Skipped { ancestor }));
                    continue;
                }
                if cancel.is_cancelled() {
                    let status = TableStatus::failed(&MigrateError::Cancelled, 0);
                    reports.insert(name.clone(), not_copied(status));
                    continue;
                }

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| MigrateError::pool(e, "acquiring worker slot"))?;
                let engine = engine.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                let table = table.clone();
                debug!("{}: starting copy into {}", name, target_name);

                tokio::spawn(async move {
                    let outcome = engine.copy_table(&table, &target_schema, &cancel).await;
                    drop(permit);
                    let _ = tx.send(outcome).await;
                });
            }
            drop(tx);

            while let Some(outcome) = rx.recv().await {
                let table = snapshot.table(&outcome.table);
                let target_name = table
                    .map(|t| dialect.qualify(self.config.target.schema_for(&t.schema), &t.name))
                    .unwrap_or_default();
                match &outcome.status {
                    TableStatus::Committed { rows } => info!("{}: completed ({} rows)", outcome.table, rows),
                    TableStatus::Failed { error, .. } => error!("{}: failed - {}", outcome.table, error),
                    _ => {}
                }
                reports.insert(
                    outcome.table.clone(),
                    TableReport {
                        table: outcome.table,
                        target: target_name,
                        wave: wave_index,
                        status: outcome.status,
                        expected_rows: outcome.expected_rows,
                        rows_copied: outcome.rows_copied,
                        batches: outcome.batches,
                        retries: outcome.retries,
                        resumed: outcome.resumed,
                        duration_seconds: outcome.elapsed.as_secs_f64(),
                    },
                );
            }

            // A worker that panicked never reports back.
            for name in wave {
                if !reports.contains_key(name) {
                    error!("{}: copy task aborted", name);
                    let e = MigrateError::structural(name, "copy task aborted");
                    let row_count = snapshot.table(name).map(|t| t.row_count).unwrap_or(0);
                    reports.insert(
                        name.clone(),
                        TableReport::without_copy(
                            name,
                            String::new(),
                            wave_index,
                            row_count,
                            TableStatus::failed(&e, 0),
                        ),
                    );
                }
            }
        }

        Ok(reports)
    }

    /// Compare source and target row counts for every selected table.
    pub async fn validate(&self) -> Result<Vec<RowCountCheck>> {
        let snapshot = extract(
            self.source.as_ref(),
            &self.config.source.schemas,
            &self.config.migration,
        )
        .await?;

        let mut results = Vec::new();
        for table in snapshot.tables() {
            let schema = self.config.target.schema_for(&table.schema);
            let target_rows = match self.target.row_count(schema, &table.name).await {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!("{}: cannot count target rows: {}", table.qualified_name(), e);
                    None
                }
            };
            let check = RowCountCheck {
                table: table.qualified_name(),
                source_rows: table.row_count,
                target_rows,
            };

            if check.matches() {
                info!("{}: {} rows (match)", check.table, check.source_rows);
            } else {
                warn!(
                    "{}: source={} target={:?} (MISMATCH)",
                    check.table, check.source_rows, check.target_rows
                );
            }
            results.push(check);
        }

        Ok(results)
    }

    /// Export artifacts only.
    pub async fn export_artifacts(&self) -> Result<ArtifactReport> {
        let snapshot = extract(
            self.source.as_ref(),
            &self.config.source.schemas,
            &self.config.migration,
        )
        .await?;
        let exporter = ArtifactExporter::new(&self.config.migration.export_dir);
        Ok(exporter.export(snapshot.artifacts()).await)
    }
}

/// First non-deferred parent of `table` that did not commit, or the table
/// that parent was skipped because of.
fn blocking_ancestor(
    plan: &MigrationPlan,
    table: &str,
    reports: &BTreeMap<String, TableReport>,
) -> Option<String> {
    plan.dependencies(table).find_map(|parent| match reports.get(parent).map(|r| &r.status) {
        Some(TableStatus::Committed { .. }) => None,
        Some(TableStatus::Skipped { ancestor }) => Some(ancestor.clone()),
        _ => Some(parent.clone()),
    })
}
