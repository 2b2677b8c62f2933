//! Target schema creation in two phases.
//!
//! The structure phase creates schemas and tables (columns and primary keys
//! only) before any data moves. The constraint phase runs after the copy and
//! adds indexes and foreign keys, but only between tables whose data
//! committed. Every statement is guarded, so re-applying is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::schema::{ForeignKeyDescriptor, IndexDescriptor, SchemaSnapshot, TableDescriptor};
use crate::core::status::TableStatus;
use crate::core::traits::{DdlKind, DdlStatement, TargetWriter};
use crate::error::{MigrateError, Result};
use crate::plan::MigrationPlan;

/// Applier settings.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Put every table in this target schema instead of its source schema.
    pub target_schema: Option<String>,
    pub create_indexes: bool,
    pub create_foreign_keys: bool,
}

impl ApplyOptions {
    pub fn target_schema_for<'a>(&'a self, source_schema: &'a str) -> &'a str {
        self.target_schema.as_deref().unwrap_or(source_schema)
    }
}

/// Result of the structure phase.
#[derive(Debug, Default)]
pub struct StructureOutcome {
    /// Tables created (or already present), in plan order.
    pub created: Vec<String>,
    /// Tables whose schema or table DDL failed.
    pub failed: BTreeMap<String, MigrateError>,
}

impl StructureOutcome {
    pub fn is_created(&self, table: &str) -> bool {
        !self.failed.contains_key(table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Index,
    ForeignKey,
    /// Self reference or cycle break, created after every table is loaded.
    DeferredForeignKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConstraintOutcome {
    Created,
    Skipped { reason: String },
    Failed { error: String },
}

/// One index or foreign key handled by the constraint phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintResult {
    /// Qualified source table name.
    pub table: String,
    /// Source constraint or index name.
    pub name: String,
    pub kind: ConstraintKind,
    #[serde(flatten)]
    pub outcome: ConstraintOutcome,
}

impl ConstraintResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ConstraintOutcome::Failed { .. })
    }
}

/// Creates target schemas, tables and constraints.
pub struct SchemaApplier {
    target: Arc<dyn TargetWriter>,
    options: ApplyOptions,
}

impl SchemaApplier {
    pub fn new(target: Arc<dyn TargetWriter>, options: ApplyOptions) -> Self {
        Self { target, options }
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    /// Render the structure-phase statements without executing them.
    pub fn structure_statements(
        &self,
        snapshot: &SchemaSnapshot,
        plan: &MigrationPlan,
    ) -> Result<Vec<DdlStatement>> {
        let dialect = self.target.dialect();
        let mut statements: Vec<DdlStatement> = self
            .target_schemas(snapshot)
            .into_iter()
            .map(|schema| DdlStatement {
                kind: DdlKind::Schema,
                table: String::new(),
                object: schema.clone(),
                sql: dialect.create_schema(&schema),
            })
            .collect();

        for name in plan.tables() {
            let table = lookup(snapshot, name)?;
            let schema = self.options.target_schema_for(&table.schema);
            statements.push(DdlStatement {
                kind: DdlKind::Table,
                table: name.clone(),
                object: dialect.qualify(schema, &table.name),
                sql: dialect.create_table(schema, table)?,
            });
        }
        Ok(statements)
    }

    fn target_schemas(&self, snapshot: &SchemaSnapshot) -> BTreeSet<String> {
        snapshot
            .tables()
            .map(|t| self.options.target_schema_for(&t.schema).to_string())
            .collect()
    }

    /// Create target schemas, then every table in plan order. A failing
    /// table does not stop the others.
    pub async fn apply_structure(
        &self,
        snapshot: &SchemaSnapshot,
        plan: &MigrationPlan,
    ) -> Result<StructureOutcome> {
        let dialect = self.target.dialect();
        let mut outcome = StructureOutcome::default();

        let mut failed_schemas: BTreeMap<String, String> = BTreeMap::new();
        for schema in self.target_schemas(snapshot) {
            let statement = DdlStatement {
                kind: DdlKind::Schema,
                table: String::new(),
                object: schema.clone(),
                sql: dialect.create_schema(&schema),
            };
            if let Err(e) = self.target.execute_ddl(&statement).await {
                error!("Failed to create schema {}: {}", schema, e);
                failed_schemas.insert(schema, e.to_string());
            }
        }

        for name in plan.tables() {
            let table = lookup(snapshot, name)?;
            let schema = self.options.target_schema_for(&table.schema);

            if let Some(message) = failed_schemas.get(schema) {
                outcome.failed.insert(
                    name.clone(),
                    MigrateError::schema_apply(name, schema, message),
                );
                continue;
            }

            let result = match dialect.create_table(schema, table) {
                Ok(sql) => {
                    let statement = DdlStatement {
                        kind: DdlKind::Table,
                        table: name.clone(),
                        object: dialect.qualify(schema, &table.name),
                        sql,
                    };
                    debug!("{}", statement.sql);
                    self.target.execute_ddl(&statement).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => outcome.created.push(name.clone()),
                Err(e) => {
                    error!("Failed to create table {}: {}", name, e);
                    outcome
                        .failed
                        .insert(name.clone(), MigrateError::schema_apply(name, "table", e));
                }
            }
        }

        info!(
            "Structure phase: {} tables created, {} failed",
            outcome.created.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    /// Create indexes, then regular foreign keys in plan order, then deferred
    /// foreign keys. Only committed tables get constraints.
    pub async fn apply_constraints(
        &self,
        snapshot: &SchemaSnapshot,
        plan: &MigrationPlan,
        statuses: &BTreeMap<String, TableStatus>,
    ) -> Result<Vec<ConstraintResult>> {
        let committed = |t: &str| statuses.get(t).is_some_and(TableStatus::is_committed);
        let mut results = Vec::new();

        if self.options.create_indexes {
            for name in plan.tables() {
                let table = lookup(snapshot, name)?;
                for index in &table.indexes {
                    let outcome = if committed(name) {
                        self.create_index(table, index).await
                    } else {
                        skipped(format!("table {} did not commit", name))
                    };
                    results.push(ConstraintResult {
                        table: name.clone(),
                        name: index.name.clone(),
                        kind: ConstraintKind::Index,
                        outcome,
                    });
                }
            }
        }

        if self.options.create_foreign_keys {
            let mut deferred = Vec::new();
            for name in plan.tables() {
                let table = lookup(snapshot, name)?;
                for fk in &table.foreign_keys {
                    if fk.is_external() || !snapshot.contains(&fk.referenced()) {
                        results.push(ConstraintResult {
                            table: name.clone(),
                            name: fk.name.clone(),
                            kind: ConstraintKind::ForeignKey,
                            outcome: skipped(format!(
                                "references {} outside the migrated set",
                                fk.referenced()
                            )),
                        });
                    } else if plan.is_deferred(name, &fk.name) {
                        deferred.push((table, fk));
                    } else {
                        let outcome = self.create_foreign_key(table, fk, true, &committed).await;
                        results.push(ConstraintResult {
                            table: name.clone(),
                            name: fk.name.clone(),
                            kind: ConstraintKind::ForeignKey,
                            outcome,
                        });
                    }
                }
            }

            for (table, fk) in deferred {
                let with_actions = !has_actions(fk);
                if !with_actions {
                    warn!(
                        "{}: deferred foreign key {} created without ON DELETE/ON UPDATE actions",
                        table.qualified_name(),
                        fk.name
                    );
                }
                let outcome = self.create_foreign_key(table, fk, with_actions, &committed).await;
                results.push(ConstraintResult {
                    table: table.qualified_name(),
                    name: fk.name.clone(),
                    kind: ConstraintKind::DeferredForeignKey,
                    outcome,
                });
            }
        }

        let failed = results.iter().filter(|r| r.is_failed()).count();
        let created = results
            .iter()
            .filter(|r| r.outcome == ConstraintOutcome::Created)
            .count();
        info!(
            "Constraint phase: {} created, {} skipped, {} failed",
            created,
            results.len() - created - failed,
            failed
        );
        Ok(results)
    }

    async fn create_index(
        &self,
        table: &TableDescriptor,
        index: &IndexDescriptor,
    ) -> ConstraintOutcome {
        let dialect = self.target.dialect();
        let schema = self.options.target_schema_for(&table.schema);
        let statement = DdlStatement {
            kind: DdlKind::Index,
            table: table.qualified_name(),
            object: dialect.index_name(schema, table, index),
            sql: dialect.create_index(schema, table, index),
        };
        self.execute(statement).await
    }

    async fn create_foreign_key(
        &self,
        table: &TableDescriptor,
        fk: &ForeignKeyDescriptor,
        with_actions: bool,
        committed: &impl Fn(&str) -> bool,
    ) -> ConstraintOutcome {
        let name = table.qualified_name();
        let parent = fk.referenced();
        if !committed(&name) {
            return skipped(format!("table {} did not commit", name));
        }
        if !committed(&parent) {
            return skipped(format!("referenced table {} did not commit", parent));
        }

        let dialect = self.target.dialect();
        let schema = self.options.target_schema_for(&table.schema);
        let ref_schema = self.options.target_schema_for(&fk.ref_schema);
        let statement = DdlStatement {
            kind: DdlKind::ForeignKey,
            table: name,
            object: dialect.foreign_key_name(schema, table, fk),
            sql: dialect.create_foreign_key(schema, table, fk, ref_schema, with_actions),
        };
        self.execute(statement).await
    }

    async fn execute(&self, statement: DdlStatement) -> ConstraintOutcome {
        debug!("{}", statement.sql);
        match self.target.execute_ddl(&statement).await {
            Ok(()) => ConstraintOutcome::Created,
            Err(e) => {
                let e = MigrateError::schema_apply(&statement.table, &statement.object, e);
                error!("{}", e);
                ConstraintOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

fn lookup<'a>(snapshot: &'a SchemaSnapshot, name: &str) -> Result<&'a TableDescriptor> {
    snapshot
        .table(name)
        .ok_or_else(|| MigrateError::UnresolvableDependency(format!("{} is not in the snapshot", name)))
}

fn skipped(reason: String) -> ConstraintOutcome {
    ConstraintOutcome::Skipped { reason }
}

/// Whether the key declares cascading or set-null/default actions.
fn has_actions(fk: &ForeignKeyDescriptor) -> bool {
    let active = |action: &str| {
        !matches!(
            action.to_uppercase().replace(' ', "_").as_str(),
            "" | "NO_ACTION" | "RESTRICT"
        )
    };
    active(&fk.on_delete) || active(&fk.on_update)
}
