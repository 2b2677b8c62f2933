//! Fakes for integration tests, built only on the public API.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use pg_mssql_migrate::core::{
    qualified_name, ArtifactDescriptor, BatchRequest, Boundary, ColumnDescriptor, DdlKind,
    DdlStatement, ForeignKeyDescriptor, ForeignKeyTarget, IndexDescriptor, KeyValue,
    PrimaryKeyDescriptor, Row, SourceReader, SourceType, TableDescriptor, TargetWriter,
    WriteTarget,
};
use pg_mssql_migrate::dialect::{Dialect, MssqlDialect};
use pg_mssql_migrate::{Config, MigrateError, Result};

pub fn config(dir: &Path, extra_migration: &str) -> Config {
    let yaml = format!(
        r#"
source:
  host: pg.internal
  database: inventory
  user: reader
target:
  host: mssql.internal
  database: inventory
  user: loader
  schema: dbo
migration:
  workers: 3
  batch_size: 10
  max_retries: 3
  retry_base_delay_ms: 1
  retry_max_delay_ms: 2
{}
"#,
        extra_migration
    );
    let mut config = Config::from_yaml(&yaml).expect("valid test config");
    config.migration.export_dir = dir.join("export");
    config
}

pub fn table(name: &str, columns: &[(&str, SourceType)], key: &[&str]) -> TableDescriptor {
    let mut t = TableDescriptor::new("public", name);
    t.columns = columns
        .iter()
        .enumerate()
        .map(|(i, (c, ty))| ColumnDescriptor::new(*c, i as u32 + 1, ty.clone()))
        .collect();
    if !key.is_empty() {
        t.primary_key = Some(PrimaryKeyDescriptor {
            name: format!("{}_pkey", name),
            columns: key.iter().map(|k| k.to_string()).collect(),
        });
    }
    t
}

pub fn fk(name: &str, column: &str, ref_table: &str) -> ForeignKeyDescriptor {
    ForeignKeyDescriptor {
        name: name.into(),
        columns: vec![column.into()],
        ref_schema: "public".into(),
        ref_table: ref_table.into(),
        ref_columns: vec!["id".into()],
        on_delete: "CASCADE".into(),
        on_update: "NO_ACTION".into(),
        target: ForeignKeyTarget::Internal,
    }
}

pub fn index(name: &str, column: &str) -> IndexDescriptor {
    IndexDescriptor {
        name: name.into(),
        columns: vec![column.into()],
        is_unique: false,
    }
}

fn key_of(table: &TableDescriptor, row: &Row) -> Vec<KeyValue> {
    table
        .key_positions()
        .into_iter()
        .filter_map(|i| KeyValue::from_sql_value(&row[i]))
        .collect()
}

/// Source whose rows are held in key order. Reads can be made to fail
/// structurally from a given read onwards.
pub struct ScriptedSource {
    tables: BTreeMap<String, (TableDescriptor, Vec<Row>)>,
    artifacts: Vec<ArtifactDescriptor>,
    fail_from_read: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<(String, Option<Boundary>)>>,
}

impl ScriptedSource {
    pub fn new(tables: Vec<(TableDescriptor, Vec<Row>)>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|(t, rows)| (t.qualified_name(), (t, rows)))
                .collect(),
            artifacts: Vec::new(),
            fail_from_read: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactDescriptor>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Reads of `table` numbered `read` (1-based) and later fail.
    pub fn fail_from_read(&self, table: &str, read: usize) {
        self.fail_from_read
            .lock()
            .unwrap()
            .insert(table.to_string(), read);
    }

    /// Boundaries requested for `table`, in order.
    pub fn requests(&self, table: &str) -> Vec<Option<Boundary>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, b)| b.clone())
            .collect()
    }

    fn entry(&self, schema: &str, table: &str) -> Result<&(TableDescriptor, Vec<Row>)> {
        self.tables
            .get(&qualified_name(schema, table))
            .ok_or_else(|| MigrateError::Extraction(format!("unknown table {}.{}", schema, table)))
    }
}

#[async_trait]
impl SourceReader for ScriptedSource {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .values()
            .filter(|(t, _)| t.schema == schema)
            .map(|(t, _)| t.name.clone())
            .collect())
    }

    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        Ok(self.entry(schema, table)?.0.columns.clone())
    }

    async fn primary_key(&self, schema: &str, table: &str) -> Result<Option<PrimaryKeyDescriptor>> {
        Ok(self.entry(schema, table)?.0.primary_key.clone())
    }

    async fn indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexDescriptor>> {
        Ok(self.entry(schema, table)?.0.indexes.clone())
    }

    async fn foreign_keys(&self, schema: &str, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        Ok(self.entry(schema, table)?.0.foreign_keys.clone())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<u64> {
        Ok(self.entry(schema, table)?.1.len() as u64)
    }

    async fn artifacts(&self, schema: &str) -> Result<Vec<ArtifactDescriptor>> {
        Ok(self
            .artifacts
            .iter()
            .filter(|a| a.schema == schema)
            .cloned()
            .collect())
    }

    async fn read_batch(&self, request: BatchRequest<'_>) -> Result<Vec<Row>> {
        let name = request.table.qualified_name();
        let read = {
            let mut requests = self.requests.lock().unwrap();
            requests.push((name.clone(), request.after.cloned()));
            requests.iter().filter(|(t, _)| *t == name).count()
        };
        if let Some(from) = self.fail_from_read.lock().unwrap().get(&name) {
            if read >= *from {
                return Err(MigrateError::structural(&name, "relation is locked for maintenance"));
            }
        }

        let (table, rows) = self.entry(&request.table.schema, &request.table.name)?;
        let start = match request.after {
            None => 0,
            Some(Boundary::Offset(n)) => *n as usize,
            Some(Boundary::Key(key)) => rows
                .iter()
                .position(|r| &key_of(table, r) == key)
                .map_or(rows.len(), |p| p + 1),
        };
        let end = (start + request.limit).min(rows.len());
        Ok(rows.get(start..end).map(<[Row]>::to_vec).unwrap_or_default())
    }

    fn db_type(&self) -> &str {
        "scripted"
    }
}

/// Target that upserts by key, logs DDL and can reject writes transiently.
#[derive(Default)]
pub struct RecordingTarget {
    dialect: MssqlDialect,
    ddl: Mutex<Vec<DdlStatement>>,
    tables: Mutex<BTreeMap<String, BTreeMap<String, Row>>>,
    keyless: Mutex<BTreeMap<String, Vec<Row>>>,
    reject_writes: Mutex<HashMap<String, u32>>,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `times` writes to `schema.table` as a deadlock.
    pub fn reject_writes(&self, table: &str, times: u32) {
        self.reject_writes
            .lock()
            .unwrap()
            .insert(table.to_string(), times);
    }

    pub fn ddl(&self) -> Vec<DdlStatement> {
        self.ddl.lock().unwrap().clone()
    }

    pub fn ddl_kinds(&self) -> Vec<DdlKind> {
        self.ddl().iter().map(|d| d.kind).collect()
    }

    pub fn row_count_of(&self, table: &str) -> usize {
        self.tables.lock().unwrap().get(table).map_or(0, BTreeMap::len)
            + self.keyless.lock().unwrap().get(table).map_or(0, Vec::len)
    }

    /// Keyed rows sorted by rendered key.
    pub fn keyed_rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn admit(&self, table: &str) -> Result<()> {
        if let Some(left) = self.reject_writes.lock().unwrap().get_mut(table) {
            if *left > 0 {
                *left -= 1;
                return Err(MigrateError::transient(table, "deadlock victim, rerun the transaction"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TargetWriter for RecordingTarget {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()> {
        self.ddl.lock().unwrap().push(statement.clone());
        Ok(())
    }

    async fn upsert_batch(&self, target: WriteTarget<'_>, rows: &[Row]) -> Result<u64> {
        let name = qualified_name(target.schema, &target.table.name);
        self.admit(&name)?;
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(name).or_default();
        for row in rows {
            stored.insert(format!("{:?}", key_of(target.table, row)), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_batch(&self, target: WriteTarget<'_>, rows: &[Row]) -> Result<u64> {
        let name = qualified_name(target.schema, &target.table.name);
        self.admit(&name)?;
        self.keyless
            .lock()
            .unwrap()
            .entry(name)
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn truncate_table(&self, schema: &str, table: &str) -> Result<()> {
        let name = qualified_name(schema, table);
        self.tables.lock().unwrap().remove(&name);
        self.keyless.lock().unwrap().remove(&name);
        Ok(())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<u64> {
        Ok(self.row_count_of(&qualified_name(schema, table)) as u64)
    }

    fn db_type(&self) -> &str {
        "recording"
    }
}
