//! In-memory source and target used by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::schema::{
    qualified_name, ArtifactDescriptor, Boundary, ColumnDescriptor, ForeignKeyDescriptor,
    ForeignKeyTarget, IndexDescriptor, KeyValue, PrimaryKeyDescriptor, SourceType,
    TableDescriptor,
};
use crate::core::traits::{BatchRequest, DdlStatement, SourceReader, TargetWriter, WriteTarget};
use crate::core::value::{Row, SqlValue};
use crate::dialect::{Dialect, MssqlDialect};
use crate::error::{MigrateError, Result};

/// Configuration targeting schema `dbo` with small batches and fast
/// retries. Artifacts go to `<dir>/artifacts`.
pub fn config(dir: &Path) -> Config {
    let mut config = Config::from_yaml(
        r#"
source:
  host: localhost
  database: shop
  user: migrator
target:
  host: localhost
  database: shop
  user: sa
  schema: dbo
migration:
  workers: 2
  batch_size: 1000
  max_retries: 2
  retry_base_delay_ms: 1
  retry_max_delay_ms: 5
"#,
    )
    .unwrap();
    config.migration.export_dir = dir.join("artifacts");
    config
}

/// `customers(id, name)` and `orders(id, customer_id, total)` with an FK from
/// orders to customers and an index on `orders.customer_id`.
pub fn customers_orders(customers: i32, orders: i64) -> Vec<(TableDescriptor, Vec<Row>)> {
    let mut c = TableDescriptor::new("public", "customers");
    c.columns = vec![
        ColumnDescriptor::new("id", 1, SourceType::new("int4").identity()),
        ColumnDescriptor::new("name", 2, SourceType::new("varchar").with_length(100).not_null()),
    ];
    c.primary_key = Some(PrimaryKeyDescriptor {
        name: "customers_pkey".into(),
        columns: vec!["id".into()],
    });
    let c_rows = (1..=customers)
        .map(|i| vec![SqlValue::I32(i), SqlValue::Text(format!("customer {}", i))])
        .collect();

    let mut o = TableDescriptor::new("public", "orders");
    o.columns = vec![
        ColumnDescriptor::new("id", 1, SourceType::new("int8").identity()),
        ColumnDescriptor::new("customer_id", 2, SourceType::new("int4").not_null()),
        ColumnDescriptor::new("total", 3, SourceType::new("numeric").with_precision(12, 2)),
    ];
    o.primary_key = Some(PrimaryKeyDescriptor {
        name: "orders_pkey".into(),
        columns: vec!["id".into()],
    });
    o.indexes = vec![IndexDescriptor {
        name: "orders_customer_idx".into(),
        columns: vec!["customer_id".into()],
        is_unique: false,
    }];
    o.foreign_keys = vec![foreign_key("orders_customer_fk", "customer_id", "customers", "id")];
    let o_rows = (1..=orders)
        .map(|j| {
            let customer = ((j - 1) % i64::from(customers.max(1))) as i32 + 1;
            vec![
                SqlValue::I64(j),
                SqlValue::I32(customer),
                SqlValue::Decimal(Decimal::new(j * 100 + 99, 2)),
            ]
        })
        .collect();

    vec![(c, c_rows), (o, o_rows)]
}

pub fn foreign_key(name: &str, column: &str, ref_table: &str, ref_column: &str) -> ForeignKeyDescriptor {
    ForeignKeyDescriptor {
        name: name.into(),
        columns: vec![column.into()],
        ref_schema: "public".into(),
        ref_table: ref_table.into(),
        ref_columns: vec![ref_column.into()],
        on_delete: "NO_ACTION".into(),
        on_update: "NO_ACTION".into(),
        target: ForeignKeyTarget::Internal,
    }
}

/// Single-column keyed table `public.<name>(id int8, v text)` with `rows` rows.
pub fn numbered_table(name: &str, rows: i64) -> (TableDescriptor, Vec<Row>) {
    let mut t = TableDescriptor::new("public", name);
    t.columns = vec![
        ColumnDescriptor::new("id", 1, SourceType::new("int8").not_null()),
        ColumnDescriptor::new("v", 2, SourceType::new("text")),
    ];
    t.primary_key = Some(PrimaryKeyDescriptor {
        name: format!("{}_pkey", name),
        columns: vec!["id".into()],
    });
    let data = (1..=rows)
        .map(|i| vec![SqlValue::I64(i), SqlValue::Text(format!("row {}", i))])
        .collect();
    (t, data)
}

/// Mapped copy of a descriptor with `row_count` set from its rows.
pub fn mapped(table: &TableDescriptor, rows: usize) -> TableDescriptor {
    let mapper = crate::typemap::TypeMapper::new().allow_narrowing(true);
    let mut t = table.clone();
    t.row_count = rows as u64;
    for c in &mut t.columns {
        let path = format!("{}.{}", table.qualified_name(), c.name);
        c.target = mapper.map(&path, &c.source).ok().map(|m| m.target);
    }
    t
}

fn key_of(table: &TableDescriptor, row: &Row) -> Vec<KeyValue> {
    table
        .key_positions()
        .into_iter()
        .filter_map(|i| KeyValue::from_sql_value(&row[i]))
        .collect()
}

/// Source with rows held in key order.
pub struct MemorySource {
    tables: BTreeMap<String, (TableDescriptor, Vec<Row>)>,
    artifacts: Vec<ArtifactDescriptor>,
    transient: Mutex<HashMap<String, u32>>,
    structural: Mutex<HashSet<String>>,
    reads: AtomicUsize,
}

impl MemorySource {
    pub fn new(tables: Vec<(TableDescriptor, Vec<Row>)>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|(mut t, rows)| {
                    t.row_count = rows.len() as u64;
                    (t.qualified_name(), (t, rows))
                })
                .collect(),
            artifacts: Vec::new(),
            transient: Mutex::new(HashMap::new()),
            structural: Mutex::new(HashSet::new()),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactDescriptor>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Fail the next `times` reads of `table` with a transient error.
    pub fn fail_transient(&self, table: &str, times: u32) {
        self.transient.lock().unwrap().insert(table.to_string(), times);
    }

    /// Fail every read of `table` with a structural error.
    pub fn fail_structural(&self, table: &str) {
        self.structural.lock().unwrap().insert(table.to_string());
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn get(&self, schema: &str, table: &str) -> Result<&(TableDescriptor, Vec<Row>)> {
        self.tables
            .get(&qualified_name(schema, table))
            .ok_or_else(|| MigrateError::Extraction(format!("no table {}.{}", schema, table)))
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .values()
            .filter(|(t, _)| t.schema == schema)
            .map(|(t, _)| t.name.clone())
            .collect())
    }

    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        Ok(self.get(schema, table)?.0.columns.clone())
    }

    async fn primary_key(&self, schema: &str, table: &str) -> Result<Option<PrimaryKeyDescriptor>> {
        Ok(self.get(schema, table)?.0.primary_key.clone())
    }

    async fn indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexDescriptor>> {
        Ok(self.get(schema, table)?.0.indexes.clone())
    }

    async fn foreign_keys(&self, schema: &str, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        Ok(self.get(schema, table)?.0.foreign_keys.clone())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<u64> {
        Ok(self.get(schema, table)?.1.len() as u64)
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
        self.reads.fetch_add(1, Ordering::SeqCst);
        let name = request.table.qualified_name();

        if self.structural.lock().unwrap().contains(&name) {
            return Err(MigrateError::structural(&name, "permission denied"));
        }
        if let Some(left) = self.transient.lock().unwrap().get_mut(&name) {
            if *left > 0 {
                *left -= 1;
                return Err(MigrateError::transient(&name, "connection reset"));
            }
        }

        let (table, rows) = self.get(&request.table.schema, &request.table.name)?;
        let start = match request.after {
            None => 0,
            Some(Boundary::Offset(n)) => *n as usize,
            Some(Boundary::Key(key)) => rows
                .iter()
                .position(|r| &key_of(table, r) == key)
                .map(|p| p + 1)
                .unwrap_or(rows.len()),
        };
        let end = (start + request.limit).min(rows.len());
        Ok(rows.get(start..end).map(|s| s.to_vec()).unwrap_or_default())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

#[derive(Default)]
struct TargetTable {
    rows: Vec<Row>,
    /// Row position by rendered key, for upserts.
    by_key: HashMap<String, usize>,
}

/// Target that keeps rows per `schema.table` and records DDL.
pub struct MemoryTarget {
    dialect: MssqlDialect,
    ddl: Mutex<Vec<DdlStatement>>,
    tables: Mutex<BTreeMap<String, TargetTable>>,
    failing_ddl: Mutex<HashSet<String>>,
    transient: Mutex<HashMap<String, u32>>,
    writes: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self {
            dialect: MssqlDialect,
            ddl: Mutex::new(Vec::new()),
            tables: Mutex::new(BTreeMap::new()),
            failing_ddl: Mutex::new(HashSet::new()),
            transient: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
        }
    }

    /// Cancel `token` once the `writes`-th write is accepted. That batch
    /// still commits.
    pub fn cancel_after_writes(&self, writes: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((writes, token));
    }

    /// Fail DDL whose object or owning table equals `name`.
    pub fn fail_ddl(&self, name: &str) {
        self.failing_ddl.lock().unwrap().insert(name.to_string());
    }

    /// Fail the next `times` writes to target table `schema.table`.
    pub fn fail_writes(&self, table: &str, times: u32) {
        self.transient.lock().unwrap().insert(table.to_string(), times);
    }

    pub fn executed(&self) -> Vec<DdlStatement> {
        self.ddl.lock().unwrap().clone()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_write(&self, name: &str) -> Result<()> {
        let count = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &*self.cancel_after.lock().unwrap() {
            if count == *after {
                token.cancel();
            }
        }
        if let Some(left) = self.transient.lock().unwrap().get_mut(name) {
            if *left > 0 {
                *left -= 1;
                return Err(MigrateError::transient(name, "deadlock victim"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TargetWriter for MemoryTarget {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()> {
        let failing = self.failing_ddl.lock().unwrap();
        if failing.contains(&statement.object) || failing.contains(&statement.table) {
            return Err(MigrateError::Target(tiberius::error::Error::Protocol(
                format!("cannot create {}", statement.object).into(),
            )));
        }
        drop(failing);
        self.ddl.lock().unwrap().push(statement.clone());
        Ok(())
    }

    async fn upsert_batch(&self, target: WriteTarget<'_>, rows: &[Row]) -> Result<u64> {
        let name = qualified_name(target.schema, &target.table.name);
        self.check_write(&name)?;
        let mut tables = self.tables.lock().unwrap();
        let existing = tables.entry(name).or_default();
        for row in rows {
            let key = format!("{:?}", key_of(target.table, row));
            match existing.by_key.get(&key) {
                Some(&pos) => existing.rows[pos] = row.clone(),
                None => {
                    existing.by_key.insert(key, existing.rows.len());
                    existing.rows.push(row.clone());
                }
            }
        }
        Ok(rows.len() as u64)
    }

    async fn insert_batch(&self, target: WriteTarget<'_>, rows: &[Row]) -> Result<u64> {
        let name = qualified_name(target.schema, &target.table.name);
        self.check_write(&name)?;
        self.tables
            .lock()
            .unwrap()
            .entry(name)
            .or_default()
            .rows
            .extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn truncate_table(&self, schema: &str, table: &str) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .insert(qualified_name(schema, table), TargetTable::default());
        Ok(())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<u64> {
        Ok(self.rows(&qualified_name(schema, table)).len() as u64)
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}
