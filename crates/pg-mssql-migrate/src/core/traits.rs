//! Collaborator traits for the source and target databases.
//!
//! The engine only talks to these traits. `drivers::postgres::PostgresReader`
//! and `drivers::mssql::MssqlWriter` implement them against real databases;
//! tests plug in in-memory fakes.

use async_trait::async_trait;

use crate::core::schema::{
    ArtifactDescriptor, Boundary, ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor,
    PrimaryKeyDescriptor, TableDescriptor,
};
use crate::core::value::Row;
use crate::dialect::Dialect;
use crate::error::Result;

/// One page of rows to read from the source.
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    pub table: &'a TableDescriptor,
    /// Resume position. `None` reads from the first row.
    pub after: Option<&'a Boundary>,
    pub limit: usize,
}

/// Read-only access to the source catalog and rows.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Base tables of a schema, sorted by name.
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    /// Columns in ordinal order.
    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>>;

    async fn primary_key(&self, schema: &str, table: &str)
        -> Result<Option<PrimaryKeyDescriptor>>;

    /// Non-primary-key indexes.
    async fn indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexDescriptor>>;

    /// Foreign keys declared on the table. The reader reports them as internal;
    /// the extractor decides which ones point outside the migrated set.
    async fn foreign_keys(&self, schema: &str, table: &str) -> Result<Vec<ForeignKeyDescriptor>>;

    /// Exact row count.
    async fn row_count(&self, schema: &str, table: &str) -> Result<u64>;

    /// Views, functions, procedures and triggers of a schema.
    async fn artifacts(&self, schema: &str) -> Result<Vec<ArtifactDescriptor>>;

    /// Read up to `limit` rows after the boundary in ordering-key order.
    /// Values come back in [`TableDescriptor::columns`] order.
    async fn read_batch(&self, request: BatchRequest<'_>) -> Result<Vec<Row>>;

    /// Get the database type identifier.
    fn db_type(&self) -> &str;
}

/// Kind of DDL statement, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlKind {
    Schema,
    Table,
    Index,
    ForeignKey,
}

/// A rendered DDL statement and the object it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlStatement {
    pub kind: DdlKind,
    /// Qualified source table name the statement belongs to.
    pub table: String,
    /// Constraint, index or table name.
    pub object: String,
    pub sql: String,
}

/// Where a batch is written.
#[derive(Debug, Clone, Copy)]
pub struct WriteTarget<'a> {
    /// Target schema name.
    pub schema: &'a str,
    /// Mapped descriptor: columns carry target types.
    pub table: &'a TableDescriptor,
}

/// Write access to the target database.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// SQL dialect used to render DDL for this target.
    fn dialect(&self) -> &dyn Dialect;

    /// Execute one DDL statement.
    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()>;

    /// Upsert rows keyed on the primary key inside one transaction.
    /// Either all rows commit or none do.
    async fn upsert_batch(&self, target: WriteTarget<'_>, rows: &[Row]) -> Result<u64>;

    /// Plain insert inside one transaction, for tables without a key.
    async fn insert_batch(&self, target: WriteTarget<'_>, rows: &[Row]) -> Result<u64>;

    /// Remove all rows from a target table.
    async fn truncate_table(&self, schema: &str, table: &str) -> Result<()>;

    /// Exact row count of a target table.
    async fn row_count(&self, schema: &str, table: &str) -> Result<u64>;

    /// Get the database type identifier.
    fn db_type(&self) -> &str;
}
