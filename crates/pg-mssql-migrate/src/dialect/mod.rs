//! Target SQL dialects.
//!
//! A [`Dialect`] renders every statement the engine sends to the target:
//! guarded DDL for the schema applier and batched upsert/insert statements
//! for the copy engine. Rendering is pure so it can be tested without a
//! database.

mod mssql;

pub use mssql::MssqlDialect;

use crate::core::schema::{ForeignKeyDescriptor, IndexDescriptor, TableDescriptor};
use crate::error::Result;

/// SQL syntax for one target database.
pub trait Dialect: Send + Sync {
    /// Get the dialect identifier (e.g., "mssql").
    fn name(&self) -> &str;

    /// Quote an identifier (table name, column name, etc.).
    fn quote_ident(&self, name: &str) -> String;

    /// `schema.table` with both parts quoted.
    fn qualify(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }

    /// Parameter placeholder for the given 1-based index.
    fn param_placeholder(&self, index: usize) -> String;

    /// Maximum bound parameters per statement.
    fn max_params(&self) -> usize;

    /// Create a schema unless it exists.
    fn create_schema(&self, schema: &str) -> String;

    /// Create a table with columns and primary key unless it exists.
    /// Fails when a column has no target type.
    fn create_table(&self, schema: &str, table: &TableDescriptor) -> Result<String>;

    /// Deterministic target name for a secondary index.
    fn index_name(&self, schema: &str, table: &TableDescriptor, index: &IndexDescriptor) -> String;

    /// Create a secondary index unless it exists.
    fn create_index(&self, schema: &str, table: &TableDescriptor, index: &IndexDescriptor) -> String;

    /// Deterministic target name for a foreign key.
    fn foreign_key_name(
        &self,
        schema: &str,
        table: &TableDescriptor,
        fk: &ForeignKeyDescriptor,
    ) -> String;

    /// Add a foreign key unless it exists. With `with_actions == false`
    /// referential actions are dropped (cyclic cascade paths are rejected by
    /// some targets).
    fn create_foreign_key(
        &self,
        schema: &str,
        table: &TableDescriptor,
        fk: &ForeignKeyDescriptor,
        ref_schema: &str,
        with_actions: bool,
    ) -> String;

    /// Keyed upsert of `rows` rows, parameters bound row-major in column order.
    fn build_upsert(&self, schema: &str, table: &TableDescriptor, rows: usize) -> String;

    /// Plain insert of `rows` rows, parameters bound row-major in column order.
    fn build_insert(&self, schema: &str, table: &TableDescriptor, rows: usize) -> String;

    /// Rows per statement so that `rows * columns` stays within [`Dialect::max_params`].
    fn rows_per_statement(&self, columns: usize) -> usize {
        (self.max_params() / columns.max(1)).clamp(1, 1000)
    }
}
