//! SQL Server dialect.
//!
//! Every DDL statement is guarded with an existence check so the schema
//! applier can be re-run against a partially migrated target.

use sha2::{Digest, Sha256};

use super::Dialect;
use crate::core::schema::{
    ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, TableDescriptor, TypeParams,
};
use crate::error::{MigrateError, Result};

/// Maximum identifier length in SQL Server.
const MAX_IDENT_LEN: usize = 128;

/// SQL Server allows 2100 parameters per request; leave room for the driver.
const MAX_PARAMS: usize = 2000;

/// Microsoft SQL Server dialect implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    pub fn new() -> Self {
        Self
    }

    /// The column that becomes `IDENTITY(1,1)` on the target.
    ///
    /// SQL Server allows one identity column per table and only on integer
    /// or scale-0 decimal types, so only the first eligible column qualifies.
    pub fn identity_column(table: &TableDescriptor) -> Option<&ColumnDescriptor> {
        table.columns.iter().find(|c| {
            c.source.is_identity
                && c.target.as_ref().is_some_and(|t| match t.name.as_str() {
                    "tinyint" | "smallint" | "int" | "bigint" => true,
                    "decimal" | "numeric" => {
                        matches!(t.params, TypeParams::PrecisionScale(_, 0) | TypeParams::Precision(_))
                    }
                    _ => false,
                })
        })
    }

    /// `N'...'` string literal.
    fn literal(value: &str) -> String {
        format!("N'{}'", value.replace('\'', "''"))
    }

    /// Join name parts with `_`, shortening with a hash suffix past 128 chars.
    fn object_name(prefix: &str, parts: &[&str]) -> String {
        let mut name = prefix.to_string();
        for part in parts {
            name.push('_');
            name.push_str(part);
        }
        if name.chars().count() <= MAX_IDENT_LEN {
            return name;
        }
        let digest = hex::encode(Sha256::digest(name.as_bytes()));
        let head: String = name.chars().take(MAX_IDENT_LEN - 9).collect();
        format!("{}_{}", head, &digest[..8])
    }

    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn column_definition(
        &self,
        table: &TableDescriptor,
        column: &ColumnDescriptor,
        identity: Option<&str>,
    ) -> Result<String> {
        let target = column.target.as_ref().ok_or_else(|| MigrateError::UnmappedType {
            column: format!("{}.{}", table.qualified_name(), column.name),
            source_type: column.source.to_string(),
        })?;

        let mut def = format!("{} {}", self.quote_ident(&column.name), target.ddl());
        if identity == Some(column.name.as_str()) {
            def.push_str(" IDENTITY(1,1)");
        }
        let is_key = table.key_columns().contains(&column.name);
        if column.source.nullable && !is_key {
            def.push_str(" NULL");
        } else {
            def.push_str(" NOT NULL");
        }
        Ok(def)
    }

    /// `CAST(@Pn AS type)` for every column of every row, grouped per row.
    fn values_rows(&self, table: &TableDescriptor, rows: usize) -> Vec<String> {
        let cols = table.columns.len();
        (0..rows)
            .map(|r| {
                let cells: Vec<String> = table
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        let p = self.param_placeholder(r * cols + i + 1);
                        match &c.target {
                            Some(t) => format!("CAST({} AS {})", p, t.ddl()),
                            None => p,
                        }
                    })
                    .collect();
                format!("({})", cells.join(", "))
            })
            .collect()
    }
}

fn referential_action(action: &str) -> Option<&'static str> {
    match action.to_uppercase().replace(' ', "_").as_str() {
        "CASCADE" => Some("CASCADE"),
        "SET_NULL" => Some("SET NULL"),
        "SET_DEFAULT" => Some("SET DEFAULT"),
        _ => None,
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &str {
        "mssql"
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn max_params(&self) -> usize {
        MAX_PARAMS
    }

    fn create_schema(&self, schema: &str) -> String {
        // CREATE SCHEMA must be the first statement in its batch.
        let create = format!("CREATE SCHEMA {}", self.quote_ident(schema));
        format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.schemas WHERE name = {}) EXEC({})",
            Self::literal(schema),
            Self::literal(&create)
        )
    }

    fn create_table(&self, schema: &str, table: &TableDescriptor) -> Result<String> {
        let qualified = self.qualify(schema, &table.name);
        let identity = Self::identity_column(table).map(|c| c.name.as_str());

        let mut defs = Vec::with_capacity(table.columns.len() + 1);
        for column in &table.columns {
            defs.push(format!("    {}", self.column_definition(table, column, identity)?));
        }
        if let Some(pk) = &table.primary_key {
            defs.push(format!(
                "    CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_ident(&Self::object_name("PK", &[schema, &table.name])),
                self.column_list(&pk.columns)
            ));
        }

        Ok(format!(
            "IF OBJECT_ID({}, N'U') IS NULL\nCREATE TABLE {} (\n{}\n)",
            Self::literal(&qualified),
            qualified,
            defs.join(",\n")
        ))
    }

    fn index_name(&self, schema: &str, table: &TableDescriptor, index: &IndexDescriptor) -> String {
        Self::object_name("IX", &[schema, &table.name, &index.name])
    }

    fn create_index(&self, schema: &str, table: &TableDescriptor, index: &IndexDescriptor) -> String {
        let qualified = self.qualify(schema, &table.name);
        let name = self.index_name(schema, table, index);
        format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.indexes WHERE name = {} AND object_id = OBJECT_ID({}))\n\
             CREATE {}INDEX {} ON {} ({})",
            Self::literal(&name),
            Self::literal(&qualified),
            if index.is_unique { "UNIQUE " } else { "" },
            self.quote_ident(&name),
            qualified,
            self.column_list(&index.columns)
        )
    }

    fn foreign_key_name(
        &self,
        schema: &str,
        table: &TableDescriptor,
        fk: &ForeignKeyDescriptor,
    ) -> String {
        Self::object_name("FK", &[schema, &table.name, &fk.name])
    }

    fn create_foreign_key(
        &self,
        schema: &str,
        table: &TableDescriptor,
        fk: &ForeignKeyDescriptor,
        ref_schema: &str,
        with_actions: bool,
    ) -> String {
        let qualified = self.qualify(schema, &table.name);
        let name = self.foreign_key_name(schema, table, fk);

        let mut sql = format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.foreign_keys WHERE name = {} AND parent_object_id = OBJECT_ID({}))\n\
             ALTER TABLE {} WITH CHECK ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            Self::literal(&name),
            Self::literal(&qualified),
            qualified,
            self.quote_ident(&name),
            self.column_list(&fk.columns),
            self.qualify(ref_schema, &fk.ref_table),
            self.column_list(&fk.ref_columns)
        );

        if with_actions {
            if let Some(action) = referential_action(&fk.on_delete) {
                sql.push_str(&format!(" ON DELETE {}", action));
            }
            if let Some(action) = referential_action(&fk.on_update) {
                sql.push_str(&format!(" ON UPDATE {}", action));
            }
        }
        sql
    }

    fn build_upsert(&self, schema: &str, table: &TableDescriptor, rows: usize) -> String {
        let qualified = self.qualify(schema, &table.name);
        let keys = table.key_columns();
        let columns = table.column_names();
        let col_str = self.column_list(&columns);

        let join_condition: Vec<String> = keys
            .iter()
            .map(|k| {
                let q = self.quote_ident(k);
                format!("target.{} = source.{}", q, q)
            })
            .collect();

        // Identity columns cannot be updated, only inserted explicitly.
        let identity = Self::identity_column(table).map(|c| c.name.clone());
        let update_cols: Vec<String> = columns
            .iter()
            .filter(|c| !keys.contains(c) && identity.as_ref() != Some(*c))
            .map(|c| {
                let q = self.quote_ident(c);
                format!("{} = source.{}", q, q)
            })
            .collect();

        let source_cols: Vec<String> = columns
            .iter()
            .map(|c| format!("source.{}", self.quote_ident(c)))
            .collect();

        let mut sql = format!(
            "MERGE INTO {} WITH (HOLDLOCK) AS target\nUSING (VALUES {}) AS source ({})\nON {}\n",
            qualified,
            self.values_rows(table, rows).join(", "),
            col_str,
            join_condition.join(" AND ")
        );
        if !update_cols.is_empty() {
            sql.push_str(&format!(
                "WHEN MATCHED THEN UPDATE SET {}\n",
                update_cols.join(", ")
            ));
        }
        sql.push_str(&format!(
            "WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
            col_str,
            source_cols.join(", ")
        ));
        sql
    }

    fn build_insert(&self, schema: &str, table: &TableDescriptor, rows: usize) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.qualify(schema, &table.name),
            self.column_list(&table.column_names()),
            self.values_rows(table, rows).join(", ")
        )
    }
}
