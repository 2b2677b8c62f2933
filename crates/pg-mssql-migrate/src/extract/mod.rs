//! Metadata extraction from the source catalog.
//!
//! Builds an unmapped [`SchemaSnapshot`] for the requested schemas and checks
//! that every constraint refers to columns that exist. Nothing is written.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::core::schema::{qualified_name, ForeignKeyTarget, SchemaSnapshot, TableDescriptor};
use crate::core::traits::SourceReader;
use crate::error::{MigrateError, Result};

/// Wrap a catalog failure as an extraction error with context.
fn catalog_error(context: String) -> impl FnOnce(MigrateError) -> MigrateError {
    move |e| match e {
        MigrateError::Extraction(_) => e,
        other => MigrateError::Extraction(format!("{}: {}", context, other)),
    }
}

/// Read every selected base table of `schemas` plus their artifacts.
pub async fn extract(
    reader: &dyn SourceReader,
    schemas: &[String],
    config: &MigrationConfig,
) -> Result<SchemaSnapshot> {
    let mut tables = Vec::new();
    let mut artifacts = Vec::new();

    for schema in schemas {
        let names = reader
            .list_tables(schema)
            .await
            .map_err(catalog_error(format!("listing tables of schema {}", schema)))?;

        let selected: Vec<String> = names
            .into_iter()
            .filter(|name| config.table_selected(schema, name))
            .collect();
        info!("Schema {}: {} tables selected", schema, selected.len());

        for name in selected {
            tables.push(read_table(reader, schema, &name).await?);
        }

        let mut found = reader
            .artifacts(schema)
            .await
            .map_err(catalog_error(format!("reading artifacts of schema {}", schema)))?;
        debug!("Schema {}: {} artifacts", schema, found.len());
        artifacts.append(&mut found);
    }

    classify_foreign_keys(&mut tables);
    let snapshot = SchemaSnapshot::new(tables, artifacts);
    validate_snapshot(&snapshot)?;

    let rows: u64 = snapshot.tables().map(|t| t.row_count).sum();
    info!(
        "Extracted {} tables ({} rows), {} artifacts",
        snapshot.len(),
        rows,
        snapshot.artifacts().len()
    );
    Ok(snapshot)
}

async fn read_table(reader: &dyn SourceReader, schema: &str, name: &str) -> Result<TableDescriptor> {
    let qualified = qualified_name(schema, name);
    let ctx = |what: &str| format!("reading {} of {}", what, qualified);

    let mut table = TableDescriptor::new(schema, name);
    table.columns = reader
        .columns(schema, name)
        .await
        .map_err(catalog_error(ctx("columns")))?;
    table.primary_key = reader
        .primary_key(schema, name)
        .await
        .map_err(catalog_error(ctx("primary key")))?;
    table.indexes = reader
        .indexes(schema, name)
        .await
        .map_err(catalog_error(ctx("indexes")))?;
    table.foreign_keys = reader
        .foreign_keys(schema, name)
        .await
        .map_err(catalog_error(ctx("foreign keys")))?;
    table.row_count = reader
        .row_count(schema, name)
        .await
        .map_err(catalog_error(ctx("row count")))?;

    debug!(
        "{}: {} columns, {} indexes, {} foreign keys, {} rows",
        qualified,
        table.columns.len(),
        table.indexes.len(),
        table.foreign_keys.len(),
        table.row_count
    );
    Ok(table)
}

/// Flag foreign keys whose referenced table was not extracted.
fn classify_foreign_keys(tables: &mut [TableDescriptor]) {
    let names: BTreeSet<String> = tables.iter().map(|t| t.qualified_name()).collect();
    for table in tables.iter_mut() {
        let owner = table.qualified_name();
        for fk in &mut table.foreign_keys {
            if names.contains(&fk.referenced()) {
                fk.target = ForeignKeyTarget::Internal;
            } else {
                warn!(
                    "{}: foreign key {} references {} outside the migrated set",
                    owner,
                    fk.name,
                    fk.referenced()
                );
                fk.target = ForeignKeyTarget::External;
            }
        }
    }
}

fn missing_columns<'a>(table: &TableDescriptor, columns: &'a [String]) -> Vec<&'a str> {
    columns
        .iter()
        .filter(|c| table.column(c).is_none())
        .map(String::as_str)
        .collect()
}

/// Check that every constraint refers to existing columns.
pub fn validate_snapshot(snapshot: &SchemaSnapshot) -> Result<()> {
    for table in snapshot.tables() {
        let name = table.qualified_name();
        if table.columns.is_empty() {
            return Err(MigrateError::Extraction(format!("{} has no columns", name)));
        }

        if let Some(pk) = &table.primary_key {
            let missing = missing_columns(table, &pk.columns);
            if pk.columns.is_empty() || !missing.is_empty() {
                return Err(MigrateError::Extraction(format!(
                    "{}: primary key {} references unknown columns {:?}",
                    name, pk.name, missing
                )));
            }
        }

        for idx in &table.indexes {
            let missing = missing_columns(table, &idx.columns);
            if !missing.is_empty() {
                return Err(MigrateError::Extraction(format!(
                    "{}: index {} references unknown columns {:?}",
                    name, idx.name, missing
                )));
            }
        }

        for fk in &table.foreign_keys {
            let missing = missing_columns(table, &fk.columns);
            if !missing.is_empty() {
                return Err(MigrateError::Extraction(format!(
                    "{}: foreign key {} references unknown columns {:?}",
                    name, fk.name, missing
                )));
            }
            if fk.columns.is_empty() || fk.columns.len() != fk.ref_columns.len() {
                return Err(MigrateError::Extraction(format!(
                    "{}: foreign key {} has {} columns but references {}",
                    name,
                    fk.name,
                    fk.columns.len(),
                    fk.ref_columns.len()
                )));
            }
            if fk.is_external() {
                continue;
            }
            let parent = snapshot.table(&fk.referenced()).ok_or_else(|| {
                MigrateError::Extraction(format!(
                    "{}: foreign key {} references {} which is not in the snapshot",
                    name,
                    fk.name,
                    fk.referenced()
                ))
            })?;
            let missing = missing_columns(parent, &fk.ref_columns);
            if !missing.is_empty() {
                return Err(MigrateError::Extraction(format!(
                    "{}: foreign key {} references unknown columns {:?} of {}",
                    name,
                    fk.name,
                    missing,
                    fk.referenced()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{customers_orders, MemorySource};

    fn schemas() -> Vec<String> {
        vec!["public".to_string()]
    }

    #[tokio::test]
    async fn test_extract_customers_orders() {
        let source = MemorySource::new(customers_orders(3, 5));
        let snapshot = extract(&source, &schemas(), &MigrationConfig::default())
            .await
            .unwrap();

        assert_eq!(snapshot.len(), 2);
        let orders = snapshot.table("public.orders").unwrap();
        assert_eq!(orders.row_count, 5);
        assert_eq!(orders.foreign_keys.len(), 1);
        assert!(!orders.foreign_keys[0].is_external());
        assert!(!snapshot.is_mapped());
    }

    #[tokio::test]
    async fn test_extract_is_idempotent() {
        let source = MemorySource::new(customers_orders(2, 2));
        let config = MigrationConfig::default();
        let a = extract(&source, &schemas(), &config).await.unwrap();
        let b = extract(&source, &schemas(), &config).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_filtered_parent_becomes_external() {
        let source = MemorySource::new(customers_orders(2, 2));
        let config = MigrationConfig {
            exclude_tables: vec!["customers".into()],
            ..Default::default()
        };
        let snapshot = extract(&source, &schemas(), &config).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        let orders = snapshot.table("public.orders").unwrap();
        assert!(orders.foreign_keys[0].is_external());
    }

    #[tokio::test]
    async fn test_missing_referenced_column_fails() {
        let mut tables = customers_orders(1, 1);
        tables[1].0.foreign_keys[0].ref_columns = vec!["nope".into()];
        let source = MemorySource::new(tables);
        let err = extract(&source, &schemas(), &MigrationConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Extraction(_)));
    }

    #[tokio::test]
    async fn test_missing_pk_column_fails() {
        let mut tables = customers_orders(1, 1);
        if let Some(pk) = tables[0].0.primary_key.as_mut() {
            pk.columns = vec!["ghost".into()];
        }
        let source = MemorySource::new(tables);
        let err = extract(&source, &schemas(), &MigrationConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_fk_column_count_mismatch_fails() {
        let mut tables = customers_orders(1, 1);
        tables[1].0.foreign_keys[0].ref_columns.push("name".into());
        let source = MemorySource::new(tables);
        let err = extract(&source, &schemas(), &MigrationConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("references 2"));
    }
}
