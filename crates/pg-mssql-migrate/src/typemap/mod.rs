//! Column type mapping from PostgreSQL to SQL Server.
//!
//! Resolution order for a column is: a column-specific override
//! (`schema.table.column`), a base-type override (`numeric`, `jsonb`, ...),
//! then the built-in table. Every resolved mapping is checked for narrowing
//! unless narrowing was explicitly allowed.

mod domain;
mod postgres;

pub use domain::{check_widening, source_domain, target_domain, ValueDomain};

use std::collections::BTreeMap;

use tracing::{debug, error, warn};

use crate::config::MigrationConfig;
use crate::core::schema::{SchemaSnapshot, SourceType, TargetType};
use crate::error::{MigrateError, Result};

/// Result of mapping one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMapping {
    pub target: TargetType,
    /// Representation change that keeps every value (e.g. json as text).
    pub warning: Option<String>,
    /// Narrowing that was accepted because it was allowed.
    pub narrowing: Option<String>,
}

#[derive(Debug, Clone)]
struct ResolvedOverride {
    target: TargetType,
    allow_narrowing: bool,
}

/// Maps source column types to target types.
#[derive(Debug, Clone, Default)]
pub struct TypeMapper {
    overrides: BTreeMap<String, ResolvedOverride>,
    allow_narrowing: bool,
}

impl TypeMapper {
    /// Mapper with built-ins only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapper with the overrides and narrowing policy from the config.
    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        let mut mapper = Self::new().allow_narrowing(config.allow_narrowing);
        for (key, ov) in &config.type_overrides {
            mapper = mapper.with_override(key, &ov.target, ov.allow_narrowing)?;
        }
        Ok(mapper)
    }

    pub fn allow_narrowing(mut self, allow: bool) -> Self {
        self.allow_narrowing = allow;
        self
    }

    /// Add an override for a column path or a base type name.
    pub fn with_override(
        mut self,
        key: impl Into<String>,
        target: &str,
        allow_narrowing: bool,
    ) -> Result<Self> {
        let key = key.into();
        let target = TargetType::parse(target).ok_or_else(|| {
            MigrateError::Config(format!(
                "type override '{}' has an invalid target type '{}'",
                key, target
            ))
        })?;
        self.overrides.insert(
            key,
            ResolvedOverride {
                target,
                allow_narrowing,
            },
        );
        Ok(self)
    }

    /// Map one column. `column` is the `schema.table.column` path.
    pub fn map(&self, column: &str, source: &SourceType) -> Result<TypeMapping> {
        let (target, warning, allow) = match self
            .overrides
            .get(column)
            .or_else(|| self.overrides.get(&source.base))
        {
            Some(ov) => (
                ov.target.clone(),
                None,
                ov.allow_narrowing || self.allow_narrowing,
            ),
            None => {
                let (target, warning) =
                    postgres::builtin(source).ok_or_else(|| MigrateError::UnmappedType {
                        column: column.to_string(),
                        source_type: source.to_string(),
                    })?;
                (target, warning, self.allow_narrowing)
            }
        };

        let narrowing = match check_widening(source_domain(source), target_domain(&target)) {
            Ok(()) => None,
            Err(reason) if allow => Some(reason),
            Err(reason) => {
                return Err(MigrateError::Narrowing {
                    column: column.to_string(),
                    source_type: source.to_string(),
                    target_type: target.ddl(),
                    reason,
                })
            }
        };

        Ok(TypeMapping {
            target,
            warning,
            narrowing,
        })
    }

    /// Fill in target types for every column of the snapshot.
    ///
    /// Every failing column is logged; the first failure is returned.
    pub fn map_snapshot(&self, snapshot: SchemaSnapshot) -> Result<SchemaSnapshot> {
        let (mut tables, artifacts) = snapshot.into_parts();
        let mut first_error = None;
        let mut failures = 0usize;

        for table in &mut tables {
            let table_name = table.qualified_name();
            for column in &mut table.columns {
                let path = format!("{}.{}", table_name, column.name);
                match self.map(&path, &column.source) {
                    Ok(mapping) => {
                        if let Some(w) = &mapping.warning {
                            warn!("{}: {}", path, w);
                        }
                        if let Some(reason) = &mapping.narrowing {
                            warn!(
                                "{}: narrowing {} -> {} allowed ({})",
                                path, column.source, mapping.target, reason
                            );
                        }
                        debug!("{}: {} -> {}", path, column.source, mapping.target);
                        column.target = Some(mapping.target);
                    }
                    Err(e) => {
                        error!("{}", e);
                        failures += 1;
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            if failures > 1 {
                error!("{} columns could not be mapped", failures);
            }
            return Err(e);
        }

        Ok(SchemaSnapshot::new(tables, artifacts))
    }
}
