//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tokio_postgres::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Catalog could not be read or describes an inconsistent schema.
    #[error("Schema extraction failed: {0}")]
    Extraction(String),

    /// No built-in or override mapping exists for a source type.
    #[error("No type mapping for column {column} (source type '{source_type}')")]
    UnmappedType { column: String, source_type: String },

    /// Mapping would lose representable values and narrowing was not allowed.
    #[error(
        "Narrowing mapping rejected for column {column}: {source_type} -> {target_type} ({reason})"
    )]
    Narrowing {
        column: String,
        source_type: String,
        target_type: String,
        reason: String,
    },

    /// Dependency graph still cyclic after cycle edges were deferred.
    #[error("Unresolvable table dependency: {0}")]
    UnresolvableDependency(String),

    /// A DDL statement failed on the target.
    #[error("Schema apply failed for {table} ({object}): {message}")]
    SchemaApply {
        table: String,
        object: String,
        message: String,
    },

    /// Retryable copy failure (connection reset, deadlock, lock timeout).
    #[error("Transient copy error for table {table}: {message}")]
    CopyTransient { table: String, message: String },

    /// Non-retryable copy failure.
    #[error("Copy failed for table {table}: {message}")]
    CopyStructural { table: String, message: String },

    /// Table was not attempted because a parent table did not commit.
    #[error("Table {table} skipped: dependency {ancestor} did not complete")]
    SkippedDueToDependency { table: String, ancestor: String },

    /// Rejected table status transition.
    #[error("Illegal status transition for table {table}: {from} -> {to}")]
    IllegalTransition {
        table: String,
        from: &'static str,
        to: &'static str,
    },

    /// Artifact could not be written.
    #[error("Artifact export failed for {name}: {message}")]
    Artifact { name: String, message: String },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Delete the state file to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

/// SQL Server error numbers worth retrying: deadlock victim, lock timeout,
/// and the two "resource busy" throttling codes.
const MSSQL_TRANSIENT_CODES: &[u32] = &[1205, 1222, 40501, 40613];

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a SchemaApply error.
    pub fn schema_apply(
        table: impl Into<String>,
        object: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        MigrateError::SchemaApply {
            table: table.into(),
            object: object.into(),
            message: message.to_string(),
        }
    }

    /// Create a transient copy error.
    pub fn transient(table: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::CopyTransient {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a structural (non-retryable) copy error.
    pub fn structural(table: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::CopyStructural {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::CopyTransient { .. } | MigrateError::Pool { .. } => true,
            MigrateError::Io(_) => true,
            MigrateError::Source(e) => {
                e.is_closed()
                    || std::error::Error::source(e)
                        .map(|s| s.is::<std::io::Error>())
                        .unwrap_or(false)
            }
            MigrateError::Target(e) => match e {
                tiberius::error::Error::Io { .. } => true,
                tiberius::error::Error::Server(token) => {
                    MSSQL_TRANSIENT_CODES.contains(&token.code())
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Whether this error must abort the run rather than a single table.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Config(_)
                | MigrateError::Extraction(_)
                | MigrateError::UnmappedType { .. }
                | MigrateError::Narrowing { .. }
                | MigrateError::UnresolvableDependency(_)
                | MigrateError::ConfigChanged
        )
    }

    /// Short machine-readable kind, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrateError::Config(_) => "config",
            MigrateError::Source(_) => "source",
            MigrateError::Target(_) => "target",
            MigrateError::Pool { .. } => "pool",
            MigrateError::Extraction(_) => "extraction",
            MigrateError::UnmappedType { .. } => "unmapped_type",
            MigrateError::Narrowing { .. } => "narrowing",
            MigrateError::UnresolvableDependency(_) => "unresolvable_dependency",
            MigrateError::SchemaApply { .. } => "schema_apply",
            MigrateError::CopyTransient { .. } => "copy_transient",
            MigrateError::CopyStructural { .. } => "copy_structural",
            MigrateError::SkippedDueToDependency { .. } => "skipped_due_to_dependency",
            MigrateError::IllegalTransition { .. } => "illegal_transition",
            MigrateError::Artifact { .. } => "artifact",
            MigrateError::State(_) => "state",
            MigrateError::ConfigChanged => "config_changed",
            MigrateError::Io(_) => "io",
            MigrateError::Yaml(_) => "yaml",
            MigrateError::Json(_) => "json",
            MigrateError::Cancelled => "cancelled",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::Yaml(_)
            | MigrateError::ConfigChanged => 2,
            MigrateError::Source(_) | MigrateError::Target(_) | MigrateError::Pool { .. } => 3,
            MigrateError::Extraction(_)
            | MigrateError::UnmappedType { .. }
            | MigrateError::Narrowing { .. }
            | MigrateError::UnresolvableDependency(_) => 4,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MigrateError::transient("public.t", "connection reset").is_transient());
        assert!(MigrateError::pool("timed out", "getting connection").is_transient());
        assert!(!MigrateError::structural("public.t", "constraint violation").is_transient());
        assert!(!MigrateError::Config("bad".into()).is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MigrateError::Extraction("lost".into()).is_fatal());
        assert!(MigrateError::UnresolvableDependency("a -> b".into()).is_fatal());
        assert!(!MigrateError::schema_apply("public.t", "table", "boom").is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
        assert_eq!(MigrateError::Extraction("x".into()).exit_code(), 4);
    }

    #[test]
    fn test_skipped_table_names_its_ancestor() {
        let err = MigrateError::SkippedDueToDependency {
            table: "public.orders".into(),
            ancestor: "public.customers".into(),
        };
        assert_eq!(err.kind(), "skipped_due_to_dependency");
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "Table public.orders skipped: dependency public.customers did not complete"
        );
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = MigrateError::structural("public.orders", "duplicate key");
        let text = err.format_detailed();
        assert!(text.starts_with("Error: Copy failed for table public.orders"));
    }
}
