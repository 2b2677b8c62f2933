//! Configuration type definitions with auto-tuning based on system resources.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len().max(1),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (PostgreSQL).
    pub source: SourceConfig,

    /// Target database configuration (SQL Server).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schemas to migrate (default: ["public"]).
    #[serde(default = "default_public_schemas")]
    pub schemas: Vec<String>,

    /// SSL mode: disable, require, verify-full (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schemas", &self.schemas)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Target database (SQL Server) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema. When unset, each source schema maps to a target
    /// schema of the same name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

impl TargetConfig {
    /// Target schema for a given source schema.
    pub fn schema_for<'a>(&'a self, source_schema: &'a str) -> &'a str {
        self.schema.as_deref().unwrap_or(source_schema)
    }
}

/// Caller-supplied type mapping entry.
///
/// Keys in [`MigrationConfig::type_overrides`] are either a source base type
/// (`numeric`, `citext`) or a column path (`schema.table.column`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeOverride {
    /// Target DDL fragment, e.g. `decimal(38,10)`.
    pub target: String,

    /// Accept the mapping even if it narrows the source domain.
    #[serde(default)]
    pub allow_narrowing: bool,
}

/// Migration behavior configuration.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Number of parallel table workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Rows per copy batch. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Maximum PostgreSQL connections. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_source_connections: Option<usize>,

    /// Maximum SQL Server connections. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_target_connections: Option<usize>,

    /// Attempts per batch before a transient failure becomes permanent (default: 5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Base delay for exponential backoff in milliseconds (default: 200).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,

    /// Upper bound for a single backoff delay in milliseconds (default: 10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_delay_ms: Option<u64>,

    /// Tables to include (`*` wildcards, matched against `table` and `schema.table`).
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to exclude (same syntax as include_tables).
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Create indexes after copy (default: true).
    #[serde(default = "default_true")]
    pub create_indexes: bool,

    /// Create foreign keys after copy (default: true).
    #[serde(default = "default_true")]
    pub create_foreign_keys: bool,

    /// Accept every narrowing mapping (default: false).
    #[serde(default)]
    pub allow_narrowing: bool,

    /// Type mapping overrides keyed by base type or `schema.table.column`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub type_overrides: BTreeMap<String, TypeOverride>,

    /// Directory for exported views, functions, procedures and triggers.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,

    /// Remove checkpoints after a fully successful run (default: false).
    #[serde(default)]
    pub cleanup_checkpoints: bool,
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Workers: cores - 2, at least 2, at most 16. Table copies are I/O bound
        // on the target, so more workers mostly adds lock contention.
        let workers = *self
            .workers
            .get_or_insert_with(|| cores.saturating_sub(2).clamp(2, 16));

        // Batch size: 1K rows, +1K per 8GB of RAM, cap at 10K
        self.batch_size
            .get_or_insert_with(|| (1_000 + (ram_gb / 8.0) as usize * 1_000).clamp(1_000, 10_000));

        // Each worker holds at most one connection per side at a time; keep headroom
        // for DDL and count queries.
        self.max_source_connections
            .get_or_insert_with(|| (workers + 2).min(64));
        self.max_target_connections
            .get_or_insert_with(|| (workers + 2).min(64));

        info!(
            "Auto-tuned config: workers={}, batch_size={}, source_conns={}, target_conns={}",
            self.get_workers(),
            self.get_batch_size(),
            self.get_max_source_connections(),
            self.get_max_target_connections(),
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(1_000)
    }

    pub fn get_max_source_connections(&self) -> usize {
        self.max_source_connections.unwrap_or(8)
    }

    pub fn get_max_target_connections(&self) -> usize {
        self.max_target_connections.unwrap_or(8)
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(5)
    }

    pub fn get_retry_base_delay_ms(&self) -> u64 {
        self.retry_base_delay_ms.unwrap_or(200)
    }

    pub fn get_retry_max_delay_ms(&self) -> u64 {
        self.retry_max_delay_ms.unwrap_or(10_000)
    }

    /// Whether `schema.table` passes the include/exclude filters.
    pub fn table_selected(&self, schema: &str, table: &str) -> bool {
        let qualified = format!("{}.{}", schema, table);
        let matches = |pattern: &String| {
            wildcard_match(pattern, table) || wildcard_match(pattern, &qualified)
        };

        if !self.include_tables.is_empty() && !self.include_tables.iter().any(matches) {
            return false;
        }
        !self.exclude_tables.iter().any(matches)
    }
}

/// Case-insensitive `*` wildcard match.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while t < text.len() {
        if p < pattern.len() && pattern[p] != '*' && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_public_schemas() -> Vec<String> {
    vec!["public".to_string()]
}

fn default_require() -> String {
    "require".to_string()
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("export")
}

fn default_true() -> bool {
    true
}
