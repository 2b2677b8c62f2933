//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the serialized configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Hash over the settings that change what a checkpoint means: connection
    /// targets, schema selection, filters and type mapping. Boundaries are
    /// keys or row offsets, so batch size, worker counts and pool sizes may
    /// differ between a run and its resume.
    pub fn resume_hash(&self) -> String {
        let mut stable = self.clone();
        stable.source.password.clear();
        stable.target.password.clear();
        stable.migration.workers = None;
        stable.migration.batch_size = None;
        stable.migration.max_source_connections = None;
        stable.migration.max_target_connections = None;
        stable.migration.max_retries = None;
        stable.migration.retry_base_delay_ms = None;
        stable.migration.retry_max_delay_ms = None;
        stable.migration.cleanup_checkpoints = false;
        stable.hash()
    }
}

impl SourceConfig {
    /// Human-readable connection target (password omitted).
    pub fn display_target(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

impl TargetConfig {
    /// Human-readable connection target (password omitted).
    pub fn display_target(&self) -> String {
        format!(
            "mssql://{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  host: pg.local
  database: shop
  user: migrator
  password: secret
  schemas: [public, sales]
target:
  host: sql.local
  database: shop
  user: sa
  password: secret
migration:
  batch_size: 500
  type_overrides:
    numeric:
      target: decimal(38,10)
      allow_narrowing: true
    public.events.payload:
      target: nvarchar(max)
"#;

    #[test]
    fn test_from_yaml_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 5432);
        assert_eq!(config.target.port, 1433);
        assert_eq!(config.source.schemas, vec!["public", "sales"]);
        assert!(config.target.schema.is_none());
        assert_eq!(config.migration.get_batch_size(), 500);
        assert_eq!(config.migration.get_max_retries(), 5);
        assert!(config.migration.create_foreign_keys);
        assert!(!config.migration.cleanup_checkpoints);
        assert_eq!(config.migration.type_overrides.len(), 2);
        assert!(config.migration.type_overrides["numeric"].allow_narrowing);
    }

    #[test]
    fn test_hash_is_stable() {
        let a = Config::from_yaml(YAML).unwrap();
        let b = Config::from_yaml(YAML).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn test_resume_hash_ignores_tuning() {
        let base = Config::from_yaml(YAML).unwrap();
        let mut tuned = base.clone();
        tuned.migration.workers = Some(12);
        tuned.migration.max_target_connections = Some(20);
        assert_eq!(base.resume_hash(), tuned.resume_hash());

        tuned.migration.batch_size = Some(1000);
        assert_eq!(base.resume_hash(), tuned.resume_hash());

        tuned.source.schemas.push("archive".into());
        assert_ne!(base.resume_hash(), tuned.resume_hash());
    }

    #[test]
    fn test_display_target_hides_password() {
        let config = Config::from_yaml(YAML).unwrap();
        assert!(!config.source.display_target().contains("secret"));
        assert_eq!(config.target.display_target(), "mssql://sa@sql.local:1433/shop");
    }
}
