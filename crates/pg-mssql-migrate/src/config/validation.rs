//! Configuration validation.

use super::Config;
use crate::drivers::SslMode;
use crate::error::{MigrateError, Result};

fn invalid(message: impl Into<String>) -> MigrateError {
    MigrateError::Config(message.into())
}

fn require(fields: &[(&str, &str)]) -> Result<()> {
    match fields.iter().find(|(_, value)| value.trim().is_empty()) {
        Some((name, _)) => Err(invalid(format!("{} is required", name))),
        None => Ok(()),
    }
}

/// Reject configurations a run could not start with.
///
/// Tuning knobs left unset are filled in later by auto-tuning, so only
/// explicit values are checked here.
pub fn validate(config: &Config) -> Result<()> {
    let (source, target, migration) = (&config.source, &config.target, &config.migration);

    require(&[
        ("source.host", &source.host),
        ("source.database", &source.database),
        ("source.user", &source.user),
        ("target.host", &target.host),
        ("target.database", &target.database),
        ("target.user", &target.user),
    ])?;

    if source.schemas.is_empty() {
        return Err(invalid("source.schemas must list at least one schema"));
    }
    if source.schemas.iter().any(|s| s.trim().is_empty()) {
        return Err(invalid("source.schemas must not contain empty names"));
    }
    SslMode::parse(&source.ssl_mode)?;

    if target.schema.as_deref().is_some_and(|s| s.trim().is_empty()) {
        return Err(invalid("target.schema must not be empty when set"));
    }

    for (name, value) in [
        ("workers", migration.workers),
        ("batch_size", migration.batch_size),
        ("max_source_connections", migration.max_source_connections),
        ("max_target_connections", migration.max_target_connections),
    ] {
        if value == Some(0) {
            return Err(invalid(format!("migration.{} must be at least 1", name)));
        }
    }
    if let (Some(base), Some(max)) = (migration.retry_base_delay_ms, migration.retry_max_delay_ms) {
        if base > max {
            return Err(invalid(
                "migration.retry_base_delay_ms must not exceed retry_max_delay_ms",
            ));
        }
    }
    if let Some((key, _)) = migration
        .type_overrides
        .iter()
        .find(|(_, entry)| entry.target.trim().is_empty())
    {
        return Err(invalid(format!(
            "migration.type_overrides.{} has an empty target",
            key
        )));
    }
    if migration.export_dir.as_os_str().is_empty() {
        return Err(invalid("migration.export_dir must not be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, SourceConfig, TargetConfig, TypeOverride};

    fn shop() -> Config {
        Config {
            source: SourceConfig {
                host: "pg.shop.internal".into(),
                port: 5432,
                database: "shop".into(),
                user: "replicator".into(),
                password: "pg-secret".into(),
                schemas: vec!["public".into(), "billing".into()],
                ssl_mode: "require".into(),
            },
            target: TargetConfig {
                host: "sql.shop.internal".into(),
                port: 1433,
                database: "shop".into(),
                user: "loader".into(),
                password: "mssql-secret".into(),
                schema: Some("shop".into()),
                encrypt: true,
                trust_server_cert: false,
            },
            migration: MigrationConfig {
                export_dir: "artifacts".into(),
                ..Default::default()
            },
        }
    }

    fn rejection(config: &Config) -> String {
        match validate(config) {
            Err(MigrateError::Config(message)) => message,
            other => panic!("expected a config error, got {:?}", other),
        }
    }

    #[test]
    fn test_complete_config_passes() {
        assert!(validate(&shop()).is_ok());
    }

    #[test]
    fn test_blank_connection_fields_are_named() {
        let mut config = shop();
        config.target.user = "  ".into();
        assert_eq!(rejection(&config), "target.user is required");

        let mut config = shop();
        config.source.host.clear();
        assert_eq!(rejection(&config), "source.host is required");
    }

    #[test]
    fn test_schema_lists() {
        let mut config = shop();
        config.source.schemas.clear();
        assert!(rejection(&config).contains("at least one schema"));

        let mut config = shop();
        config.source.schemas.push(String::new());
        assert!(rejection(&config).contains("empty names"));

        let mut config = shop();
        config.target.schema = Some(String::new());
        assert!(rejection(&config).contains("target.schema"));
    }

    #[test]
    fn test_unsupported_ssl_mode() {
        let mut config = shop();
        config.source.ssl_mode = "prefer".into();
        assert!(rejection(&config).contains("ssl_mode"));
    }

    #[test]
    fn test_zero_valued_knobs() {
        let mut config = shop();
        config.migration.batch_size = Some(0);
        assert_eq!(rejection(&config), "migration.batch_size must be at least 1");

        let mut config = shop();
        config.migration.max_target_connections = Some(0);
        assert_eq!(
            rejection(&config),
            "migration.max_target_connections must be at least 1"
        );
    }

    #[test]
    fn test_retry_delays_must_be_ordered() {
        let mut config = shop();
        config.migration.retry_base_delay_ms = Some(5_000);
        config.migration.retry_max_delay_ms = Some(100);
        assert!(rejection(&config).contains("retry_base_delay_ms"));
    }

    #[test]
    fn test_blank_override_target() {
        let mut config = shop();
        config.migration.type_overrides.insert(
            "money".into(),
            TypeOverride {
                target: " ".into(),
                allow_narrowing: false,
            },
        );
        assert_eq!(
            rejection(&config),
            "migration.type_overrides.money has an empty target"
        );
    }

    #[test]
    fn test_passwords_hidden_from_debug_output() {
        let config = shop();
        let source = format!("{:?}", config.source);
        let target = format!("{:?}", config.target);
        assert!(source.contains("[REDACTED]") && !source.contains("pg-secret"));
        assert!(target.contains("[REDACTED]") && !target.contains("mssql-secret"));
    }
}
