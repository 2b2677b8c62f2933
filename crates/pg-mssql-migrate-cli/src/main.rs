//! pg-mssql-migrate CLI - PostgreSQL to SQL Server migration.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pg_mssql_migrate::{
    Config, MigrateError, MigrationReport, Orchestrator, RunStatus, TableStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code when the run finished but not every table or check succeeded.
const EXIT_INCOMPLETE: u8 = 1;

#[derive(Parser)]
#[command(name = "pg-mssql-migrate")]
#[command(about = "PostgreSQL to SQL Server schema and data migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration
    Run {
        /// Override source schemas (repeatable)
        #[arg(long)]
        source_schema: Vec<String>,

        /// Override target schema
        #[arg(long)]
        target_schema: Option<String>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Dry run: show the plan without touching the target
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a previously interrupted migration
    Resume {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Show copy waves, deferred foreign keys and structure DDL
    Plan,

    /// Compare row counts between source and target
    Validate,

    /// Write views, functions, procedures and triggers as SQL files
    ExportArtifacts {
        /// Override the export directory
        #[arg(long)]
        export_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)?;

    let mut config = load_config(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Commands::Run {
            source_schema,
            target_schema,
            workers,
            dry_run,
        } => {
            if !source_schema.is_empty() {
                config.source.schemas = source_schema;
            }
            if target_schema.is_some() {
                config.target.schema = target_schema;
            }
            if workers.is_some() {
                config.migration.workers = workers;
            }
            config.validate()?;

            let mut orchestrator = Orchestrator::new(config).await?;
            if dry_run {
                return print_plan(&orchestrator, cli.output_json).await;
            }
            if let Some(path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path);
            }

            let cancel = setup_signal_handler();
            let report = orchestrator.run(cancel).await?;
            print_report(&report, cli.output_json, "Migration finished")
        }

        Commands::Resume { workers } => {
            let state_file = cli.state_file.ok_or_else(|| {
                MigrateError::Config("--state-file is required for resume".to_string())
            })?;
            if !state_file.exists() {
                return Err(MigrateError::Config(format!(
                    "State file not found: {}",
                    state_file.display()
                )));
            }
            if workers.is_some() {
                config.migration.workers = workers;
                config.validate()?;
            }

            let orchestrator = Orchestrator::new(config)
                .await?
                .with_state_file(state_file)
                .resume();
            info!("Resuming from previous state");

            let cancel = setup_signal_handler();
            let report = orchestrator.run(cancel).await?;
            print_report(&report, cli.output_json, "Migration resumed and finished")
        }

        Commands::Plan => {
            let orchestrator = Orchestrator::new(config).await?;
            print_plan(&orchestrator, cli.output_json).await
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::new(config).await?;
            let checks = orchestrator.validate().await?;
            let mismatches = checks.iter().filter(|c| !c.matches()).count();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&checks)?);
            } else {
                println!("Row count validation:");
                for check in &checks {
                    let target = check
                        .target_rows
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "unavailable".to_string());
                    let mark = if check.matches() { "OK" } else { "MISMATCH" };
                    println!(
                        "  {:<8} {} (source: {}, target: {})",
                        mark, check.table, check.source_rows, target
                    );
                }
                println!("\n  {} tables, {} mismatched", checks.len(), mismatches);
            }

            Ok(exit_code(mismatches == 0))
        }

        Commands::ExportArtifacts { export_dir } => {
            if let Some(dir) = export_dir {
                config.migration.export_dir = dir;
            }
            let orchestrator = Orchestrator::new(config).await?;
            let report = orchestrator.export_artifacts().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Artifacts exported to {}", report.export_dir.display());
                println!("  Written: {}", report.written());
                println!("  Conflicts: {}", report.conflicts());
                println!("  Failed: {}", report.failures());
            }

            Ok(exit_code(report.is_clean()))
        }
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    }
}

fn load_config(path: &Path) -> Result<Config, MigrateError> {
    if !path.exists() {
        return Err(MigrateError::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    Config::load(path)
}

async fn print_plan(orchestrator: &Orchestrator, json: bool) -> Result<ExitCode, MigrateError> {
    let plan = orchestrator.plan().await?;

    if json {
        println!("{}", plan.to_json()?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Migration plan: {} tables", plan.tables_total);
    for (i, wave) in plan.waves.iter().enumerate() {
        println!("  Wave {}: {}", i, wave.join(", "));
    }
    for fk in &plan.deferred_foreign_keys {
        println!(
            "  Deferred: {}.{} -> {} ({:?})",
            fk.table, fk.constraint, fk.references, fk.reason
        );
    }
    for fk in &plan.external_foreign_keys {
        println!(
            "  External (not created): {}.{} -> {}",
            fk.table, fk.constraint, fk.references
        );
    }
    println!("  Artifacts to export: {}", plan.artifacts);
    println!("\nStructure DDL:");
    for statement in &plan.statements {
        println!("{}\n", statement);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(
    report: &MigrationReport,
    json: bool,
    headline: &str,
) -> Result<ExitCode, MigrateError> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        println!("\n{}: {:?}", headline, report.status);
        println!("  Run ID: {}", report.run_id);
        println!("  Duration: {:.2}s", report.duration_seconds);
        println!(
            "  Tables: {} committed, {} failed, {} skipped, {} total",
            report.tables_committed, report.tables_failed, report.tables_skipped, report.tables_total
        );
        println!("  Rows: {}", report.rows_transferred);
        println!("  Throughput: {} rows/sec", report.rows_per_second);

        for table in &report.tables {
            match &table.status {
                TableStatus::Failed { error, kind, retries } => println!(
                    "  FAILED  {} [{}] after {} retries: {}",
                    table.table, kind, retries, error
                ),
                TableStatus::Skipped { ancestor } => {
                    println!("  SKIPPED {} (ancestor {} failed)", table.table, ancestor)
                }
                _ => {}
            }
        }
        for name in &report.row_count_mismatches {
            if let Some(table) = report.table(name) {
                println!(
                    "  COUNT MISMATCH {}: expected {}, copied {}",
                    name, table.expected_rows, table.rows_copied
                );
            }
        }
        for constraint in report.constraints.iter().filter(|c| c.is_failed()) {
            println!(
                "  CONSTRAINT FAILED {} on {}: {:?}",
                constraint.name, constraint.table, constraint.outcome
            );
        }
        if let Some(artifacts) = &report.artifacts {
            println!(
                "  Artifacts: {} written, {} conflicts, {} failed",
                artifacts.written(),
                artifacts.conflicts(),
                artifacts.failures()
            );
        }
    }

    Ok(match report.status {
        RunStatus::Cancelled => ExitCode::from(MigrateError::Cancelled.exit_code()),
        _ => exit_code(report.is_success()),
    })
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), MigrateError> {
    let level = match verbosity.to_lowercase().as_str() {
        level @ ("trace" | "debug" | "info" | "warn" | "error") => level.to_string(),
        other => {
            return Err(MigrateError::Config(format!(
                "Invalid verbosity '{}'. Valid values: debug, info, warn, error",
                other
            )))
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => {
            return Err(MigrateError::Config(format!(
                "Invalid log format '{}'. Valid values: text, json",
                other
            )))
        }
    }
    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM. Tables in flight stop
/// after their current batch; checkpoints stay valid for `resume`.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();

    for (kind, label) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Finishing current batches...", label);
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", label, e),
        }
    }

    cancel
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing current batches...");
            token.cancel();
        }
    });

    cancel
}
