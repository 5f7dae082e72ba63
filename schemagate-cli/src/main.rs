//! Command line front end for schemagate.
//!
//! Connection settings and paths come from the environment (a `.env` file in
//! the working directory is loaded first). See `config.rs` for the variables.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use schemagate::{
    Error, MigrationApplier, MigrationHistoryStore, SchemaComparator, SchemaDumper,
    ValidationOrchestrator,
};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "schemagate", version, about = "Apply and validate MySQL migrations")]
struct Cli {
    /// Log level used when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations to the primary database
    #[command(name = "migrate")]
    Migrate,

    /// Replay pending migrations on an ephemeral database and compare the
    /// result with the schema snapshot
    #[command(name = "check:migrations")]
    CheckMigrations {
        /// Print the validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a schema snapshot of the primary database
    #[command(name = "dump:schema")]
    DumpSchema {
        /// Output directory, overrides SCHEMA_OUTPUT_DIR
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("schemagate={},schemagate_cli={}", cli.log_level, cli.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = CliConfig::from_env().and_then(|config| match cli.command {
        Commands::Migrate => migrate(&config),
        Commands::CheckMigrations { json } => check_migrations(&config, json),
        Commands::DumpSchema { output } => dump_schema(&config, output),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", error_chain(&e));
            ExitCode::FAILURE
        }
    }
}

fn migrate(config: &CliConfig) -> Result<(), Error> {
    let connections = config.connections();
    let mut primary = connections.connect(&config.primary)?;
    let mut history = match config.history {
        Some(ref history) => Some(connections.connect(history)?),
        None => None,
    };

    let applier = MigrationApplier::new(MigrationHistoryStore::new(&config.paths.init_script))
        .on_migration_start(|name| info!(migration = name, "Running migration"))
        .on_migration_complete(|name, duration| {
            info!(migration = name, duration_ms = duration.as_millis() as u64, "Migration complete")
        })
        .on_migration_error(|name, e| error!(migration = name, error = %e, "Migration failed"));

    let report = applier.apply(&mut primary, history.as_mut(), &config.paths.migrations_dir)?;
    if report.applied.is_empty() {
        println!("No outstanding migrations.");
    }
    for migration in &report.applied {
        println!(
            "Applied {} ({} ms, sha256 {})",
            migration.name,
            migration.duration.as_millis(),
            &migration.checksum[..12]
        );
    }
    Ok(())
}

fn check_migrations(config: &CliConfig, json: bool) -> Result<(), Error> {
    let connections = config.connections();
    let dumper = SchemaDumper::new(config.dump_backend(), connections.clone());
    let mut orchestrator = ValidationOrchestrator::new(
        config.validation_settings(),
        connections,
        dumper,
        Box::new(SchemaComparator::new()),
        config.infrastructure(),
    );

    match orchestrator.run() {
        Ok(report) => {
            if json {
                let rendered = serde_json::to_string_pretty(&report)
                    .map_err(|e| Error::Configuration(format!("could not render report: {e}")))?;
                println!("{rendered}");
            } else {
                println!("Schemas are identical.");
                for migration in &report.applied {
                    println!("  validated {}", migration.name);
                }
            }
            Ok(())
        }
        Err(Error::ValidationFailure { diff }) => {
            println!("Schemas differ.");
            println!("{diff}");
            Err(Error::ValidationFailure { diff })
        }
        Err(e) => Err(e),
    }
}

fn dump_schema(config: &CliConfig, output: Option<PathBuf>) -> Result<(), Error> {
    let connections = config.connections();
    let dumper = SchemaDumper::new(config.dump_backend(), connections);
    let output = output.unwrap_or_else(|| config.paths.schema_output_dir.clone());

    let dump = dumper.dump_snapshot(&config.primary, &output)?;
    println!(
        "Dumped {} objects of {} into {}",
        dump.objects.len(),
        config.primary.database,
        output.display()
    );
    Ok(())
}

/// `error: cause: cause`, following `source()`.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_colon_subcommands() {
        let cli = Cli::try_parse_from(["schemagate", "check:migrations", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckMigrations { json: true }));
        assert_eq!(cli.log_level, "info");

        let cli = Cli::try_parse_from(["schemagate", "--log-level", "debug", "dump:schema"]).unwrap();
        assert!(matches!(cli.command, Commands::DumpSchema { output: None }));
        assert_eq!(cli.log_level, "debug");

        assert!(Cli::try_parse_from(["schemagate", "migrate:down"]).is_err());
    }

    #[test]
    fn error_chain_skips_repeated_causes() {
        let e = Error::Io {
            context: "Error reading file schema/main_tmp.sql".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(
            error_chain(&e),
            "Error reading file schema/main_tmp.sql: missing"
        );
    }
}
