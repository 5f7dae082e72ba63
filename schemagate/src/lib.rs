//! `schemagate` applies forward-only SQL migration files to MySQL and checks
//! them against a disposable clone before they reach the primary database.
//!
//! Core concepts:
//! - Migrations are plain `*.sql` files, applied in file name order. Each file
//!   runs in its own transaction together with the row that records it in the
//!   `migration_history` table.
//! - A schema snapshot (one file per table, view, routine, trigger and event)
//!   is checked into source control next to the migrations.
//! - Validation copies the primary's structure and history into an ephemeral
//!   database, replays the pending files there and compares the result with
//!   the snapshot.
//!
//! # Applying migrations
//!
//! ```no_run
//! use std::path::Path;
//! use schemagate::{ConnectionProvider, DatabaseConfig, MigrationApplier, MigrationHistoryStore};
//!
//! # fn main() -> Result<(), schemagate::Error> {
//! let config = DatabaseConfig::new("127.0.0.1", 3306, "root", "secret", "app");
//! let mut conn = ConnectionProvider::default().connect(&config)?;
//!
//! let applier = MigrationApplier::new(MigrationHistoryStore::new("database/init_migrations.sql"))
//!     .on_migration_complete(|name, duration| println!("{name} took {duration:?}"));
//! let report = applier.apply(&mut conn, None, Path::new("migrations"))?;
//! println!("applied {:?}", report.applied_names());
//! # Ok(())
//! # }
//! ```
//!
//! # Validating pending migrations
//!
//! [`ValidationOrchestrator::run`] walks the whole pipeline and always cleans
//! up the ephemeral database, its scratch files and any infrastructure it
//! tried to start.
//!
//! # Extension points
//!
//! - [`DumpBackend`]: how definitions are extracted and replayed
//!   ([`NativeBackend`] or [`MysqldumpBackend`]).
//! - [`SchemaDiff`]: how two dump trees are compared.
//! - [`EphemeralInfrastructure`]: how the ephemeral server is started and stopped.

mod applier;
pub use applier::{AppliedMigration, ApplyReport, MigrationApplier};

mod compare;
pub use compare::{normalize, SchemaComparator, SchemaComparisonResult, SchemaDiff};

mod config;
pub use config::{DatabaseConfig, PipelinePaths, PoolLimits, ValidationSettings};

mod connection;
pub use connection::{quote_identifier, run_script, ConnectionProvider};

mod dump;
pub use dump::{
    DumpBackend, DumpedObject, MysqldumpBackend, NativeBackend, SchemaDump, SchemaDumper,
    SchemaObjectKind, BULK_DUMP_FILE,
};

mod error;
pub use error::Error;

mod history;
pub use history::{MigrationHistoryRecord, MigrationHistoryStore, HISTORY_TABLE};

mod infra;
pub use infra::{CommandInfrastructure, EphemeralInfrastructure, ExternalInfrastructure};

mod migration;
pub use migration::{pending_migrations, MigrationFile};

mod orchestrator;
pub use orchestrator::{
    ephemeral_database_name, ValidationOrchestrator, ValidationOutcome, ValidationReport,
    ValidationState, TEMP_PREFIX,
};

mod retry;
pub use retry::{retry, Backoff, RetryExhausted, RetryPolicy};

pub mod sql;

#[cfg(test)]
pub(crate) mod test_mysql;
