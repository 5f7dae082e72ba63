//!
//! # Validating pending migrations
//!
//! Pending migrations are never tried on the primary database first. Instead
//! the primary's structure and history are copied into a throw-away database,
//! the migrations are replayed there, and the result is compared with the
//! schema snapshot checked into source control.
//!
//! ```text
//! Init -> HistoryChecked -> NoOpExit ----------------------------------+
//!                        \-> ProvisioningEphemeral -> Migrating        |
//!                              -> Comparing -> Passed | Failed         |
//!                                                    -> CleaningUp <---+
//!                                                         -> Done
//! ```
//!
//! Cleanup runs after every outcome, including errors. Once provisioning was
//! attempted the infrastructure is stopped, even when starting it failed.
//! Cleanup problems are logged and never replace the outcome of the run.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use mysql::prelude::*;
use mysql::TxOpts;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::applier::{AppliedMigration, MigrationApplier};
use crate::compare::SchemaDiff;
use crate::config::ValidationSettings;
use crate::connection::ConnectionProvider;
use crate::dump::{create_dir, SchemaDumper};
use crate::error::Error;
use crate::history::{MigrationHistoryStore, HISTORY_TABLE};
use crate::infra::EphemeralInfrastructure;
use crate::migration::{pending_migrations, MigrationFile};
use crate::sql::extract_insert_statements;

/// Prefix of every ephemeral database name.
pub const TEMP_PREFIX: &str = "tmp__";

/// Steps of a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Init,
    HistoryChecked,
    NoOpExit,
    ProvisioningEphemeral,
    Migrating,
    Comparing,
    Passed,
    Failed,
    CleaningUp,
    Done,
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Every migration file is already recorded on the primary.
    NoPendingMigrations,
    /// The replayed schema matches the snapshot.
    Passed,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationReport {
    pub outcome: ValidationOutcome,
    pub trail: Vec<ValidationState>,
    pub ephemeral_database: Option<String>,
    pub applied: Vec<AppliedMigration>,
    pub diff: String,
}

/// A unique ephemeral database name: `tmp__<UTC millis timestamp>_<random hex>`.
pub fn ephemeral_database_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{TEMP_PREFIX}{}_{}",
        Utc::now().format("%Y%m%d%H%M%S%3f"),
        &suffix[..8]
    )
}

/// Per-run resources that cleanup has to release.
#[derive(Debug, Default)]
struct RunResources {
    run_dir: PathBuf,
    ephemeral_database: Option<String>,
    /// Set before `start`, which may fail after creating containers.
    infra_requested: bool,
}

/// Runs the validation pipeline.
pub struct ValidationOrchestrator {
    settings: ValidationSettings,
    connections: ConnectionProvider,
    dumper: SchemaDumper,
    differ: Box<dyn SchemaDiff>,
    infra: Box<dyn EphemeralInfrastructure>,
    store: MigrationHistoryStore,
    applier: MigrationApplier,
    trail: Vec<ValidationState>,
    last_ephemeral_database: Option<String>,
}

impl std::fmt::Debug for ValidationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationOrchestrator")
            .field("settings", &self.settings)
            .field("dumper", &self.dumper)
            .field("trail", &self.trail)
            .finish_non_exhaustive()
    }
}

impl ValidationOrchestrator {
    pub fn new(
        settings: ValidationSettings,
        connections: ConnectionProvider,
        dumper: SchemaDumper,
        differ: Box<dyn SchemaDiff>,
        infra: Box<dyn EphemeralInfrastructure>,
    ) -> Self {
        let store = MigrationHistoryStore::new(settings.paths.init_script.clone());
        let applier = MigrationApplier::new(store.clone());
        Self {
            settings,
            connections,
            dumper,
            differ,
            infra,
            store,
            applier,
            trail: Vec::new(),
            last_ephemeral_database: None,
        }
    }

    /// Replace the applier used for the replay, e.g. to attach hooks.
    pub fn with_applier(mut self, applier: MigrationApplier) -> Self {
        self.applier = applier;
        self
    }

    /// States walked by the last run.
    pub fn trail(&self) -> &[ValidationState] {
        &self.trail
    }

    /// Ephemeral database created by the last run, if it got that far.
    pub fn last_ephemeral_database(&self) -> Option<&str> {
        self.last_ephemeral_database.as_deref()
    }

    fn enter(&mut self, state: ValidationState) {
        info!(state = ?state, "Validation state");
        self.trail.push(state);
    }

    /// Validate the pending migrations.
    ///
    /// Returns [`Error::ValidationFailure`] when the replayed schema differs
    /// from the snapshot.
    pub fn run(&mut self) -> Result<ValidationReport, Error> {
        self.trail.clear();
        self.last_ephemeral_database = None;
        self.enter(ValidationState::Init);

        let run_name = ephemeral_database_name();
        let mut resources = RunResources {
            run_dir: self.settings.paths.work_dir.join(&run_name),
            ..RunResources::default()
        };

        let result = self.execute(&run_name, &mut resources);
        if let Err(ref e) = result {
            error!(error = %e, "Migration validation failed");
            if self.trail.last() != Some(&ValidationState::Failed) {
                self.enter(ValidationState::Failed);
            }
        }

        self.enter(ValidationState::CleaningUp);
        self.cleanup(&resources);
        self.enter(ValidationState::Done);

        result.map(|mut report| {
            report.trail = self.trail.clone();
            report
        })
    }

    fn execute(
        &mut self,
        run_name: &str,
        resources: &mut RunResources,
    ) -> Result<ValidationReport, Error> {
        create_dir(&resources.run_dir)?;
        let primary = self.settings.primary.clone();
        let paths = self.settings.paths.clone();

        let mut conn = self.connections.connect(&primary)?;
        let history_exists = self.connections.table_exists(&mut conn, HISTORY_TABLE)?;
        self.enter(ValidationState::HistoryChecked);

        let files = MigrationFile::load_dir(&paths.migrations_dir)?;
        let history_dump = if history_exists {
            let applied = self.store.get_applied(&mut conn)?;
            if pending_migrations(&files, &applied).is_empty() {
                info!("No unapplied migrations. Exiting");
                self.enter(ValidationState::NoOpExit);
                return Ok(ValidationReport {
                    outcome: ValidationOutcome::NoPendingMigrations,
                    trail: Vec::new(),
                    ephemeral_database: None,
                    applied: Vec::new(),
                    diff: String::new(),
                });
            }
            Some(self.dumper.dump_table(
                HISTORY_TABLE,
                &primary,
                &resources.run_dir.join("history"),
            )?)
        } else {
            info!("No migration history on the primary database. Validating from a fresh start");
            None
        };
        drop(conn);

        self.enter(ValidationState::ProvisioningEphemeral);
        resources.infra_requested = true;
        self.infra.start()?;

        let bulk = self
            .dumper
            .dump_bulk(&primary, &resources.run_dir.join("bulk"))?;

        let mut server = self.connections.connect_server(&self.settings.ephemeral)?;
        self.connections.create_database(&mut server, run_name)?;
        drop(server);
        resources.ephemeral_database = Some(run_name.to_string());
        self.last_ephemeral_database = Some(run_name.to_string());
        let ephemeral = self.settings.ephemeral.with_database(run_name);

        self.dumper.restore(&ephemeral, &bulk)?;
        let mut ephemeral_conn = self.connections.connect(&ephemeral)?;
        self.store.ensure_history_table(&mut ephemeral_conn)?;
        if let Some(ref path) = history_dump {
            self.restore_history(&mut ephemeral_conn, path)?;
        }

        self.enter(ValidationState::Migrating);
        let report = self
            .applier
            .apply(&mut ephemeral_conn, None, &paths.migrations_dir)?;
        drop(ephemeral_conn);

        self.enter(ValidationState::Comparing);
        let replayed_dir = resources.run_dir.join("ephemeral");
        self.dumper.dump_schema(&ephemeral, &replayed_dir)?;
        let comparison = self.differ.diff_trees(&paths.snapshot_dir, &replayed_dir)?;

        if !comparison.is_identical {
            error!("Schemas differ after replaying migrations:\n{}", comparison.diff);
            self.enter(ValidationState::Failed);
            return Err(Error::ValidationFailure {
                diff: comparison.diff,
            });
        }

        info!(
            applied = report.applied.len(),
            "Migrations replayed cleanly and match the schema snapshot"
        );
        self.enter(ValidationState::Passed);
        Ok(ValidationReport {
            outcome: ValidationOutcome::Passed,
            trail: Vec::new(),
            ephemeral_database: Some(run_name.to_string()),
            applied: report.applied,
            diff: comparison.diff,
        })
    }

    /// Replay only the rows of a history dump; its table definition is
    /// already in place.
    fn restore_history(&self, conn: &mut mysql::Conn, dump: &Path) -> Result<(), Error> {
        let sql = fs::read_to_string(dump)
            .map_err(|e| Error::io(format!("Error reading file {}", dump.display()), e))?;
        let inserts = extract_insert_statements(&sql);
        info!(rows = inserts.len(), "Restoring migration history");

        let mut tx = conn.start_transaction(TxOpts::default())?;
        for insert in &inserts {
            tx.query_drop(insert)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn cleanup(&self, resources: &RunResources) {
        if let Some(ref name) = resources.ephemeral_database {
            self.drop_ephemeral(name);
        }

        if resources.run_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&resources.run_dir) {
                warn!(dir = %resources.run_dir.display(), error = %e, "Could not remove temporary files");
            }
        }

        if resources.infra_requested {
            if let Err(e) = self.infra.stop() {
                error!(error = %e, "Could not stop ephemeral infrastructure");
            }
        }
    }

    fn drop_ephemeral(&self, name: &str) {
        let dropped = self
            .connections
            .connect_server(&self.settings.ephemeral)
            .and_then(|mut conn| self.connections.drop_database(&mut conn, name));
        if let Err(e) = dropped {
            warn!(database = name, error = %e, "Could not drop ephemeral database");
        }
    }
}
