//!
//! # Applying migration files
//!
//! Pending files run one by one, each inside its own transaction together with
//! the history row that names it. The first failure rolls that file back and
//! stops the run; files committed before it stay committed.
//!
//! MySQL commits DDL implicitly, so a file that fails *after* a successful DDL
//! statement leaves that statement applied even though its history row is
//! rolled back. Keep each file to one logical change.

use std::path::Path;
use std::time::{Duration, Instant};

use mysql::{Conn, Transaction, TxOpts};
use tracing::{debug, error, info};

use crate::connection::run_script;
use crate::error::Error;
use crate::history::MigrationHistoryStore;
use crate::migration::{pending_migrations, MigrationFile};
use crate::sql::{is_blank, preprocess_sql};

/// A file applied during this run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AppliedMigration {
    pub name: String,
    pub checksum: String,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

/// What a call to [`MigrationApplier::apply`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Files found in the history table and therefore not executed.
    pub skipped: Vec<String>,
    /// Files executed and recorded, in order.
    pub applied: Vec<AppliedMigration>,
}

impl ApplyReport {
    pub fn applied_names(&self) -> Vec<&str> {
        self.applied.iter().map(|m| m.name.as_str()).collect()
    }
}

/// Applies pending migration files from a directory.
pub struct MigrationApplier {
    store: MigrationHistoryStore,
    on_migration_start: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_migration_complete: Option<Box<dyn Fn(&str, Duration) + Send + Sync>>,
    on_migration_error: Option<Box<dyn Fn(&str, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for MigrationApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationApplier")
            .field("store", &self.store)
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

impl MigrationApplier {
    pub fn new(store: MigrationHistoryStore) -> Self {
        Self {
            store,
            on_migration_start: None,
            on_migration_complete: None,
            on_migration_error: None,
        }
    }

    pub fn store(&self) -> &MigrationHistoryStore {
        &self.store
    }

    /// Called with the file name right before a file is executed.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Called with the file name and duration once a file is committed.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Called with the file name and error when a file is rolled back.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    /// The files of `migrations_dir` not yet recorded in the history table.
    /// Creates the history table if needed.
    pub fn preview(
        &self,
        history: &mut Conn,
        migrations_dir: &Path,
    ) -> Result<Vec<MigrationFile>, Error> {
        self.store.ensure_history_table(history)?;
        let applied = self.store.get_applied(history)?;
        let files = MigrationFile::load_dir(migrations_dir)?;
        Ok(pending_migrations(&files, &applied)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Apply every pending file of `migrations_dir` to `primary`.
    ///
    /// History rows go to `history` when given, otherwise to `primary`. With a
    /// separate history connection the two commits are not atomic: the primary
    /// transaction commits first, so a crash in between leaves the change
    /// applied but unrecorded.
    pub fn apply(
        &self,
        primary: &mut Conn,
        mut history: Option<&mut Conn>,
        migrations_dir: &Path,
    ) -> Result<ApplyReport, Error> {
        let applied = match history.as_deref_mut() {
            Some(conn) => {
                self.store.ensure_history_table(conn)?;
                self.store.get_applied(conn)?
            }
            None => {
                self.store.ensure_history_table(primary)?;
                self.store.get_applied(primary)?
            }
        };

        let files = MigrationFile::load_dir(migrations_dir)?;
        let pending = pending_migrations(&files, &applied);

        let mut report = ApplyReport::default();
        if pending.is_empty() {
            info!("No outstanding migrations. Ending application");
            return Ok(report);
        }

        for record in &applied {
            info!(migration = %record.name, "Skipping already applied migration file");
            report.skipped.push(record.name.clone());
        }

        debug!(
            pending = ?pending.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "Considering migrations to run"
        );

        for file in pending {
            let started = Instant::now();
            if let Some(ref callback) = self.on_migration_start {
                callback(&file.name);
            }

            if let Err(error) = self.apply_one(primary, history.as_deref_mut(), file) {
                if let Some(ref callback) = self.on_migration_error {
                    callback(&file.name, &error);
                }
                return Err(error);
            }

            let duration = started.elapsed();
            if let Some(ref callback) = self.on_migration_complete {
                callback(&file.name, duration);
            }
            report.applied.push(AppliedMigration {
                name: file.name.clone(),
                checksum: file.checksum(),
                duration,
            });
        }

        Ok(report)
    }

    fn apply_one(
        &self,
        primary: &mut Conn,
        history: Option<&mut Conn>,
        file: &MigrationFile,
    ) -> Result<(), Error> {
        info!(migration = %file.name, checksum = %file.checksum(), "Applying migration");
        let sql = preprocess_sql(&file.sql);

        let mut primary_tx = primary.start_transaction(TxOpts::default())?;
        let mut history_tx = match history {
            Some(conn) => Some(conn.start_transaction(TxOpts::default())?),
            None => None,
        };

        let executed = self.execute_and_record(&mut primary_tx, history_tx.as_mut(), file, &sql);
        let committed = executed.and_then(|()| {
            primary_tx.commit()?;
            if let Some(tx) = history_tx.take() {
                tx.commit()?;
            }
            Ok(())
        });

        match committed {
            Ok(()) => {
                info!(migration = %file.name, "Applied migration successfully");
                Ok(())
            }
            Err(source) => {
                error!(migration = %file.name, error = %source, "Failed migration: {}. Rolling back changes", file.name);
                // Whatever was not committed rolls back when its transaction is dropped
                drop(history_tx);
                Err(Error::MigrationExecution {
                    name: file.name.clone(),
                    source,
                })
            }
        }
    }

    fn execute_and_record(
        &self,
        primary: &mut Transaction<'_>,
        history: Option<&mut Transaction<'_>>,
        file: &MigrationFile,
        sql: &str,
    ) -> Result<(), mysql::Error> {
        if !is_blank(sql) {
            run_script(primary, sql)?;
        }
        match history {
            Some(tx) => self.store.record(tx, &file.name),
            None => self.store.record(primary, &file.name),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}
