use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use mysql::prelude::*;
use tracing::{error, info};

use crate::connection::run_script;
use crate::error::Error;

/// Name of the table that records applied migration files.
pub const HISTORY_TABLE: &str = "migration_history";

const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One row of the history table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationHistoryRecord {
    pub id: u64,
    pub name: String,
    pub created_at: NaiveDateTime,
}

/// Reads and appends to the history table.
///
/// Every method is generic over [`Queryable`], so it runs the same on a plain
/// connection or inside an open transaction.
#[derive(Debug, Clone)]
pub struct MigrationHistoryStore {
    init_script: PathBuf,
}

impl MigrationHistoryStore {
    /// `init_script` is the SQL file that creates the history table.
    pub fn new(init_script: impl Into<PathBuf>) -> Self {
        Self {
            init_script: init_script.into(),
        }
    }

    pub fn init_script(&self) -> &Path {
        &self.init_script
    }

    /// Read the init script. A missing script is a configuration problem, not a database one.
    pub fn load_init_script(&self) -> Result<String, Error> {
        if !self.init_script.is_file() {
            return Err(Error::Configuration(format!(
                "Missing migration init file at: {}",
                self.init_script.display()
            )));
        }
        fs::read_to_string(&self.init_script).map_err(|e| {
            Error::io(
                format!("Error reading file {}", self.init_script.display()),
                e,
            )
        })
    }

    /// Create the history table unless it already exists.
    pub fn ensure_history_table<Q: Queryable>(&self, conn: &mut Q) -> Result<(), Error> {
        info!("Validating migrations table");
        let script = self.load_init_script()?;
        run_script(conn, &script)?;
        Ok(())
    }

    /// Applied migrations, oldest first.
    pub fn get_applied<Q: Queryable>(
        &self,
        conn: &mut Q,
    ) -> Result<Vec<MigrationHistoryRecord>, Error> {
        let rows: Vec<(u64, String, String)> = conn
            .query(format!(
                "SELECT id, name, DATE_FORMAT(created_at, '%Y-%m-%d %H:%i:%s') \
                 FROM {HISTORY_TABLE} ORDER BY id ASC"
            ))
            .map_err(|e| {
                error!(error = %e, "Error fetching applied migrations");
                Error::from(e)
            })?;

        rows.into_iter()
            .map(|(id, name, created_at)| {
                let created_at = NaiveDateTime::parse_from_str(&created_at, CREATED_AT_FORMAT)
                    .map_err(|e| {
                        Error::Configuration(format!(
                            "unreadable created_at '{created_at}' for migration {name}: {e}"
                        ))
                    })?;
                Ok(MigrationHistoryRecord {
                    id,
                    name,
                    created_at,
                })
            })
            .collect()
    }

    /// Append a row naming `name`.
    pub fn record<Q: Queryable>(&self, conn: &mut Q, name: &str) -> Result<(), mysql::Error> {
        conn.exec_drop(
            format!("INSERT INTO {HISTORY_TABLE} (name) VALUES (?)"),
            (name,),
        )
    }
}
