//!
//! # Schema dumps
//!
//! A dump is a directory with one sub directory per object kind and one file per
//! object:
//!
//! ```text
//! schema/
//!   table/users.sql
//!   table/migration_history.sql   (the only file that carries rows)
//!   view/active_users.sql
//!   procedure/bump.sql
//!   main_tmp.sql                  (optional single-file structural dump)
//! ```
//!
//! Extraction itself is delegated to a [`DumpBackend`]. [`NativeBackend`]
//! talks to the server through the `mysql` driver only, [`MysqldumpBackend`]
//! shells out to the client tools.

mod mysqldump;
mod native;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use mysql::prelude::*;
use tracing::{error, info};

use crate::config::DatabaseConfig;
use crate::connection::ConnectionProvider;
use crate::error::Error;
use crate::history::HISTORY_TABLE;

pub use mysqldump::MysqldumpBackend;
pub use native::NativeBackend;

/// File name of the single-file structural dump.
pub const BULK_DUMP_FILE: &str = "main_tmp.sql";

/// What a dumped file describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaObjectKind {
    Table,
    Procedure,
    View,
    Trigger,
    Event,
    Function,
    /// A whole database, for bulk dumps and restores.
    Database,
}

impl SchemaObjectKind {
    /// Kinds that get their own directory in a dump tree, in dump order.
    pub const OBJECTS: [SchemaObjectKind; 6] = [
        SchemaObjectKind::Table,
        SchemaObjectKind::Procedure,
        SchemaObjectKind::View,
        SchemaObjectKind::Event,
        SchemaObjectKind::Function,
        SchemaObjectKind::Trigger,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            SchemaObjectKind::Table => "table",
            SchemaObjectKind::Procedure => "procedure",
            SchemaObjectKind::View => "view",
            SchemaObjectKind::Trigger => "trigger",
            SchemaObjectKind::Event => "event",
            SchemaObjectKind::Function => "function",
            SchemaObjectKind::Database => "database",
        }
    }
}

impl fmt::Display for SchemaObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Capability to extract and replay schema definitions.
///
/// Implementations connect on every call; nothing is held between calls.
pub trait DumpBackend: Send + Sync {
    /// Write a structure-only dump of the whole database of `config` to `output`.
    fn dump_structure(&self, config: &DatabaseConfig, output: &Path) -> Result<(), Error>;

    /// Write the definition of one object to `output`. `with_data` only applies
    /// to tables.
    fn dump_object(
        &self,
        config: &DatabaseConfig,
        kind: SchemaObjectKind,
        name: &str,
        with_data: bool,
        output: &Path,
    ) -> Result<(), Error>;

    /// Execute the dump file `input` against the database of `config`.
    fn restore(&self, config: &DatabaseConfig, input: &Path) -> Result<(), Error>;
}

/// One file of a dump tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpedObject {
    pub kind: SchemaObjectKind,
    pub name: String,
    pub path: PathBuf,
}

/// Result of [`SchemaDumper::dump_schema`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDump {
    pub root: PathBuf,
    pub objects: Vec<DumpedObject>,
    pub bulk: Option<PathBuf>,
}

impl SchemaDump {
    pub fn names_of(&self, kind: SchemaObjectKind) -> Vec<&str> {
        self.objects
            .iter()
            .filter(|o| o.kind == kind)
            .map(|o| o.name.as_str())
            .collect()
    }
}

/// Writes schema dumps through a [`DumpBackend`].
pub struct SchemaDumper {
    backend: Box<dyn DumpBackend>,
    connections: ConnectionProvider,
}

impl fmt::Debug for SchemaDumper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaDumper")
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

impl SchemaDumper {
    pub fn new(backend: Box<dyn DumpBackend>, connections: ConnectionProvider) -> Self {
        Self {
            backend,
            connections,
        }
    }

    /// Dumper backed by [`NativeBackend`].
    pub fn native(connections: ConnectionProvider) -> Self {
        Self::new(Box::new(NativeBackend::new(connections.clone())), connections)
    }

    /// Dump every object of the database of `config` into `output_dir`, one file each.
    ///
    /// Stops at the first object that fails; files already written are left in place.
    pub fn dump_schema(
        &self,
        config: &DatabaseConfig,
        output_dir: &Path,
    ) -> Result<SchemaDump, Error> {
        if config.database.is_empty() {
            return Err(Error::NameRequired("Database"));
        }
        info!(database = %config.database, output = %output_dir.display(), "Dumping schema");

        let inventory = self.list_objects(config)?;
        let mut dump = SchemaDump {
            root: output_dir.to_path_buf(),
            ..SchemaDump::default()
        };

        for (kind, name) in inventory {
            let path = match self.dump_one(config, kind, &name, output_dir) {
                Ok(path) => path,
                Err(e) => {
                    error!(kind = %kind, name = %name, error = %e, "Stopping table dumping due to error");
                    return Err(e);
                }
            };
            dump.objects.push(DumpedObject { kind, name, path });
        }

        info!(
            database = %config.database,
            objects = dump.objects.len(),
            "Schema dump finished"
        );
        Ok(dump)
    }

    /// [`dump_schema`](Self::dump_schema) plus the bulk file, the layout `dump:schema` writes.
    pub fn dump_snapshot(
        &self,
        config: &DatabaseConfig,
        output_dir: &Path,
    ) -> Result<SchemaDump, Error> {
        let mut dump = self.dump_schema(config, output_dir)?;
        dump.bulk = Some(self.dump_bulk(config, output_dir)?);
        Ok(dump)
    }

    /// Single-file structural dump of the whole database, written to
    /// `output_dir/main_tmp.sql`.
    pub fn dump_bulk(&self, config: &DatabaseConfig, output_dir: &Path) -> Result<PathBuf, Error> {
        if config.database.is_empty() {
            return Err(Error::NameRequired("Database"));
        }
        create_dir(output_dir)?;
        let path = output_dir.join(BULK_DUMP_FILE);
        info!(database = %config.database, output = %path.display(), "Creating bulk dump");
        self.backend.dump_structure(config, &path)?;
        Ok(path)
    }

    /// Dump a single table into `output_dir/table/<name>.sql`. The history
    /// table keeps its rows, every other table is structure only.
    pub fn dump_table(
        &self,
        name: &str,
        config: &DatabaseConfig,
        output_dir: &Path,
    ) -> Result<PathBuf, Error> {
        if name.is_empty() {
            return Err(Error::NameRequired("Table"));
        }
        self.dump_one(config, SchemaObjectKind::Table, name, output_dir)
    }

    /// Execute a dump file against the database of `config`.
    pub fn restore(&self, config: &DatabaseConfig, input: &Path) -> Result<(), Error> {
        if !input.is_file() {
            return Err(Error::Configuration(format!(
                "dump file {} does not exist",
                input.display()
            )));
        }
        info!(database = %config.database, input = %input.display(), "Restoring dump");
        self.backend.restore(config, input)
    }

    fn dump_one(
        &self,
        config: &DatabaseConfig,
        kind: SchemaObjectKind,
        name: &str,
        output_dir: &Path,
    ) -> Result<PathBuf, Error> {
        let dir = output_dir.join(kind.dir_name());
        create_dir(&dir)?;
        let path = dir.join(object_file_name(name));
        let with_data = kind == SchemaObjectKind::Table && name == HISTORY_TABLE;
        info!(kind = %kind, name, with_data, "Dumping object");
        self.backend
            .dump_object(config, kind, name, with_data, &path)?;
        Ok(path)
    }

    /// Every dumpable object of the database, grouped by kind in dump order
    /// and sorted by name within a kind.
    fn list_objects(
        &self,
        config: &DatabaseConfig,
    ) -> Result<Vec<(SchemaObjectKind, String)>, Error> {
        let mut conn = self.connections.connect(config)?;
        let mut objects = Vec::new();

        for kind in SchemaObjectKind::OBJECTS {
            let query = match kind {
                SchemaObjectKind::Table => {
                    "SELECT table_name FROM information_schema.tables \
                     WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' \
                     ORDER BY table_name"
                }
                SchemaObjectKind::View => {
                    "SELECT table_name FROM information_schema.views \
                     WHERE table_schema = DATABASE() ORDER BY table_name"
                }
                SchemaObjectKind::Procedure => {
                    "SELECT routine_name FROM information_schema.routines \
                     WHERE routine_schema = DATABASE() AND routine_type = 'PROCEDURE' \
                     ORDER BY routine_name"
                }
                SchemaObjectKind::Function => {
                    "SELECT routine_name FROM information_schema.routines \
                     WHERE routine_schema = DATABASE() AND routine_type = 'FUNCTION' \
                     ORDER BY routine_name"
                }
                SchemaObjectKind::Trigger => {
                    "SELECT trigger_name FROM information_schema.triggers \
                     WHERE trigger_schema = DATABASE() ORDER BY trigger_name"
                }
                SchemaObjectKind::Event => {
                    "SELECT event_name FROM information_schema.events \
                     WHERE event_schema = DATABASE() ORDER BY event_name"
                }
                SchemaObjectKind::Database => continue,
            };
            let names: Vec<String> = conn.query(query).map_err(|e| {
                error!(kind = %kind, error = %e, "Error listing schema objects");
                Error::from(e)
            })?;
            objects.extend(names.into_iter().map(|name| (kind, name)));
        }

        Ok(objects)
    }
}

/// File name for an object. Quoted identifiers may contain path separators
/// or start with a dot, so those are percent-escaped (`%` too, keeping the
/// mapping one to one).
pub(crate) fn object_file_name(name: &str) -> String {
    let mut file = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        match c {
            '%' => file.push_str("%25"),
            '/' => file.push_str("%2F"),
            '\\' => file.push_str("%5C"),
            '.' if i == 0 => file.push_str("%2E"),
            c => file.push(c),
        }
    }
    file.push_str(".sql");
    file
}

pub(crate) fn create_dir(dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("Error creating directory {}", dir.display()), e))
}

pub(crate) fn write_file(path: &Path, content: &str) -> Result<(), Error> {
    fs::write(path, content)
        .map_err(|e| Error::io(format!("Error writing file {}", path.display()), e))
}
