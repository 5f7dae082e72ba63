use std::fs;
use std::path::Path;

use mysql::prelude::*;
use mysql::{Conn, Row};
use tracing::debug;

use super::{write_file, DumpBackend, SchemaObjectKind};
use crate::config::DatabaseConfig;
use crate::connection::{quote_identifier, run_script, ConnectionProvider};
use crate::error::Error;
use crate::sql::{is_blank, preprocess_sql};

/// Dumps through `SHOW CREATE ...` statements over a regular driver connection.
///
/// Needs no client tools on the host. Output is plain SQL in the layout
/// `mysqldump --compact` produces, with stored programs wrapped in
/// `DELIMITER ;;` blocks so the `mysql` client can replay the files too.
#[derive(Debug, Clone, Default)]
pub struct NativeBackend {
    connections: ConnectionProvider,
}

impl NativeBackend {
    pub fn new(connections: ConnectionProvider) -> Self {
        Self { connections }
    }

    fn connect(&self, config: &DatabaseConfig) -> Result<Conn, Error> {
        if config.database.is_empty() {
            return Err(Error::NameRequired("Database"));
        }
        self.connections.connect(config)
    }

    /// SQL text recreating one object.
    pub(crate) fn render_object(
        &self,
        conn: &mut Conn,
        kind: SchemaObjectKind,
        name: &str,
        with_data: bool,
    ) -> Result<String, Error> {
        let failed = |reason: String| Error::Dump {
            kind,
            name: name.to_string(),
            reason,
        };

        let (statement, column) = match kind {
            SchemaObjectKind::Table => ("SHOW CREATE TABLE", "Create Table"),
            SchemaObjectKind::View => ("SHOW CREATE VIEW", "Create View"),
            SchemaObjectKind::Procedure => ("SHOW CREATE PROCEDURE", "Create Procedure"),
            SchemaObjectKind::Function => ("SHOW CREATE FUNCTION", "Create Function"),
            SchemaObjectKind::Trigger => ("SHOW CREATE TRIGGER", "SQL Original Statement"),
            SchemaObjectKind::Event => ("SHOW CREATE EVENT", "Create Event"),
            SchemaObjectKind::Database => {
                return Err(failed("not a single object".to_string()));
            }
        };

        let row: Option<Row> = conn
            .query_first(format!("{statement} {}", quote_identifier(name)))
            .map_err(|e| failed(e.to_string()))?;
        let definition = row
            .and_then(|row| row.get::<Option<String>, _>(column).flatten())
            .ok_or_else(|| failed(format!("no definition returned by {statement}")))?;

        let mut out = String::new();
        match kind {
            SchemaObjectKind::Table => {
                out.push_str("SET FOREIGN_KEY_CHECKS=0;\n");
                out.push_str(&definition);
                out.push_str(";\n");
                if with_data {
                    for insert in self.render_rows(conn, name).map_err(|e| failed(e.to_string()))? {
                        out.push_str(&insert);
                        out.push('\n');
                    }
                }
                out.push_str("SET FOREIGN_KEY_CHECKS=1;\n");
            }
            SchemaObjectKind::View => {
                out.push_str(&definition);
                out.push_str(";\n");
            }
            _ => {
                out.push_str("DELIMITER ;;\n");
                out.push_str(&definition);
                out.push_str(" ;;\n");
                out.push_str("DELIMITER ;\n");
            }
        }
        Ok(out)
    }

    /// One `INSERT` per row, values rendered as SQL literals.
    fn render_rows(&self, conn: &mut Conn, table: &str) -> Result<Vec<String>, mysql::Error> {
        let table = quote_identifier(table);
        let rows: Vec<Row> = conn.query(format!("SELECT * FROM {table}"))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let values: Vec<String> = (0..row.len())
                    .filter_map(|i| row.as_ref(i))
                    .map(|value| value.as_sql(false))
                    .collect();
                format!("INSERT INTO {table} VALUES ({});", values.join(","))
            })
            .collect())
    }

    fn names(&self, conn: &mut Conn, query: &str) -> Result<Vec<String>, Error> {
        Ok(conn.query(query)?)
    }
}

/// `views` (sorted by name) reordered so every view follows the views it
/// selects from. `uses` holds `(view, referenced table or view)` pairs.
fn order_views(views: Vec<String>, uses: &[(String, String)]) -> Vec<String> {
    let mut remaining = views;
    let mut ordered: Vec<String> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|view| {
            uses.iter().all(|(user, used)| {
                user != view || used == view || !remaining.contains(used)
            })
        });
        match ready {
            Some(i) => ordered.push(remaining.remove(i)),
            // a cycle cannot be created by the server; keep name order
            None => ordered.append(&mut remaining),
        }
    }
    ordered
}

impl DumpBackend for NativeBackend {
    fn dump_structure(&self, config: &DatabaseConfig, output: &Path) -> Result<(), Error> {
        let mut conn = self.connect(config)?;
        let bulk_failed = |e: Error| Error::Dump {
            kind: SchemaObjectKind::Database,
            name: config.database.clone(),
            reason: e.to_string(),
        };

        // Routines come before views so a view may call a stored function.
        let listings = [
            (
                SchemaObjectKind::Table,
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' ORDER BY table_name",
            ),
            (
                SchemaObjectKind::Function,
                "SELECT routine_name FROM information_schema.routines \
                 WHERE routine_schema = DATABASE() AND routine_type = 'FUNCTION' ORDER BY routine_name",
            ),
            (
                SchemaObjectKind::Procedure,
                "SELECT routine_name FROM information_schema.routines \
                 WHERE routine_schema = DATABASE() AND routine_type = 'PROCEDURE' ORDER BY routine_name",
            ),
            (
                SchemaObjectKind::View,
                "SELECT table_name FROM information_schema.views \
                 WHERE table_schema = DATABASE() ORDER BY table_name",
            ),
            (
                SchemaObjectKind::Trigger,
                "SELECT trigger_name FROM information_schema.triggers \
                 WHERE trigger_schema = DATABASE() ORDER BY trigger_name",
            ),
            (
                SchemaObjectKind::Event,
                "SELECT event_name FROM information_schema.events \
                 WHERE event_schema = DATABASE() ORDER BY event_name",
            ),
        ];

        let mut out = format!("-- Structure of database {}\n", config.database);
        for (kind, query) in listings {
            let mut names = self.names(&mut conn, query).map_err(bulk_failed)?;
            if kind == SchemaObjectKind::View {
                let uses: Vec<(String, String)> = conn
                    .query(
                        "SELECT view_name, table_name FROM information_schema.view_table_usage \
                         WHERE view_schema = DATABASE() AND table_schema = DATABASE()",
                    )
                    .map_err(|e| bulk_failed(e.into()))?;
                names = order_views(names, &uses);
            }
            for name in names {
                debug!(kind = %kind, name = %name, "Adding object to bulk dump");
                out.push_str(&self.render_object(&mut conn, kind, &name, false)?);
            }
        }
        write_file(output, &out)
    }

    fn dump_object(
        &self,
        config: &DatabaseConfig,
        kind: SchemaObjectKind,
        name: &str,
        with_data: bool,
        output: &Path,
    ) -> Result<(), Error> {
        let mut conn = self.connect(config)?;
        let sql = self.render_object(&mut conn, kind, name, with_data)?;
        write_file(output, &sql)
    }

    fn restore(&self, config: &DatabaseConfig, input: &Path) -> Result<(), Error> {
        let sql = fs::read_to_string(input)
            .map_err(|e| Error::io(format!("Error reading file {}", input.display()), e))?;
        let sql = preprocess_sql(&sql);
        // The server rejects a query that is nothing but comments
        if is_blank(&sql) {
            debug!(input = %input.display(), "Nothing to restore");
            return Ok(());
        }
        let mut conn = self.connect(config)?;
        run_script(&mut conn, &sql).map_err(|e| Error::Dump {
            kind: SchemaObjectKind::Database,
            name: config.database.clone(),
            reason: format!("restoring {} failed: {e}", input.display()),
        })
    }
}
