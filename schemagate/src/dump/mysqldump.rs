use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::{debug, error};

use super::{write_file, DumpBackend, NativeBackend, SchemaObjectKind};
use crate::config::DatabaseConfig;
use crate::connection::ConnectionProvider;
use crate::error::Error;

/// Dumps with the `mysqldump` client and restores with `mysql`.
///
/// `mysqldump` has no per-object switch for stored programs, so procedures,
/// functions, triggers and events go through [`NativeBackend`].
#[derive(Debug, Clone)]
pub struct MysqldumpBackend {
    mysqldump: PathBuf,
    mysql: PathBuf,
    native: NativeBackend,
}

impl MysqldumpBackend {
    /// Uses `mysqldump` and `mysql` from `PATH`.
    pub fn new(connections: ConnectionProvider) -> Self {
        Self {
            mysqldump: PathBuf::from("mysqldump"),
            mysql: PathBuf::from("mysql"),
            native: NativeBackend::new(connections),
        }
    }

    pub fn with_binaries(mut self, mysqldump: impl Into<PathBuf>, mysql: impl Into<PathBuf>) -> Self {
        self.mysqldump = mysqldump.into();
        self.mysql = mysql.into();
        self
    }

    /// A client command for `config`. The password goes through `MYSQL_PWD`
    /// so it never shows up in the process list.
    fn command(&self, program: &Path, config: &DatabaseConfig) -> Command {
        let mut command = Command::new(program);
        command
            .arg("-h")
            .arg(&config.host)
            .arg("-P")
            .arg(config.port.to_string())
            .arg("-u")
            .arg(&config.user)
            .env("MYSQL_PWD", &config.password);
        command
    }

    fn run(
        &self,
        mut command: Command,
        kind: SchemaObjectKind,
        name: &str,
    ) -> Result<Output, Error> {
        debug!(command = ?command.get_program(), args = ?command.get_args().collect::<Vec<_>>(), "Running client tool");
        let output = command.output().map_err(|e| {
            Error::io(
                format!("Error running {}", command.get_program().to_string_lossy()),
                e,
            )
        })?;
        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(kind = %kind, name, status = %output.status, reason = %reason, "Client tool failed");
            return Err(Error::Dump {
                kind,
                name: name.to_string(),
                reason,
            });
        }
        Ok(output)
    }

    fn write_stdout(output: &Output, path: &Path) -> Result<(), Error> {
        write_file(path, &String::from_utf8_lossy(&output.stdout))
    }
}

impl DumpBackend for MysqldumpBackend {
    fn dump_structure(&self, config: &DatabaseConfig, output: &Path) -> Result<(), Error> {
        if config.database.is_empty() {
            return Err(Error::NameRequired("Database"));
        }
        let mut command = self.command(&self.mysqldump, config);
        command
            .args([
                "--no-data",
                "--single-transaction",
                "--routines",
                "--triggers",
                "--events",
            ])
            .arg(&config.database);
        let out = self.run(command, SchemaObjectKind::Database, &config.database)?;
        Self::write_stdout(&out, output)
    }

    fn dump_object(
        &self,
        config: &DatabaseConfig,
        kind: SchemaObjectKind,
        name: &str,
        with_data: bool,
        output: &Path,
    ) -> Result<(), Error> {
        match kind {
            SchemaObjectKind::Table | SchemaObjectKind::View => {
                let mut command = self.command(&self.mysqldump, config);
                if !(with_data && kind == SchemaObjectKind::Table) {
                    command.arg("--no-data");
                }
                command
                    .args(["--compact", "--skip-triggers"])
                    .arg(&config.database)
                    .arg(name);
                let out = self.run(command, kind, name)?;
                // mysqldump exits 0 with empty output for an unknown table
                if out.stdout.iter().all(u8::is_ascii_whitespace) {
                    return Err(Error::Dump {
                        kind,
                        name: name.to_string(),
                        reason: "mysqldump returned no definition".to_string(),
                    });
                }
                Self::write_stdout(&out, output)
            }
            _ => self
                .native
                .dump_object(config, kind, name, with_data, output),
        }
    }

    fn restore(&self, config: &DatabaseConfig, input: &Path) -> Result<(), Error> {
        let file = File::open(input)
            .map_err(|e| Error::io(format!("Error reading file {}", input.display()), e))?;
        let mut command = self.command(&self.mysql, config);
        command
            .arg(&config.database)
            .stdin(Stdio::from(file))
            .stdout(Stdio::null());
        self.run(command, SchemaObjectKind::Database, &config.database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    fn backend() -> MysqldumpBackend {
        MysqldumpBackend::new(ConnectionProvider::new(RetryPolicy::immediate(1)))
    }

    #[test]
    fn password_travels_in_the_environment() {
        let config = DatabaseConfig::new("db.internal", 3307, "app", "s3cret", "main");
        let command = backend().command(Path::new("mysqldump"), &config);

        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["-h", "db.internal", "-P", "3307", "-u", "app"]);
        assert!(!args.iter().any(|a| a.contains("s3cret")));

        let pwd = command
            .get_envs()
            .find(|(key, _)| *key == "MYSQL_PWD")
            .and_then(|(_, value)| value);
        assert_eq!(pwd.map(|v| v.to_string_lossy().into_owned()), Some("s3cret".to_string()));
    }

    #[test]
    fn failing_tool_reports_the_object() {
        let config = DatabaseConfig::new("127.0.0.1", 1, "root", "", "main");
        let out = tempfile::tempdir().unwrap();
        // `false` ignores its arguments and exits 1
        let backend = backend().with_binaries("false", "false");

        match backend.dump_object(&config, SchemaObjectKind::Table, "users", false, &out.path().join("users.sql")) {
            Err(Error::Dump { kind, name, .. }) => {
                assert_eq!(kind, SchemaObjectKind::Table);
                assert_eq!(name, "users");
            }
            other => panic!("expected dump error, got {:?}", other),
        }
    }

    #[test]
    fn missing_binary_is_an_io_error() {
        let config = DatabaseConfig::new("127.0.0.1", 1, "root", "", "main");
        let out = tempfile::tempdir().unwrap();
        let backend = backend().with_binaries("/nonexistent/mysqldump", "/nonexistent/mysql");

        assert!(matches!(
            backend.dump_structure(&config, &out.path().join("bulk.sql")),
            Err(Error::Io { .. })
        ));
    }
}
