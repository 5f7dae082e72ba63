//! Configuration read from the environment (and `.env`) once at start-up.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use schemagate::{
    CommandInfrastructure, ConnectionProvider, DatabaseConfig, DumpBackend, EphemeralInfrastructure,
    Error, ExternalInfrastructure, MysqldumpBackend, NativeBackend, PipelinePaths, RetryPolicy,
    ValidationSettings,
};

/// Value of `EPHEMERAL_UP_COMMAND` that means "the server is managed elsewhere".
const NO_COMMAND: &str = "none";

const DEFAULT_UP_COMMAND: &str = "docker compose --env-file .env up -d --build mysqldb";
const DEFAULT_DOWN_COMMAND: &str = "docker compose --env-file .env rm -sfv mysqldb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpBackendKind {
    Native,
    Mysqldump,
}

impl FromStr for DumpBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(DumpBackendKind::Native),
            "mysqldump" => Ok(DumpBackendKind::Mysqldump),
            other => Err(format!("unknown dump backend '{other}', expected native or mysqldump")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub primary: DatabaseConfig,
    /// Separate database holding the history table, when configured.
    pub history: Option<DatabaseConfig>,
    /// Server hosting ephemeral databases. No database selected.
    pub ephemeral: DatabaseConfig,
    pub paths: PipelinePaths,
    /// `None` when the ephemeral server is managed elsewhere.
    pub ephemeral_commands: Option<(String, String)>,
    pub dump_backend: DumpBackendKind,
    pub retry: RetryPolicy,
}

impl CliConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Every missing required variable is reported at once.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let missing: Vec<&str> = ["DB_HOST", "DB_PORT", "DB_USER", "DB_PASSWORD", "DB_NAME"]
            .into_iter()
            .filter(|&key| lookup(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Configuration(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let var = |key: &str| lookup(key).unwrap_or_default();
        let primary = DatabaseConfig::new(
            var("DB_HOST"),
            parse_required(&lookup, "DB_PORT")?,
            var("DB_USER"),
            var("DB_PASSWORD"),
            var("DB_NAME"),
        );

        let history = match lookup("DB_MIGRATION_NAME") {
            Some(name) if !name.is_empty() => Some(DatabaseConfig::new(
                lookup("DB_MIGRATION_HOST").unwrap_or_else(|| primary.host.clone()),
                parse_or(&lookup, "DB_MIGRATION_PORT", primary.port)?,
                lookup("DB_MIGRATION_USER").unwrap_or_else(|| primary.user.clone()),
                lookup("DB_MIGRATION_PASSWORD").unwrap_or_else(|| primary.password.clone()),
                name,
            )),
            _ => None,
        };

        let ephemeral = DatabaseConfig::new(
            lookup("TMP_DB_HOST").unwrap_or_else(|| primary.host.clone()),
            parse_or(&lookup, "TMP_DB_PORT", primary.port)?,
            lookup("TMP_DB_USER").unwrap_or_else(|| primary.user.clone()),
            lookup("TMP_DB_PASSWORD").unwrap_or_else(|| primary.password.clone()),
            "",
        );

        let defaults = PipelinePaths::default();
        let path_or = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);
        let paths = PipelinePaths {
            migrations_dir: path_or("MIGRATIONS_DIR", defaults.migrations_dir),
            snapshot_dir: path_or("SNAPSHOT_DIR", defaults.snapshot_dir),
            schema_output_dir: path_or("SCHEMA_OUTPUT_DIR", defaults.schema_output_dir),
            work_dir: path_or("WORK_DIR", defaults.work_dir),
            init_script: path_or("INIT_SCRIPT", defaults.init_script),
        };

        let up = lookup("EPHEMERAL_UP_COMMAND").unwrap_or_else(|| DEFAULT_UP_COMMAND.to_string());
        let down =
            lookup("EPHEMERAL_DOWN_COMMAND").unwrap_or_else(|| DEFAULT_DOWN_COMMAND.to_string());
        let ephemeral_commands =
            (!up.trim().is_empty() && !up.eq_ignore_ascii_case(NO_COMMAND)).then_some((up, down));

        let retry = RetryPolicy::fixed(
            parse_or(&lookup, "DB_CONNECT_RETRIES", RetryPolicy::default().max_attempts)?,
            Duration::from_millis(parse_or(&lookup, "DB_CONNECT_RETRY_DELAY_MS", 5_000u64)?),
        );

        Ok(Self {
            primary,
            history,
            ephemeral,
            paths,
            ephemeral_commands,
            dump_backend: parse_or(&lookup, "DUMP_BACKEND", DumpBackendKind::Native)?,
            retry,
        })
    }

    pub fn connections(&self) -> ConnectionProvider {
        ConnectionProvider::new(self.retry)
    }

    pub fn dump_backend(&self) -> Box<dyn DumpBackend> {
        match self.dump_backend {
            DumpBackendKind::Native => Box::new(NativeBackend::new(self.connections())),
            DumpBackendKind::Mysqldump => Box::new(MysqldumpBackend::new(self.connections())),
        }
    }

    pub fn infrastructure(&self) -> Box<dyn EphemeralInfrastructure> {
        match self.ephemeral_commands {
            Some((ref up, ref down)) => Box::new(CommandInfrastructure::new(up, down)),
            None => Box::new(ExternalInfrastructure),
        }
    }

    pub fn validation_settings(&self) -> ValidationSettings {
        ValidationSettings {
            primary: self.primary.clone(),
            ephemeral: self.ephemeral.clone(),
            paths: self.paths.clone(),
        }
    }
}

fn parse_required<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_default();
    raw.trim()
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid {key} '{raw}': {e}")))
}

/// Parse `key` if set, otherwise `default`. A set but unparsable value is an error.
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid {key} '{raw}': {e}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 5] = [
        ("DB_HOST", "db.internal"),
        ("DB_PORT", "3306"),
        ("DB_USER", "app"),
        ("DB_PASSWORD", ""),
        ("DB_NAME", "main"),
    ];

    #[test]
    fn reports_every_missing_variable() {
        let err = CliConfig::from_lookup(lookup(&[("DB_HOST", "x"), ("DB_USER", "u")])).unwrap_err();
        let message = err.to_string();
        for key in ["DB_PORT", "DB_PASSWORD", "DB_NAME"] {
            assert!(message.contains(key), "{message}");
        }
        assert!(!message.contains("DB_HOST"));
    }

    #[test]
    fn defaults_follow_the_primary() {
        let config = CliConfig::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(config.primary.target(), "app@db.internal:3306/main");
        assert!(config.history.is_none());
        assert_eq!(config.ephemeral.host, "db.internal");
        assert_eq!(config.ephemeral.database, "");
        assert_eq!(config.paths, PipelinePaths::default());
        assert_eq!(config.dump_backend, DumpBackendKind::Native);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(
            config.ephemeral_commands,
            Some((DEFAULT_UP_COMMAND.to_string(), DEFAULT_DOWN_COMMAND.to_string()))
        );
    }

    #[test]
    fn overrides() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("DB_MIGRATION_NAME", "history"),
            ("DB_MIGRATION_PORT", "3307"),
            ("TMP_DB_HOST", "scratch"),
            ("TMP_DB_PORT", "3308"),
            ("MIGRATIONS_DIR", "db/migrations"),
            ("WORK_DIR", "/tmp/schemagate"),
            ("DUMP_BACKEND", "mysqldump"),
            ("EPHEMERAL_UP_COMMAND", "none"),
            ("DB_CONNECT_RETRIES", "2"),
            ("DB_CONNECT_RETRY_DELAY_MS", "10"),
        ]);
        let config = CliConfig::from_lookup(lookup(&pairs)).unwrap();

        let history = config.history.unwrap();
        assert_eq!(history.target(), "app@db.internal:3307/history");
        assert_eq!(config.ephemeral.target(), "app@scratch:3308");
        assert_eq!(config.paths.migrations_dir, PathBuf::from("db/migrations"));
        assert_eq!(config.paths.work_dir, PathBuf::from("/tmp/schemagate"));
        assert_eq!(config.dump_backend, DumpBackendKind::Mysqldump);
        assert!(config.ephemeral_commands.is_none());
        assert_eq!(config.retry, RetryPolicy::fixed(2, Duration::from_millis(10)));
    }

    #[test]
    fn unparsable_values_are_errors() {
        let mut pairs = REQUIRED.to_vec();
        pairs[1] = ("DB_PORT", "mysql");
        assert!(matches!(
            CliConfig::from_lookup(lookup(&pairs)),
            Err(Error::Configuration(_))
        ));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("DUMP_BACKEND", "xtrabackup"));
        let err = CliConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.to_string().contains("xtrabackup"));
    }
}
