//! Explicit configuration values consumed by the pipeline components.
//!
//! Nothing in this crate reads the environment. Callers build these values once
//! and hand them to each component's constructor.

use std::path::PathBuf;
use std::time::Duration;

use mysql::{OptsBuilder, PoolConstraints, PoolOpts};

/// Connection pool bounds for a target. Only consulted when a caller builds a
/// [`mysql::Pool`] from [`DatabaseConfig::opts`]; the pipeline itself opens
/// one connection per unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub min: usize,
    pub max: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self { min: 0, max: 10 }
    }
}

/// Connection parameters for one logical target (primary, ephemeral or history).
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Empty means "server level", no default schema is selected.
    pub database: String,
    pub pool: PoolLimits,
    pub connect_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: database.into(),
            pool: PoolLimits::default(),
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// A copy of this config pointing at another database on the same server.
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self.clone()
        }
    }

    /// A copy of this config that selects no database.
    pub fn server(&self) -> Self {
        self.with_database("")
    }

    pub fn with_pool_limits(mut self, pool: PoolLimits) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Human readable target used in logs and errors. Never includes the password.
    pub fn target(&self) -> String {
        if self.database.is_empty() {
            format!("{}@{}:{}", self.user, self.host, self.port)
        } else {
            format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
        }
    }

    pub fn opts(&self) -> OptsBuilder {
        let constraints =
            PoolConstraints::new(self.pool.min, self.pool.max).unwrap_or_default();
        OptsBuilder::new()
            .ip_or_hostname(Some(self.host.clone()))
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(if self.database.is_empty() {
                None
            } else {
                Some(self.database.clone())
            })
            .tcp_connect_timeout(Some(self.connect_timeout))
            .pool_opts(PoolOpts::default().with_constraints(constraints))
    }
}

// Manual Debug impl so passwords never end up in logs
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"****")
            .field("database", &self.database)
            .field("pool", &self.pool)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Filesystem locations used by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePaths {
    /// Directory of `*.sql` migration files.
    pub migrations_dir: PathBuf,
    /// The schema snapshot checked into source control.
    pub snapshot_dir: PathBuf,
    /// Where `dump:schema` writes a fresh snapshot.
    pub schema_output_dir: PathBuf,
    /// Parent of the per-run scratch directories.
    pub work_dir: PathBuf,
    /// Script that creates the history table.
    pub init_script: PathBuf,
}

impl Default for PipelinePaths {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            snapshot_dir: PathBuf::from("schema"),
            schema_output_dir: PathBuf::from("schema"),
            work_dir: PathBuf::from("tmp"),
            init_script: PathBuf::from("database/init_migrations.sql"),
        }
    }
}

/// Everything the validation pipeline needs to know about its targets.
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub primary: DatabaseConfig,
    /// Server that hosts the ephemeral database. Its `database` field is ignored,
    /// a unique name is generated for every run.
    pub ephemeral: DatabaseConfig,
    pub paths: PipelinePaths,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_database_leaves_original_untouched() {
        let primary = DatabaseConfig::new("db", 3306, "root", "pw", "main");
        let other = primary.with_database("tmp__1");

        assert_eq!(primary.database, "main");
        assert_eq!(other.database, "tmp__1");
        assert_eq!(other.host, primary.host);
        assert_eq!(primary.server().database, "");
    }

    #[test]
    fn target_and_debug_hide_password() {
        let config = DatabaseConfig::new("db", 3307, "app", "s3cret", "main");

        assert_eq!(config.target(), "app@db:3307/main");
        assert_eq!(config.server().target(), "app@db:3307");
        assert!(!format!("{:?}", config).contains("s3cret"));
    }
}
