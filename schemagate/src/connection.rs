//!
//! # Connection handling
//!

use mysql::prelude::*;
use mysql::Conn;
use tracing::{error, info};

use crate::config::DatabaseConfig;
use crate::error::Error;
use crate::retry::{retry, RetryPolicy};

/// Opens connections with bounded retry and performs the small amount of
/// server-level DDL the pipeline needs.
///
/// Every call to [`connect`](Self::connect) returns an independent connection;
/// nothing here shares transactional state between two calls.
#[derive(Debug, Clone, Default)]
pub struct ConnectionProvider {
    policy: RetryPolicy,
}

impl ConnectionProvider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Connect to the database named in `config`.
    pub fn connect(&self, config: &DatabaseConfig) -> Result<Conn, Error> {
        retry(&self.policy, |attempt| {
            if attempt == 0 {
                info!(target_db = %config.target(), "Establishing connection to the database");
            } else {
                info!(target_db = %config.target(), "Connecting to database. Retry #{attempt}");
            }
            Conn::new(config.opts())
        })
        .map_err(|exhausted| {
            error!(
                target_db = %config.target(),
                attempts = exhausted.attempts,
                "Exceeded maximum retry count for connecting to the database"
            );
            Error::ConnectionExhausted {
                target: config.target(),
                attempts: exhausted.attempts,
                source: exhausted.last_error,
            }
        })
    }

    /// Connect to the server of `config` without selecting a database.
    pub fn connect_server(&self, config: &DatabaseConfig) -> Result<Conn, Error> {
        self.connect(&config.server())
    }

    pub fn create_database(&self, conn: &mut Conn, name: &str) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::NameRequired("Database"));
        }
        info!(database = name, "Creating database");
        conn.query_drop(format!(
            "CREATE DATABASE {} CHARACTER SET utf8mb4",
            quote_identifier(name)
        ))
        .map_err(|e| {
            error!(database = name, error = %e, "Error creating database");
            Error::from(e)
        })
    }

    pub fn drop_database(&self, conn: &mut Conn, name: &str) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::NameRequired("Database"));
        }
        info!(database = name, "Dropping database");
        conn.query_drop(format!("DROP DATABASE IF EXISTS {}", quote_identifier(name)))
            .map_err(|e| {
                error!(database = name, error = %e, "Error dropping database");
                Error::from(e)
            })
    }

    /// Whether `name` is a table in the connection's current database.
    pub fn table_exists(&self, conn: &mut Conn, name: &str) -> Result<bool, Error> {
        if name.is_empty() {
            return Err(Error::NameRequired("Table"));
        }
        let count: Option<i64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?",
                (name,),
            )
            .map_err(|e| {
                error!(table = name, error = %e, "Error checking if table exists");
                Error::from(e)
            })?;
        Ok(count.unwrap_or(0) > 0)
    }
}

/// Execute a multi-statement script and surface the first error of any
/// statement in it.
///
/// `query_drop` only reports a failure of the first statement; errors of later
/// statements are swallowed while the remaining result sets are discarded.
pub fn run_script<Q: Queryable>(conn: &mut Q, sql: &str) -> Result<(), mysql::Error> {
    let mut result = conn.query_iter(sql)?;
    while let Some(set) = result.iter() {
        for row in set {
            row?;
        }
    }
    Ok(())
}

/// Backtick-quote a MySQL identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mysql::fresh_database;

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_identifier("users"), "`users`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn exhausts_against_a_closed_port() {
        let provider = ConnectionProvider::new(RetryPolicy::immediate(3));
        let config = DatabaseConfig::new("127.0.0.1", 1, "root", "pw", "nothing_here");

        match provider.connect(&config) {
            Err(Error::ConnectionExhausted {
                attempts, target, ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(target, "root@127.0.0.1:1/nothing_here");
            }
            other => panic!("expected ConnectionExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn empty_names_are_rejected() {
        let (config, _db) = fresh_database().await;
        let provider = ConnectionProvider::new(RetryPolicy::immediate(1));
        let mut conn = provider.connect(&config).unwrap();

        assert!(matches!(
            provider.create_database(&mut conn, ""),
            Err(Error::NameRequired("Database"))
        ));
        assert!(matches!(
            provider.drop_database(&mut conn, ""),
            Err(Error::NameRequired("Database"))
        ));
        assert!(matches!(
            provider.table_exists(&mut conn, ""),
            Err(Error::NameRequired("Table"))
        ));
    }

    #[tokio::test]
    async fn create_check_and_drop() {
        let (config, _db) = fresh_database().await;
        let provider = ConnectionProvider::new(RetryPolicy::immediate(1));
        let mut server = provider.connect_server(&config).unwrap();

        let name = format!("{}_extra", config.database);
        provider.create_database(&mut server, &name).unwrap();

        let mut conn = provider.connect(&config.with_database(&name)).unwrap();
        assert!(!provider.table_exists(&mut conn, "users").unwrap());
        conn.query_drop("CREATE TABLE users (id INT PRIMARY KEY)")
            .unwrap();
        assert!(provider.table_exists(&mut conn, "users").unwrap());
        drop(conn);

        provider.drop_database(&mut server, &name).unwrap();
        // dropping twice is harmless
        provider.drop_database(&mut server, &name).unwrap();
        assert!(provider.connect(&config.with_database(&name)).is_err());
    }

    #[tokio::test]
    async fn scripts_report_errors_after_the_first_statement() {
        let (config, _db) = fresh_database().await;
        let provider = ConnectionProvider::new(RetryPolicy::immediate(1));
        let mut conn = provider.connect(&config).unwrap();

        run_script(&mut conn, "CREATE TABLE a (id INT);\nSELECT * FROM a;\nCREATE TABLE b (id INT);")
            .unwrap();
        assert!(provider.table_exists(&mut conn, "b").unwrap());

        assert!(run_script(&mut conn, "CREATE TABLE c (id INT);\nCREAT TABLE d (id INT);").is_err());
        assert!(provider.table_exists(&mut conn, "c").unwrap());
        assert!(!provider.table_exists(&mut conn, "d").unwrap());
    }

    #[tokio::test]
    async fn creating_an_existing_database_propagates_the_server_error() {
        let (config, db) = fresh_database().await;
        let provider = ConnectionProvider::new(RetryPolicy::immediate(1));
        let mut server = provider.connect_server(&config).unwrap();

        assert!(matches!(
            provider.create_database(&mut server, &db),
            Err(Error::Mysql(_))
        ));
    }
}
