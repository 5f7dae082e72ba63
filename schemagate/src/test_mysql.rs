//! MySQL test infrastructure module.
//!
//! Starts one MySQL container for the whole test run and hands every test its
//! own freshly created database.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use mysql::prelude::*;
use mysql::Conn;
use testcontainers::core::logs::LogFrame;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::connection::ConnectionProvider;
use crate::retry::RetryPolicy;

pub(crate) const ROOT_PASSWORD: &str = "rootpw";

/// Shared container and its mapped port, created on first use.
static MYSQL_INNER: RwLock<Option<(ContainerAsync<GenericImage>, u16)>> = RwLock::new(None);

/// Port of the shared MySQL container, starting it if needed.
async fn mysql_port() -> u16 {
    {
        let mut mysql = MYSQL_INNER.write().unwrap();
        if mysql.is_none() {
            *mysql = Some(create_mysql_container().await);
        }
    }
    MYSQL_INNER.read().unwrap().as_ref().unwrap().1
}

/// Start MySQL 8.4 and wait until the real (non-temporary) server accepts connections.
async fn create_mysql_container() -> (ContainerAsync<GenericImage>, u16) {
    let temporary_server_started = Arc::new(AtomicBool::new(false));
    let mysql_ready = Arc::new(AtomicBool::new(false));
    let temp_clone = Arc::clone(&temporary_server_started);
    let ready_clone = Arc::clone(&mysql_ready);

    let log_consumer = move |log: &LogFrame| {
        let msg = format!("{:?}", log);
        if msg.contains("Temporary server started") {
            temp_clone.store(true, Ordering::SeqCst);
        } else if temp_clone.load(Ordering::SeqCst)
            && msg.contains("/usr/sbin/mysqld: ready for connections")
        {
            ready_clone.store(true, Ordering::SeqCst);
        }
    };

    let image = GenericImage::new("mysql", "8.4")
        .with_log_consumer(log_consumer)
        .with_env_var("MYSQL_ROOT_PASSWORD", ROOT_PASSWORD)
        .with_env_var("MYSQL_DATABASE", "bootstrap");

    let started = AsyncRunner::start(image)
        .await
        .expect("failed to start mysql docker image");

    while !mysql_ready.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let port = started.get_host_port_ipv4(3306).await.unwrap();

    // Stored functions are created by the dump tests while binary logging is on
    let mut admin = Conn::new(server_config(port).opts()).expect("failed to get admin conn");
    admin
        .query_drop("SET GLOBAL max_connections = 1000")
        .expect("failed to set max connections");
    admin
        .query_drop("SET GLOBAL log_bin_trust_function_creators = 1")
        .expect("failed to allow function creation");

    (started, port)
}

fn server_config(port: u16) -> DatabaseConfig {
    DatabaseConfig::new("127.0.0.1", port, "root", ROOT_PASSWORD, "")
}

/// Server-level config for the shared container.
pub async fn server() -> DatabaseConfig {
    server_config(mysql_port().await)
}

/// Create an empty database with a unique name.
/// Returns a config pointing at it and the database name.
pub async fn fresh_database() -> (DatabaseConfig, String) {
    let server = server().await;
    let provider = ConnectionProvider::new(RetryPolicy::immediate(3));
    let mut admin = provider.connect(&server).expect("failed to get admin conn");

    let db_name = format!("test_{}", Uuid::new_v4().simple());
    provider
        .create_database(&mut admin, &db_name)
        .expect("create test database");

    (server.with_database(&db_name), db_name)
}

/// The init script shipped at the workspace root.
pub fn init_script() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../database/init_migrations.sql")
}

/// A fresh database plus an open connection to it.
pub async fn fresh_conn() -> (DatabaseConfig, Conn) {
    let (config, _) = fresh_database().await;
    let conn = Conn::new(config.opts()).expect("connect to test database");
    (config, conn)
}

#[ctor::dtor]
fn stop_shared_mysql() {
    let Ok(rt) = tokio::runtime::Runtime::new() else {
        return;
    };
    rt.block_on(async {
        if let Some((container, _)) = MYSQL_INNER.write().unwrap().take() {
            drop(container);
        }
    })
}
