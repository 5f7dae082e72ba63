//! Lifecycle of the server that hosts ephemeral databases.

use std::path::PathBuf;
use std::process::Command;

use tracing::{error, info};

use crate::error::Error;

/// Starts and stops the server that hosts ephemeral databases.
pub trait EphemeralInfrastructure: Send + Sync {
    fn start(&self) -> Result<(), Error>;
    fn stop(&self) -> Result<(), Error>;
}

/// Infrastructure managed outside this process, e.g. a server that is always
/// running. Both calls do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalInfrastructure;

impl EphemeralInfrastructure for ExternalInfrastructure {
    fn start(&self) -> Result<(), Error> {
        info!("Using externally managed ephemeral server");
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Runs shell commands to bring the ephemeral server up and down, typically
/// a `docker compose` service.
#[derive(Debug, Clone)]
pub struct CommandInfrastructure {
    up: String,
    down: String,
    working_dir: Option<PathBuf>,
}

impl CommandInfrastructure {
    pub fn new(up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            up: up.into(),
            down: down.into(),
            working_dir: None,
        }
    }

    /// The `docker compose` service `mysqldb`, configured from `.env`.
    pub fn docker_compose() -> Self {
        Self::new(
            "docker compose --env-file .env up -d --build mysqldb",
            "docker compose --env-file .env rm -sfv mysqldb",
        )
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn run(&self, action: &str, script: &str) -> Result<(), Error> {
        info!(action, command = script, "Running infrastructure command");
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .map_err(|e| Error::Infrastructure(format!("could not run `{script}`: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(action, status = %output.status, stderr = %stderr, "Infrastructure command failed");
            return Err(Error::Infrastructure(format!(
                "`{script}` exited with {}: {stderr}",
                output.status
            )));
        }
        Ok(())
    }
}

impl EphemeralInfrastructure for CommandInfrastructure {
    fn start(&self) -> Result<(), Error> {
        self.run("start", &self.up)
    }

    fn stop(&self) -> Result<(), Error> {
        self.run("stop", &self.down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_commands() {
        let infra = CommandInfrastructure::new("true", "exit 0");
        assert!(infra.start().is_ok());
        assert!(infra.stop().is_ok());
    }

    #[test]
    fn failing_command_carries_stderr() {
        let infra = CommandInfrastructure::new("echo boom >&2; exit 3", "true");
        match infra.start() {
            Err(Error::Infrastructure(message)) => assert!(message.contains("boom")),
            other => panic!("expected infrastructure error, got {:?}", other),
        }
    }

    #[test]
    fn runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let infra = CommandInfrastructure::new("touch started", "rm started")
            .with_working_dir(dir.path());

        infra.start().unwrap();
        assert!(dir.path().join("started").exists());
        infra.stop().unwrap();
        assert!(!dir.path().join("started").exists());
    }
}
