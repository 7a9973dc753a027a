//! [`ContainerClient`] backed by the container engine CLI.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;

use super::ContainerClient;
use crate::error::AcceleratorError;

pub struct DockerCliClient {
    binary: PathBuf,
    timeout: Duration,
}

impl DockerCliClient {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, Report<AcceleratorError>> {
        let failed = || AcceleratorError::ContainerClient {
            message: format!("{} {}", self.binary.display(), args.join(" ")),
        };

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary).args(args).kill_on_drop(true).output(),
        )
        .await
        .change_context_lazy(failed)?
        .change_context_lazy(failed)?;

        if !output.status.success() {
            return Err(Report::new(failed())
                .attach_printable(format!("exit status: {}", output.status))
                .attach_printable(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerClient for DockerCliClient {
    async fn list_volumes(&self) -> Result<Vec<String>, Report<AcceleratorError>> {
        let stdout = self
            .run(&["volume", "ls", "--format", "{{.Name}}"])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn create_volume(&self, name: &str, driver: &str) -> Result<(), Report<AcceleratorError>> {
        self.run(&["volume", "create", "--driver", driver, "--name", name])
            .await
            .map(|_| ())
    }
}
