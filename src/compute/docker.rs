//! Docker (or any Docker-compatible CLI, e.g. Podman) implementation of [`ContainerControl`]
//!
//! Containers are expected to exist already (created by compose or by hand); this only starts
//! and stops them:
//! - `docker start <container>`
//! - `docker stop <container>`
//! - `docker inspect --format {{.State.Running}} <container>`
//!
//! Readiness is a plain GET against the model server, through the same [`HttpClient`] used for
//! forwarding.

use super::control::ContainerControl;
use crate::client::{HttpClient, HyperClient, create_hyper_client, request_with_timeout};
use crate::errors::ComputeError;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Stop,
    Inspect,
}

fn command_args(action: Action, container: &str) -> Vec<String> {
    match action {
        Action::Start => vec!["start".into(), container.into()],
        Action::Stop => vec!["stop".into(), container.into()],
        Action::Inspect => vec![
            "inspect".into(),
            "--format".into(),
            "{{.State.Running}}".into(),
            container.into(),
        ],
    }
}

/// Output of one CLI invocation.
struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

pub struct DockerControl<T: HttpClient = HyperClient> {
    /// CLI binary, e.g. `docker` or `podman`
    cli: String,
    client: T,
    /// Timeout for each readiness probe
    probe_timeout: Duration,
    /// Timeout for each CLI invocation
    command_timeout: Duration,
}

impl DockerControl<HyperClient> {
    pub fn new(cli: impl Into<String>) -> Self {
        Self::with_client(cli, create_hyper_client())
    }
}

impl<T: HttpClient> DockerControl<T> {
    pub fn with_client(cli: impl Into<String>, client: T) -> Self {
        Self {
            cli: cli.into(),
            client,
            probe_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn run(&self, action: Action, container: &str) -> Result<CliOutput, ComputeError> {
        let args = command_args(action, container);
        debug!(cli = %self.cli, args = ?args, "Running container command");

        let output = Command::new(&self.cli)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.command_timeout, output)
            .await
            .map_err(|_| {
                ComputeError::Control(format!(
                    "{} {:?} timed out after {:?}",
                    self.cli, action, self.command_timeout
                ))
            })?
            .map_err(|e| ComputeError::Control(format!("failed to run {}: {}", self.cli, e)))?;

        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl<T: HttpClient + 'static> ContainerControl for DockerControl<T> {
    async fn start(&self, container: &str) -> Result<(), ComputeError> {
        info!(container = %container, "Starting container");
        let output = self.run(Action::Start, container).await?;
        if !output.success {
            return Err(ComputeError::Control(format!(
                "start {} failed: {}",
                container, output.stderr
            )));
        }
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<(), ComputeError> {
        info!(container = %container, "Stopping container");
        let output = self.run(Action::Stop, container).await?;
        if !output.success {
            return Err(ComputeError::Control(format!(
                "stop {} failed: {}",
                container, output.stderr
            )));
        }
        Ok(())
    }

    async fn is_running(&self, container: &str) -> Result<bool, ComputeError> {
        let output = self.run(Action::Inspect, container).await?;
        if !output.success {
            return Err(ComputeError::Control(format!(
                "inspect {} failed: {}",
                container, output.stderr
            )));
        }
        Ok(output.stdout == "true")
    }

    async fn probe_ready(&self, url: &Url) -> bool {
        let req = match Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                warn!(url = %url, error = %e, "Invalid readiness URL");
                return false;
            }
        };

        match request_with_timeout(&self.client, req, self.probe_timeout).await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "Readiness probe failed");
                false
            }
        }
    }
}
