//! Configuration parsing and validation for the gateway binary
//!
//! Command-line arguments (each also readable from a `SWITCHYARD_*` environment variable) are
//! parsed with clap. The provider/model file itself is loaded by the registry.
use anyhow::{anyhow, bail};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use switchyard::health::HealthCheckConfig;
use switchyard::router::RouterConfig;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the gateway will listen.
    #[arg(short = 'p', long, env = "SWITCHYARD_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, env = "SWITCHYARD_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, env = "SWITCHYARD_METRICS", default_value_t = true, action = clap::ArgAction::Set)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, env = "SWITCHYARD_METRICS_PREFIX", default_value = "switchyard")]
    pub metrics_prefix: String,

    /// The JSON file listing providers and models.
    #[arg(short = 'f', long, env = "SWITCHYARD_PROVIDERS")]
    pub providers: PathBuf,

    /// Seconds between health check passes.
    #[arg(long, env = "SWITCHYARD_HEALTH_INTERVAL_SECS", default_value_t = 15)]
    pub health_interval_secs: u64,

    /// Timeout for a single health probe, in seconds.
    #[arg(long, env = "SWITCHYARD_HEALTH_TIMEOUT_SECS", default_value_t = 5)]
    pub health_timeout_secs: u64,

    /// Consecutive failed probes before a provider is taken out of rotation.
    #[arg(long, env = "SWITCHYARD_FAILURE_THRESHOLD", default_value_t = 2)]
    pub failure_threshold: u32,

    /// Seconds between idle reaper passes over managed computes.
    #[arg(long, env = "SWITCHYARD_REAPER_INTERVAL_SECS", default_value_t = 30)]
    pub reaper_interval_secs: u64,

    /// Timeout for one forwarded request, including reading the response, in seconds.
    #[arg(long, env = "SWITCHYARD_REQUEST_TIMEOUT_SECS", default_value_t = 300)]
    pub request_timeout_secs: u64,

    /// Maximum number of providers one request is forwarded to. Unset tries every candidate.
    #[arg(long, env = "SWITCHYARD_MAX_ATTEMPTS")]
    pub max_attempts: Option<usize>,

    /// Container CLI used to start and stop managed computes (`docker`, `podman`, ...).
    #[arg(long, env = "SWITCHYARD_CONTAINER_CLI", default_value = "docker")]
    pub container_cli: String,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.providers.exists() {
            return Err(anyhow!(
                "Provider file '{}' does not exist",
                self.providers.display()
            ));
        }
        if self.health_interval_secs == 0 || self.reaper_interval_secs == 0 {
            bail!("Background task intervals must be at least one second");
        }
        if self.max_attempts == Some(0) {
            bail!("--max-attempts must be at least 1");
        }
        Ok(self)
    }

    pub fn health_check(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_secs(self.health_interval_secs),
            timeout: Duration::from_secs(self.health_timeout_secs),
            failure_threshold: self.failure_threshold,
        }
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_attempts: self.max_attempts,
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}
