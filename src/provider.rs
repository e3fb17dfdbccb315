/// Providers are the backends requests get forwarded to: either a model server we run ourselves
/// on local GPUs, or a cloud API. The kind decides how URLs are built; everything else is plain
/// configuration read once at startup.
use crate::auth::AuthConfig;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// A model server on our own hardware (vLLM, llama.cpp, TGI, ...).
    Local,
    /// A hosted API. Endpoints include their version prefix, e.g. `https://api.openai.com/v1`.
    Cloud,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_enabled() -> bool {
    true
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_start_timeout_secs() -> u64 {
    300
}

/// Lifecycle settings for a local provider whose container we start and stop on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct ManagedConfig {
    /// Container name or id, handed as-is to the container runtime.
    #[builder(into)]
    pub container: String,
    #[serde(default = "default_idle_timeout_secs")]
    #[builder(default = default_idle_timeout_secs())]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_start_timeout_secs")]
    #[builder(default = default_start_timeout_secs())]
    pub start_timeout_secs: u64,
    /// Readiness path polled after a start. Defaults to the provider's health path.
    #[builder(into)]
    pub ready_path: Option<String>,
}

impl ManagedConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

/// A backend capable of serving chat completions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct Provider {
    #[builder(into)]
    pub id: String,
    #[builder(into)]
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: Url,
    #[serde(default)]
    #[builder(default)]
    pub auth: AuthConfig,
    /// Lower sorts first.
    #[serde(default)]
    #[builder(default)]
    pub priority: i32,
    #[serde(default = "default_max_concurrent")]
    #[builder(default = default_max_concurrent())]
    pub max_concurrent: usize,
    #[serde(default = "default_enabled")]
    #[builder(default = default_enabled())]
    pub enabled: bool,
    /// Overrides the kind's default chat-completions path.
    #[builder(into)]
    pub chat_path: Option<String>,
    /// Overrides the kind's default health path.
    #[builder(into)]
    pub health_path: Option<String>,
    /// Extra headers sent on every request (e.g. `anthropic-version`).
    #[serde(default)]
    #[builder(default)]
    pub headers: HashMap<String, String>,
    pub managed: Option<ManagedConfig>,
}

impl Provider {
    pub fn is_managed(&self) -> bool {
        self.managed.is_some()
    }
}

/// Append `path` to the base URL without dropping the base's own path segments.
fn join_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url
}

/// Where chat requests for `provider` go.
pub fn build_url(provider: &Provider) -> Url {
    let path = match (&provider.chat_path, provider.kind) {
        (Some(path), _) => path.as_str(),
        (None, ProviderKind::Local) => "/v1/chat/completions",
        (None, ProviderKind::Cloud) => "/chat/completions",
    };
    join_path(&provider.endpoint, path)
}

/// The lightweight GET used by the health checker.
pub fn build_health_url(provider: &Provider) -> Url {
    let path = match (&provider.health_path, provider.kind) {
        (Some(path), _) => path.as_str(),
        (None, ProviderKind::Local) => "/health",
        (None, ProviderKind::Cloud) => "/models",
    };
    join_path(&provider.endpoint, path)
}

/// The URL polled while a managed container comes up.
pub fn build_ready_url(provider: &Provider) -> Url {
    match provider
        .managed
        .as_ref()
        .and_then(|m| m.ready_path.as_deref())
    {
        Some(path) => join_path(&provider.endpoint, path),
        None => build_health_url(provider),
    }
}
