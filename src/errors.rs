//! Error types for the gateway core
//!
//! Load-time problems surface as [`RegistryError`] and abort startup. Everything that can go
//! wrong with a single candidate during routing is a [`CandidateError`]; the router swallows
//! those and moves on, so callers only ever see a [`RouteError`].
use std::time::Duration;

/// Failures while loading or querying the provider/model registry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate provider id: {0}")]
    DuplicateProvider(String),

    #[error("duplicate model id: {0}")]
    DuplicateModel(String),

    #[error("model '{model}' references unknown provider '{provider}'")]
    DanglingProvider { model: String, provider: String },

    #[error("provider '{0}' must allow at least one concurrent request")]
    ZeroConcurrency(String),

    #[error("provider '{provider}' has more than one default model ({first}, {second})")]
    MultipleDefaults {
        provider: String,
        first: String,
        second: String,
    },

    #[error("provider '{0}' is a cloud provider and cannot be managed")]
    ManagedCloudProvider(String),

    #[error("empty {0} id")]
    EmptyId(&'static str),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),
}

/// Failures from the container lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("provider '{0}' is not a managed compute")]
    NotManaged(String),

    #[error("failed to start container for '{provider}': {reason}")]
    StartFailed { provider: String, reason: String },

    #[error("could not inspect container for '{provider}': {reason}")]
    InspectFailed { provider: String, reason: String },

    #[error("backend for '{provider}' not ready after {timeout:?}")]
    NotReady { provider: String, timeout: Duration },

    #[error("container control error: {0}")]
    Control(String),
}

/// Why a single candidate was passed over. Never returned to callers directly.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("provider '{0}' is unhealthy")]
    ProviderUnhealthy(String),

    #[error("backend for '{provider}' not ready: {reason}")]
    BackendNotReady { provider: String, reason: String },

    #[error("provider '{0}' is at capacity")]
    CapacityExceeded(String),

    #[error("call to '{provider}' failed: {reason}")]
    BackendCallFailed { provider: String, reason: String },
}

impl CandidateError {
    /// A lifecycle failure for `provider`, which the manager may not have named itself.
    pub fn not_ready(provider: &str, e: ComputeError) -> Self {
        CandidateError::BackendNotReady {
            provider: provider.to_string(),
            reason: e.to_string(),
        }
    }
}

/// What a caller of [`crate::router::Router::route`] can observe.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no available provider for '{requested}' after {attempts} attempt(s){}", suffix(.last_error))]
    NoAvailableProvider {
        requested: String,
        attempts: usize,
        last_error: Option<CandidateError>,
    },
}

fn suffix(last_error: &Option<CandidateError>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(": {e}"))
        .unwrap_or_default()
}
