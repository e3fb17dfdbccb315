/// Outbound authentication for upstream providers
///
/// Credentials never live in the provider file. A provider names an environment variable (or any
/// other [`SecretSource`] key) and the header is built at call time.
use crate::errors::CandidateError;
use crate::provider::Provider;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

/// How requests to a provider are authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    /// `Authorization: Bearer <secret>`
    Bearer { env: String },
    /// `<header>: <secret>`, e.g. `x-api-key`
    ApiKey {
        env: String,
        #[serde(default = "default_api_key_header")]
        header: String,
    },
}

/// Somewhere to look up credential values by name.
pub trait SecretSource: Send + Sync + std::fmt::Debug {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretSource for EnvSecrets {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

impl SecretSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

/// Build the headers every request to `provider` must carry: its static extra headers plus the
/// credential header, if any.
pub fn build_auth_headers(
    provider: &Provider,
    secrets: &dyn SecretSource,
) -> Result<HeaderMap, CandidateError> {
    let invalid = |what: &str| CandidateError::BackendCallFailed {
        provider: provider.id.clone(),
        reason: format!("invalid {what}"),
    };
    let missing = |env: &str| CandidateError::BackendCallFailed {
        provider: provider.id.clone(),
        reason: format!("credential '{env}' is not set"),
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &provider.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid("header name"))?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid("header value"))?;
        headers.insert(name, value);
    }

    match &provider.auth {
        AuthConfig::None => {}
        AuthConfig::Bearer { env } => {
            let secret = secrets.get(env).ok_or_else(|| missing(env))?;
            let mut value = HeaderValue::from_str(&format!("Bearer {secret}"))
                .map_err(|_| invalid("bearer token"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        AuthConfig::ApiKey { env, header } => {
            let secret = secrets.get(env).ok_or_else(|| missing(env))?;
            let name =
                HeaderName::from_bytes(header.as_bytes()).map_err(|_| invalid("header name"))?;
            let mut value = HeaderValue::from_str(&secret).map_err(|_| invalid("api key"))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }
    }

    Ok(headers)
}
