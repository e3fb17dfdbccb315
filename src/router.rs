//! Request routing with failover
//!
//! [`Router::route`] resolves the requested identifier to an ordered candidate list and walks it:
//! skip unhealthy providers, bring managed computes up, take a concurrency slot, forward. Any
//! per-candidate failure moves on to the next candidate. Callers only ever see the first
//! success or a single [`RouteError::NoAvailableProvider`].
use crate::auth::{SecretSource, build_auth_headers};
use crate::classifier::RequestFeatures;
use crate::client::{HttpClient, request_with_timeout};
use crate::compute::ComputeManager;
use crate::errors::{CandidateError, RouteError};
use crate::provider::build_url;
use crate::registry::{Candidate, Registry, SelectionReason};
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header::CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Covers sending the request and reading the whole response body.
    pub request_timeout: Duration,
    /// Upper bound on forwarded calls per request. Skipped candidates do not count.
    /// `None` tries every candidate.
    pub max_attempts: Option<usize>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            max_attempts: None,
        }
    }
}

/// A successful upstream response and who served it.
#[derive(Debug, Clone)]
pub struct ForwardResult {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub provider_id: String,
    pub model_id: String,
    pub reason: SelectionReason,
    /// Candidates considered before this one succeeded, including it.
    pub attempts: usize,
}

pub struct Router<T: HttpClient> {
    registry: Arc<Registry>,
    compute: Option<Arc<ComputeManager>>,
    client: T,
    secrets: Arc<dyn SecretSource>,
    config: RouterConfig,
}

impl<T: HttpClient> std::fmt::Debug for Router<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("registry", &self.registry)
            .field("compute", &self.compute.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl<T: HttpClient> Router<T> {
    pub fn new(
        registry: Arc<Registry>,
        client: T,
        secrets: Arc<dyn SecretSource>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            compute: None,
            client,
            secrets,
            config,
        }
    }

    pub fn with_compute(mut self, compute: Arc<ComputeManager>) -> Self {
        self.compute = Some(compute);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Forward `body` to the first candidate for `requested` that accepts it.
    ///
    /// The body's `model` field is rewritten to the upstream name of whichever model serves the
    /// request.
    #[instrument(skip(self, features, body), fields(reason = tracing::field::Empty))]
    pub async fn route(
        &self,
        requested: &str,
        features: &RequestFeatures,
        body: &Value,
    ) -> Result<ForwardResult, RouteError> {
        let resolution = self.registry.candidates_for(requested, features)?;
        let reason = resolution.reason;
        tracing::Span::current().record("reason", tracing::field::display(reason));
        debug!(candidates = resolution.candidates.len(), "Resolved candidates");

        let max_forwards = self.config.max_attempts.unwrap_or(usize::MAX);
        let mut attempts = 0;
        let mut forwards = 0;
        let mut last_error = None;

        for candidate in &resolution.candidates {
            if forwards >= max_forwards {
                debug!(max_forwards, "Attempt limit reached");
                break;
            }
            attempts += 1;

            match self.try_candidate(candidate, body, &mut forwards).await {
                Ok((status, headers, bytes)) => {
                    info!(
                        provider = %candidate.provider.id,
                        model = %candidate.model.id,
                        attempts,
                        "Request served"
                    );
                    return Ok(ForwardResult {
                        status,
                        headers,
                        body: bytes,
                        provider_id: candidate.provider.id.clone(),
                        model_id: candidate.model.id.clone(),
                        reason,
                        attempts,
                    });
                }
                Err(e) => {
                    match &e {
                        CandidateError::ProviderUnhealthy(_) | CandidateError::CapacityExceeded(_) => {
                            debug!(provider = %candidate.provider.id, error = %e, "Skipping candidate")
                        }
                        _ => warn!(provider = %candidate.provider.id, error = %e, "Candidate failed, trying next"),
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(RouteError::NoAvailableProvider {
            requested: requested.to_string(),
            attempts,
            last_error,
        })
    }

    async fn try_candidate(
        &self,
        candidate: &Candidate,
        body: &Value,
        forwards: &mut usize,
    ) -> Result<(StatusCode, HeaderMap, Bytes), CandidateError> {
        let provider = &candidate.provider;
        let compute = self
            .compute
            .as_ref()
            .filter(|compute| compute.is_managed(&provider.id));

        // A stopped managed compute has only stale health; ensure_running checks it for real.
        let stopped = match compute {
            Some(compute) => !compute.is_active(&provider.id).await,
            None => false,
        };
        if !stopped
            && !self
                .registry
                .health(&provider.id)
                .is_none_or(|health| health.is_routable())
        {
            return Err(CandidateError::ProviderUnhealthy(provider.id.clone()));
        }

        if let Some(compute) = compute {
            compute
                .ensure_running(&provider.id)
                .await
                .map_err(|e| CandidateError::not_ready(&provider.id, e))?;
        }

        let _slot = self
            .registry
            .try_admit(&provider.id)
            .ok_or_else(|| CandidateError::CapacityExceeded(provider.id.clone()))?;

        let failed = |reason: String| CandidateError::BackendCallFailed {
            provider: provider.id.clone(),
            reason,
        };

        let mut payload = body.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert("model".into(), Value::String(candidate.model.name.clone()));
        }
        let payload = serde_json::to_vec(&payload).map_err(|e| failed(e.to_string()))?;

        let url = build_url(provider);
        let mut req = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .body(Body::from(payload))
            .map_err(|e| failed(format!("invalid url {url}: {e}")))?;
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        req.headers_mut()
            .extend(build_auth_headers(provider, self.secrets.as_ref())?);

        *forwards += 1;
        debug!(provider = %provider.id, url = %url, upstream_model = %candidate.model.name, "Forwarding request");

        let timeout = self.config.request_timeout;
        let (status, headers, bytes) = tokio::time::timeout(timeout, async {
            let response = request_with_timeout(&self.client, req, timeout)
                .await
                .map_err(|e| failed(e.to_string()))?;
            let (parts, body) = response.into_parts();
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| failed(format!("failed reading response: {e}")))?;
            Ok::<_, CandidateError>((parts.status, parts.headers, bytes))
        })
        .await
        .map_err(|_| failed(format!("timed out after {timeout:?}")))??;

        if !status.is_success() {
            return Err(failed(format!("upstream returned {status}")));
        }

        if let Some(compute) = compute {
            compute.mark_used(&provider.id).await;
        }
        Ok((status, headers, bytes))
    }
}
