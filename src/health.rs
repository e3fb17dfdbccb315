//! Periodic health checks for every enabled provider
//!
//! The router never probes anything itself; it reads whatever the last probe recorded in the
//! registry. One loop probes all providers concurrently each tick. Each provider has its own
//! probe lock so an out-of-band [`HealthChecker::force_check`] and the loop never interleave
//! their updates for the same provider.
use crate::auth::{SecretSource, build_auth_headers};
use crate::client::{HttpClient, request_with_timeout};
use crate::compute::ComputeManager;
use crate::errors::RegistryError;
use crate::provider::{Provider, build_health_url};
use crate::registry::{HealthState, Registry};
use crate::task::PeriodicTask;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    /// Per-probe timeout
    pub timeout: Duration,
    /// Consecutive failures before a provider is marked unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
            failure_threshold: 2,
        }
    }
}

/// Result of one probe, together with the provider's health after recording it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub provider_id: String,
    pub success: bool,
    pub status: Option<StatusCode>,
    pub response_time_ms: f64,
    pub error: Option<String>,
    pub health: HealthState,
}

pub struct HealthChecker<T: HttpClient> {
    registry: Arc<Registry>,
    client: T,
    secrets: Arc<dyn SecretSource>,
    compute: Option<Arc<ComputeManager>>,
    config: HealthCheckConfig,
    locks: HashMap<String, Mutex<()>>,
}

impl<T: HttpClient> std::fmt::Debug for HealthChecker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .field("providers", &self.locks.len())
            .finish()
    }
}

impl<T: HttpClient + 'static> HealthChecker<T> {
    pub fn new(
        registry: Arc<Registry>,
        client: T,
        secrets: Arc<dyn SecretSource>,
        config: HealthCheckConfig,
    ) -> Self {
        let locks = registry
            .list_providers()
            .iter()
            .map(|p| (p.id.clone(), Mutex::new(())))
            .collect();
        Self {
            registry,
            client,
            secrets,
            compute: None,
            config,
            locks,
        }
    }

    /// Skip managed providers whose container is stopped.
    pub fn with_compute(mut self, compute: Arc<ComputeManager>) -> Self {
        self.compute = Some(compute);
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Probe every enabled provider once, concurrently.
    pub async fn check_all(&self) -> Vec<ProbeOutcome> {
        let mut due = Vec::new();
        for provider in self.registry.list_providers() {
            if !provider.enabled {
                continue;
            }
            if let Some(compute) = &self.compute
                && compute.is_managed(&provider.id)
                && !compute.is_active(&provider.id).await
            {
                trace!(provider = %provider.id, "Managed compute is stopped, not probing");
                continue;
            }
            due.push(provider);
        }

        join_all(due.iter().map(|provider| self.check_provider(provider))).await
    }

    /// Probe one provider right now, regardless of schedule.
    #[instrument(skip(self))]
    pub async fn force_check(&self, provider_id: &str) -> Result<ProbeOutcome, RegistryError> {
        let provider = self
            .registry
            .get_provider(provider_id)
            .ok_or_else(|| RegistryError::ProviderNotFound(provider_id.to_string()))?;
        Ok(self.check_provider(&provider).await)
    }

    /// Run [`HealthChecker::check_all`] every configured interval until the handle is stopped.
    pub fn spawn(self: &Arc<Self>) -> PeriodicTask {
        let checker = Arc::clone(self);
        PeriodicTask::spawn("health-checker", self.config.interval, move || {
            let checker = Arc::clone(&checker);
            async move {
                let outcomes = checker.check_all().await;
                let failed = outcomes.iter().filter(|o| !o.success).count();
                debug!(probed = outcomes.len(), failed, "Health check pass complete");
            }
        })
    }

    async fn check_provider(&self, provider: &Provider) -> ProbeOutcome {
        // Locks are built from the same registry, so every provider has one.
        let _probe = match self.locks.get(&provider.id) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let started = Instant::now();
        let result = self.probe(provider).await;
        let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (success, status, error) = match result {
            Ok(status) if status.is_success() => (true, Some(status), None),
            Ok(status) => (false, Some(status), Some(format!("status {}", status.as_u16()))),
            Err(e) => (false, None, Some(e)),
        };

        let threshold = self.config.failure_threshold;
        let health = self
            .registry
            .update_health(&provider.id, |state| {
                let flipped = match &error {
                    None => state.record_success(response_time_ms),
                    Some(e) => state.record_failure(e.clone(), Some(response_time_ms), threshold),
                };
                (flipped, state.clone())
            })
            .map(|(flipped, state)| {
                if flipped && state.is_healthy {
                    info!(provider = %provider.id, response_time_ms, "Provider is healthy");
                } else if flipped {
                    warn!(
                        provider = %provider.id,
                        failures = state.consecutive_failures,
                        error = state.last_error.as_deref().unwrap_or_default(),
                        "Provider marked unhealthy"
                    );
                }
                state
            })
            .unwrap_or_default();

        ProbeOutcome {
            provider_id: provider.id.clone(),
            success,
            status,
            response_time_ms,
            error,
            health,
        }
    }

    async fn probe(&self, provider: &Provider) -> Result<StatusCode, String> {
        let url = build_health_url(provider);
        let headers = build_auth_headers(provider, self.secrets.as_ref()).map_err(|e| e.to_string())?;

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .body(Body::empty())
            .map_err(|e| format!("invalid health url {url}: {e}"))?;
        req.headers_mut().extend(headers);

        trace!(provider = %provider.id, url = %url, "Probing provider");
        request_with_timeout(&self.client, req, self.config.timeout)
            .await
            .map(|response| response.status())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use crate::compute::ContainerControl;
    use crate::provider::{ManagedConfig, ProviderKind};
    use crate::registry::ConfigFile;
    use crate::registry::tests::{local, model};
    use crate::test_utils::{MockContainers, MockHttpClient};

    fn registry(providers: Vec<Provider>) -> Arc<Registry> {
        Arc::new(
            Registry::from_config(ConfigFile {
                providers,
                models: vec![],
            })
            .unwrap(),
        )
    }

    fn checker(registry: &Arc<Registry>, client: MockHttpClient) -> HealthChecker<MockHttpClient> {
        HealthChecker::new(
            Arc::clone(registry),
            client,
            Arc::new(HashMap::<String, String>::new()),
            HealthCheckConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_three_failures_then_recovery() {
        let registry = registry(vec![local("gpu0", 0, 1)]);
        let client = MockHttpClient::sequence(vec![
            StatusCode::OK,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::OK,
        ]);
        let checker = checker(&registry, client.clone());

        assert!(checker.force_check("gpu0").await.unwrap().health.is_healthy);

        let first = checker.force_check("gpu0").await.unwrap();
        assert!(!first.success);
        assert_eq!(first.status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(first.health.consecutive_failures, 1);
        assert!(first.health.is_healthy);

        let second = checker.force_check("gpu0").await.unwrap();
        assert!(!second.health.is_healthy);
        assert_eq!(second.health.consecutive_failures, 2);

        let third = checker.force_check("gpu0").await.unwrap();
        assert!(!third.health.is_healthy);
        assert_eq!(third.health.consecutive_failures, 3);
        assert_eq!(third.health.last_error.as_deref(), Some("status 500"));

        let recovered = checker.force_check("gpu0").await.unwrap();
        assert!(recovered.success);
        assert!(recovered.health.is_healthy);
        assert_eq!(recovered.health.consecutive_failures, 0);
        assert_eq!(registry.health("gpu0"), Some(recovered.health));

        let requests = client.get_requests();
        assert_eq!(requests.len(), 5);
        assert!(requests.iter().all(|r| r.method == "GET"));
        assert_eq!(requests[0].uri, "http://gpu0.local:8000/health");
    }

    #[tokio::test]
    async fn test_unknown_provider_tolerates_one_failure() {
        let registry = registry(vec![local("gpu0", 0, 1)]);
        let checker = checker(
            &registry,
            MockHttpClient::new(StatusCode::SERVICE_UNAVAILABLE, "loading"),
        );
        assert!(registry.health("gpu0").unwrap().is_routable());

        let outcome = checker.force_check("gpu0").await.unwrap();
        assert_eq!(outcome.health.consecutive_failures, 1);
        assert!(!outcome.health.is_healthy);
        assert!(outcome.health.is_routable());
        assert!(registry.health("gpu0").unwrap().is_routable());

        let outcome = checker.force_check("gpu0").await.unwrap();
        assert_eq!(outcome.health.consecutive_failures, 2);
        assert!(!outcome.health.is_routable());
    }

    #[tokio::test]
    async fn test_healthy_provider_tolerates_one_failure() {
        let registry = registry(vec![local("gpu0", 0, 1)]);
        let client = MockHttpClient::sequence(vec![
            StatusCode::OK,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR,
        ]);
        let checker = checker(&registry, client);

        assert!(checker.force_check("gpu0").await.unwrap().health.is_healthy);
        assert!(checker.force_check("gpu0").await.unwrap().health.is_healthy);
        assert!(!checker.force_check("gpu0").await.unwrap().health.is_healthy);
    }

    #[tokio::test]
    async fn test_transport_error_counts_as_failure() {
        let registry = registry(vec![local("gpu0", 0, 1)]);
        let checker = checker(&registry, MockHttpClient::failing("connection refused"));

        let outcome = checker.force_check("gpu0").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, None);
        assert!(outcome.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_force_check_unknown_provider() {
        let registry = registry(vec![local("gpu0", 0, 1)]);
        let checker = checker(&registry, MockHttpClient::new(StatusCode::OK, "{}"));
        assert_eq!(
            checker.force_check("nope").await.unwrap_err(),
            RegistryError::ProviderNotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn test_cloud_probe_carries_credentials() {
        let cloud = Provider::builder()
            .id("openai")
            .name("OpenAI")
            .kind(ProviderKind::Cloud)
            .endpoint("https://api.openai.com/v1".parse().unwrap())
            .auth(AuthConfig::Bearer {
                env: "OPENAI_API_KEY".into(),
            })
            .build();
        let registry = registry(vec![cloud]);
        let client = MockHttpClient::new(StatusCode::OK, r#"{"data": []}"#);
        let secrets: HashMap<String, String> =
            [("OPENAI_API_KEY".to_string(), "sk-test".to_string())].into();
        let checker = HealthChecker::new(
            Arc::clone(&registry),
            client.clone(),
            Arc::new(secrets),
            HealthCheckConfig::default(),
        );

        assert!(checker.force_check("openai").await.unwrap().success);
        let request = &client.get_requests()[0];
        assert_eq!(request.uri, "https://api.openai.com/v1/models");
        assert_eq!(request.header("authorization"), Some("Bearer sk-test"));
    }

    #[tokio::test]
    async fn test_missing_credential_is_a_failed_probe() {
        let cloud = Provider::builder()
            .id("openai")
            .name("OpenAI")
            .kind(ProviderKind::Cloud)
            .endpoint("https://api.openai.com/v1".parse().unwrap())
            .auth(AuthConfig::Bearer {
                env: "OPENAI_API_KEY".into(),
            })
            .build();
        let registry = registry(vec![cloud]);
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let checker = checker(&registry, client.clone());

        let outcome = checker.force_check("openai").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("OPENAI_API_KEY"));
        assert!(client.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_check_all_skips_disabled_and_stopped_managed() {
        let mut disabled = local("spare", 0, 1);
        disabled.enabled = false;
        let mut gpu = local("gpu0", 0, 1);
        gpu.managed = Some(ManagedConfig::builder().container("vllm-qwen").build());
        let registry = Arc::new(
            Registry::from_config(ConfigFile {
                providers: vec![gpu, local("always-on", 1, 1), disabled],
                models: vec![model("qwen", "gpu0", "qwen")],
            })
            .unwrap(),
        );
        let containers = Arc::new(MockContainers::new());
        let compute = Arc::new(ComputeManager::new(
            Arc::clone(&registry),
            Arc::clone(&containers) as Arc<dyn ContainerControl>,
        ));
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let checker = checker(&registry, client.clone()).with_compute(Arc::clone(&compute));

        let outcomes = checker.check_all().await;
        let probed: Vec<&str> = outcomes.iter().map(|o| o.provider_id.as_str()).collect();
        assert_eq!(probed, vec!["always-on"]);

        compute.ensure_running("gpu0").await.unwrap();
        let outcomes = checker.check_all().await;
        let mut probed: Vec<&str> = outcomes.iter().map(|o| o.provider_id.as_str()).collect();
        probed.sort();
        assert_eq!(probed, vec!["always-on", "gpu0"]);
        assert_eq!(client.get_requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_updates_registry_until_stopped() {
        let registry = registry(vec![local("gpu0", 0, 1)]);
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let checker = Arc::new(checker(&registry, client.clone()));

        let task = checker.spawn();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.health("gpu0").unwrap().is_healthy);
        // immediate pass plus 15s and 30s
        assert_eq!(client.get_requests().len(), 3);

        task.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.get_requests().len(), 3);
    }
}
