//! Switchyard - an LLM gateway for mixed local and cloud capacity
//!
//! Requests name a model, a provider, a tier or `auto`. The gateway resolves that to an ordered
//! list of candidate backends, skips the unhealthy and the saturated, starts local model servers
//! on demand, and fails over until one of them answers. Idle local servers are stopped again to
//! free their GPUs.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod auth;
pub mod classifier;
pub mod client;
pub mod compute;
pub mod errors;
pub mod handlers;
pub mod health;
pub mod models;
pub mod provider;
pub mod registry;
pub mod router;
pub mod task;

use auth::{EnvSecrets, SecretSource};
use client::{HttpClient, HyperClient};
use compute::ComputeManager;
use health::{HealthCheckConfig, HealthChecker};
use registry::Registry;
use router::RouterConfig;

/// Everything the HTTP handlers need, shared across requests.
pub struct AppState<T: HttpClient> {
    pub registry: Arc<Registry>,
    pub router: Arc<router::Router<T>>,
    pub health: Arc<HealthChecker<T>>,
    pub compute: Option<Arc<ComputeManager>>,
}

impl<T: HttpClient> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            health: Arc::clone(&self.health),
            compute: self.compute.clone(),
        }
    }
}

impl<T: HttpClient> std::fmt::Debug for AppState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("registry", &self.registry)
            .field("router", &self.router)
            .field("health", &self.health)
            .finish()
    }
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client, credentials from the environment
    /// and default timeouts.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_client(registry, client::create_hyper_client())
    }
}

impl<T: HttpClient + Clone + 'static> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(registry: Arc<Registry>, http_client: T) -> Self {
        Self::with_options(
            registry,
            http_client,
            Arc::new(EnvSecrets),
            RouterConfig::default(),
            HealthCheckConfig::default(),
            None,
        )
    }

    /// Wire the router and health checker around one registry, client and compute manager.
    pub fn with_options(
        registry: Arc<Registry>,
        http_client: T,
        secrets: Arc<dyn SecretSource>,
        router_config: RouterConfig,
        health_config: HealthCheckConfig,
        compute: Option<Arc<ComputeManager>>,
    ) -> Self {
        let mut router = router::Router::new(
            Arc::clone(&registry),
            http_client.clone(),
            Arc::clone(&secrets),
            router_config,
        );
        let mut health =
            HealthChecker::new(Arc::clone(&registry), http_client, secrets, health_config);
        if let Some(compute) = &compute {
            router = router.with_compute(Arc::clone(compute));
            health = health.with_compute(Arc::clone(compute));
        }

        Self {
            registry,
            router: Arc::new(router),
            health: Arc::new(health),
            compute,
        }
    }
}

/// Build the main router for the gateway
/// This creates routes for:
/// - `/v1/chat/completions` - Routes a chat request to the best available provider
/// - `/v1/models` - Returns available models
/// - `/status` - Provider health, load and compute state
/// - `/status/providers/{id}/check` - Probes one provider immediately
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::models))
        .route("/status", get(handlers::status))
        .route(
            "/status/providers/{id}/check",
            post(handlers::check_provider),
        )
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` must be `'static` because the layer lives for the whole process.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::MatchedPath)
        .with_default_metrics()
        .build_pair()
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use crate::client::BoxError;
    use crate::compute::ContainerControl;
    use crate::errors::ComputeError;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;
    use url::Url;

    type Responder = dyn Fn(&MockRequest) -> Result<axum::response::Response, BoxError> + Send + Sync;

    /// Records every request and answers through a closure.
    #[derive(Clone)]
    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        responder: Arc<Responder>,
        /// Requests whose uri contains the fragment are delayed before answering.
        delays: Vec<(String, Duration)>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        }

        pub fn body_json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).unwrap()
        }
    }

    fn respond(status: StatusCode, body: String) -> axum::response::Response {
        axum::response::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body))
            .unwrap()
    }

    impl MockHttpClient {
        fn from_responder(responder: Arc<Responder>) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                responder,
                delays: Vec::new(),
            }
        }

        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_string();
            Self::from_responder(Arc::new(move |_| Ok(respond(status, body.clone()))))
        }

        pub fn with_responder<F>(f: F) -> Self
        where
            F: Fn(&MockRequest) -> (StatusCode, String) + Send + Sync + 'static,
        {
            Self::from_responder(Arc::new(move |req| {
                let (status, body) = f(req);
                Ok(respond(status, body))
            }))
        }

        /// Answer with each status in turn, repeating the last one once exhausted.
        pub fn sequence(statuses: Vec<StatusCode>) -> Self {
            let next = AtomicUsize::new(0);
            Self::from_responder(Arc::new(move |_| {
                let i = next.fetch_add(1, Ordering::SeqCst).min(statuses.len() - 1);
                Ok(respond(statuses[i], "{}".to_string()))
            }))
        }

        /// Every request fails at the transport level.
        pub fn failing(message: &str) -> Self {
            let message = message.to_string();
            Self::from_responder(Arc::new(move |_| Err(message.clone().into())))
        }

        pub fn with_delay_for(mut self, uri_fragment: &str, delay: Duration) -> Self {
            self.delays.push((uri_fragment.to_string(), delay));
            self
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("responder", &"<closure>")
                .finish()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, BoxError> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as BoxError)?
                .to_vec();

            let mock_request = MockRequest {
                method,
                uri,
                headers,
                body,
            };
            self.requests.lock().unwrap().push(mock_request.clone());

            if let Some((_, delay)) = self
                .delays
                .iter()
                .find(|(fragment, _)| mock_request.uri.contains(fragment.as_str()))
            {
                tokio::time::sleep(*delay).await;
            }

            (self.responder)(&mock_request)
        }
    }

    /// In-memory container runtime. `None` start time means the container was already running
    /// when the test began and is ready.
    #[derive(Debug, Default)]
    pub struct MockContainers {
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
        running: Mutex<HashMap<String, Option<Instant>>>,
        start_delay: Duration,
        ready_after: Duration,
        never_ready: bool,
        fail_stop: AtomicBool,
        fail_inspect: AtomicBool,
    }

    impl MockContainers {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_start_delay(mut self, delay: Duration) -> Self {
            self.start_delay = delay;
            self
        }

        pub fn with_ready_after(mut self, after: Duration) -> Self {
            self.ready_after = after;
            self
        }

        pub fn never_ready(mut self) -> Self {
            self.never_ready = true;
            self
        }

        pub fn set_running(&self, container: &str) {
            self.running
                .lock()
                .unwrap()
                .insert(container.to_string(), None);
        }

        pub fn is_running_now(&self, container: &str) -> bool {
            self.running.lock().unwrap().contains_key(container)
        }

        pub fn fail_stops(&self, fail: bool) {
            self.fail_stop.store(fail, Ordering::SeqCst);
        }

        pub fn fail_inspects(&self, fail: bool) {
            self.fail_inspect.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ContainerControl for MockContainers {
        async fn start(&self, container: &str) -> Result<(), ComputeError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.start_delay).await;
            self.running
                .lock()
                .unwrap()
                .insert(container.to_string(), Some(Instant::now()));
            Ok(())
        }

        async fn stop(&self, container: &str) -> Result<(), ComputeError> {
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(ComputeError::Control(format!("stop {container} refused")));
            }
            self.running.lock().unwrap().remove(container);
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self, container: &str) -> Result<bool, ComputeError> {
            if self.fail_inspect.load(Ordering::SeqCst) {
                return Err(ComputeError::Control(format!("inspect {container} refused")));
            }
            Ok(self.is_running_now(container))
        }

        async fn probe_ready(&self, _url: &Url) -> bool {
            if self.never_ready {
                return false;
            }
            self.running
                .lock()
                .unwrap()
                .values()
                .any(|started| started.is_none_or(|at| at.elapsed() >= self.ready_after))
        }
    }
}
