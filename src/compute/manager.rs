//! Compute lifecycle manager - starts managed containers on demand and reaps idle ones
//!
//! Each managed provider carries a `last_used_at` timestamp. Set means "we believe the container
//! is up"; unset means "stopped, or never started". Requests refresh it, the reaper clears it.
//! Starts are serialized per provider, so concurrent requests for a cold backend share a single
//! start and readiness wait.

use super::control::ContainerControl;
use crate::errors::ComputeError;
use crate::provider::build_ready_url;
use crate::registry::Registry;
use crate::task::PeriodicTask;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

#[derive(Debug, Default)]
struct ComputeState {
    last_used_at: Option<Instant>,
}

struct ManagedCompute {
    provider_id: String,
    container: String,
    ready_url: Url,
    idle_timeout: Duration,
    start_timeout: Duration,
    state: Mutex<ComputeState>,
    /// Held for the whole start + readiness wait
    start_lock: Mutex<()>,
}

impl ManagedCompute {
    /// Refresh `last_used_at` if the container is believed to be running.
    async fn touch_if_running(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.last_used_at.is_some() {
            state.last_used_at = Some(Instant::now());
            true
        } else {
            false
        }
    }

    async fn touch(&self) {
        self.state.lock().await.last_used_at = Some(Instant::now());
    }
}

/// Point-in-time view of one managed compute.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeStatus {
    pub provider_id: String,
    pub container: String,
    pub running: bool,
    pub idle_for: Option<Duration>,
    pub idle_timeout: Duration,
}

pub struct ComputeManager {
    registry: Arc<Registry>,
    control: Arc<dyn ContainerControl>,
    computes: HashMap<String, Arc<ManagedCompute>>,
    poll_interval: Duration,
}

impl std::fmt::Debug for ComputeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeManager")
            .field("computes", &self.computes.keys().collect::<Vec<_>>())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl ComputeManager {
    /// Take ownership of every managed provider in the registry.
    pub fn new(registry: Arc<Registry>, control: Arc<dyn ContainerControl>) -> Self {
        let computes = registry
            .list_providers()
            .into_iter()
            .filter_map(|provider| {
                let managed = provider.managed.as_ref()?;
                Some((
                    provider.id.clone(),
                    Arc::new(ManagedCompute {
                        provider_id: provider.id.clone(),
                        container: managed.container.clone(),
                        ready_url: build_ready_url(&provider),
                        idle_timeout: managed.idle_timeout(),
                        start_timeout: managed.start_timeout(),
                        state: Mutex::new(ComputeState::default()),
                        start_lock: Mutex::new(()),
                    }),
                ))
            })
            .collect();

        Self {
            registry,
            control,
            computes,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Set the interval between readiness polls after a start
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn is_managed(&self, provider_id: &str) -> bool {
        self.computes.contains_key(provider_id)
    }

    /// Whether the provider's container is believed to be running.
    pub async fn is_active(&self, provider_id: &str) -> bool {
        match self.computes.get(provider_id) {
            Some(compute) => compute.state.lock().await.last_used_at.is_some(),
            None => false,
        }
    }

    /// Make sure the provider's backend is up and ready, starting it if needed.
    ///
    /// Concurrent callers for the same stopped provider share one start: the first one in takes
    /// the start lock, the rest wait on it and then find the container running.
    #[instrument(skip(self))]
    pub async fn ensure_running(&self, provider_id: &str) -> Result<(), ComputeError> {
        let compute = self
            .computes
            .get(provider_id)
            .ok_or_else(|| ComputeError::NotManaged(provider_id.to_string()))?;

        if compute.touch_if_running().await {
            trace!(provider = %provider_id, "Compute already running");
            return Ok(());
        }

        let _start = compute.start_lock.lock().await;

        if compute.touch_if_running().await {
            debug!(provider = %provider_id, "Compute started by a concurrent request");
            return Ok(());
        }

        // Something else may have started it (or it survived a restart of the gateway).
        let running = self
            .control
            .is_running(&compute.container)
            .await
            .map_err(|e| ComputeError::InspectFailed {
                provider: provider_id.to_string(),
                reason: e.to_string(),
            })?;
        if running && self.control.probe_ready(&compute.ready_url).await
        {
            info!(provider = %provider_id, container = %compute.container, "Adopting running container");
            compute.touch().await;
            return Ok(());
        }

        info!(provider = %provider_id, container = %compute.container, "Starting managed compute");
        let started_at = Instant::now();
        self.control
            .start(&compute.container)
            .await
            .map_err(|e| ComputeError::StartFailed {
                provider: provider_id.to_string(),
                reason: e.to_string(),
            })?;

        self.wait_ready(compute).await?;
        compute.touch().await;
        // Probes taken while the container was down say nothing about it now
        self.registry.reset_health(provider_id);

        info!(
            provider = %provider_id,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Managed compute is ready"
        );
        Ok(())
    }

    /// Poll readiness until it succeeds or the start timeout passes. The container is left as
    /// the start left it on timeout.
    async fn wait_ready(&self, compute: &ManagedCompute) -> Result<(), ComputeError> {
        let deadline = Instant::now() + compute.start_timeout;
        let mut attempt = 0u32;

        loop {
            if self.control.probe_ready(&compute.ready_url).await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    provider = %compute.provider_id,
                    timeout = ?compute.start_timeout,
                    "Managed compute failed to become ready"
                );
                return Err(ComputeError::NotReady {
                    provider: compute.provider_id.clone(),
                    timeout: compute.start_timeout,
                });
            }

            attempt += 1;
            debug!(provider = %compute.provider_id, attempt, "Waiting for readiness");
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Record a successful forward to the provider.
    pub async fn mark_used(&self, provider_id: &str) {
        if let Some(compute) = self.computes.get(provider_id) {
            compute.touch().await;
        }
    }

    /// Stop every managed compute idle for longer than its timeout. Returns the provider ids
    /// that were stopped.
    ///
    /// Computes with a start in progress or requests in flight are skipped. A failed stop leaves
    /// the compute marked running so the next pass retries it.
    pub async fn reap_idle(&self) -> Vec<String> {
        let mut stopped = Vec::new();

        for compute in self.computes.values() {
            let Ok(_start) = compute.start_lock.try_lock() else {
                trace!(provider = %compute.provider_id, "Start in progress, not reaping");
                continue;
            };

            let mut state = compute.state.lock().await;
            let Some(last_used_at) = state.last_used_at else {
                continue;
            };

            let idle_for = Instant::now().saturating_duration_since(last_used_at);
            if idle_for <= compute.idle_timeout {
                continue;
            }

            let in_flight = self
                .registry
                .current_requests(&compute.provider_id)
                .unwrap_or(0);
            if in_flight > 0 {
                debug!(provider = %compute.provider_id, in_flight, "Idle timeout passed but requests in flight");
                continue;
            }

            info!(
                provider = %compute.provider_id,
                container = %compute.container,
                idle_secs = idle_for.as_secs(),
                "Stopping idle compute"
            );
            match self.control.stop(&compute.container).await {
                Ok(()) => {
                    state.last_used_at = None;
                    self.registry.reset_health(&compute.provider_id);
                    stopped.push(compute.provider_id.clone());
                }
                Err(e) => {
                    warn!(provider = %compute.provider_id, error = %e, "Failed to stop idle compute, will retry");
                }
            }
        }

        stopped
    }

    /// Run [`ComputeManager::reap_idle`] every `interval` until the handle is stopped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> PeriodicTask {
        let manager = Arc::clone(self);
        PeriodicTask::spawn("idle-reaper", interval, move || {
            let manager = Arc::clone(&manager);
            async move {
                let stopped = manager.reap_idle().await;
                if !stopped.is_empty() {
                    debug!(stopped = ?stopped, "Reaper pass complete");
                }
            }
        })
    }

    pub async fn status(&self) -> Vec<ComputeStatus> {
        let mut statuses = Vec::with_capacity(self.computes.len());
        for compute in self.computes.values() {
            let last_used_at = compute.state.lock().await.last_used_at;
            statuses.push(ComputeStatus {
                provider_id: compute.provider_id.clone(),
                container: compute.container.clone(),
                running: last_used_at.is_some(),
                idle_for: last_used_at.map(|t| Instant::now().saturating_duration_since(t)),
                idle_timeout: compute.idle_timeout,
            });
        }
        statuses.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        statuses
    }
}
