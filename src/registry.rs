//! Provider and model registry
//!
//! The registry is loaded once from the provider file and is the only owner of mutable
//! per-provider state: the in-flight request counter and the last known health. Static fields
//! are never mutated after load, so lookups need no locking; the counter is an atomic and health
//! lives in a sharded map, so unrelated providers never contend with each other.
//!
//! Requested model identifiers resolve in this order:
//! 1. an exact model id
//! 2. `provider/model` shorthand (model matched by name or id within that provider)
//! 3. a bare provider id, which selects that provider's default model
//! 4. a tier alias (`small`, `fast`, `medium`, `big`)
//! 5. `auto`, which classifies the request and resolves the resulting tier
//! 6. a model name, matching that model on every provider that serves it
use crate::classifier::{RequestFeatures, Tier, classify};
use crate::errors::{RegistryError, RouteError};
use crate::provider::{Provider, ProviderKind};
use anyhow::anyhow;
use bon::Builder;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Sentinel model id asking the gateway to pick a tier itself.
pub const AUTO: &str = "auto";

/// A unit of capability exposed by exactly one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct Model {
    /// Globally unique; what clients put in the `model` field.
    #[builder(into)]
    pub id: String,
    #[builder(into)]
    pub provider_id: String,
    /// What the upstream backend calls this model.
    #[builder(into)]
    pub name: String,
    pub tier: Option<Tier>,
    #[serde(default)]
    #[builder(default)]
    pub is_default: bool,
}

/// The provider file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub models: Vec<Model>,
}

/// Last known health of a provider. Written only by the health checker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthState {
    pub is_healthy: bool,
    /// Set once `failure_threshold` consecutive failures are seen, cleared by a success.
    pub out_of_rotation: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<SystemTime>,
    pub response_time_ms: Option<f64>,
    pub last_error: Option<String>,
}

impl HealthState {
    /// Record a successful probe. Returns true if this flipped the provider to healthy.
    pub fn record_success(&mut self, response_time_ms: f64) -> bool {
        let was_healthy = self.is_healthy;
        self.is_healthy = true;
        self.out_of_rotation = false;
        self.consecutive_failures = 0;
        self.last_check = Some(SystemTime::now());
        self.response_time_ms = Some(response_time_ms);
        self.last_error = None;
        !was_healthy
    }

    /// Record a failed probe. The provider is only marked unhealthy once `failure_threshold`
    /// consecutive failures have been seen, whether or not it ever passed a probe. Returns
    /// true if this took it out of rotation.
    pub fn record_failure(
        &mut self,
        error: String,
        response_time_ms: Option<f64>,
        failure_threshold: u32,
    ) -> bool {
        let was_routable = self.is_routable();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_check = Some(SystemTime::now());
        self.response_time_ms = response_time_ms;
        self.last_error = Some(error);
        if self.consecutive_failures >= failure_threshold.max(1) {
            self.is_healthy = false;
            self.out_of_rotation = true;
        }
        was_routable && !self.is_routable()
    }

    /// Unknown providers stay routable until they reach the failure threshold.
    pub fn is_routable(&self) -> bool {
        !self.out_of_rotation
    }
}

/// How a request was matched to its candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    ExplicitId,
    Shorthand,
    ProviderDefault,
    Tier(Tier),
    Auto(Tier),
    ByName,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionReason::ExplicitId => f.write_str("explicit"),
            SelectionReason::Shorthand => f.write_str("shorthand"),
            SelectionReason::ProviderDefault => f.write_str("provider-default"),
            SelectionReason::Tier(tier) => write!(f, "tier:{tier}"),
            SelectionReason::Auto(tier) => write!(f, "auto:{tier}"),
            SelectionReason::ByName => f.write_str("name"),
        }
    }
}

/// A (provider, model) pair that could serve a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub provider: Arc<Provider>,
    pub model: Model,
}

/// The ordered candidates for a requested identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub candidates: Vec<Candidate>,
    pub reason: SelectionReason,
}

/// Point-in-time view of one provider for diagnostics.
#[derive(Debug, Clone)]
pub struct ProviderSnapshot {
    pub provider: Arc<Provider>,
    pub current_requests: usize,
    pub health: HealthState,
}

struct ProviderSlot {
    provider: Arc<Provider>,
    current_requests: AtomicUsize,
}

impl ProviderSlot {
    fn try_increment(&self) -> bool {
        let max = self.provider.max_concurrent;
        self.current_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn decrement(&self) {
        if self
            .current_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!(provider = %self.provider.id, "Release without matching acquire");
        }
    }
}

/// A held concurrency slot. Dropping it releases the slot, whatever the exit path.
pub struct AdmissionGuard {
    slot: Arc<ProviderSlot>,
}

impl AdmissionGuard {
    pub fn provider_id(&self) -> &str {
        &self.slot.provider.id
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.slot.decrement();
    }
}

impl fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("provider", &self.slot.provider.id)
            .finish()
    }
}

pub struct Registry {
    providers: HashMap<String, Arc<ProviderSlot>>,
    models: HashMap<String, Model>,
    health: DashMap<String, HealthState>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("providers", &self.providers.len())
            .field("models", &self.models.len())
            .finish()
    }
}

impl Registry {
    pub async fn from_config_file(config_path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            anyhow!(
                "Failed to read provider file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let config_file: ConfigFile = serde_json::from_str(&contents).map_err(|e| {
            anyhow!(
                "Failed to parse provider file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let registry = Self::from_config(config_file)?;

        info!(
            "Loaded {} providers and {} models from {}",
            registry.providers.len(),
            registry.models.len(),
            config_path.display()
        );
        Ok(registry)
    }

    /// Validate and load a parsed provider file. Any inconsistency is fatal.
    pub fn from_config(config_file: ConfigFile) -> Result<Self, RegistryError> {
        let mut providers = HashMap::new();
        let health = DashMap::new();

        for provider in config_file.providers {
            if provider.id.is_empty() {
                return Err(RegistryError::EmptyId("provider"));
            }
            if providers.contains_key(&provider.id) {
                return Err(RegistryError::DuplicateProvider(provider.id));
            }
            if provider.max_concurrent == 0 {
                return Err(RegistryError::ZeroConcurrency(provider.id));
            }
            if provider.managed.is_some() && provider.kind == ProviderKind::Cloud {
                return Err(RegistryError::ManagedCloudProvider(provider.id));
            }
            debug!(
                provider = %provider.id,
                kind = ?provider.kind,
                priority = provider.priority,
                max_concurrent = provider.max_concurrent,
                "Registering provider"
            );
            health.insert(provider.id.clone(), HealthState::default());
            providers.insert(
                provider.id.clone(),
                Arc::new(ProviderSlot {
                    provider: Arc::new(provider),
                    current_requests: AtomicUsize::new(0),
                }),
            );
        }

        let mut models: HashMap<String, Model> = HashMap::new();
        let mut defaults: HashMap<String, String> = HashMap::new();

        for model in config_file.models {
            if model.id.is_empty() {
                return Err(RegistryError::EmptyId("model"));
            }
            if models.contains_key(&model.id) {
                return Err(RegistryError::DuplicateModel(model.id));
            }
            if !providers.contains_key(&model.provider_id) {
                return Err(RegistryError::DanglingProvider {
                    model: model.id,
                    provider: model.provider_id,
                });
            }
            if model.is_default {
                if let Some(first) = defaults.get(&model.provider_id) {
                    return Err(RegistryError::MultipleDefaults {
                        provider: model.provider_id.clone(),
                        first: first.clone(),
                        second: model.id,
                    });
                }
                defaults.insert(model.provider_id.clone(), model.id.clone());
            }
            models.insert(model.id.clone(), model);
        }

        Ok(Registry {
            providers,
            models,
            health,
        })
    }

    pub fn get_provider(&self, id: &str) -> Option<Arc<Provider>> {
        self.providers.get(id).map(|slot| Arc::clone(&slot.provider))
    }

    pub fn get_model(&self, id: &str) -> Option<Model> {
        self.models.get(id).cloned()
    }

    /// All providers, in priority order.
    pub fn list_providers(&self) -> Vec<Arc<Provider>> {
        let mut providers: Vec<_> = self
            .providers
            .values()
            .map(|slot| Arc::clone(&slot.provider))
            .collect();
        providers.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
        providers
    }

    /// All models, ordered by id.
    pub fn list_models(&self) -> Vec<Model> {
        let mut models: Vec<_> = self.models.values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn health(&self, provider_id: &str) -> Option<HealthState> {
        self.health.get(provider_id).map(|h| h.value().clone())
    }

    /// Mutate a provider's health in place. Holds only that provider's shard lock.
    pub fn update_health<R>(
        &self,
        provider_id: &str,
        f: impl FnOnce(&mut HealthState) -> R,
    ) -> Option<R> {
        self.health
            .get_mut(provider_id)
            .map(|mut state| f(state.value_mut()))
    }

    /// Forget everything known about a provider's health (e.g. after its container stopped).
    pub fn reset_health(&self, provider_id: &str) {
        self.update_health(provider_id, |state| *state = HealthState::default());
    }

    pub fn current_requests(&self, provider_id: &str) -> Option<usize> {
        self.providers
            .get(provider_id)
            .map(|slot| slot.current_requests.load(Ordering::Acquire))
    }

    /// Take a concurrency slot if the provider is below `max_concurrent`.
    ///
    /// Prefer [`Registry::try_admit`], which cannot leak the slot.
    pub fn acquire(&self, provider_id: &str) -> bool {
        self.providers
            .get(provider_id)
            .is_some_and(|slot| slot.try_increment())
    }

    /// Give back a slot taken with [`Registry::acquire`].
    pub fn release(&self, provider_id: &str) {
        if let Some(slot) = self.providers.get(provider_id) {
            slot.decrement();
        }
    }

    /// Take a concurrency slot, released when the guard is dropped. `None` if at capacity.
    pub fn try_admit(&self, provider_id: &str) -> Option<AdmissionGuard> {
        let slot = self.providers.get(provider_id)?;
        slot.try_increment().then(|| AdmissionGuard {
            slot: Arc::clone(slot),
        })
    }

    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        self.list_providers()
            .into_iter()
            .map(|provider| ProviderSnapshot {
                current_requests: self.current_requests(&provider.id).unwrap_or(0),
                health: self.health(&provider.id).unwrap_or_default(),
                provider,
            })
            .collect()
    }

    /// Resolve a requested model identifier to its ordered candidates.
    ///
    /// Candidates are restricted to enabled providers and sorted by provider priority, then
    /// provider id, then model id. Health is not consulted here.
    pub fn candidates_for(
        &self,
        requested: &str,
        features: &RequestFeatures,
    ) -> Result<Resolution, RouteError> {
        // 1. exact model id
        if let Some(model) = self.models.get(requested) {
            return Ok(self.resolution(
                std::iter::once(model),
                SelectionReason::ExplicitId,
            ));
        }

        // 2. provider/model shorthand
        if let Some((provider_id, model_name)) = requested.split_once('/')
            && self.providers.contains_key(provider_id)
        {
            let matching: Vec<&Model> = self
                .models
                .values()
                .filter(|m| m.provider_id == provider_id)
                .filter(|m| m.name == model_name || m.id == model_name)
                .collect();
            if !matching.is_empty() {
                return Ok(self.resolution(matching, SelectionReason::Shorthand));
            }
        }

        // 3. bare provider id
        if self.providers.contains_key(requested)
            && let Some(model) = self
                .models
                .values()
                .find(|m| m.provider_id == requested && m.is_default)
        {
            return Ok(self.resolution(
                std::iter::once(model),
                SelectionReason::ProviderDefault,
            ));
        }

        // 4. tier alias
        if let Ok(tier) = requested.parse::<Tier>() {
            return Ok(self.resolution(self.models_in_tier(tier), SelectionReason::Tier(tier)));
        }

        // 5. auto
        if requested == AUTO {
            let classified = classify(features);
            for tier in classified.escalation() {
                let resolution =
                    self.resolution(self.models_in_tier(tier), SelectionReason::Auto(tier));
                if !resolution.candidates.is_empty() {
                    debug!(classified = %classified, tier = %tier, "Resolved auto request");
                    return Ok(resolution);
                }
            }
            return Ok(Resolution {
                candidates: Vec::new(),
                reason: SelectionReason::Auto(classified),
            });
        }

        // 6. model name across providers
        let by_name: Vec<&Model> = self
            .models
            .values()
            .filter(|m| m.name == requested)
            .collect();
        if !by_name.is_empty() {
            return Ok(self.resolution(by_name, SelectionReason::ByName));
        }

        Err(RouteError::UnknownModel(requested.to_string()))
    }

    fn models_in_tier(&self, tier: Tier) -> Vec<&Model> {
        self.models
            .values()
            .filter(|m| m.tier == Some(tier))
            .collect()
    }

    fn resolution<'a>(
        &self,
        models: impl IntoIterator<Item = &'a Model>,
        reason: SelectionReason,
    ) -> Resolution {
        let mut candidates: Vec<Candidate> = models
            .into_iter()
            .filter_map(|model| {
                let slot = self.providers.get(&model.provider_id)?;
                slot.provider.enabled.then(|| Candidate {
                    provider: Arc::clone(&slot.provider),
                    model: model.clone(),
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            (a.provider.priority, &a.provider.id, &a.model.id).cmp(&(
                b.provider.priority,
                &b.provider.id,
                &b.model.id,
            ))
        });
        Resolution { candidates, reason }
    }

    /// Provider ids that serve no model, used to sanity check the provider file.
    pub fn providers_without_models(&self) -> Vec<String> {
        let served: HashSet<&str> = self.models.values().map(|m| m.provider_id.as_str()).collect();
        let mut idle: Vec<String> = self
            .providers
            .keys()
            .filter(|id| !served.contains(id.as_str()))
            .cloned()
            .collect();
        idle.sort();
        idle
    }
}
