/// Wire types for the HTTP surface.
///
/// `/v1/models` mimics the OpenAI models endpoint so existing clients can discover what the
/// gateway serves. `/status` is our own diagnostics format.
use crate::classifier::Tier;
use crate::compute::ComputeStatus;
use crate::health::ProbeOutcome;
use crate::provider::ProviderKind;
use crate::registry::{HealthState, Model, ProviderSnapshot, Registry};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::UNIX_EPOCH;

/// The `model` field of a chat request body.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ExtractedModel<'a> {
    /// Borrowed unless the JSON string contains escapes.
    #[serde(borrow)]
    pub(crate) model: Cow<'a, str>,
}

/// One entry returned by `/v1/models`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelObject {
    /// The model identifier, which can be referenced in the API endpoints.
    pub id: String,
    /// The Unix timestamp (in seconds) when the model was created.
    pub created: Option<u32>,
    /// The object type, which is always "model".
    pub object: String,
    /// The provider serving the model.
    pub owned_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl ModelObject {
    fn from_model(model: &Model) -> Self {
        ModelObject {
            id: model.id.clone(),
            created: None,
            object: "model".into(),
            owned_by: model.provider_id.clone(),
            tier: model.tier,
        }
    }
}

/// The response from the /v1/models endpoint, which is a list of models.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListModelResponse {
    /// The object type, which is always "list".
    pub object: String,
    pub data: Vec<ModelObject>,
}

impl ListModelResponse {
    /// Every model whose provider is enabled.
    pub fn from_registry(registry: &Registry) -> Self {
        let data = registry
            .list_models()
            .iter()
            .filter(|m| {
                registry
                    .get_provider(&m.provider_id)
                    .is_some_and(|p| p.enabled)
            })
            .map(ModelObject::from_model)
            .collect();
        ListModelResponse {
            object: "list".into(),
            data,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthView {
    pub is_healthy: bool,
    pub routable: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<u64>,
    pub response_time_ms: Option<f64>,
    pub last_error: Option<String>,
}

impl From<&HealthState> for HealthView {
    fn from(state: &HealthState) -> Self {
        HealthView {
            is_healthy: state.is_healthy,
            routable: state.is_routable(),
            consecutive_failures: state.consecutive_failures,
            last_check: state
                .last_check
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            response_time_ms: state.response_time_ms,
            last_error: state.last_error.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderStatus {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub priority: i32,
    pub enabled: bool,
    pub managed: bool,
    pub current_requests: usize,
    pub max_concurrent: usize,
    pub health: HealthView,
}

impl From<&ProviderSnapshot> for ProviderStatus {
    fn from(snapshot: &ProviderSnapshot) -> Self {
        let provider = &snapshot.provider;
        ProviderStatus {
            id: provider.id.clone(),
            name: provider.name.clone(),
            kind: provider.kind,
            priority: provider.priority,
            enabled: provider.enabled,
            managed: provider.is_managed(),
            current_requests: snapshot.current_requests,
            max_concurrent: provider.max_concurrent,
            health: HealthView::from(&snapshot.health),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ComputeView {
    pub provider_id: String,
    pub container: String,
    pub running: bool,
    pub idle_secs: Option<u64>,
    pub idle_timeout_secs: u64,
}

impl From<&ComputeStatus> for ComputeView {
    fn from(status: &ComputeStatus) -> Self {
        ComputeView {
            provider_id: status.provider_id.clone(),
            container: status.container.clone(),
            running: status.running,
            idle_secs: status.idle_for.map(|d| d.as_secs()),
            idle_timeout_secs: status.idle_timeout.as_secs(),
        }
    }
}

/// The response from `/status`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub providers: Vec<ProviderStatus>,
    pub models: Vec<Model>,
    pub computes: Vec<ComputeView>,
}

/// The response from a forced health check.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckResponse {
    pub provider_id: String,
    pub success: bool,
    pub status: Option<u16>,
    pub response_time_ms: f64,
    pub error: Option<String>,
    pub health: HealthView,
}

impl From<&ProbeOutcome> for CheckResponse {
    fn from(outcome: &ProbeOutcome) -> Self {
        CheckResponse {
            provider_id: outcome.provider_id.clone(),
            success: outcome.success,
            status: outcome.status.map(|s| s.as_u16()),
            response_time_ms: outcome.response_time_ms,
            error: outcome.error.clone(),
            health: HealthView::from(&outcome.health),
        }
    }
}

/// OpenAI-style error body, so clients surface the message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, kind: &str, code: &str) -> Self {
        ErrorResponse {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.to_string(),
                code: code.to_string(),
            },
        }
    }
}
