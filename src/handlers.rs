/// Axum handlers for the gateway
use crate::AppState;
use crate::classifier::{RequestFeatures, Tier};
use crate::client::HttpClient;
use crate::errors::{RegistryError, RouteError};
use crate::models::{
    CheckResponse, ComputeView, ErrorResponse, ExtractedModel, ListModelResponse, ProviderStatus,
    StatusResponse,
};
use crate::router::ForwardResult;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, info, instrument, warn};

pub const MODEL_OVERRIDE_HEADER: &str = "model-override";
pub const COMPLEXITY_HINT_HEADER: &str = "x-complexity-hint";
pub const PROVIDER_HEADER: &str = "x-switchyard-provider";
pub const MODEL_HEADER: &str = "x-switchyard-model";
pub const REASON_HEADER: &str = "x-switchyard-reason";

/// Upstream response headers that describe the upstream connection rather than the payload.
const HOP_BY_HOP: [HeaderName; 5] = [
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
];

fn error_response(status: StatusCode, message: impl Into<String>, kind: &str, code: &str) -> Response {
    (status, Json(ErrorResponse::new(message, kind, code))).into_response()
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        match &self {
            RouteError::UnknownModel(_) => error_response(
                StatusCode::NOT_FOUND,
                self.to_string(),
                "invalid_request_error",
                "model_not_found",
            ),
            RouteError::NoAvailableProvider { .. } => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                self.to_string(),
                "server_error",
                "no_available_provider",
            ),
        }
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        message,
        "invalid_request_error",
        "invalid_request",
    )
}

/// Order of precedence for the requested model:
/// 1. supplied as a header (model-override)
/// 2. the `model` field of the JSON body
fn requested_model(headers: &HeaderMap, body: &[u8]) -> Result<String, Response> {
    match headers.get(MODEL_OVERRIDE_HEADER) {
        Some(value) => {
            let model = value
                .to_str()
                .map_err(|_| bad_request("model-override header is not valid UTF-8"))?;
            debug!("Using model override from header: {}", model);
            Ok(model.to_string())
        }
        None => serde_json::from_slice::<ExtractedModel>(body)
            .map(|extracted| extracted.model.into_owned())
            .map_err(|_| bad_request("request body must be JSON with a string `model` field")),
    }
}

/// Unparseable hints are ignored rather than rejected.
fn complexity_hint(headers: &HeaderMap) -> Option<Tier> {
    let raw = headers.get(COMPLEXITY_HINT_HEADER)?.to_str().ok()?;
    match raw.trim().to_ascii_lowercase().parse() {
        Ok(tier) => Some(tier),
        Err(()) => {
            debug!(hint = raw, "Ignoring unknown complexity hint");
            None
        }
    }
}

fn forward_response(result: ForwardResult) -> Response {
    let mut response = Response::new(Body::from(result.body));
    *response.status_mut() = result.status;

    let headers = response.headers_mut();
    for (name, value) in &result.headers {
        if !HOP_BY_HOP.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    for (name, value) in [
        (PROVIDER_HEADER, result.provider_id),
        (MODEL_HEADER, result.model_id),
        (REASON_HEADER, result.reason.to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    response
}

/// Route a chat completion to the best available provider.
#[instrument(skip(state, headers, body))]
pub async fn chat_completions<T: HttpClient + 'static>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let requested = match requested_model(&headers, &body) {
        Ok(model) => model,
        Err(response) => return response,
    };
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return bad_request(format!("invalid JSON body: {e}")),
    };

    let features = RequestFeatures::from_chat_body(&payload).with_hint(complexity_hint(&headers));
    info!("Received request for model: {}", requested);

    match state.router.route(&requested, &features, &payload).await {
        Ok(result) => forward_response(result),
        Err(e) => {
            warn!(model = %requested, error = %e, "Request could not be routed");
            e.into_response()
        }
    }
}

#[instrument(skip(state))]
pub async fn models<T: HttpClient>(State(state): State<AppState<T>>) -> impl IntoResponse {
    Json(ListModelResponse::from_registry(&state.registry))
}

#[instrument(skip(state))]
pub async fn status<T: HttpClient>(State(state): State<AppState<T>>) -> impl IntoResponse {
    let computes = match &state.compute {
        Some(compute) => compute.status().await.iter().map(ComputeView::from).collect(),
        None => Vec::new(),
    };
    Json(StatusResponse {
        providers: state
            .registry
            .snapshot()
            .iter()
            .map(ProviderStatus::from)
            .collect(),
        models: state.registry.list_models(),
        computes,
    })
}

#[instrument(skip(state))]
pub async fn check_provider<T: HttpClient + 'static>(
    State(state): State<AppState<T>>,
    Path(provider_id): Path<String>,
) -> Response {
    match state.health.force_check(&provider_id).await {
        Ok(outcome) => Json(CheckResponse::from(&outcome)).into_response(),
        Err(e @ RegistryError::ProviderNotFound(_)) => error_response(
            StatusCode::NOT_FOUND,
            e.to_string(),
            "invalid_request_error",
            "provider_not_found",
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
            "server_error",
            "check_failed",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_header_beats_body() {
        let mut headers = HeaderMap::new();
        headers.insert(MODEL_OVERRIDE_HEADER, HeaderValue::from_static("big"));
        assert_eq!(
            requested_model(&headers, br#"{"model": "small"}"#).unwrap(),
            "big"
        );
        assert_eq!(
            requested_model(&HeaderMap::new(), br#"{"model": "small"}"#).unwrap(),
            "small"
        );
    }

    #[test]
    fn test_escaped_shorthand_in_body() {
        assert_eq!(
            requested_model(&HeaderMap::new(), br#"{"model": "gpu0\/m"}"#).unwrap(),
            "gpu0/m"
        );
        assert_eq!(
            requested_model(&HeaderMap::new(), br#"{"model": "gpu0\u002fm"}"#).unwrap(),
            "gpu0/m"
        );
    }

    #[test]
    fn test_missing_model_is_bad_request() {
        let response = requested_model(&HeaderMap::new(), br#"{"messages": []}"#).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_complexity_hint_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(complexity_hint(&headers), None);
        headers.insert(COMPLEXITY_HINT_HEADER, HeaderValue::from_static(" Medium "));
        assert_eq!(complexity_hint(&headers), Some(Tier::Medium));
        headers.insert(COMPLEXITY_HINT_HEADER, HeaderValue::from_static("huge"));
        assert_eq!(complexity_hint(&headers), None);
    }
}
