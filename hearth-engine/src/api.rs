//! HTTP surface: translates wire requests into Request Gate calls.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hearth_resilience::{HealthMonitor, HealthState};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::EngineError;
use crate::gate::RequestGate;
use crate::models::GenerationParams;
use crate::prompt::{self, ContextTurn};
use crate::request::{FinishReason, InferenceRequest};

const REQUEST_ID_HEADER: &str = "x-request-id";

// ── Shared state ──────────────────────────────────────────────────────────

/// State shared by all handlers. The gate is installed once the model has
/// loaded; until then only health queries are answered.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

struct AppInner {
    health: Arc<HealthMonitor>,
    gate: OnceLock<Arc<RequestGate>>,
    model_name: String,
    defaults: GenerationParams,
}

impl AppState {
    pub fn new(health: Arc<HealthMonitor>, model_name: impl Into<String>, defaults: GenerationParams) -> Self {
        Self {
            inner: Arc::new(AppInner {
                health,
                gate: OnceLock::new(),
                model_name: model_name.into(),
                defaults,
            }),
        }
    }

    /// Start routing inference traffic to `gate`. Returns false if a gate was
    /// already installed.
    pub fn install_gate(&self, gate: Arc<RequestGate>) -> bool {
        self.inner.gate.set(gate).is_ok()
    }

    pub fn gate(&self) -> Option<&Arc<RequestGate>> {
        self.inner.gate.get()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.inner.health
    }

    pub fn model_name(&self) -> &str {
        &self.inner.model_name
    }
}

// ── Wire types ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub message: String,
    #[serde(default)]
    pub context: Option<Vec<ContextTurn>>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub content: String,
    pub model: String,
    pub tokens_generated: u64,
    pub prompt_tokens: u64,
    pub finish_reason: FinishReason,
    pub elapsed_ms: u64,
    pub queued_ms: u64,
    pub request_id: String,
    pub success: bool,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: HealthState,
    model_loaded: bool,
    model: String,
    queue_depth: usize,
    in_flight: bool,
    consecutive_failures: u32,
    uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

// ── Errors ────────────────────────────────────────────────────────────────

/// An [`EngineError`] on its way to the wire.
#[derive(Debug)]
pub struct ApiError {
    pub error: EngineError,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(error: EngineError, request_id: Option<String>) -> Self {
        Self { error, request_id }
    }
}

/// HTTP status for each error class.
pub fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Rejected { .. } => StatusCode::TOO_MANY_REQUESTS,
        EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Inference(_) | EngineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::NotReady(_) | EngineError::ShuttingDown | EngineError::Load(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.error.code().to_string(),
                message: self.error.to_string(),
            },
            request_id: self.request_id.clone(),
        };
        let mut response = (status, Json(body)).into_response();
        if matches!(self.error, EngineError::Rejected { .. }) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        if let Some(id) = self.request_id.as_deref() {
            tag_request_id(&mut response, id);
        }
        response
    }
}

fn tag_request_id(response: &mut Response, id: &str) {
    if let Ok(value) = HeaderValue::from_str(id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

// ── Router ────────────────────────────────────────────────────────────────

/// Build the axum Router with `/`, `/health`, `/stats` and `/generate` routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/generate", post(generate_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "hearth-engine",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "model": state.model_name(),
        "model_loaded": state.gate().is_some(),
    }))
}

/// Health check endpoint: 200 while ready or overloaded, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.health().snapshot();
    let (queue_depth, in_flight) = state
        .gate()
        .map(|gate| {
            let serializer = gate.serializer();
            (serializer.queue_depth(), serializer.is_busy())
        })
        .unwrap_or((0, false));

    let body = HealthBody {
        status: snapshot.state,
        model_loaded: state.gate().is_some(),
        model: state.model_name().to_string(),
        queue_depth,
        in_flight,
        consecutive_failures: snapshot.consecutive_failures,
        uptime_secs: snapshot.uptime_secs,
        reason: snapshot.reason,
    };
    let status = if snapshot.state.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn stats_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let gate = state.gate().ok_or_else(|| not_ready(&state, None))?;
    Ok(Json(gate.stats()).into_response())
}

async fn generate_handler(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) =
        body.map_err(|e| ApiError::new(EngineError::InvalidRequest(e.body_text()), None))?;

    let request_id = body
        .request_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let gate = state
        .gate()
        .cloned()
        .ok_or_else(|| not_ready(&state, Some(request_id.clone())))?;

    if body.message.trim().is_empty() {
        return Err(ApiError::new(
            EngineError::InvalidRequest("message must not be empty".into()),
            Some(request_id),
        ));
    }

    let request = build_request(&state.inner.defaults, body, request_id.clone());
    let result = gate
        .submit(request)
        .await
        .map_err(|e| ApiError::new(e, Some(request_id.clone())))?;

    let payload = GenerateResponse {
        content: result.text,
        model: state.model_name().to_string(),
        tokens_generated: result.tokens_generated,
        prompt_tokens: result.prompt_tokens,
        finish_reason: result.finish_reason,
        elapsed_ms: result.elapsed.as_millis() as u64,
        queued_ms: result.queued_for.as_millis() as u64,
        request_id: request_id.clone(),
        success: true,
    };
    let mut response = Json(payload).into_response();
    tag_request_id(&mut response, &request_id);
    Ok(response)
}

fn not_ready(state: &AppState, request_id: Option<String>) -> ApiError {
    let health = state.health().state();
    ApiError::new(
        EngineError::NotReady(format!("model is {health}")),
        request_id,
    )
}

/// Merge the wire body over the configured defaults.
fn build_request(defaults: &GenerationParams, body: GenerateRequest, request_id: String) -> InferenceRequest {
    let mut params = defaults.clone();
    if let Some(v) = body.max_tokens {
        params.max_tokens = v;
    }
    if let Some(v) = body.temperature {
        params.temperature = v;
    }
    if body.top_p.is_some() {
        params.top_p = body.top_p;
    }
    if body.top_k.is_some() {
        params.top_k = body.top_k;
    }
    params.seed = body.seed;
    params.stop_sequences = prompt::stop_sequences(body.stop.as_deref().unwrap_or(&[]));

    let text = prompt::format_prompt(&body.message, body.context.as_deref().unwrap_or(&[]));
    let mut request = InferenceRequest::new(text)
        .with_id(request_id)
        .with_params(params);
    if let Some(ms) = body.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    request
}
