use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use churn_core::{ModelMetadata, ServingCell, ServingPhase};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, instrument, warn, Span};

use crate::metrics::GatewayMetrics;
use crate::schema::{FieldError, PredictionRequest, PredictionResult};

pub const SERVICE_MESSAGE: &str = "ChurnGuard churn prediction API";

#[derive(Clone)]
pub struct AppState {
    pub serving: Arc<ServingCell>,
    pub metrics: Arc<GatewayMetrics>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(serving: Arc<ServingCell>, metrics: Arc<GatewayMetrics>, request_timeout: Duration) -> Self {
        Self { serving, metrics, request_timeout }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    MalformedBody { status: StatusCode, message: String },
    #[error("invalid request: {0}")]
    Validation(FieldError),
    #[error("model not available")]
    ModelUnavailable(Box<ModelMetadata>),
    #[error("prediction failed: {message}")]
    Inference { customer_id: String, message: String },
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a ModelMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedBody { status, .. } => *status,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Inference { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Self::MalformedBody { .. } | Self::Validation(_) => "invalid",
            Self::ModelUnavailable(_) => "unavailable",
            Self::Inference { .. } => "error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let body = match &self {
            Self::MalformedBody { .. } => ErrorBody { error: "malformed_request", message, customer_id: None, model: None, field: None },
            Self::Validation(f) => ErrorBody { error: "validation_error", message, customer_id: None, model: None, field: Some(f.field) },
            Self::ModelUnavailable(meta) => ErrorBody {
                error: "model_unavailable",
                message: format!("model '{}' ({}) could not be loaded", meta.name, meta.stage),
                customer_id: None,
                model: Some(&**meta),
                field: None,
            },
            Self::Inference { customer_id, .. } => {
                ErrorBody { error: "inference_error", message, customer_id: Some(customer_id), model: None, field: None }
            }
        };
        (self.status(), Json(body)).into_response()
    }
}

pub async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "online", "model": state.serving.metadata(), "message": SERVICE_MESSAGE }))
}

/// Always 200; the verdict is in the body.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let (status, message) = match state.serving.phase() {
        ServingPhase::Loaded => ("healthy", "ready for predictions".to_string()),
        ServingPhase::Unloaded => ("unhealthy", "model not loaded yet".to_string()),
        ServingPhase::Failed => ("unhealthy", format!("model failed to load: {}", state.serving.metadata().error.as_deref().unwrap_or("unknown error"))),
    };
    Json(json!({ "status": status, "model": state.serving.metadata(), "message": message }))
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let phase = state.serving.phase();
    let code = if phase == ServingPhase::Loaded { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(json!({ "ready": phase == ServingPhase::Loaded, "phase": phase })))
}

pub async fn metrics(State(state): State<AppState>) -> Response { state.metrics.render() }

#[instrument(skip_all, fields(customer_id = tracing::field::Empty))]
pub async fn predict(State(state): State<AppState>, body: Result<Json<Value>, JsonRejection>) -> Result<Json<PredictionResult>, GatewayError> {
    let started = Instant::now();
    let result = run_prediction(&state, body).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.outcome(),
    };
    state.metrics.observe(outcome, started.elapsed().as_secs_f64() * 1000.0);
    result.map(Json)
}

async fn run_prediction(state: &AppState, body: Result<Json<Value>, JsonRejection>) -> Result<PredictionResult, GatewayError> {
    let Json(body) = body.map_err(|r| GatewayError::MalformedBody { status: r.status(), message: r.body_text() })?;
    let request = PredictionRequest::from_json(&body).map_err(|e| {
        warn!(target: "inference-gateway", field = e.field, reason = %e.message, "request rejected");
        GatewayError::Validation(e)
    })?;
    Span::current().record("customer_id", request.customer_id.as_str());

    let Some(model) = state.serving.loaded() else {
        error!(target: "inference-gateway", phase = ?state.serving.phase(), "prediction requested without a loaded model");
        return Err(GatewayError::ModelUnavailable(Box::new(state.serving.metadata().clone())));
    };

    let customer_id = request.customer_id.clone();
    let fail = |message: String| {
        error!(target: "inference-gateway", customer_id = %customer_id, %message, "prediction failed");
        GatewayError::Inference { customer_id: customer_id.clone(), message }
    };

    let frame = request.to_frame();
    let gated = model.gated();
    let task = tokio::task::spawn_blocking(move || model.predict(&frame));
    let outputs = match tokio::time::timeout(state.request_timeout, task).await {
        Err(_) => {
            // a blocking task cannot be cancelled: it runs to completion and keeps holding the
            // gate of a non-reentrant artifact, so later requests queue behind it
            warn!(
                target: "inference-gateway",
                customer_id = %customer_id,
                timeout_ms = state.request_timeout.as_millis() as u64,
                gated,
                "inference timed out, abandoned task keeps running"
            );
            return Err(fail(format!("inference exceeded {} ms", state.request_timeout.as_millis())));
        }
        Ok(Err(join)) => return Err(fail(format!("inference task aborted: {join}"))),
        Ok(Ok(Err(e))) => return Err(fail(e.to_string())),
        Ok(Ok(Ok(outputs))) => outputs,
    };
    let [output] = outputs.as_slice() else {
        return Err(fail(format!("expected one output, artifact returned {}", outputs.len())));
    };
    let result = PredictionResult::from_label(request.customer_id, *output).ok_or_else(|| fail(format!("non-binary output {output}")))?;
    info!(target: "inference-gateway", customer_id = %result.customer_id, prediction = result.churn_prediction, "prediction served");
    Ok(result)
}
