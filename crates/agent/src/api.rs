//! HTTP API: scheduling requests, on-demand checks, health and metrics

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use scaler_lib::{
    health::{ComponentStatus, HealthRegistry},
    store::CancelOutcome,
    CheckError, CheckReport, EvaluationError, ManagedInstance, PlatformError, ResizeSchedule,
    ResizeScheduler, ScaleCheck, ScheduleError, ScheduleRequest, ScheduleSource, StoreError,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub scheduler: ResizeScheduler,
    pub check: ScaleCheck,
    pub instances: Arc<HashMap<String, ManagedInstance>>,
    pub api_token: Option<String>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        scheduler: ResizeScheduler,
        check: ScaleCheck,
        instances: impl IntoIterator<Item = ManagedInstance>,
    ) -> Self {
        Self {
            health_registry,
            scheduler,
            check,
            instances: Arc::new(
                instances
                    .into_iter()
                    .map(|instance| (instance.instance_id.clone(), instance))
                    .collect(),
            ),
            api_token: None,
        }
    }

    /// Require `Authorization: Bearer <token>` on mutating endpoints
    pub fn with_api_token(mut self, token: Option<String>) -> Self {
        self.api_token = token.filter(|t| !t.is_empty());
        self
    }
}

/// Error body: `{error, code}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token",
        )
    }

    fn unknown_instance(instance_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "unknown_instance",
            format!("unknown instance {}", instance_id),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        let status = match e {
            ValidationError::InvalidExecutionTime(_)
            | ValidationError::NoopTarget { .. }
            | ValidationError::EmptyTarget => StatusCode::BAD_REQUEST,
            ValidationError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            ValidationError::ResizeInProgress(_) => StatusCode::CONFLICT,
        };
        Self::new(status, e.code(), e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "Schedule store failure");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
    }
}

impl From<PlatformError> for ApiError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::NotFound(ref id) => Self::unknown_instance(id),
            other => Self::new(StatusCode::BAD_GATEWAY, "platform_error", other.to_string()),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::Validation(v) => v.into(),
            ScheduleError::Platform(p) => {
                Self::new(StatusCode::BAD_GATEWAY, "platform_error", p.to_string())
            }
            ScheduleError::Store(s) => s.into(),
        }
    }
}

impl From<CheckError> for ApiError {
    fn from(e: CheckError) -> Self {
        match e {
            CheckError::Evaluation(ref eval) => {
                let (status, code) = match eval {
                    EvaluationError::MetricUnavailable { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "metric_unavailable")
                    }
                    EvaluationError::InvalidSample(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "invalid_sample")
                    }
                    EvaluationError::UnknownSizeClass { .. } => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "unknown_size_class")
                    }
                };
                Self::new(status, code, e.to_string())
            }
            CheckError::Platform(p) => p.into(),
            CheckError::Schedule(s) => s.into(),
        }
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(ref expected) = state.api_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => {
            warn!("Rejected unauthenticated API request");
            Err(ApiError::unauthorized())
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleCreated {
    pub schedule_id: Uuid,
}

/// Query-string form of a schedule request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeQuery {
    pub instance_id: String,
    pub target_instance_type: String,
    pub datetime: String,
    #[serde(default)]
    pub time_zone: Option<String>,
}

impl From<ResizeQuery> for ScheduleRequest {
    fn from(query: ResizeQuery) -> Self {
        ScheduleRequest {
            instance_id: query.instance_id,
            target_size_class: query.target_instance_type,
            execution_time: query.datetime,
            time_zone: query.time_zone,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    /// `cancelled`, `requested` or `no_pending`
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
}

impl From<CancelOutcome> for CancelResponse {
    fn from(outcome: CancelOutcome) -> Self {
        let (outcome, schedule_id) = match outcome {
            CancelOutcome::NoPending => ("no_pending", None),
            CancelOutcome::Cancelled(record) => ("cancelled", Some(record.schedule_id)),
            CancelOutcome::Requested(record) => ("requested", Some(record.schedule_id)),
        };
        Self {
            outcome: outcome.to_string(),
            schedule_id,
        }
    }
}

async fn submit(state: &AppState, request: ScheduleRequest) -> Result<Response, ApiError> {
    let schedule_id = state
        .scheduler
        .schedule(&request, ScheduleSource::Manual)
        .await?;
    info!(
        instance_id = %request.instance_id,
        schedule_id = %schedule_id,
        "Manual resize scheduled"
    );
    Ok((StatusCode::CREATED, Json(ScheduleCreated { schedule_id })).into_response())
}

async fn create_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ScheduleRequest>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    submit(&state, request).await
}

async fn resize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ResizeQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    submit(&state, query.into()).await
}

async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<ResizeSchedule>, ApiError> {
    if !state.scheduler.is_managed(&instance_id) {
        return Err(ApiError::unknown_instance(&instance_id));
    }
    state
        .scheduler
        .store()
        .get_current(&instance_id)?
        .map(Json)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "no_schedule",
                format!("no schedule recorded for {}", instance_id),
            )
        })
}

async fn schedule_history(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<Vec<ResizeSchedule>>, ApiError> {
    if !state.scheduler.is_managed(&instance_id) {
        return Err(ApiError::unknown_instance(&instance_id));
    }
    Ok(Json(state.scheduler.store().history(&instance_id)?))
}

async fn cancel_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(instance_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    authorize(&state, &headers)?;
    let outcome = state.scheduler.cancel(&instance_id)?;
    Ok(Json(outcome.into()))
}

async fn run_check(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(instance_id): Path<String>,
) -> Result<Json<CheckReport>, ApiError> {
    authorize(&state, &headers)?;
    let instance = state
        .instances
        .get(&instance_id)
        .ok_or_else(|| ApiError::unknown_instance(&instance_id))?;
    Ok(Json(state.check.run(instance).await?))
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/schedules", post(create_schedule))
        .route(
            "/api/v1/schedules/:instance_id",
            get(get_schedule).delete(cancel_schedule),
        )
        .route(
            "/api/v1/schedules/:instance_id/history",
            get(schedule_history),
        )
        .route("/api/v1/checks/:instance_id", post(run_check))
        .route("/resize", get(resize))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
