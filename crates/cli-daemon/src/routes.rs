use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, warn};
use serde::Deserialize;
use serde_json::json;
use splitter::config::JobDefaults;
use splitter::{JobParams, Orchestrator, PipelineError};

const API_KEY_HEADER: &str = "x-api-key";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub defaults: Arc<JobDefaults>,
    pub api_key: Option<Arc<str>>,
}

/// `POST /start` body; anything missing takes the configured default
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub url: Option<String>,
    pub segment_time: Option<f64>,
    pub overlap_seconds: Option<f64>,
    pub format: Option<String>,
    pub dest_root: Option<String>,
    pub group_prefix: Option<String>,
    pub max_dirs: Option<u32>,
    pub max_files_per_dir: Option<u32>,
    pub max_segments: Option<u32>,
}

impl StartRequest {
    pub fn into_params(self, defaults: &JobDefaults) -> JobParams {
        JobParams {
            url: self.url.unwrap_or_default(),
            segment_time: self.segment_time.unwrap_or(defaults.segment_time),
            overlap_seconds: self.overlap_seconds.unwrap_or(defaults.overlap_seconds),
            format: self.format.unwrap_or_else(|| defaults.format.clone()),
            dest_root: self.dest_root.unwrap_or_else(|| defaults.dest_root.clone()),
            group_prefix: self.group_prefix.unwrap_or_else(|| defaults.group_prefix.clone()),
            max_dirs: self.max_dirs.unwrap_or(defaults.max_dirs),
            max_files_per_dir: self.max_files_per_dir.unwrap_or(defaults.max_files_per_dir),
            max_segments: self.max_segments.or(defaults.max_segments),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SlicesQuery {
    pub group_prefix: Option<String>,
    pub dest_root: Option<String>,
}

/// JSON `{"error": ...}` with a status code
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::TransientStorage(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::FatalStorage(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }
        ApiError(status, err.to_string())
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/start", post(start_job))
        .route("/status/:job_id", get(job_status))
        .route("/slices", get(list_slices))
        .with_state(state)
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "endpoints": ["/health", "/start", "/status/<job_id>", "/slices"],
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(());
    };
    let supplied = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if supplied == Some(expected) {
        Ok(())
    } else {
        warn!("Rejected request with missing or wrong {}", API_KEY_HEADER);
        Err(ApiError(StatusCode::UNAUTHORIZED, "invalid or missing api key".to_string()))
    }
}

async fn start_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<StartRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    check_api_key(&state, &headers)?;

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let params = request.into_params(&state.defaults);
    let job = state.orchestrator.submit(params).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job.id, "state": job.status.as_str() })),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.orchestrator.status(&job_id).await? {
        Some(job) => Ok(Json(job).into_response()),
        None => Err(ApiError(StatusCode::NOT_FOUND, format!("job {} not found", job_id))),
    }
}

async fn list_slices(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SlicesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_api_key(&state, &headers)?;

    let group_prefix = query.group_prefix.unwrap_or_else(|| state.defaults.group_prefix.clone());
    let dest_root = query.dest_root.unwrap_or_else(|| state.defaults.dest_root.clone());
    let paths = state.orchestrator.slices(&group_prefix, &dest_root).await?;

    Ok(Json(json!({
        "group_prefix": group_prefix,
        "dest_root": dest_root,
        "paths": paths,
    })))
}
