// Run HTTP routes
//
// Runs are created against an agent and advanced in the background by the
// supervisor. The event log is served from storage; live delivery is the
// WebSocket endpoint's job.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use runloop_core::{Run, RunError, RunEvent, RunFilter, RunStatus, Trigger, UsageRecord};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::common::{ApiError, ErrorResponse, ListResponse};
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 100;

/// Request to trigger a run manually
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CreateRunRequest {
    /// Substituted for `{{input}}` in the agent's prompt template.
    #[serde(default)]
    #[schema(example = "rust async runtimes")]
    pub input: Option<String>,
}

/// Query parameters for run listing
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListRunsQuery {
    /// Only runs of this agent
    pub agent_id: Option<Uuid>,
    /// Only runs in this status
    #[param(value_type = Option<String>)]
    pub status: Option<RunStatus>,
    /// Maximum number of runs returned (default 100)
    pub limit: Option<usize>,
}

/// Query parameters for event listing
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct EventsQuery {
    /// Only events with a sequence number greater than this
    pub since: Option<u64>,
}

/// Create run routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/agents/:agent_id/runs", post(create_run))
        .route("/v1/runs", get(list_runs))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/v1/runs/:run_id/events", get(list_events))
        .route("/v1/runs/:run_id/usage", get(list_usage))
        .route("/v1/runs/:run_id/cancel", post(cancel_run))
        .with_state(state)
}

async fn require_run(state: &AppState, run_id: Uuid) -> Result<Run, ApiError> {
    Ok(state
        .runs
        .get_run(run_id)
        .await?
        .ok_or(RunError::RunNotFound(run_id))?)
}

/// POST /v1/agents/{agent_id}/runs - Trigger a run
#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/runs",
    params(
        ("agent_id" = Uuid, Path, description = "Agent ID")
    ),
    request_body = CreateRunRequest,
    responses(
        (status = 201, description = "Run created and queued", body = Run),
        (status = 404, description = "Agent not found", body = ErrorResponse),
        (status = 503, description = "Server is shutting down", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "runs"
)]
pub async fn create_run(
    State(state): State<AppState>,
    Path(agent_id): Path<Uuid>,
    body: Option<Json<CreateRunRequest>>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let run = state
        .supervisor
        .create_and_start(agent_id, Trigger::manual(req.input))
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /v1/runs - List runs, newest first
#[utoipa::path(
    get,
    path = "/v1/runs",
    params(ListRunsQuery),
    responses(
        (status = 200, description = "List of runs", body = ListResponse<Run>),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ListResponse<Run>>, ApiError> {
    let filter = RunFilter {
        agent_id: query.agent_id,
        status: query.status,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
    };
    let runs = state.runs.list_runs(&filter).await?;
    Ok(Json(ListResponse::new(runs)))
}

/// GET /v1/runs/{run_id} - Get run with its steps
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}",
    params(
        ("run_id" = Uuid, Path, description = "Run ID")
    ),
    responses(
        (status = 200, description = "Run found", body = Run),
        (status = 404, description = "Run not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(require_run(&state, run_id).await?))
}

/// GET /v1/runs/{run_id}/events - Event log in sequence order
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}/events",
    params(
        ("run_id" = Uuid, Path, description = "Run ID"),
        EventsQuery
    ),
    responses(
        (status = 200, description = "Events of the run", body = ListResponse<RunEvent>),
        (status = 404, description = "Run not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "runs"
)]
pub async fn list_events(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<ListResponse<RunEvent>>, ApiError> {
    require_run(&state, run_id).await?;
    let events = state.runs.list_events(run_id, query.since).await?;
    Ok(Json(ListResponse::new(events)))
}

/// GET /v1/runs/{run_id}/usage - Per-turn usage records
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}/usage",
    params(
        ("run_id" = Uuid, Path, description = "Run ID")
    ),
    responses(
        (status = 200, description = "Usage records of the run", body = ListResponse<UsageRecord>),
        (status = 404, description = "Run not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "runs"
)]
pub async fn list_usage(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ListResponse<UsageRecord>>, ApiError> {
    require_run(&state, run_id).await?;
    let usage = state.runs.list_usage(run_id).await?;
    Ok(Json(ListResponse::new(usage)))
}

/// POST /v1/runs/{run_id}/cancel - Cancel a run
///
/// Idempotent: cancelling a terminal run returns it unchanged.
#[utoipa::path(
    post,
    path = "/v1/runs/{run_id}/cancel",
    params(
        ("run_id" = Uuid, Path, description = "Run ID")
    ),
    responses(
        (status = 200, description = "Run after cancellation", body = Run),
        (status = 404, description = "Run not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    let run = state.supervisor.cancel(run_id).await?;
    Ok(Json(run))
}
