// Schedule HTTP routes
//
// User edits recompute the next fire time from "now"; the scheduler only
// ever moves it forward through its claim.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use runloop_core::{
    CreateScheduleRequest, RunError, Schedule, StoreError, UpdateScheduleRequest,
};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use super::common::{ApiError, ErrorResponse, ListResponse};
use crate::state::AppState;

/// Query parameters for schedule listing
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListSchedulesQuery {
    /// Only schedules of this agent
    pub agent_id: Option<Uuid>,
}

/// Create schedule routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/schedules", post(create_schedule).get(list_schedules))
        .route(
            "/v1/schedules/:schedule_id",
            get(get_schedule)
                .patch(update_schedule)
                .delete(delete_schedule),
        )
        .with_state(state)
}

async fn require_schedule(state: &AppState, schedule_id: Uuid) -> Result<Schedule, ApiError> {
    Ok(state
        .schedules
        .get_schedule(schedule_id)
        .await?
        .ok_or(RunError::ScheduleNotFound(schedule_id))?)
}

/// POST /v1/schedules - Create a schedule
#[utoipa::path(
    post,
    path = "/v1/schedules",
    request_body = CreateScheduleRequest,
    responses(
        (status = 201, description = "Schedule created", body = Schedule),
        (status = 400, description = "Invalid cron expression", body = ErrorResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "schedules"
)]
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    state
        .agents
        .get_agent(req.agent_id)
        .await?
        .ok_or(RunError::AgentNotFound(req.agent_id))?;

    let schedule = Schedule::new(req.agent_id, &req.cron, req.input, req.enabled, Utc::now())?;
    let schedule = state.schedules.create_schedule(schedule).await?;
    tracing::info!(
        schedule_id = %schedule.id,
        agent_id = %schedule.agent_id,
        cron = %schedule.cron,
        next_fire_at = ?schedule.next_fire_at,
        "Schedule created"
    );
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /v1/schedules - List schedules
#[utoipa::path(
    get,
    path = "/v1/schedules",
    params(ListSchedulesQuery),
    responses(
        (status = 200, description = "List of schedules", body = ListResponse<Schedule>),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "schedules"
)]
pub async fn list_schedules(
    State(state): State<AppState>,
    Query(query): Query<ListSchedulesQuery>,
) -> Result<Json<ListResponse<Schedule>>, ApiError> {
    let schedules = state.schedules.list_schedules(query.agent_id).await?;
    Ok(Json(ListResponse::new(schedules)))
}

/// GET /v1/schedules/{schedule_id} - Get schedule by ID
#[utoipa::path(
    get,
    path = "/v1/schedules/{schedule_id}",
    params(
        ("schedule_id" = Uuid, Path, description = "Schedule ID")
    ),
    responses(
        (status = 200, description = "Schedule found", body = Schedule),
        (status = 404, description = "Schedule not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "schedules"
)]
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
) -> Result<Json<Schedule>, ApiError> {
    Ok(Json(require_schedule(&state, schedule_id).await?))
}

/// PATCH /v1/schedules/{schedule_id} - Update schedule
#[utoipa::path(
    patch,
    path = "/v1/schedules/{schedule_id}",
    params(
        ("schedule_id" = Uuid, Path, description = "Schedule ID")
    ),
    request_body = UpdateScheduleRequest,
    responses(
        (status = 200, description = "Schedule updated", body = Schedule),
        (status = 400, description = "Invalid cron expression", body = ErrorResponse),
        (status = 404, description = "Schedule not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "schedules"
)]
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
    Json(req): Json<UpdateScheduleRequest>,
) -> Result<Json<Schedule>, ApiError> {
    let mut schedule = require_schedule(&state, schedule_id).await?;
    schedule.apply(req, Utc::now())?;

    let schedule = match state.schedules.update_schedule(schedule).await {
        Ok(schedule) => schedule,
        // Deleted between the read and the write
        Err(StoreError::NotFound(_)) => return Err(RunError::ScheduleNotFound(schedule_id).into()),
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        schedule_id = %schedule.id,
        enabled = schedule.enabled,
        next_fire_at = ?schedule.next_fire_at,
        "Schedule updated"
    );
    Ok(Json(schedule))
}

/// DELETE /v1/schedules/{schedule_id} - Delete schedule
#[utoipa::path(
    delete,
    path = "/v1/schedules/{schedule_id}",
    params(
        ("schedule_id" = Uuid, Path, description = "Schedule ID")
    ),
    responses(
        (status = 204, description = "Schedule deleted"),
        (status = 404, description = "Schedule not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "schedules"
)]
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state.schedules.delete_schedule(schedule_id).await? {
        return Err(RunError::ScheduleNotFound(schedule_id).into());
    }
    tracing::info!(schedule_id = %schedule_id, "Schedule deleted");
    Ok(StatusCode::NO_CONTENT)
}
