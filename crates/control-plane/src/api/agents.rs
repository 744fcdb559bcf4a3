// Agent HTTP routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use runloop_core::{Agent, CreateAgentRequest, RunError};
use uuid::Uuid;

use super::common::{ApiError, ErrorResponse, ListResponse};
use crate::state::AppState;

/// Create agent routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/agents", post(create_agent).get(list_agents))
        .route("/v1/agents/:agent_id", get(get_agent))
        .with_state(state)
}

/// POST /v1/agents - Create a new agent
#[utoipa::path(
    post,
    path = "/v1/agents",
    request_body = CreateAgentRequest,
    responses(
        (status = 201, description = "Agent created successfully", body = Agent),
        (status = 400, description = "Invalid agent", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn create_agent(
    State(state): State<AppState>,
    Json(req): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("Agent name must not be empty"));
    }
    let unknown: Vec<&str> = req
        .config
        .allowed_tools
        .iter()
        .map(String::as_str)
        .filter(|name| !state.machine().tools().has(name))
        .collect();
    if !unknown.is_empty() {
        return Err(ApiError::bad_request(format!(
            "Unknown tools: {}",
            unknown.join(", ")
        )));
    }

    let agent = state.agents.create_agent(Agent::from(req)).await?;
    tracing::info!(agent_id = %agent.id, name = %agent.name, "Agent created");
    Ok((StatusCode::CREATED, Json(agent)))
}

/// GET /v1/agents - List agents
#[utoipa::path(
    get,
    path = "/v1/agents",
    responses(
        (status = 200, description = "List of agents", body = ListResponse<Agent>),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn list_agents(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Agent>>, ApiError> {
    let agents = state.agents.list_agents().await?;
    Ok(Json(ListResponse::new(agents)))
}

/// GET /v1/agents/{agent_id} - Get agent by ID
#[utoipa::path(
    get,
    path = "/v1/agents/{agent_id}",
    params(
        ("agent_id" = Uuid, Path, description = "Agent ID")
    ),
    responses(
        (status = 200, description = "Agent found", body = Agent),
        (status = 404, description = "Agent not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<Agent>, ApiError> {
    let agent = state
        .agents
        .get_agent(agent_id)
        .await?
        .ok_or(RunError::AgentNotFound(agent_id))?;
    Ok(Json(agent))
}
