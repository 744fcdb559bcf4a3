// Health endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub version: String,
    /// "postgres" or "memory"
    #[schema(example = "memory")]
    pub storage: String,
    /// Runs currently being advanced
    pub active_runs: usize,
    /// True once graceful shutdown has started
    pub draining: bool,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

/// GET /health - Liveness and runtime summary
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Server is up", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.supervisor.is_draining() {
            "draining"
        } else {
            "ok"
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage: state.storage_mode.to_string(),
        active_runs: state.supervisor.active_count(),
        draining: state.supervisor.is_draining(),
    })
}
