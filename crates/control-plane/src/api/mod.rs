// HTTP API routes
//
// This module contains all HTTP route handlers for the public API.
// Each submodule handles a specific resource type; all share AppState.

pub mod agents;
pub mod common;
pub mod health;
pub mod runs;
pub mod schedules;
pub mod tools;
pub mod ws;

use axum::Router;

use crate::state::AppState;

// Re-export common types
pub use common::{ApiError, ErrorResponse, ListResponse};

/// Every API route, unlayered
pub fn routes(state: AppState) -> Router {
    Router::new()
        .merge(health::routes(state.clone()))
        .merge(agents::routes(state.clone()))
        .merge(runs::routes(state.clone()))
        .merge(schedules::routes(state.clone()))
        .merge(tools::routes(state.clone()))
        .merge(ws::routes(state))
}
