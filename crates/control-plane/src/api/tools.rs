// Tool catalog HTTP routes

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use super::common::ListResponse;
use crate::state::AppState;

/// A registered tool and its contract
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ToolInfo {
    #[schema(example = "search")]
    pub name: String,
    /// Semantic version of the contract
    #[schema(example = "1.0.0")]
    pub version: String,
    pub description: String,
    #[schema(value_type = Object)]
    pub input_schema: Value,
    #[schema(value_type = Object)]
    pub output_schema: Value,
}

/// Create tool routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/tools", get(list_tools))
        .with_state(state)
}

/// GET /v1/tools - List registered tools with their contracts
#[utoipa::path(
    get,
    path = "/v1/tools",
    responses(
        (status = 200, description = "Registered tools", body = ListResponse<ToolInfo>)
    ),
    tag = "tools"
)]
pub async fn list_tools(State(state): State<AppState>) -> Json<ListResponse<ToolInfo>> {
    let registry = state.machine().tools();
    let tools = registry
        .contracts()
        .into_iter()
        .map(|contract| {
            let description = registry
                .resolve_version(&contract.name, &contract.version)
                .map(|registered| registered.tool().description().to_string())
                .unwrap_or_default();
            ToolInfo {
                name: contract.name,
                version: contract.version.to_string(),
                description,
                input_schema: contract.input_schema,
                output_schema: contract.output_schema,
            }
        })
        .collect();
    Json(ListResponse::new(tools))
}
