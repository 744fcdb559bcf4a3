// OpenAPI specification
//
// Served by the API server at /api-doc/openapi.json.

use crate::api;
use crate::api::{ErrorResponse, ListResponse};
use runloop_core::{
    events::{RunCancelledData, RunCompletedData, RunCreatedData, RunFailedData, RunStepData},
    Agent, AgentConfig, Cost, CreateAgentRequest, CreateScheduleRequest, ErrorCode, EventData,
    ModelParams, ModelTurnRecord, Run, RunEvent, RunStatus, RunUsage, Schedule, Step, StepError,
    StepKind, TokenUsage, ToolCall, ToolCallRecord, Trigger, TriggerSource, UpdateScheduleRequest,
    UsageRecord,
};
use utoipa::OpenApi;

/// OpenAPI documentation for the Runloop API
#[derive(OpenApi)]
#[openapi(
    paths(
        api::health::health,
        api::agents::create_agent,
        api::agents::list_agents,
        api::agents::get_agent,
        api::runs::create_run,
        api::runs::list_runs,
        api::runs::get_run,
        api::runs::list_events,
        api::runs::list_usage,
        api::runs::cancel_run,
        api::schedules::create_schedule,
        api::schedules::list_schedules,
        api::schedules::get_schedule,
        api::schedules::update_schedule,
        api::schedules::delete_schedule,
        api::tools::list_tools,
    ),
    components(
        schemas(
            ErrorResponse,
            api::health::HealthResponse,
            // Agents
            Agent, AgentConfig, ModelParams, CreateAgentRequest,
            ListResponse<Agent>,
            // Runs
            Run, RunStatus, Trigger, TriggerSource, RunUsage, Cost, TokenUsage,
            Step, StepKind, StepError, ErrorCode, ModelTurnRecord, ToolCallRecord, ToolCall,
            UsageRecord,
            api::runs::CreateRunRequest,
            ListResponse<Run>,
            ListResponse<UsageRecord>,
            // Events
            RunEvent, EventData, RunCreatedData, RunStepData, RunCompletedData,
            RunFailedData, RunCancelledData,
            ListResponse<RunEvent>,
            // Schedules
            Schedule, CreateScheduleRequest, UpdateScheduleRequest,
            ListResponse<Schedule>,
            // Tools
            api::tools::ToolInfo,
            ListResponse<api::tools::ToolInfo>,
        )
    ),
    tags(
        (name = "health", description = "Liveness"),
        (name = "agents", description = "Agent management endpoints"),
        (name = "runs", description = "Run triggering, inspection and cancellation"),
        (name = "schedules", description = "Cron schedule management endpoints"),
        (name = "tools", description = "Registered tool contracts")
    ),
    info(
        title = "Runloop API",
        version = "0.1.0",
        description = "API for triggering agent runs, scheduling them, and inspecting their steps and events",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI spec as a pretty-printed JSON string
    pub fn to_json() -> Result<String, serde_json::Error> {
        Self::openapi().to_pretty_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_lists_run_routes() {
        let spec: serde_json::Value = serde_json::from_str(&ApiDoc::to_json().unwrap()).unwrap();
        let paths = spec["paths"].as_object().unwrap();
        assert!(paths.contains_key("/v1/agents/{agent_id}/runs"));
        assert!(paths.contains_key("/v1/runs/{run_id}/events"));
        assert!(paths.contains_key("/v1/schedules/{schedule_id}"));
        assert!(spec["components"]["schemas"]["RunEvent"].is_object());
    }
}
