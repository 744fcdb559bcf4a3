// Integration tests for the HTTP API
//
// Drives the axum router with tower's oneshot against in-memory storage and
// the echo driver; no network or database needed.
//
// Run with: cargo test -p runloop-control-plane --test api_test

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use runloop_control_plane::dev_driver::EchoDriver;
use runloop_control_plane::{app, AppState};
use runloop_core::{PriceTable, ToolRegistry};
use runloop_storage::StorageBackend;
use runloop_worker::RuntimeConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

// ============================================================================
// Helpers
// ============================================================================

fn setup() -> (AppState, Router) {
    let state = AppState::build(
        &StorageBackend::in_memory(),
        Arc::new(EchoDriver),
        PriceTable::with_defaults(),
        ToolRegistry::with_defaults().unwrap(),
        &RuntimeConfig::default(),
    );
    let router = app(state.clone(), Vec::new());
    (state, router)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_agent(router: &Router) -> Uuid {
    let (status, agent) = send(
        router,
        Method::POST,
        "/v1/agents",
        Some(json!({
            "name": "researcher",
            "description": "Looks things up",
            "config": {
                "system_prompt": "You are a research assistant",
                "prompt_template": "Research: {{input}}",
                "allowed_tools": ["search"]
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    agent["id"].as_str().unwrap().parse().unwrap()
}

async fn wait_idle(state: &AppState) {
    for _ in 0..200 {
        if state.supervisor.active_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("runs still active");
}

// ============================================================================
// Health, tools, OpenAPI
// ============================================================================

#[tokio::test]
async fn test_health() {
    let (_state, router) = setup();
    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], "memory");
    assert_eq!(body["active_runs"], 0);
}

#[tokio::test]
async fn test_list_tools() {
    let (_state, router) = setup();
    let (status, body) = send(&router, Method::GET, "/v1/tools", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["add", "echo", "get_current_time", "search"]);
    assert_eq!(body["data"][3]["input_schema"]["required"], json!(["query"]));
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let (_state, router) = setup();
    let (status, body) = send(&router, Method::GET, "/api-doc/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "Runloop API");
}

// ============================================================================
// Agents
// ============================================================================

#[tokio::test]
async fn test_agent_crud() {
    let (_state, router) = setup();
    let agent_id = create_agent(&router).await;

    let (status, body) = send(&router, Method::GET, "/v1/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(&router, Method::GET, &format!("/v1/agents/{agent_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["config"]["allowed_tools"], json!(["search"]));

    let missing = Uuid::now_v7();
    let (status, body) = send(&router, Method::GET, &format!("/v1/agents/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], format!("Agent not found: {missing}"));
}

#[tokio::test]
async fn test_agent_validation() {
    let (_state, router) = setup();

    let (status, _) = send(&router, Method::POST, "/v1/agents", Some(json!({"name": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &router,
        Method::POST,
        "/v1/agents",
        Some(json!({"name": "bad", "config": {"allowed_tools": ["search", "rm_rf"]}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Unknown tools: rm_rf");
}

// ============================================================================
// Runs
// ============================================================================

#[tokio::test]
async fn test_run_lifecycle() {
    let (state, router) = setup();
    let agent_id = create_agent(&router).await;

    let (status, run) = send(
        &router,
        Method::POST,
        &format!("/v1/agents/{agent_id}/runs"),
        Some(json!({"input": "rust"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(run["status"], "queued");
    assert_eq!(run["trigger"]["source"], "manual");
    let run_id = run["id"].as_str().unwrap().to_string();

    wait_idle(&state).await;

    let (status, run) = send(&router, Method::GET, &format!("/v1/runs/{run_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "completed");
    assert_eq!(run["output"], "Echo: Research: rust");
    assert_eq!(run["steps"].as_array().unwrap().len(), 1);

    let (status, events) =
        send(&router, Method::GET, &format!("/v1/runs/{run_id}/events"), None).await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = events["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["run.created", "run.step", "run.completed"]);

    let (_, events) = send(
        &router,
        Method::GET,
        &format!("/v1/runs/{run_id}/events?since=0"),
        None,
    )
    .await;
    let sequences: Vec<u64> = events["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences, vec![1, 2]);

    let (status, usage) =
        send(&router, Method::GET, &format!("/v1/runs/{run_id}/usage"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["data"].as_array().unwrap().len(), 1);

    let (_, listed) = send(
        &router,
        Method::GET,
        &format!("/v1/runs?agent_id={agent_id}&status=completed"),
        None,
    )
    .await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);

    let (_, listed) = send(&router, Method::GET, "/v1/runs?status=failed", None).await;
    assert!(listed["data"].as_array().unwrap().is_empty());

    // Cancelling a terminal run is a no-op
    let (status, run) = send(
        &router,
        Method::POST,
        &format!("/v1/runs/{run_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "completed");
}

#[tokio::test]
async fn test_run_without_body_and_missing_resources() {
    let (state, router) = setup();
    let agent_id = create_agent(&router).await;

    let (status, run) = send(
        &router,
        Method::POST,
        &format!("/v1/agents/{agent_id}/runs"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(run.get("trigger").unwrap().get("input").is_none());
    wait_idle(&state).await;

    let missing = Uuid::now_v7();
    let (status, _) = send(
        &router,
        Method::POST,
        &format!("/v1/agents/{missing}/runs"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    for uri in [
        format!("/v1/runs/{missing}"),
        format!("/v1/runs/{missing}/events"),
        format!("/v1/runs/{missing}/usage"),
    ] {
        let (status, _) = send(&router, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }

    let (status, _) = send(
        &router,
        Method::POST,
        &format!("/v1/runs/{missing}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_runs_refused_while_draining() {
    let (state, router) = setup();
    let agent_id = create_agent(&router).await;

    state.supervisor.shutdown(Duration::from_secs(1)).await;

    let (status, body) = send(
        &router,
        Method::POST,
        &format!("/v1/agents/{agent_id}/runs"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Runtime is shutting down");

    let (_, health) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(health["status"], "draining");
}

// ============================================================================
// Schedules
// ============================================================================

#[tokio::test]
async fn test_schedule_crud() {
    let (_state, router) = setup();
    let agent_id = create_agent(&router).await;

    let (status, schedule) = send(
        &router,
        Method::POST,
        "/v1/schedules",
        Some(json!({"agent_id": agent_id, "cron": "0 9 * * *", "input": "daily digest"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(schedule["enabled"], true);
    assert!(schedule["next_fire_at"].is_string());
    let schedule_id = schedule["id"].as_str().unwrap().to_string();
    let uri = format!("/v1/schedules/{schedule_id}");

    let (status, updated) = send(
        &router,
        Method::PATCH,
        &uri,
        Some(json!({"enabled": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["enabled"], false);
    assert!(updated.get("next_fire_at").is_none());

    let (status, _) = send(
        &router,
        Method::PATCH,
        &uri,
        Some(json!({"cron": "not a cron"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, listed) = send(
        &router,
        Method::GET,
        &format!("/v1/schedules?agent_id={agent_id}"),
        None,
    )
    .await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);

    let (status, fetched) = send(&router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["cron"], "0 9 * * *");

    let (status, body) = send(&router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, _) = send(&router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, Method::PATCH, &uri, Some(json!({"enabled": true}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_schedule_validation() {
    let (_state, router) = setup();
    let agent_id = create_agent(&router).await;

    let (status, body) = send(
        &router,
        Method::POST,
        "/v1/schedules",
        Some(json!({"agent_id": agent_id, "cron": "every tuesday"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid schedule"));

    let (status, _) = send(
        &router,
        Method::POST,
        "/v1/schedules",
        Some(json!({"agent_id": Uuid::now_v7(), "cron": "*/5 * * * *"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
