// Integration tests for OpenAiDriver against a mock HTTP server
//
// Run with: cargo test -p runloop-openai --test openai_driver_test

use runloop_core::{
    AgentConfig, ChatMessage, ChatRequest, DriverError, ErrorCode, LlmDriver, ModelAdapter,
    ModelAdapterConfig, PriceTable, RetryPolicy,
};
use runloop_openai::OpenAiDriver;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COMPLETIONS_PATH: &str = "/v1/chat/completions";

fn driver_for(server: &MockServer) -> OpenAiDriver {
    OpenAiDriver::with_base_url("test-key", format!("{}{}", server.uri(), COMPLETIONS_PATH))
}

fn request() -> ChatRequest {
    ChatRequest {
        model: "gpt-4o-mini".to_string(),
        messages: vec![ChatMessage::user("What is Rust?")],
        tools: vec![],
        temperature: None,
        max_tokens: None,
    }
}

fn completion(content: serde_json::Value, usage: Option<serde_json::Value>) -> serde_json::Value {
    let mut body = json!({
        "id": "chatcmpl-1",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    });
    if let Some(usage) = usage {
        body["usage"] = usage;
    }
    body
}

#[tokio::test]
async fn test_text_completion_with_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "gpt-4o-mini", "stream": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            json!("A systems language"),
            Some(json!({ "prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16 })),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let response = driver_for(&server).chat_completion(&request()).await.unwrap();

    assert_eq!(response.text, "A systems language");
    assert!(response.tool_calls.is_empty());
    let usage = response.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 12);
    assert_eq!(usage.completion_tokens, 4);
    assert_eq!(response.model.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(response.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_tool_call_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": { "name": "search", "arguments": "{\"query\":\"rust\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let response = driver_for(&server).chat_completion(&request()).await.unwrap();

    assert_eq!(response.text, "");
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].id, "call_abc");
    assert_eq!(response.tool_calls[0].arguments, json!({ "query": "rust" }));
    assert!(response.usage.is_none());
}

#[tokio::test]
async fn test_status_classification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided", "type": "invalid_request_error" }
        })))
        .mount(&server)
        .await;

    let err = driver_for(&server)
        .chat_completion(&request())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DriverError::Rejected {
            status: 401,
            message: "Incorrect API key provided".to_string()
        }
    );
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_rate_limit_reads_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
        .mount(&server)
        .await;

    let err = driver_for(&server)
        .chat_completion(&request())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DriverError::RateLimited {
            retry_after: Some(Duration::from_secs(3))
        }
    );
}

#[tokio::test]
async fn test_empty_choices_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = driver_for(&server)
        .chat_completion(&request())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_error() {
    let driver = OpenAiDriver::with_base_url("test-key", "http://127.0.0.1:9/v1/chat/completions");
    let err = driver.chat_completion(&request()).await.unwrap_err();
    assert!(matches!(err, DriverError::Transport(_)));
    assert!(err.is_transient());
}

// ============================================================================
// Through the ModelAdapter
// ============================================================================

fn adapter_for(server: &MockServer, max_attempts: u32) -> ModelAdapter {
    ModelAdapter::new(
        Arc::new(driver_for(server)),
        Arc::new(PriceTable::with_defaults()),
    )
    .with_config(
        ModelAdapterConfig::default().with_retry(
            RetryPolicy::exponential()
                .with_max_attempts(max_attempts)
                .with_initial_interval(Duration::from_millis(10))
                .with_max_interval(Duration::from_millis(50))
                .with_jitter(0.0),
        ),
    )
}

#[tokio::test]
async fn test_adapter_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            json!("recovered"),
            Some(json!({ "prompt_tokens": 1000, "completion_tokens": 1000 })),
        )))
        .mount(&server)
        .await;

    let turn = adapter_for(&server, 3)
        .converse(
            &AgentConfig::default(),
            vec![ChatMessage::user("hi")],
            vec![],
        )
        .await
        .unwrap();

    assert_eq!(turn.text, "recovered");
    assert_eq!(turn.attempts, 2);
    assert!(turn.cost.is_known());
}

#[tokio::test]
async fn test_adapter_gives_up_on_persistent_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .expect(2)
        .mount(&server)
        .await;

    let err = adapter_for(&server, 2)
        .converse(
            &AgentConfig::default(),
            vec![ChatMessage::user("hi")],
            vec![],
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ProviderUnavailable);
    assert_eq!(err.attempts(), 2);
}

#[tokio::test]
async fn test_adapter_does_not_retry_rejections() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown model"))
        .expect(1)
        .mount(&server)
        .await;

    let err = adapter_for(&server, 3)
        .converse(
            &AgentConfig::default(),
            vec![ChatMessage::user("hi")],
            vec![],
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ProviderRejected);
    assert_eq!(err.attempts(), 1);
}
