// OpenAI LLM Driver
//
// Production implementation for OpenAI's chat completions API and compatible
// endpoints. Performs exactly one HTTP call per invocation and maps the
// outcome onto DriverError; retries and timeouts belong to the ModelAdapter.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use runloop_core::{ChatRequest, ChatResponse, DriverError, LlmDriver, TokenUsage};
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{OpenAiErrorBody, OpenAiRequest, OpenAiResponse};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI LLM Driver
///
/// # Example
///
/// ```ignore
/// use runloop_openai::OpenAiDriver;
///
/// let driver = OpenAiDriver::from_env()?;
/// // or with a custom endpoint
/// let driver = OpenAiDriver::with_base_url("your-api-key", "http://localhost:8080/v1/chat/completions");
/// ```
#[derive(Clone)]
pub struct OpenAiDriver {
    client: Client,
    api_key: String,
    api_url: String,
}

impl OpenAiDriver {
    /// Create a new driver with the given API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_API_URL)
    }

    /// Create a new driver with a custom API URL
    pub fn with_base_url(api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: api_url.into(),
        }
    }

    /// Create a driver from OPENAI_API_KEY (and optional OPENAI_BASE_URL)
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        let api_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_API_URL.into());
        Ok(Self::with_base_url(api_key, api_url))
    }

    /// Replace the HTTP client (proxies, custom TLS, connection limits)
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl LlmDriver for OpenAiDriver {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, DriverError> {
        let body = OpenAiRequest::from(request);
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.as_ref().map_or(0, Vec::len),
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            let message = error_message(&text);
            warn!(status = status.as_u16(), error = %message, "Chat completion request failed");
            return Err(classify_status(status, message, retry_after));
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::InvalidResponse("No choices in response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .iter()
            .map(|call| call.to_core())
            .collect();

        Ok(ChatResponse {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
            model: parsed.model,
            finish_reason: choice.finish_reason,
        })
    }
}

impl std::fmt::Debug for OpenAiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiDriver")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// Error classification
// ============================================================================

fn transport_error(err: reqwest::Error) -> DriverError {
    if err.is_timeout() {
        DriverError::Timeout
    } else {
        DriverError::Transport(err.to_string())
    }
}

fn classify_status(status: StatusCode, message: String, retry_after: Option<Duration>) -> DriverError {
    match DriverError::from_status(status.as_u16(), message) {
        DriverError::RateLimited { .. } => DriverError::RateLimited { retry_after },
        other => other,
    }
}

/// Retry-After in delta-seconds form; HTTP dates are ignored
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Prefer the provider's error message over the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<OpenAiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_debug_redacts_api_key() {
        let driver = OpenAiDriver::new("sk-secret");
        let rendered = format!("{driver:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("sk-secret"));
        assert_eq!(driver.api_url(), DEFAULT_API_URL);
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down".into(),
            retry_after(&headers),
        );
        assert_eq!(
            err,
            DriverError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[test]
    fn test_http_date_retry_after_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        assert_eq!(error_message(body), "Incorrect API key provided");
        assert_eq!(error_message("upstream exploded"), "upstream exploded");
    }
}
