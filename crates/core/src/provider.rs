// Model Provider Adapter
//
// Wraps an LlmDriver with the bounded retry policy, a per-call timeout and
// cost accounting. One `converse` call is one model turn, however many
// attempts it took.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::AgentConfig;
use crate::error::{ErrorCode, StepError};
use crate::llm_driver::{
    ChatMessage, ChatRequest, DriverError, LlmDriver, TokenUsage, ToolCall, ToolDefinition,
};
use crate::pricing::PriceTable;
use crate::retry::RetryPolicy;
use crate::run::{Cost, ModelTurnRecord};

/// Result of one successful model turn
#[derive(Debug, Clone)]
pub struct ModelTurn {
    pub model: String,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    pub cost: Cost,
    pub finish_reason: Option<String>,
    pub input_messages: u32,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ModelTurn {
    pub fn requests_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn to_record(&self) -> ModelTurnRecord {
        ModelTurnRecord {
            model: self.model.clone(),
            input_messages: self.input_messages,
            text: self.text.clone(),
            tool_calls: self.tool_calls.clone(),
            usage: self.usage,
            cost: self.cost,
            finish_reason: self.finish_reason.clone(),
            attempts: self.attempts,
            duration_ms: self.duration_ms,
        }
    }
}

/// Failure of a model turn after the retry policy was applied
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Non-transient failure (auth, malformed request); never retried
    #[error("Provider rejected the request: {source}")]
    Rejected {
        source: DriverError,
        attempts: u32,
        duration_ms: u64,
    },

    /// Transient failures exhausted the retry budget
    #[error("Provider unavailable after {attempts} attempts: {source}")]
    Unavailable {
        source: DriverError,
        attempts: u32,
        duration_ms: u64,
    },
}

impl ProviderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProviderError::Rejected { .. } => ErrorCode::ProviderRejected,
            ProviderError::Unavailable { .. } => ErrorCode::ProviderUnavailable,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ProviderError::Rejected { attempts, .. } | ProviderError::Unavailable { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            ProviderError::Rejected { duration_ms, .. }
            | ProviderError::Unavailable { duration_ms, .. } => *duration_ms,
        }
    }

    pub fn to_step_error(&self) -> StepError {
        StepError::new(self.code(), self.to_string())
            .with_details(serde_json::json!({ "attempts": self.attempts() }))
    }
}

/// Adapter configuration
#[derive(Debug, Clone)]
pub struct ModelAdapterConfig {
    pub retry: RetryPolicy,
    /// Upper bound on a single provider call
    pub call_timeout: Duration,
}

impl Default for ModelAdapterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl ModelAdapterConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Retried, timed and priced access to a language model
pub struct ModelAdapter {
    driver: Arc<dyn LlmDriver>,
    prices: Arc<PriceTable>,
    config: ModelAdapterConfig,
}

impl ModelAdapter {
    pub fn new(driver: Arc<dyn LlmDriver>, prices: Arc<PriceTable>) -> Self {
        Self {
            driver,
            prices,
            config: ModelAdapterConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ModelAdapterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ModelAdapterConfig {
        &self.config
    }

    /// Run one model turn for `history`
    pub async fn converse(
        &self,
        agent: &AgentConfig,
        history: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ModelTurn, ProviderError> {
        let request = ChatRequest {
            model: agent.model.model.clone(),
            messages: history,
            tools,
            temperature: agent.model.temperature,
            max_tokens: agent.model.max_tokens,
        };
        self.call(&request).await
    }

    async fn call(&self, request: &ChatRequest) -> Result<ModelTurn, ProviderError> {
        let started = Instant::now();
        let retry = &self.config.retry;
        let mut attempt = 1;

        loop {
            debug!(
                driver = self.driver.name(),
                model = %request.model,
                attempt,
                "Calling model provider"
            );

            let result = match tokio::time::timeout(
                self.config.call_timeout,
                self.driver.chat_completion(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DriverError::Timeout),
            };

            match result {
                Ok(response) => {
                    let model = response.model.unwrap_or_else(|| request.model.clone());
                    let cost = self.prices.cost(&model, response.usage.as_ref());
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(
                        model = %model,
                        attempts = attempt,
                        duration_ms,
                        tool_calls = response.tool_calls.len(),
                        "Model turn completed"
                    );
                    return Ok(ModelTurn {
                        model,
                        text: response.text,
                        tool_calls: response.tool_calls,
                        usage: response.usage,
                        cost,
                        finish_reason: response.finish_reason,
                        input_messages: request.messages.len() as u32,
                        attempts: attempt,
                        duration_ms,
                    });
                }
                Err(err) if !err.is_transient() => {
                    warn!(model = %request.model, error = %err, "Model provider rejected request");
                    return Err(ProviderError::Rejected {
                        source: err,
                        attempts: attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(err) if !retry.has_attempts_remaining(attempt) => {
                    warn!(
                        model = %request.model,
                        attempts = attempt,
                        error = %err,
                        "Model provider retries exhausted"
                    );
                    return Err(ProviderError::Unavailable {
                        source: err,
                        attempts: attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(err) => {
                    let hint = match &err {
                        DriverError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    attempt += 1;
                    let delay = retry.delay_with_hint(attempt, hint);
                    warn!(
                        model = %request.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_driver::ChatResponse;
    use crate::memory::{MockLlmDriver, MockLlmResponse};
    use crate::pricing::ModelPrice;

    fn adapter(driver: Arc<MockLlmDriver>, max_attempts: u32) -> ModelAdapter {
        let prices = PriceTable::new().with_price("gpt-4o-mini", ModelPrice::new(1.0, 2.0));
        ModelAdapter::new(driver, Arc::new(prices)).with_config(
            ModelAdapterConfig::default()
                .with_retry(
                    RetryPolicy::exponential()
                        .with_max_attempts(max_attempts)
                        .with_initial_interval(Duration::from_millis(100))
                        .with_jitter(0.0),
                )
                .with_call_timeout(Duration::from_secs(5)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let driver = Arc::new(MockLlmDriver::new());
        driver.push_error(DriverError::Server {
            status: 503,
            message: "busy".into(),
        });
        driver.push_error(DriverError::RateLimited { retry_after: None });
        driver.push(MockLlmResponse::text("hello").with_usage(1000, 500));

        let turn = adapter(driver.clone(), 4)
            .converse(&AgentConfig::default(), vec![ChatMessage::user("hi")], vec![])
            .await
            .unwrap();

        assert_eq!(turn.text, "hello");
        assert_eq!(turn.attempts, 3);
        assert_eq!(turn.cost, Cost::Known { usd: 0.002 });
        assert_eq!(driver.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_unavailable() {
        let driver = Arc::new(MockLlmDriver::new());
        for _ in 0..3 {
            driver.push_error(DriverError::Timeout);
        }

        let err = adapter(driver.clone(), 3)
            .converse(&AgentConfig::default(), vec![ChatMessage::user("hi")], vec![])
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ProviderUnavailable);
        assert_eq!(err.attempts(), 3);
        assert_eq!(driver.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let driver = Arc::new(MockLlmDriver::new());
        driver.push_error(DriverError::Rejected {
            status: 401,
            message: "invalid api key".into(),
        });

        let err = adapter(driver.clone(), 4)
            .converse(&AgentConfig::default(), vec![ChatMessage::user("hi")], vec![])
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ProviderRejected);
        assert_eq!(err.attempts(), 1);
        assert_eq!(driver.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out_and_retries() {
        let driver = Arc::new(MockLlmDriver::new());
        driver.push(MockLlmResponse::text("late").with_delay(Duration::from_secs(30)));
        driver.push(MockLlmResponse::text("on time"));

        let turn = adapter(driver.clone(), 2)
            .converse(&AgentConfig::default(), vec![ChatMessage::user("hi")], vec![])
            .await
            .unwrap();

        assert_eq!(turn.text, "on time");
        assert_eq!(turn.attempts, 2);
    }

    #[tokio::test]
    async fn test_missing_usage_yields_unknown_cost() {
        let driver = Arc::new(MockLlmDriver::new());
        driver.push_response(ChatResponse {
            text: "no usage".into(),
            ..Default::default()
        });

        let turn = adapter(driver, 1)
            .converse(&AgentConfig::default(), vec![ChatMessage::user("hi")], vec![])
            .await
            .unwrap();

        assert!(turn.usage.is_none());
        assert_eq!(turn.cost, Cost::Unknown);
    }
}
