// Runtime configuration
//
// Limits and intervals shared by the run machine, model adapter, event bus,
// supervisor and scheduler. Loaded from environment variables with defaults.

use runloop_core::{BusConfig, MachineConfig, ModelAdapterConfig, RetryPolicy};
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the in-process run runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Retry policy for model provider calls
    pub llm_retry: RetryPolicy,
    /// Upper bound on a single provider call
    pub llm_call_timeout: Duration,
    /// Timeout handed to every tool invocation
    pub tool_timeout: Duration,
    /// Model turns allowed when the agent does not set its own limit
    pub max_iterations: u32,
    /// Interval between scheduler ticks
    pub scheduler_tick: Duration,
    /// Events buffered per subscriber before it is evicted
    pub subscriber_queue_capacity: usize,
    /// Deadline for writing one message to a subscriber's connection
    pub subscriber_write_timeout: Duration,
    /// How long shutdown waits for in-flight runs before cancelling them
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            llm_retry: RetryPolicy::exponential()
                .with_max_attempts(4)
                .with_initial_interval(Duration::from_millis(500))
                .with_max_interval(Duration::from_millis(8000)),
            llm_call_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            max_iterations: 10,
            scheduler_tick: Duration::from_millis(1000),
            subscriber_queue_capacity: 256,
            subscriber_write_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl RuntimeConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut llm_retry = defaults.llm_retry.clone();
        if let Some(attempts) = env_parse::<u32>("LLM_MAX_ATTEMPTS") {
            llm_retry = llm_retry.with_max_attempts(attempts.max(1));
        }
        if let Some(ms) = env_parse::<u64>("LLM_INITIAL_BACKOFF_MS") {
            llm_retry = llm_retry.with_initial_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("LLM_MAX_BACKOFF_MS") {
            llm_retry = llm_retry.with_max_interval(Duration::from_millis(ms));
        }

        Self {
            llm_retry,
            llm_call_timeout: env_parse("LLM_CALL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.llm_call_timeout),
            tool_timeout: env_parse("TOOL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_timeout),
            max_iterations: env_parse("RUN_MAX_ITERATIONS").unwrap_or(defaults.max_iterations),
            scheduler_tick: env_parse("SCHEDULER_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.scheduler_tick),
            subscriber_queue_capacity: env_parse("SUBSCRIBER_QUEUE_CAPACITY")
                .unwrap_or(defaults.subscriber_queue_capacity),
            subscriber_write_timeout: env_parse("SUBSCRIBER_WRITE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.subscriber_write_timeout),
            shutdown_timeout: env_parse("SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        }
    }

    pub fn with_llm_retry(mut self, retry: RetryPolicy) -> Self {
        self.llm_retry = retry;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    pub fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity;
        self
    }

    pub fn with_subscriber_write_timeout(mut self, timeout: Duration) -> Self {
        self.subscriber_write_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig::default()
            .with_tool_timeout(self.tool_timeout)
            .with_default_max_iterations(self.max_iterations)
    }

    pub fn adapter_config(&self) -> ModelAdapterConfig {
        ModelAdapterConfig::default()
            .with_retry(self.llm_retry.clone())
            .with_call_timeout(self.llm_call_timeout)
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig::default().with_queue_capacity(self.subscriber_queue_capacity)
    }
}
