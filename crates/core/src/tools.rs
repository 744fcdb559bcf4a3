// Tool Registry & Contract Validator
//
// Tools are registered explicitly at startup into an immutable ToolRegistry.
// Every invocation goes through `validate_and_invoke`, which checks the input
// against the tool's contract, runs the tool under a timeout, and checks the
// output before anything is returned to the caller.
//
// Design decisions:
// - Lookup by name resolves to the highest registered version
// - Unknown tools are a lookup miss, never a runtime introspection failure
// - Tool-level errors are returned as values (ToolError), not panics
// - Internal errors are logged but replaced with a generic message

use async_trait::async_trait;
use semver::Version;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::contract::{
    summarize_payload, CompiledContract, ContractError, ContractPhase, SchemaViolation,
    ToolContract,
};
use crate::error::{ErrorCode, StepError};
use crate::llm_driver::ToolDefinition;
use crate::retry::RetryPolicy;

/// Message returned in place of internal error details
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred while executing the tool";

// ============================================================================
// Tool Execution Result
// ============================================================================

/// Raw outcome of a tool's own logic
///
/// - `Success`: result to be validated against the output schema
/// - `ToolError`: expected failure that is safe to show to the model
///   (e.g., "City not found")
/// - `InternalError`: system failure; retried per the tool's policy, then
///   reported with a generic message
#[derive(Debug, Clone, PartialEq)]
pub enum ToolExecutionResult {
    Success(Value),
    ToolError(String),
    InternalError(String),
}

impl ToolExecutionResult {
    pub fn success(value: impl Into<Value>) -> Self {
        ToolExecutionResult::Success(value.into())
    }

    pub fn tool_error(message: impl Into<String>) -> Self {
        ToolExecutionResult::ToolError(message.into())
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        ToolExecutionResult::InternalError(message.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolExecutionResult::Success(_))
    }
}

// ============================================================================
// Tool Trait
// ============================================================================

/// Capability object behind one tool contract
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Tool for Echo {
///     fn name(&self) -> &str { "echo" }
///     fn description(&self) -> &str { "Echo the message" }
///     fn input_schema(&self) -> Value { json!({"type": "object"}) }
///     fn output_schema(&self) -> Value { json!({"type": "object"}) }
///     async fn invoke(&self, input: Value) -> ToolExecutionResult {
///         ToolExecutionResult::success(input)
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> Version {
        Version::new(1, 0, 0)
    }

    fn description(&self) -> &str;

    /// JSON Schema of the accepted payload
    fn input_schema(&self) -> Value;

    /// JSON Schema every successful result must satisfy
    fn output_schema(&self) -> Value;

    /// Policy for timeouts and internal errors; tools are not retried by default
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::no_retry()
    }

    async fn invoke(&self, input: Value) -> ToolExecutionResult;

    fn contract(&self) -> ToolContract {
        ToolContract {
            name: self.name().to_string(),
            version: self.version(),
            input_schema: self.input_schema(),
            output_schema: self.output_schema(),
        }
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.input_schema(),
        }
    }
}

// ============================================================================
// ToolError
// ============================================================================

/// Structured failure of `validate_and_invoke`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Contract violation ({phase}) for {tool}@{version}: {}", join_violations(.violations))]
    ContractViolation {
        tool: String,
        version: Version,
        phase: ContractPhase,
        violations: Vec<SchemaViolation>,
        payload_summary: String,
    },

    #[error("Tool {tool} timed out after {timeout_ms}ms ({attempts} attempts)")]
    Timeout {
        tool: String,
        version: Version,
        timeout_ms: u64,
        attempts: u32,
    },

    #[error("Tool {tool} failed: {message}")]
    Execution {
        tool: String,
        version: Version,
        message: String,
        attempts: u32,
    },
}

fn join_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ToolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ToolError::UnknownTool { .. } => ErrorCode::UnknownTool,
            ToolError::ContractViolation { .. } => ErrorCode::ContractViolation,
            ToolError::Timeout { .. } => ErrorCode::ToolTimeout,
            ToolError::Execution { .. } => ErrorCode::ToolExecutionError,
        }
    }

    /// Contract version that was resolved, if any
    pub fn version(&self) -> Option<&Version> {
        match self {
            ToolError::UnknownTool { .. } => None,
            ToolError::ContractViolation { version, .. }
            | ToolError::Timeout { version, .. }
            | ToolError::Execution { version, .. } => Some(version),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ToolError::UnknownTool { .. } | ToolError::ContractViolation { .. } => 0,
            ToolError::Timeout { attempts, .. } | ToolError::Execution { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Message fed back to the model for recoverable failures
    pub fn model_message(&self) -> String {
        match self {
            ToolError::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_step_error(&self) -> StepError {
        let error = StepError::new(self.code(), self.model_message());
        match self {
            ToolError::UnknownTool { name } => {
                error.with_details(serde_json::json!({ "tool": name }))
            }
            ToolError::ContractViolation {
                tool,
                version,
                phase,
                violations,
                payload_summary,
            } => error.with_details(serde_json::json!({
                "tool": tool,
                "version": version.to_string(),
                "phase": phase,
                "violations": violations,
                "payload_summary": payload_summary,
            })),
            ToolError::Timeout {
                timeout_ms,
                attempts,
                ..
            } => error.with_details(serde_json::json!({
                "timeout_ms": timeout_ms,
                "attempts": attempts,
            })),
            ToolError::Execution { attempts, .. } => {
                error.with_details(serde_json::json!({ "attempts": attempts }))
            }
        }
    }
}

/// Successful, contract-checked tool result
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub output: Value,
    pub version: Version,
    pub attempts: u32,
    pub duration_ms: u64,
}

// ============================================================================
// ToolRegistry
// ============================================================================

/// A registered tool with its compiled contract
#[derive(Clone)]
pub struct RegisteredTool {
    tool: Arc<dyn Tool>,
    contract: Arc<CompiledContract>,
}

impl RegisteredTool {
    pub fn tool(&self) -> &Arc<dyn Tool> {
        &self.tool
    }

    pub fn contract(&self) -> &CompiledContract {
        &self.contract
    }

    pub fn version(&self) -> &Version {
        self.contract.version()
    }
}

/// Immutable mapping from tool name and version to a capability object
///
/// Built once via [`ToolRegistryBuilder`]; safe for concurrent reads.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, BTreeMap<Version, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    /// Registry with the built-in tools (search, echo, get_current_time, add)
    pub fn with_defaults() -> Result<Self, ContractError> {
        use crate::builtin_tools::{AddTool, EchoTool, GetCurrentTimeTool, SearchTool};

        ToolRegistry::builder()
            .tool(SearchTool::new())
            .tool(EchoTool)
            .tool(GetCurrentTimeTool)
            .tool(AddTool)
            .build()
    }

    /// Highest registered version of `name`
    pub fn resolve(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools
            .get(name)
            .and_then(|versions| versions.values().next_back())
    }

    pub fn resolve_version(&self, name: &str, version: &Version) -> Option<&RegisteredTool> {
        self.tools.get(name).and_then(|versions| versions.get(version))
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Every registered contract, sorted by name then version
    pub fn contracts(&self) -> Vec<ToolContract> {
        let mut contracts: Vec<ToolContract> = self
            .tools
            .values()
            .flat_map(|versions| versions.values())
            .map(|registered| registered.contract.contract().clone())
            .collect();
        contracts.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        contracts
    }

    /// Definitions advertised to the model for the given allow-list
    pub fn definitions_for(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        allowed
            .iter()
            .filter_map(|name| self.resolve(name))
            .map(|registered| registered.tool.to_definition())
            .collect()
    }

    /// Validate `payload`, invoke the tool under `timeout`, validate the result
    pub async fn validate_and_invoke(
        &self,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<ToolInvocation, ToolError> {
        let registered = self.resolve(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
        })?;
        let contract = registered.contract();
        let version = contract.version().clone();

        contract
            .validate_input(&payload)
            .map_err(|violations| ToolError::ContractViolation {
                tool: name.to_string(),
                version: version.clone(),
                phase: ContractPhase::Input,
                violations,
                payload_summary: summarize_payload(&payload),
            })?;

        let policy = registered.tool.retry_policy();
        let started = Instant::now();
        let mut attempt = 1;

        let output = loop {
            debug!(tool = %name, version = %version, attempt, "Invoking tool");
            let outcome = tokio::time::timeout(timeout, registered.tool.invoke(payload.clone())).await;

            match outcome {
                Ok(ToolExecutionResult::Success(value)) => break value,
                Ok(ToolExecutionResult::ToolError(message)) => {
                    return Err(ToolError::Execution {
                        tool: name.to_string(),
                        version,
                        message,
                        attempts: attempt,
                    });
                }
                Ok(ToolExecutionResult::InternalError(message)) => {
                    error!(
                        tool = %name,
                        attempt,
                        error = %message,
                        "Tool internal error (details hidden from model)"
                    );
                    if !policy.has_attempts_remaining(attempt) {
                        return Err(ToolError::Execution {
                            tool: name.to_string(),
                            version,
                            message: INTERNAL_ERROR_MESSAGE.to_string(),
                            attempts: attempt,
                        });
                    }
                }
                Err(_) => {
                    warn!(tool = %name, attempt, timeout_ms = timeout.as_millis() as u64, "Tool timed out");
                    if !policy.has_attempts_remaining(attempt) {
                        return Err(ToolError::Timeout {
                            tool: name.to_string(),
                            version,
                            timeout_ms: timeout.as_millis() as u64,
                            attempts: attempt,
                        });
                    }
                }
            }

            attempt += 1;
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
        };

        contract
            .validate_output(&output)
            .map_err(|violations| ToolError::ContractViolation {
                tool: name.to_string(),
                version: version.clone(),
                phase: ContractPhase::Output,
                violations,
                payload_summary: summarize_payload(&output),
            })?;

        Ok(ToolInvocation {
            output,
            version,
            attempts: attempt,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

// ============================================================================
// ToolRegistryBuilder
// ============================================================================

/// Fluent builder; contracts are compiled in `build`
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn build(self) -> Result<ToolRegistry, ContractError> {
        let mut registry = ToolRegistry::default();
        for tool in self.tools {
            let compiled = CompiledContract::compile(tool.contract())?;
            let versions = registry.tools.entry(tool.name().to_string()).or_default();
            if versions.contains_key(compiled.version()) {
                return Err(ContractError::Duplicate(compiled.contract().id()));
            }
            versions.insert(
                compiled.version().clone(),
                RegisteredTool {
                    tool,
                    contract: Arc::new(compiled),
                },
            );
        }
        Ok(registry)
    }
}
