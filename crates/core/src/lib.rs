// Run Orchestration Core
//
// This crate provides a DB-agnostic implementation of the agent-run
// orchestration engine (trigger → model turn → tool call → repeat → terminal).
//
// Key design decisions:
// - Uses traits (AgentStore, RunStore, ScheduleStore, LlmDriver, Tool) for pluggable backends
// - Every transition is persisted before its event is published to the EventBus
// - Tools are registered explicitly; unknown tools are a lookup miss
// - Tool contracts are versioned JSON Schema pairs checked on input and output
// - Provider failures are classified transient/non-transient and retried with backoff
// - Subscribers have bounded queues; slow ones are disconnected, publishers never block
// - Domain entity types (Agent, Run, Step, Schedule) are shared by API and worker

// Domain entity types
pub mod agent;
pub mod events;
pub mod run;
pub mod schedule;

pub mod bus;
pub mod builtin_tools;
pub mod contract;
pub mod error;
pub mod llm_driver;
pub mod machine;
pub mod pricing;
pub mod provider;
pub mod retry;
pub mod tools;
pub mod traits;

// In-memory implementations for development and testing
pub mod memory;

// Note: HTTP model drivers live in separate crates (runloop-openai) that
// depend on runloop-core and implement LlmDriver.

// Re-exports for convenience
pub use error::{ErrorCode, Result, RunError, StepError, StoreError, StoreResult};
pub use retry::RetryPolicy;

pub use agent::{Agent, AgentConfig, CreateAgentRequest, ModelParams};
pub use run::{
    Cost, ModelTurnRecord, Run, RunFilter, RunStatus, RunUsage, Step, StepKind, ToolCallRecord,
    Trigger, TriggerSource, UsageRecord,
};
pub use schedule::{CreateScheduleRequest, CronExpr, Schedule, UpdateScheduleRequest};

pub use events::{
    EventData, RunCancelledData, RunCompletedData, RunCreatedData, RunEvent, RunFailedData,
    RunStepData, EVENT_TYPES, RUN_CANCELLED, RUN_COMPLETED, RUN_CREATED, RUN_FAILED, RUN_STEP,
};

pub use bus::{BusConfig, EventBus, RecvError, Subscription};
pub use machine::{MachineConfig, RunMachine};
pub use traits::{AgentStore, RunStore, ScheduleStore, Transition};

// LLM driver and adapter re-exports
pub use llm_driver::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, DriverError, LlmDriver, TokenUsage,
    ToolCall, ToolDefinition,
};
pub use pricing::{ModelPrice, PriceTable, PriceTableError};
pub use provider::{ModelAdapter, ModelAdapterConfig, ModelTurn, ProviderError};

// Tool abstraction re-exports
pub use builtin_tools::{AddTool, EchoTool, GetCurrentTimeTool, SearchTool};
pub use contract::{
    CompiledContract, ContractError, ContractManifest, ContractMismatch, ContractPhase,
    ManifestError, SchemaViolation, ToolContract,
};
pub use tools::{
    Tool, ToolError, ToolExecutionResult, ToolInvocation, ToolRegistry, ToolRegistryBuilder,
};

pub use memory::{InMemoryStore, MockLlmDriver, MockLlmResponse};
