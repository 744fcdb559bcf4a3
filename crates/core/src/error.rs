// Error types for run orchestration
//
// Every failure that can end up on a Step or a Run carries a stable ErrorCode.
// The code is what gets persisted; the message is for humans.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Result type alias for run orchestration operations
pub type Result<T> = std::result::Result<T, RunError>;

/// Result type alias for persistence operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Error Codes
// ============================================================================

/// Stable, machine-readable error code recorded on failed steps and runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub enum ErrorCode {
    AgentNotFound,
    RunNotFound,
    ScheduleNotFound,
    UnknownTool,
    ContractViolation,
    ToolTimeout,
    ToolExecutionError,
    ProviderRejected,
    ProviderUnavailable,
    SlowConsumer,
    ScheduleConflict,
    InvalidSchedule,
    MaxIterationsReached,
    RunInterrupted,
    Cancelled,
    ShuttingDown,
    StoreError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AgentNotFound => "AgentNotFound",
            ErrorCode::RunNotFound => "RunNotFound",
            ErrorCode::ScheduleNotFound => "ScheduleNotFound",
            ErrorCode::UnknownTool => "UnknownTool",
            ErrorCode::ContractViolation => "ContractViolation",
            ErrorCode::ToolTimeout => "ToolTimeout",
            ErrorCode::ToolExecutionError => "ToolExecutionError",
            ErrorCode::ProviderRejected => "ProviderRejected",
            ErrorCode::ProviderUnavailable => "ProviderUnavailable",
            ErrorCode::SlowConsumer => "SlowConsumer",
            ErrorCode::ScheduleConflict => "ScheduleConflict",
            ErrorCode::InvalidSchedule => "InvalidSchedule",
            ErrorCode::MaxIterationsReached => "MaxIterationsReached",
            ErrorCode::RunInterrupted => "RunInterrupted",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::ShuttingDown => "ShuttingDown",
            ErrorCode::StoreError => "StoreError",
            ErrorCode::Internal => "Internal",
        }
    }

    /// Whether the failure fails the whole run rather than only the step
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorCode::ToolTimeout | ErrorCode::ToolExecutionError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// StepError - persisted error summary
// ============================================================================

/// Error summary attached to a failed step (and mirrored on the run)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct StepError {
    pub code: ErrorCode,
    pub message: String,
    /// Diagnostic detail: schema paths, payload summary, attempt counts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub details: Option<serde_json::Value>,
}

impl StepError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ============================================================================
// RunError
// ============================================================================

/// Errors surfaced by the run state machine, scheduler and stores
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Another tick already claimed this fire time
    #[error("Schedule {0} was claimed concurrently")]
    ScheduleConflict(Uuid),

    #[error("Max iterations ({0}) reached")]
    MaxIterationsReached(u32),

    /// The supervisor is draining and accepts no new runs
    #[error("Runtime is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RunError {
    pub fn invalid_schedule(msg: impl Into<String>) -> Self {
        RunError::InvalidSchedule(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RunError::AgentNotFound(_) => ErrorCode::AgentNotFound,
            RunError::RunNotFound(_) => ErrorCode::RunNotFound,
            RunError::ScheduleNotFound(_) => ErrorCode::ScheduleNotFound,
            RunError::InvalidSchedule(_) => ErrorCode::InvalidSchedule,
            RunError::ScheduleConflict(_) => ErrorCode::ScheduleConflict,
            RunError::MaxIterationsReached(_) => ErrorCode::MaxIterationsReached,
            RunError::ShuttingDown => ErrorCode::ShuttingDown,
            RunError::Store(_) => ErrorCode::StoreError,
            RunError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn to_step_error(&self) -> StepError {
        StepError::new(self.code(), self.to_string())
    }
}

// ============================================================================
// StoreError
// ============================================================================

/// Errors from a persistence backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// An append would leave a gap or overwrite an existing sequence number
    #[error("Sequence conflict for run {run_id}: expected {expected}, got {actual}")]
    SequenceConflict {
        run_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// The run is terminal and its record is read-only
    #[error("Run {0} is terminal")]
    RunTerminal(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn database(msg: impl Into<String>) -> Self {
        StoreError::Database(msg.into())
    }
}
