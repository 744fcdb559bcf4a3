// Run domain types
//
// A Run is one execution of an Agent. Its Steps are an append-only list;
// each Step is either a model turn or a tool invocation. A tool step that
// starts a turn also carries the model turn that requested it, so one
// advance iteration always appends exactly one Step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::agent::AgentConfig;
use crate::error::StepError;
use crate::llm_driver::{ChatMessage, TokenUsage, ToolCall};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

// ============================================================================
// Status and Trigger
// ============================================================================

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Where a run came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Scheduled,
}

/// The event that created a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Trigger {
    pub source: TriggerSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

impl Trigger {
    pub fn manual(input: Option<String>) -> Self {
        Self {
            source: TriggerSource::Manual,
            schedule_id: None,
            input,
        }
    }

    pub fn scheduled(schedule_id: Uuid, input: Option<String>) -> Self {
        Self {
            source: TriggerSource::Scheduled,
            schedule_id: Some(schedule_id),
            input,
        }
    }
}

// ============================================================================
// Cost and Usage
// ============================================================================

/// Computed cost of model usage
///
/// `Unknown` is recorded when the provider omitted usage or the model has no
/// configured price. It is sticky: adding anything to an unknown cost stays unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Cost {
    Known { usd: f64 },
    Unknown,
}

impl Cost {
    pub fn zero() -> Self {
        Cost::Known { usd: 0.0 }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Cost::Known { .. })
    }

    pub fn usd(&self) -> Option<f64> {
        match self {
            Cost::Known { usd } => Some(*usd),
            Cost::Unknown => None,
        }
    }

    pub fn add(self, other: Cost) -> Cost {
        match (self, other) {
            (Cost::Known { usd: a }, Cost::Known { usd: b }) => Cost::Known { usd: a + b },
            _ => Cost::Unknown,
        }
    }
}

impl Default for Cost {
    fn default() -> Self {
        Cost::zero()
    }
}

/// Cumulative token and cost usage of a run
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RunUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: Cost,
}

impl RunUsage {
    pub fn record(&mut self, usage: Option<&TokenUsage>, cost: Cost) {
        if let Some(usage) = usage {
            self.prompt_tokens += u64::from(usage.prompt_tokens);
            self.completion_tokens += u64::from(usage.completion_tokens);
        }
        self.cost = self.cost.add(cost);
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Append-only metrics record written for every successful model turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct UsageRecord {
    pub run_id: Uuid,
    pub step_sequence: u32,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub cost: Cost,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ModelTurn,
    ToolCall,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ModelTurn => "model_turn",
            StepKind::ToolCall => "tool_call",
        }
    }
}

/// Record of one successful provider call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ModelTurnRecord {
    pub model: String,
    /// Number of messages sent to the provider
    pub input_messages: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub cost: Cost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Record of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ToolCallRecord {
    pub call_id: String,
    pub name: String,
    /// Contract version validated for this call; None when the tool is unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub output: Option<serde_json::Value>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Ordered unit of work within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Step {
    /// Position within the run, starting at 0
    pub sequence: u32,
    /// Model turn this step belongs to, starting at 0
    pub turn: u32,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurnRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Step {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Content fed back to the model for a tool step
    pub fn tool_result_content(&self) -> Option<String> {
        let call = self.tool_call.as_ref()?;
        let payload = match (&call.output, &self.error) {
            (Some(output), _) => output.clone(),
            (None, Some(err)) => serde_json::json!({ "error": err.message }),
            (None, None) => serde_json::Value::Null,
        };
        Some(payload.to_string())
    }
}

// ============================================================================
// Run
// ============================================================================

/// One execution instance of an Agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Run {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub trigger: Trigger,
    pub status: RunStatus,
    /// Agent configuration captured when the run was created
    pub config: AgentConfig,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub usage: RunUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Mirrors the error of the final step (or the run-level reason)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Sequence number the next event for this run will carry
    pub next_sequence: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(agent_id: Uuid, config: AgentConfig, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            agent_id,
            trigger,
            status: RunStatus::Queued,
            config,
            steps: Vec::new(),
            usage: RunUsage::default(),
            output: None,
            error: None,
            next_sequence: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Number of model turns that produced a response
    pub fn turn_count(&self) -> u32 {
        self.steps.iter().filter(|s| s.model_turn.is_some()).count() as u32
    }

    /// Tool calls of the latest model turn that have no step yet
    pub fn pending_tool_calls(&self) -> Vec<ToolCall> {
        let Some(opening) = self.steps.iter().rev().find(|s| s.model_turn.is_some()) else {
            return Vec::new();
        };
        let Some(turn) = opening.model_turn.as_ref() else {
            return Vec::new();
        };
        if turn.tool_calls.is_empty() {
            return Vec::new();
        }
        let executed = self
            .steps
            .iter()
            .filter(|s| s.turn == opening.turn && s.kind == StepKind::ToolCall)
            .count();
        turn.tool_calls.iter().skip(executed).cloned().collect()
    }

    /// Turn index the next step belongs to
    pub fn current_turn(&self) -> u32 {
        if self.pending_tool_calls().is_empty() {
            self.turn_count()
        } else {
            self.turn_count().saturating_sub(1)
        }
    }

    /// Rebuild the provider conversation from the persisted steps
    pub fn conversation(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if !self.config.system_prompt.is_empty() {
            messages.push(ChatMessage::system(&self.config.system_prompt));
        }
        messages.push(ChatMessage::user(
            self.config.render_prompt(self.trigger.input.as_deref()),
        ));

        for step in &self.steps {
            if let Some(turn) = &step.model_turn {
                messages.push(ChatMessage::assistant(&turn.text, turn.tool_calls.clone()));
            }
            if let (Some(call), Some(content)) = (&step.tool_call, step.tool_result_content()) {
                messages.push(ChatMessage::tool_result(&call.call_id, content));
            }
        }
        messages
    }

    /// Milliseconds between start (or creation) and end of the run
    pub fn duration_ms(&self) -> u64 {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - start).num_milliseconds().max(0) as u64
    }
}

/// Optional filters for listing runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.agent_id.map_or(true, |id| run.agent_id == id)
            && self.status.map_or(true, |s| run.status == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_step(sequence: u32, turn: u32, call_id: &str, turn_record: Option<ModelTurnRecord>) -> Step {
        Step {
            sequence,
            turn,
            kind: StepKind::ToolCall,
            model_turn: turn_record,
            tool_call: Some(ToolCallRecord {
                call_id: call_id.to_string(),
                name: "search".to_string(),
                version: Some("1.0.0".to_string()),
                input: json!({"query": "x"}),
                output: Some(json!({"results": []})),
                attempts: 1,
                duration_ms: 3,
            }),
            error: None,
            started_at: Utc::now(),
            duration_ms: 3,
        }
    }

    fn turn_with_calls(ids: &[&str]) -> ModelTurnRecord {
        ModelTurnRecord {
            model: "gpt-4o-mini".to_string(),
            input_messages: 1,
            text: String::new(),
            tool_calls: ids
                .iter()
                .map(|id| ToolCall {
                    id: id.to_string(),
                    name: "search".to_string(),
                    arguments: json!({"query": "x"}),
                })
                .collect(),
            usage: None,
            cost: Cost::Unknown,
            finish_reason: Some("tool_calls".to_string()),
            attempts: 1,
            duration_ms: 10,
        }
    }

    #[test]
    fn test_cost_unknown_is_sticky() {
        let cost = Cost::zero().add(Cost::Known { usd: 0.5 });
        assert_eq!(cost.usd(), Some(0.5));
        assert_eq!(cost.add(Cost::Unknown), Cost::Unknown);
        assert_eq!(Cost::Unknown.add(Cost::Known { usd: 1.0 }), Cost::Unknown);
    }

    #[test]
    fn test_cost_serialization() {
        assert_eq!(
            serde_json::to_value(Cost::Known { usd: 0.25 }).unwrap(),
            json!({"status": "known", "usd": 0.25})
        );
        assert_eq!(
            serde_json::to_value(Cost::Unknown).unwrap(),
            json!({"status": "unknown"})
        );
    }

    #[test]
    fn test_usage_record_without_tokens_marks_unknown() {
        let mut usage = RunUsage::default();
        usage.record(
            Some(&TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
            Cost::Known { usd: 0.01 },
        );
        usage.record(None, Cost::Unknown);
        assert_eq!(usage.total_tokens(), 15);
        assert_eq!(usage.cost, Cost::Unknown);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert_eq!("cancelled".parse::<RunStatus>().unwrap(), RunStatus::Cancelled);
    }

    #[test]
    fn test_pending_tool_calls_tracks_executed_steps() {
        let mut run = Run::new(Uuid::now_v7(), AgentConfig::default(), Trigger::manual(None));
        assert!(run.pending_tool_calls().is_empty());
        assert_eq!(run.current_turn(), 0);

        run.steps
            .push(tool_step(0, 0, "call_a", Some(turn_with_calls(&["call_a", "call_b"]))));
        let pending = run.pending_tool_calls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "call_b");
        assert_eq!(run.current_turn(), 0);

        run.steps.push(tool_step(1, 0, "call_b", None));
        assert!(run.pending_tool_calls().is_empty());
        assert_eq!(run.turn_count(), 1);
        assert_eq!(run.current_turn(), 1);
    }

    #[test]
    fn test_conversation_rebuilds_from_steps() {
        let config = AgentConfig {
            system_prompt: "You are helpful".to_string(),
            prompt_template: "Find {{input}}".to_string(),
            ..Default::default()
        };
        let mut run = Run::new(
            Uuid::now_v7(),
            config,
            Trigger::manual(Some("x".to_string())),
        );
        run.steps
            .push(tool_step(0, 0, "call_a", Some(turn_with_calls(&["call_a"]))));

        let messages = run.conversation();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "Find x");
        assert_eq!(messages[2].tool_calls.len(), 1);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(messages[3].content, r#"{"results":[]}"#);
    }
}
