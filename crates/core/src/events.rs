// Event Protocol
//
// Events are immutable facts about a Run. Every event carries the run id and a
// sequence number scoped to that run: 0 for run.created, then strictly
// increasing with no gaps. The same shape is persisted, returned by the REST
// API and pushed over the real-time connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StepError;
use crate::run::{Run, RunStatus, RunUsage, Step, Trigger};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

// ============================================================================
// Event Type Constants
// ============================================================================

pub const RUN_CREATED: &str = "run.created";
pub const RUN_STEP: &str = "run.step";
pub const RUN_COMPLETED: &str = "run.completed";
pub const RUN_FAILED: &str = "run.failed";
pub const RUN_CANCELLED: &str = "run.cancelled";

/// All event kinds, in lifecycle order
pub const EVENT_TYPES: [&str; 5] = [
    RUN_CREATED,
    RUN_STEP,
    RUN_COMPLETED,
    RUN_FAILED,
    RUN_CANCELLED,
];

// ============================================================================
// Event Data
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RunCreatedData {
    pub agent_id: Uuid,
    pub trigger: Trigger,
    pub status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RunStepData {
    pub step: Step,
    pub status: RunStatus,
    /// Cumulative usage of the run including this step
    pub usage: RunUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RunCompletedData {
    pub output: String,
    pub usage: RunUsage,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RunFailedData {
    pub error: StepError,
    pub usage: RunUsage,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RunCancelledData {
    pub usage: RunUsage,
    pub duration_ms: u64,
}

/// Kind-specific payload of an event
///
/// Untagged: the variants are told apart by their required fields, so
/// `Cancelled` (a subset of the others) must stay last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(untagged)]
pub enum EventData {
    Created(RunCreatedData),
    Step(Box<RunStepData>),
    Completed(RunCompletedData),
    Failed(RunFailedData),
    Cancelled(RunCancelledData),
}

impl EventData {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventData::Created(_) => RUN_CREATED,
            EventData::Step(_) => RUN_STEP,
            EventData::Completed(_) => RUN_COMPLETED,
            EventData::Failed(_) => RUN_FAILED,
            EventData::Cancelled(_) => RUN_CANCELLED,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventData::Completed(_) | EventData::Failed(_) | EventData::Cancelled(_)
        )
    }
}

// ============================================================================
// RunEvent
// ============================================================================

/// Immutable fact describing a Run or Step transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RunEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub run_id: Uuid,
    pub sequence: u64,
    pub ts: DateTime<Utc>,
    pub data: EventData,
}

impl RunEvent {
    pub fn new(run_id: Uuid, sequence: u64, data: EventData) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: data.event_type().to_string(),
            run_id,
            sequence,
            ts: Utc::now(),
            data,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.data.is_terminal()
    }

    /// Build the next event for `run`, consuming its sequence counter
    pub fn next_for(run: &mut Run, data: EventData) -> Self {
        let event = Self::new(run.id, run.next_sequence, data);
        run.next_sequence += 1;
        event
    }

    pub fn created(run: &mut Run) -> Self {
        let data = EventData::Created(RunCreatedData {
            agent_id: run.agent_id,
            trigger: run.trigger.clone(),
            status: run.status,
        });
        Self::next_for(run, data)
    }

    pub fn step(run: &mut Run, step: Step) -> Self {
        let data = EventData::Step(Box::new(RunStepData {
            step,
            status: run.status,
            usage: run.usage,
        }));
        Self::next_for(run, data)
    }

    pub fn completed(run: &mut Run) -> Self {
        let data = EventData::Completed(RunCompletedData {
            output: run.output.clone().unwrap_or_default(),
            usage: run.usage,
            duration_ms: run.duration_ms(),
        });
        Self::next_for(run, data)
    }

    pub fn failed(run: &mut Run, error: StepError) -> Self {
        let data = EventData::Failed(RunFailedData {
            error,
            usage: run.usage,
            duration_ms: run.duration_ms(),
        });
        Self::next_for(run, data)
    }

    pub fn cancelled(run: &mut Run) -> Self {
        let data = EventData::Cancelled(RunCancelledData {
            usage: run.usage,
            duration_ms: run.duration_ms(),
        });
        Self::next_for(run, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::error::ErrorCode;
    use crate::run::{Cost, StepKind};

    fn run() -> Run {
        Run::new(Uuid::now_v7(), AgentConfig::default(), Trigger::manual(None))
    }

    #[test]
    fn test_sequence_numbers_are_consecutive() {
        let mut run = run();
        let created = RunEvent::created(&mut run);
        run.status = RunStatus::Completed;
        run.output = Some("done".to_string());
        let completed = RunEvent::completed(&mut run);

        assert_eq!(created.sequence, 0);
        assert_eq!(completed.sequence, 1);
        assert_eq!(run.next_sequence, 2);
        assert_eq!(created.event_type, RUN_CREATED);
        assert!(completed.is_terminal());
    }

    #[test]
    fn test_wire_shape() {
        let mut run = run();
        let event = RunEvent::created(&mut run);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "run.created");
        assert_eq!(json["sequence"], 0);
        assert_eq!(json["run_id"], run.id.to_string());
        assert_eq!(json["data"]["status"], "queued");
        assert_eq!(json["data"]["trigger"]["source"], "manual");
    }

    #[test]
    fn test_untagged_data_deserializes_to_matching_variant() {
        let mut run = run();
        run.status = RunStatus::Running;
        let step = Step {
            sequence: 0,
            turn: 0,
            kind: StepKind::ModelTurn,
            model_turn: None,
            tool_call: None,
            error: None,
            started_at: Utc::now(),
            duration_ms: 1,
        };
        let events = vec![
            RunEvent::created(&mut run),
            RunEvent::step(&mut run, step),
            RunEvent::failed(&mut run, StepError::new(ErrorCode::Internal, "boom")),
            RunEvent::cancelled(&mut run),
        ];

        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let parsed: RunEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.data.event_type(), event.event_type);
        }
    }

    #[test]
    fn test_step_event_carries_cumulative_usage() {
        let mut run = run();
        run.usage.cost = Cost::Unknown;
        let step = Step {
            sequence: 0,
            turn: 0,
            kind: StepKind::ModelTurn,
            model_turn: None,
            tool_call: None,
            error: None,
            started_at: Utc::now(),
            duration_ms: 1,
        };
        let event = RunEvent::step(&mut run, step);
        match event.data {
            EventData::Step(data) => assert_eq!(data.usage.cost, Cost::Unknown),
            other => panic!("unexpected data: {other:?}"),
        }
    }
}
