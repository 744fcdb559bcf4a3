// Core traits for pluggable backends
//
// The state machine, scheduler and API only talk to storage through these
// traits:
// - In-memory implementations for tests and local development
// - Postgres implementations for production (runloop-storage)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::Agent;
use crate::error::{StoreError, StoreResult};
use crate::events::RunEvent;
use crate::run::{Run, RunFilter, Step, UsageRecord};
use crate::schedule::Schedule;

// ============================================================================
// Transition - the unit of atomic persistence
// ============================================================================

/// One atomic state change of a run
///
/// `run` is the full record after the change. The new step, event and usage
/// record (if any) are appended in the same write; a store must persist all
/// of them or none.
#[derive(Debug, Clone)]
pub struct Transition {
    pub run: Run,
    pub step: Option<Step>,
    pub event: Option<RunEvent>,
    pub usage: Option<UsageRecord>,
}

impl Transition {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            step: None,
            event: None,
            usage: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_event(mut self, event: RunEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_usage(mut self, usage: Option<UsageRecord>) -> Self {
        self.usage = usage;
        self
    }

    /// Check the transition against the currently stored record
    ///
    /// Rejects writes to terminal runs and any append that would leave a gap
    /// or overwrite an existing step or event.
    pub fn check(&self, stored: Option<&Run>) -> StoreResult<()> {
        let run_id = self.run.id;
        let (next_event, next_step) = match stored {
            Some(stored) if stored.is_terminal() => return Err(StoreError::RunTerminal(run_id)),
            Some(stored) => (stored.next_sequence, stored.steps.len() as u64),
            None => (0, 0),
        };

        if let Some(event) = &self.event {
            if event.run_id != run_id || event.sequence != next_event {
                return Err(StoreError::SequenceConflict {
                    run_id,
                    expected: next_event,
                    actual: event.sequence,
                });
            }
        }

        if let Some(step) = &self.step {
            if u64::from(step.sequence) != next_step {
                return Err(StoreError::SequenceConflict {
                    run_id,
                    expected: next_step,
                    actual: u64::from(step.sequence),
                });
            }
        }

        let expected_next = next_event + u64::from(self.event.is_some());
        if self.run.next_sequence != expected_next {
            return Err(StoreError::SequenceConflict {
                run_id,
                expected: expected_next,
                actual: self.run.next_sequence,
            });
        }

        Ok(())
    }
}

// ============================================================================
// AgentStore
// ============================================================================

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn create_agent(&self, agent: Agent) -> StoreResult<Agent>;

    async fn get_agent(&self, agent_id: Uuid) -> StoreResult<Option<Agent>>;

    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;
}

// ============================================================================
// RunStore
// ============================================================================

/// Durable record of runs, their steps and their event log
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Atomically persist a transition (see [`Transition::check`])
    async fn persist_transition(&self, transition: &Transition) -> StoreResult<()>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>>;

    /// Runs matching `filter`, newest first
    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<Run>>;

    /// Events of a run in sequence order, optionally only those after `after`
    async fn list_events(&self, run_id: Uuid, after: Option<u64>) -> StoreResult<Vec<RunEvent>>;

    /// Runs left queued or running (startup recovery)
    async fn list_non_terminal_runs(&self) -> StoreResult<Vec<Run>>;

    async fn list_usage(&self, run_id: Uuid) -> StoreResult<Vec<UsageRecord>>;
}

// ============================================================================
// ScheduleStore
// ============================================================================

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule(&self, schedule: Schedule) -> StoreResult<Schedule>;

    async fn get_schedule(&self, schedule_id: Uuid) -> StoreResult<Option<Schedule>>;

    async fn list_schedules(&self, agent_id: Option<Uuid>) -> StoreResult<Vec<Schedule>>;

    /// Replace a schedule; `NotFound` if it does not exist
    async fn update_schedule(&self, schedule: Schedule) -> StoreResult<Schedule>;

    /// Returns whether a schedule was deleted
    async fn delete_schedule(&self, schedule_id: Uuid) -> StoreResult<bool>;

    /// Enabled schedules whose next fire time is at or before `now`
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>>;

    /// Compare-and-set the fire time
    ///
    /// Succeeds only if the schedule is still enabled and its `next_fire_at`
    /// equals `expected`; then records `fired_at` and moves it to `next`.
    /// `false` means another tick claimed this fire time.
    async fn claim_fire(
        &self,
        schedule_id: Uuid,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::run::{RunStatus, Trigger};

    fn created() -> (Run, Transition) {
        let mut run = Run::new(Uuid::now_v7(), AgentConfig::default(), Trigger::manual(None));
        let event = RunEvent::created(&mut run);
        let transition = Transition::new(run.clone()).with_event(event);
        (run, transition)
    }

    #[test]
    fn test_first_event_must_be_zero() {
        let (_, transition) = created();
        assert!(transition.check(None).is_ok());
    }

    #[test]
    fn test_replayed_event_is_a_conflict() {
        let (run, transition) = created();
        let err = transition.check(Some(&run)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceConflict {
                expected: 1,
                actual: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_terminal_runs_are_read_only() {
        let (mut run, _) = created();
        run.status = RunStatus::Completed;
        let transition = Transition::new(run.clone());
        assert!(matches!(
            transition.check(Some(&run)),
            Err(StoreError::RunTerminal(_))
        ));
    }

    #[test]
    fn test_status_only_transition_keeps_sequence() {
        let (stored, _) = created();
        let mut run = stored.clone();
        run.status = RunStatus::Running;
        assert!(Transition::new(run.clone()).check(Some(&stored)).is_ok());

        run.next_sequence += 1;
        assert!(Transition::new(run).check(Some(&stored)).is_err());
    }
}
