// In-memory implementations for tests and local development
//
// InMemoryStore implements every store trait behind one lock, so a
// Transition is applied atomically exactly like the Postgres backend does
// inside a database transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::agent::Agent;
use crate::error::{StoreError, StoreResult};
use crate::events::RunEvent;
use crate::llm_driver::{
    ChatRequest, ChatResponse, DriverError, LlmDriver, TokenUsage, ToolCall,
};
use crate::run::{Run, RunFilter, UsageRecord};
use crate::schedule::Schedule;
use crate::traits::{AgentStore, RunStore, ScheduleStore, Transition};

// ============================================================================
// InMemoryStore
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    agents: HashMap<Uuid, Agent>,
    runs: HashMap<Uuid, Run>,
    events: HashMap<Uuid, Vec<RunEvent>>,
    usage: HashMap<Uuid, Vec<UsageRecord>>,
    schedules: HashMap<Uuid, Schedule>,
}

/// In-memory implementation of AgentStore, RunStore and ScheduleStore
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    failing_writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `count` run transitions fail with a database error
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn event_count(&self, run_id: Uuid) -> usize {
        self.tables
            .read()
            .events
            .get(&run_id)
            .map_or(0, Vec::len)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AgentStore for InMemoryStore {
    async fn create_agent(&self, agent: Agent) -> StoreResult<Agent> {
        let mut tables = self.tables.write();
        if tables.agents.contains_key(&agent.id) {
            return Err(StoreError::Conflict(format!("agent {} exists", agent.id)));
        }
        tables.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, agent_id: Uuid) -> StoreResult<Option<Agent>> {
        Ok(self.tables.read().agents.get(&agent_id).cloned())
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.tables.read().agents.values().cloned().collect();
        agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(agents)
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn persist_transition(&self, transition: &Transition) -> StoreResult<()> {
        if self.take_injected_failure() {
            return Err(StoreError::database("injected write failure"));
        }

        let mut tables = self.tables.write();
        let run_id = transition.run.id;
        transition.check(tables.runs.get(&run_id))?;

        if let Some(event) = &transition.event {
            tables.events.entry(run_id).or_default().push(event.clone());
        }
        if let Some(usage) = &transition.usage {
            tables.usage.entry(run_id).or_default().push(usage.clone());
        }
        tables.runs.insert(run_id, transition.run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        Ok(self.tables.read().runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<Run>> {
        let tables = self.tables.read();
        let mut runs: Vec<Run> = tables
            .runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn list_events(&self, run_id: Uuid, after: Option<u64>) -> StoreResult<Vec<RunEvent>> {
        let tables = self.tables.read();
        Ok(tables
            .events
            .get(&run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| after.map_or(true, |after| e.sequence > after))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_non_terminal_runs(&self) -> StoreResult<Vec<Run>> {
        let tables = self.tables.read();
        let mut runs: Vec<Run> = tables
            .runs
            .values()
            .filter(|run| !run.is_terminal())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn list_usage(&self, run_id: Uuid) -> StoreResult<Vec<UsageRecord>> {
        Ok(self
            .tables
            .read()
            .usage
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn create_schedule(&self, schedule: Schedule) -> StoreResult<Schedule> {
        let mut tables = self.tables.write();
        tables.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, schedule_id: Uuid) -> StoreResult<Option<Schedule>> {
        Ok(self.tables.read().schedules.get(&schedule_id).cloned())
    }

    async fn list_schedules(&self, agent_id: Option<Uuid>) -> StoreResult<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self
            .tables
            .read()
            .schedules
            .values()
            .filter(|s| agent_id.map_or(true, |id| s.agent_id == id))
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(schedules)
    }

    async fn update_schedule(&self, schedule: Schedule) -> StoreResult<Schedule> {
        let mut tables = self.tables.write();
        match tables.schedules.get_mut(&schedule.id) {
            Some(existing) => {
                *existing = schedule.clone();
                Ok(schedule)
            }
            None => Err(StoreError::NotFound(format!("schedule {}", schedule.id))),
        }
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> StoreResult<bool> {
        Ok(self.tables.write().schedules.remove(&schedule_id).is_some())
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        let mut due: Vec<Schedule> = self
            .tables
            .read()
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_fire_at.cmp(&b.next_fire_at));
        Ok(due)
    }

    async fn claim_fire(
        &self,
        schedule_id: Uuid,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let Some(schedule) = tables.schedules.get_mut(&schedule_id) else {
            return Ok(false);
        };
        if !schedule.enabled || schedule.next_fire_at != Some(expected) {
            return Ok(false);
        }
        schedule.next_fire_at = next;
        schedule.last_fired_at = Some(fired_at);
        schedule.updated_at = fired_at;
        Ok(true)
    }
}

// ============================================================================
// MockLlmDriver - Returns predefined responses
// ============================================================================

/// A scripted provider reply
#[derive(Debug, Clone)]
pub struct MockLlmResponse {
    pub result: Result<ChatResponse, DriverError>,
    pub delay: Option<Duration>,
}

impl MockLlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::response(ChatResponse {
            text: text.into(),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        })
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::response(ChatResponse {
            tool_calls: calls,
            finish_reason: Some("tool_calls".to_string()),
            ..Default::default()
        })
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self::tool_calls(vec![ToolCall {
            id: format!("call_{}", Uuid::now_v7().simple()),
            name: name.into(),
            arguments,
        }])
    }

    pub fn response(response: ChatResponse) -> Self {
        Self {
            result: Ok(response),
            delay: None,
        }
    }

    pub fn error(error: DriverError) -> Self {
        Self {
            result: Err(error),
            delay: None,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        if let Ok(response) = &mut self.result {
            response.usage = Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
            });
        }
        self
    }

    /// Delay the reply (use with paused tokio time in tests)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Mock LLM driver for testing
///
/// Replies are consumed in FIFO order; once exhausted it answers with a
/// fixed text response.
#[derive(Debug, Default)]
pub struct MockLlmDriver {
    responses: Mutex<VecDeque<MockLlmResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlmDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: impl IntoIterator<Item = MockLlmResponse>) -> Self {
        let driver = Self::new();
        driver.responses.lock().extend(responses);
        driver
    }

    pub fn push(&self, response: MockLlmResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn push_response(&self, response: ChatResponse) {
        self.push(MockLlmResponse::response(response));
    }

    pub fn push_error(&self, error: DriverError) {
        self.push(MockLlmResponse::error(error));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests received so far, in call order
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmDriver for MockLlmDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, DriverError> {
        self.requests.lock().push(request.clone());
        let next = self.responses.lock().pop_front();
        let reply = next.unwrap_or_else(|| {
            MockLlmResponse::text("Mock response (no more responses configured)")
        });

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        reply.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::run::{RunStatus, Trigger};

    #[tokio::test]
    async fn test_transition_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let mut run = Run::new(Uuid::now_v7(), AgentConfig::default(), Trigger::manual(None));
        let created = RunEvent::created(&mut run);
        store
            .persist_transition(&Transition::new(run.clone()).with_event(created.clone()))
            .await
            .unwrap();

        // Re-sending event 0 must not change the stored run
        let mut stale = run.clone();
        stale.status = RunStatus::Running;
        stale.next_sequence = 1;
        let err = store
            .persist_transition(&Transition::new(stale).with_event(created))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SequenceConflict { .. }));

        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Queued);
        assert_eq!(store.event_count(run.id), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.fail_next_writes(1);
        let run = Run::new(Uuid::now_v7(), AgentConfig::default(), Trigger::manual(None));
        assert!(store.persist_transition(&Transition::new(run.clone())).await.is_err());
        assert!(store.persist_transition(&Transition::new(run)).await.is_ok());
    }

    #[tokio::test]
    async fn test_claim_fire_is_compare_and_set() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let schedule = Schedule::new(Uuid::now_v7(), "* * * * *", None, true, now).unwrap();
        let expected = schedule.next_fire_at.unwrap();
        store.create_schedule(schedule.clone()).await.unwrap();

        let next = Some(expected + chrono::Duration::minutes(1));
        assert!(store.claim_fire(schedule.id, expected, next, now).await.unwrap());
        assert!(!store.claim_fire(schedule.id, expected, next, now).await.unwrap());

        let stored = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(stored.next_fire_at, next);
        assert_eq!(stored.last_fired_at, Some(now));
    }

    #[tokio::test]
    async fn test_mock_driver_replays_script() {
        let driver = MockLlmDriver::with_responses([
            MockLlmResponse::text("one"),
            MockLlmResponse::error(DriverError::Timeout),
        ]);
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![],
            tools: vec![],
            temperature: None,
            max_tokens: None,
        };

        assert_eq!(driver.chat_completion(&request).await.unwrap().text, "one");
        assert_eq!(
            driver.chat_completion(&request).await.unwrap_err(),
            DriverError::Timeout
        );
        assert!(driver.chat_completion(&request).await.is_ok());
        assert_eq!(driver.call_count(), 3);
    }
}
