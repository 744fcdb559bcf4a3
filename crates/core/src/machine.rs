// Run State Machine
//
// Owns the lifecycle of a run: queued → running → completed | failed | cancelled.
// While running it cycles between model turns and tool calls. Each loop
// iteration appends exactly one Step.
//
// Every transition is persisted before its event is published, so a
// subscriber never observes state that is not durable. The only suspension
// points are persistence writes, provider calls and tool invocations; the
// latter two race against the run's CancellationToken.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{ErrorCode, Result, RunError, StepError};
use crate::events::RunEvent;
use crate::llm_driver::ToolCall;
use crate::provider::{ModelAdapter, ModelTurn};
use crate::run::{Run, RunStatus, Step, StepKind, ToolCallRecord, Trigger, UsageRecord};
use crate::tools::{ToolError, ToolRegistry};
use crate::traits::{AgentStore, RunStore, Transition};

/// Runtime limits of the state machine
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Timeout handed to every tool invocation
    pub tool_timeout: Duration,
    /// Model turns allowed when the agent does not set `max_iterations`
    pub default_max_iterations: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(30),
            default_max_iterations: 10,
        }
    }
}

impl MachineConfig {
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_default_max_iterations(mut self, max: u32) -> Self {
        self.default_max_iterations = max.max(1);
        self
    }
}

/// Drives runs through their lifecycle
pub struct RunMachine {
    agents: Arc<dyn AgentStore>,
    runs: Arc<dyn RunStore>,
    tools: Arc<ToolRegistry>,
    adapter: Arc<ModelAdapter>,
    bus: EventBus,
    config: MachineConfig,
}

impl RunMachine {
    pub fn new(
        agents: Arc<dyn AgentStore>,
        runs: Arc<dyn RunStore>,
        tools: Arc<ToolRegistry>,
        adapter: Arc<ModelAdapter>,
        bus: EventBus,
    ) -> Self {
        Self {
            agents,
            runs,
            tools,
            adapter,
            bus,
            config: MachineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MachineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or(RunError::RunNotFound(run_id))
    }

    // ========================================================================
    // create
    // ========================================================================

    /// Create a queued run for `agent_id`, snapshotting the agent configuration
    pub async fn create(&self, agent_id: Uuid, trigger: Trigger) -> Result<Run> {
        let agent = self
            .agents
            .get_agent(agent_id)
            .await?
            .ok_or(RunError::AgentNotFound(agent_id))?;

        let mut run = Run::new(agent.id, agent.config, trigger);
        let event = RunEvent::created(&mut run);
        self.commit(Transition::new(run.clone()).with_event(event))
            .await?;

        info!(
            run_id = %run.id,
            agent_id = %agent_id,
            source = ?run.trigger.source,
            "Run created"
        );
        Ok(run)
    }

    // ========================================================================
    // advance
    // ========================================================================

    /// Drive a run until it reaches a terminal state
    ///
    /// A terminal run is returned unchanged. When an unexpected error (e.g. a
    /// failed persistence write) aborts the loop, the run is failed on a best
    /// effort basis before the error is returned.
    pub async fn advance(&self, run_id: Uuid, cancel: &CancellationToken) -> Result<Run> {
        match self.drive(run_id, cancel).await {
            Ok(run) => Ok(run),
            Err(err @ RunError::RunNotFound(_)) => Err(err),
            Err(err) => {
                error!(run_id = %run_id, error = %err, "Run aborted");
                self.fail_after_error(run_id, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(&self, run_id: Uuid, cancel: &CancellationToken) -> Result<Run> {
        let mut run = self.get_run(run_id).await?;
        if run.is_terminal() {
            debug!(run_id = %run_id, status = %run.status, "Run already terminal");
            return Ok(run);
        }
        if cancel.is_cancelled() {
            return self.finish_cancelled(run, None).await;
        }

        if run.status == RunStatus::Queued {
            let now = Utc::now();
            run.status = RunStatus::Running;
            run.started_at = Some(now);
            run.updated_at = now;
            self.commit(Transition::new(run.clone())).await?;
            info!(run_id = %run_id, "Run started");
        }

        loop {
            if let Some(call) = run.pending_tool_calls().into_iter().next() {
                if let Some(done) = self.tool_step(&mut run, call, None, cancel).await? {
                    return Ok(done);
                }
                continue;
            }

            let max_iterations = run
                .config
                .max_iterations
                .unwrap_or(self.config.default_max_iterations);
            if run.turn_count() >= max_iterations {
                let error = RunError::MaxIterationsReached(max_iterations).to_step_error();
                return self.finish_failed(run, error).await;
            }

            let history = run.conversation();
            let definitions = self.tools.definitions_for(&run.config.allowed_tools);
            let started_at = Utc::now();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.adapter.converse(&run.config, history, definitions) => Some(result),
            };

            let turn = match result {
                None => return self.finish_cancelled(run, None).await,
                Some(Ok(turn)) => turn,
                Some(Err(err)) => {
                    warn!(run_id = %run_id, code = %err.code(), error = %err, "Model turn failed");
                    let step = Step {
                        sequence: run.steps.len() as u32,
                        turn: run.current_turn(),
                        kind: StepKind::ModelTurn,
                        model_turn: None,
                        tool_call: None,
                        error: Some(err.to_step_error()),
                        started_at,
                        duration_ms: err.duration_ms(),
                    };
                    return self.fail_with_step(run, step, None).await;
                }
            };

            if let Some(call) = turn.tool_calls.first().cloned() {
                debug!(
                    run_id = %run_id,
                    requested = turn.tool_calls.len(),
                    "Model requested tool calls"
                );
                if let Some(done) = self.tool_step(&mut run, call, Some(turn), cancel).await? {
                    return Ok(done);
                }
                continue;
            }

            let sequence = run.steps.len() as u32;
            let usage = record_usage(&mut run, sequence, &turn);
            let step = Step {
                sequence,
                turn: run.current_turn(),
                kind: StepKind::ModelTurn,
                duration_ms: turn.duration_ms,
                model_turn: Some(turn.to_record()),
                tool_call: None,
                error: None,
                started_at,
            };
            run.output = Some(turn.text);
            self.append_step(&mut run, step, Some(usage)).await?;
            return self.finish_completed(run).await;
        }
    }

    /// Execute one tool call as a step
    ///
    /// `turn` is the model turn that requested the call when this is the
    /// first call of the turn. Returns the terminal run when the step ended it.
    async fn tool_step(
        &self,
        run: &mut Run,
        call: ToolCall,
        turn: Option<ModelTurn>,
        cancel: &CancellationToken,
    ) -> Result<Option<Run>> {
        let sequence = run.steps.len() as u32;
        let turn_index = run.current_turn();
        let started_at = Utc::now();
        let started = Instant::now();

        let result = if run.config.allows_tool(&call.name) {
            let invoked = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.tools.validate_and_invoke(
                    &call.name,
                    call.arguments.clone(),
                    self.config.tool_timeout,
                ) => Some(result),
            };
            match invoked {
                Some(result) => result,
                None => {
                    return self
                        .cancel_during_tool(run.clone(), call, turn, started_at, started)
                        .await
                        .map(Some);
                }
            }
        } else {
            Err(ToolError::UnknownTool {
                name: call.name.clone(),
            })
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let (record, error) = match result {
            Ok(invocation) => (
                ToolCallRecord {
                    call_id: call.id,
                    name: call.name,
                    version: Some(invocation.version.to_string()),
                    input: call.arguments,
                    output: Some(invocation.output),
                    attempts: invocation.attempts,
                    duration_ms: invocation.duration_ms,
                },
                None,
            ),
            Err(err) => {
                warn!(
                    run_id = %run.id,
                    tool = %call.name,
                    code = %err.code(),
                    error = %err,
                    "Tool call failed"
                );
                (
                    ToolCallRecord {
                        call_id: call.id,
                        name: call.name,
                        version: err.version().map(ToString::to_string),
                        input: call.arguments,
                        output: None,
                        attempts: err.attempts(),
                        duration_ms,
                    },
                    Some(err.to_step_error()),
                )
            }
        };

        let usage = turn.as_ref().map(|t| record_usage(run, sequence, t));
        let step = Step {
            sequence,
            turn: turn_index,
            kind: StepKind::ToolCall,
            model_turn: turn.map(|t| t.to_record()),
            tool_call: Some(record),
            error,
            started_at,
            duration_ms,
        };

        match step.error.clone().filter(|e| e.code.is_fatal()) {
            Some(_) => self.fail_with_step(run.clone(), step, usage).await.map(Some),
            None => {
                self.append_step(run, step, usage).await?;
                Ok(None)
            }
        }
    }

    /// Cancel while a tool call is in flight
    ///
    /// When the call was requested by a model turn of this iteration, that
    /// turn is recorded on a step with the interrupted call so the usage
    /// ledger keeps pointing at an existing step.
    async fn cancel_during_tool(
        &self,
        mut run: Run,
        call: ToolCall,
        turn: Option<ModelTurn>,
        started_at: DateTime<Utc>,
        started: Instant,
    ) -> Result<Run> {
        let Some(turn) = turn else {
            return self.finish_cancelled(run, None).await;
        };

        let sequence = run.steps.len() as u32;
        let usage = record_usage(&mut run, sequence, &turn);
        let duration_ms = started.elapsed().as_millis() as u64;
        let step = Step {
            sequence,
            turn: run.current_turn(),
            kind: StepKind::ToolCall,
            model_turn: Some(turn.to_record()),
            tool_call: Some(ToolCallRecord {
                call_id: call.id,
                version: self
                    .tools
                    .resolve(&call.name)
                    .map(|registered| registered.version().to_string()),
                name: call.name,
                input: call.arguments,
                output: None,
                attempts: 1,
                duration_ms,
            }),
            error: Some(StepError::new(
                ErrorCode::Cancelled,
                "Run was cancelled during the tool call",
            )),
            started_at,
            duration_ms,
        };
        self.append_step(&mut run, step, Some(usage)).await?;
        self.finish_cancelled(run, None).await
    }

    // ========================================================================
    // cancel
    // ========================================================================

    /// Cancel a run that no task is currently advancing
    ///
    /// Idempotent: a terminal run is returned unchanged and no event is emitted.
    /// Runs being advanced are cancelled through their CancellationToken.
    pub async fn cancel_idle(&self, run_id: Uuid) -> Result<Run> {
        let run = self.get_run(run_id).await?;
        if run.is_terminal() {
            debug!(run_id = %run_id, status = %run.status, "Cancel on terminal run ignored");
            return Ok(run);
        }
        self.finish_cancelled(run, None).await
    }

    /// Fail runs left queued or running by a previous process
    pub async fn fail_interrupted(&self) -> Result<Vec<Uuid>> {
        let mut failed = Vec::new();
        for run in self.runs.list_non_terminal_runs().await? {
            let run_id = run.id;
            let error = StepError::new(
                ErrorCode::RunInterrupted,
                "Run was interrupted before reaching a terminal state",
            );
            self.finish_failed(run, error).await?;
            warn!(run_id = %run_id, "Interrupted run marked failed");
            failed.push(run_id);
        }
        Ok(failed)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Persist, then publish
    async fn commit(&self, transition: Transition) -> Result<()> {
        self.runs.persist_transition(&transition).await?;
        if let Some(event) = transition.event {
            self.bus.publish(event);
        }
        Ok(())
    }

    async fn append_step(&self, run: &mut Run, step: Step, usage: Option<UsageRecord>) -> Result<()> {
        run.steps.push(step.clone());
        run.updated_at = Utc::now();
        let event = RunEvent::step(run, step.clone());
        self.commit(
            Transition::new(run.clone())
                .with_step(step)
                .with_event(event)
                .with_usage(usage),
        )
        .await
    }

    /// Append a failed step, then fail the run with the step's error
    async fn fail_with_step(
        &self,
        mut run: Run,
        step: Step,
        usage: Option<UsageRecord>,
    ) -> Result<Run> {
        let error = step
            .error
            .clone()
            .unwrap_or_else(|| StepError::new(ErrorCode::Internal, "step failed without error"));
        self.append_step(&mut run, step, usage).await?;
        self.finish_failed(run, error).await
    }

    async fn finish_completed(&self, mut run: Run) -> Result<Run> {
        let now = Utc::now();
        run.status = RunStatus::Completed;
        run.finished_at = Some(now);
        run.updated_at = now;
        let event = RunEvent::completed(&mut run);
        self.commit(Transition::new(run.clone()).with_event(event))
            .await?;
        info!(
            run_id = %run.id,
            steps = run.steps.len(),
            total_tokens = run.usage.total_tokens(),
            cost_usd = ?run.usage.cost.usd(),
            "Run completed"
        );
        Ok(run)
    }

    async fn finish_failed(&self, mut run: Run, error: StepError) -> Result<Run> {
        let now = Utc::now();
        run.status = RunStatus::Failed;
        run.error = Some(error.clone());
        run.finished_at = Some(now);
        run.updated_at = now;
        let event = RunEvent::failed(&mut run, error);
        self.commit(Transition::new(run.clone()).with_event(event))
            .await?;
        info!(
            run_id = %run.id,
            code = ?run.error.as_ref().map(|e| e.code),
            "Run failed"
        );
        Ok(run)
    }

    async fn finish_cancelled(&self, mut run: Run, usage: Option<UsageRecord>) -> Result<Run> {
        let now = Utc::now();
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(now);
        run.updated_at = now;
        let event = RunEvent::cancelled(&mut run);
        self.commit(
            Transition::new(run.clone())
                .with_event(event)
                .with_usage(usage),
        )
        .await?;
        info!(run_id = %run.id, "Run cancelled");
        Ok(run)
    }

    /// Best-effort failure after the loop aborted on an unexpected error
    async fn fail_after_error(&self, run_id: Uuid, cause: &RunError) {
        let run = match self.runs.get_run(run_id).await {
            Ok(Some(run)) if !run.is_terminal() => run,
            Ok(_) => return,
            Err(err) => {
                error!(run_id = %run_id, error = %err, "Could not reload run to fail it");
                return;
            }
        };
        if let Err(err) = self.finish_failed(run, cause.to_step_error()).await {
            error!(run_id = %run_id, error = %err, "Could not record run failure");
        }
    }
}

/// Add a turn's usage to the run and build its metrics record
fn record_usage(run: &mut Run, sequence: u32, turn: &ModelTurn) -> UsageRecord {
    run.usage.record(turn.usage.as_ref(), turn.cost);
    UsageRecord {
        run_id: run.id,
        step_sequence: sequence,
        model: turn.model.clone(),
        usage: turn.usage,
        cost: turn.cost,
        recorded_at: Utc::now(),
    }
}
