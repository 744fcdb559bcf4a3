// Run supervisor
//
// Owns the tokio task that advances each run. A run is active from
// `start_run` until its advance loop returns; while active it can be
// cancelled through its CancellationToken. Shutdown closes the supervisor
// to new runs, waits for in-flight runs, and cancels the stragglers.

use parking_lot::Mutex;
use runloop_core::{Result, Run, RunError, RunMachine, RunStatus, StoreError, Trigger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handle to a run whose advance loop is executing
struct ActiveRun {
    token: CancellationToken,
    /// Set to the final status once the advance loop returns
    finished: watch::Receiver<Option<RunStatus>>,
}

/// Outcome of a supervisor shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Runs that finished on their own within the timeout
    pub drained: usize,
    /// Runs cancelled after the timeout elapsed
    pub cancelled: usize,
}

pub struct RunSupervisor {
    machine: Arc<RunMachine>,
    active: Arc<Mutex<HashMap<Uuid, ActiveRun>>>,
    tracker: TaskTracker,
    draining: AtomicBool,
}

impl RunSupervisor {
    pub fn new(machine: Arc<RunMachine>) -> Self {
        Self {
            machine,
            active: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            draining: AtomicBool::new(false),
        }
    }

    pub fn machine(&self) -> &Arc<RunMachine> {
        &self.machine
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.active.lock().contains_key(&run_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Create a run and start advancing it in the background
    pub async fn create_and_start(&self, agent_id: Uuid, trigger: Trigger) -> Result<Run> {
        if self.is_draining() {
            return Err(RunError::ShuttingDown);
        }
        let run = self.machine.create(agent_id, trigger).await?;
        self.start_run(run.id)?;
        Ok(run)
    }

    /// Spawn the advance loop for an existing run
    ///
    /// Starting a run that is already active is a no-op.
    pub fn start_run(&self, run_id: Uuid) -> Result<()> {
        if self.is_draining() {
            return Err(RunError::ShuttingDown);
        }

        let token = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(None);
        {
            let mut active = self.active.lock();
            if active.contains_key(&run_id) {
                debug!(run_id = %run_id, "Run already active");
                return Ok(());
            }
            active.insert(
                run_id,
                ActiveRun {
                    token: token.clone(),
                    finished: finished_rx,
                },
            );
        }

        let machine = self.machine.clone();
        let active = self.active.clone();
        self.tracker.spawn(async move {
            let status = match machine.advance(run_id, &token).await {
                Ok(run) => Some(run.status),
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Run task failed");
                    machine.get_run(run_id).await.ok().map(|run| run.status)
                }
            };
            debug!(run_id = %run_id, status = ?status, "Run task finished");
            finished_tx.send_replace(status);
            active.lock().remove(&run_id);
        });

        debug!(run_id = %run_id, "Run task started");
        Ok(())
    }

    /// Cancel a run
    ///
    /// An active run is cancelled through its token and this call waits for the
    /// terminal write. A run with no task is cancelled directly. Cancelling a
    /// terminal run returns it unchanged.
    pub async fn cancel(&self, run_id: Uuid) -> Result<Run> {
        let handle = self
            .active
            .lock()
            .get(&run_id)
            .map(|run| (run.token.clone(), run.finished.clone()));

        if let Some((token, mut finished)) = handle {
            info!(run_id = %run_id, "Cancelling active run");
            token.cancel();
            // A closed channel means the task exited; the store has the final word
            let _ = finished.wait_for(Option::is_some).await;
            return self.machine.get_run(run_id).await;
        }

        match self.machine.cancel_idle(run_id).await {
            Err(RunError::Store(err)) if is_transition_conflict(&err) => {
                // Another writer moved the run first; report where it ended up
                let run = self.machine.get_run(run_id).await?;
                debug!(run_id = %run_id, status = %run.status, "Cancel lost a transition race");
                if run.is_terminal() {
                    Ok(run)
                } else {
                    Err(RunError::Store(err))
                }
            }
            other => other,
        }
    }

    /// Stop accepting runs and drain the in-flight ones
    ///
    /// Waits up to `timeout` for active runs to finish, then cancels the rest
    /// and waits for their cancellation to be persisted.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.draining.store(true, Ordering::SeqCst);
        self.tracker.close();

        let in_flight = self.active_count();
        info!(in_flight, timeout_ms = timeout.as_millis() as u64, "Draining runs");

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            info!(drained = in_flight, "All runs drained");
            return ShutdownReport {
                drained: in_flight,
                cancelled: 0,
            };
        }

        let tokens: Vec<(Uuid, CancellationToken)> = self
            .active
            .lock()
            .iter()
            .map(|(id, run)| (*id, run.token.clone()))
            .collect();
        for (run_id, token) in &tokens {
            warn!(run_id = %run_id, "Cancelling run at shutdown");
            token.cancel();
        }
        self.tracker.wait().await;

        let report = ShutdownReport {
            drained: in_flight.saturating_sub(tokens.len()),
            cancelled: tokens.len(),
        };
        info!(drained = report.drained, cancelled = report.cancelled, "Shutdown complete");
        report
    }
}

fn is_transition_conflict(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::SequenceConflict { .. } | StoreError::RunTerminal(_) | StoreError::Conflict(_)
    )
}

impl std::fmt::Debug for RunSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSupervisor")
            .field("active", &self.active_count())
            .field("draining", &self.is_draining())
            .finish()
    }
}
