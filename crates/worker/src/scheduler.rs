// Cron scheduler
//
// Periodic tick that fires due schedules. Each fire time is claimed with a
// compare-and-set on the schedule row before the run is created, so a fire
// time produces at most one run even when ticks overlap. Missed periods are
// not backfilled: the next fire time is always computed from "now".

use chrono::{DateTime, Utc};
use runloop_core::{ErrorCode, Schedule, ScheduleStore, StoreResult, Trigger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::supervisor::RunSupervisor;

/// A run started by a schedule fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredRun {
    pub schedule_id: Uuid,
    pub run_id: Uuid,
}

pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    supervisor: Arc<RunSupervisor>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(schedules: Arc<dyn ScheduleStore>, supervisor: Arc<RunSupervisor>) -> Self {
        Self {
            schedules,
            supervisor,
            tick_interval: Duration::from_secs(1),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Fire every schedule due at `now`
    ///
    /// Returns the runs started on this tick. Schedules whose claim fails or
    /// whose run cannot be created are logged and skipped.
    pub async fn tick(&self, now: DateTime<Utc>) -> StoreResult<Vec<FiredRun>> {
        let due = self.schedules.list_due_schedules(now).await?;
        if !due.is_empty() {
            debug!(due = due.len(), "Due schedules");
        }

        let mut fired = Vec::new();
        for schedule in due {
            match self.fire(&schedule, now).await {
                Ok(Some(run)) => fired.push(run),
                Ok(None) => {}
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "Failed to claim schedule");
                }
            }
        }
        Ok(fired)
    }

    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> StoreResult<Option<FiredRun>> {
        let Some(expected) = schedule.next_fire_at else {
            return Ok(None);
        };

        let next = match schedule.expr() {
            Ok(expr) => expr.next_after(now),
            Err(e) => {
                // Stored expressions are validated on write; clear next_fire_at so it stops firing
                error!(schedule_id = %schedule.id, error = %e, "Invalid stored cron expression");
                None
            }
        };

        if !self
            .schedules
            .claim_fire(schedule.id, expected, next, now)
            .await?
        {
            warn!(
                schedule_id = %schedule.id,
                code = ErrorCode::ScheduleConflict.as_str(),
                "Schedule fire already claimed, skipping"
            );
            return Ok(None);
        }

        let trigger = Trigger::scheduled(schedule.id, schedule.input.clone());
        match self
            .supervisor
            .create_and_start(schedule.agent_id, trigger)
            .await
        {
            Ok(run) => {
                info!(
                    schedule_id = %schedule.id,
                    run_id = %run.id,
                    agent_id = %schedule.agent_id,
                    next_fire_at = ?next,
                    "Scheduled run started"
                );
                Ok(Some(FiredRun {
                    schedule_id: schedule.id,
                    run_id: run.id,
                }))
            }
            Err(e) => {
                warn!(
                    schedule_id = %schedule.id,
                    code = e.code().as_str(),
                    error = %e,
                    "Scheduled run not started"
                );
                Ok(None)
            }
        }
    }

    /// Start the tick loop
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(tick_ms = self.tick_interval.as_millis() as u64, "Scheduler started");
            let mut ticker = tokio::time::interval(self.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Scheduler received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            error!(error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }
            info!("Scheduler stopped");
        });

        SchedulerHandle { shutdown_tx, task }
    }
}

/// Handle to a running scheduler loop
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for the current tick to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Scheduler task panicked");
        }
    }
}
