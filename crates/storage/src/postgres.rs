//! PostgreSQL implementation of the core store traits
//!
//! - Each transition is a single transaction guarded by a row lock on the run
//! - Sequence numbers are checked with `Transition::check` against the locked row
//! - Schedule fire times are claimed with a compare-and-set UPDATE

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use runloop_core::{
    Agent, AgentStore, Run, RunEvent, RunFilter, RunStore, Schedule, ScheduleStore, Step,
    StoreError, StoreResult, Transition, UsageRecord,
};

use crate::rows::{self as decode, db_err};

const RUN_COLUMNS: &str = "id, agent_id, status, trigger, config, usage, output, error, \
     next_sequence, created_at, started_at, finished_at, updated_at";

const SCHEDULE_COLUMNS: &str =
    "id, agent_id, cron, input, enabled, next_fire_at, last_fired_at, created_at, updated_at";

/// PostgreSQL store for agents, runs and schedules
///
/// # Example
///
/// ```ignore
/// use runloop_storage::PgStore;
///
/// let store = PgStore::connect("postgres://localhost/runloop", 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a bounded pool
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn load_steps(conn: &mut PgConnection, run_id: Uuid) -> StoreResult<Vec<Step>> {
    let rows = sqlx::query(
        r#"
        SELECT data FROM run_steps
        WHERE run_id = $1
        ORDER BY sequence
        "#,
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    rows.iter().map(decode::step).collect()
}

async fn load_run(conn: &mut PgConnection, run_id: Uuid, lock: bool) -> StoreResult<Option<Run>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

    match row {
        Some(row) => {
            let steps = load_steps(conn, run_id).await?;
            decode::run(&row, steps).map(Some)
        }
        None => Ok(None),
    }
}

/// Attach steps to a batch of run rows with one query
async fn runs_with_steps(pool: &PgPool, run_rows: Vec<PgRow>) -> StoreResult<Vec<Run>> {
    let ids = run_rows
        .iter()
        .map(|row| row.try_get::<Uuid, _>("id").map_err(db_err))
        .collect::<StoreResult<Vec<_>>>()?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let step_rows = sqlx::query(
        r#"
        SELECT run_id, data FROM run_steps
        WHERE run_id = ANY($1)
        ORDER BY run_id, sequence
        "#,
    )
    .bind(&ids)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    let mut steps: std::collections::HashMap<Uuid, Vec<Step>> = std::collections::HashMap::new();
    for row in &step_rows {
        let run_id: Uuid = row.try_get("run_id").map_err(db_err)?;
        steps.entry(run_id).or_default().push(decode::step(row)?);
    }

    run_rows
        .iter()
        .zip(ids)
        .map(|(row, id)| decode::run(row, steps.remove(&id).unwrap_or_default()))
        .collect()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ============================================================================
// AgentStore
// ============================================================================

#[async_trait]
impl AgentStore for PgStore {
    #[instrument(skip(self, agent), fields(agent_id = %agent.id))]
    async fn create_agent(&self, agent: Agent) -> StoreResult<Agent> {
        let config = serde_json::to_value(&agent.config)?;
        sqlx::query(
            r#"
            INSERT INTO agents (id, name, description, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(agent.id)
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(&config)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create agent: {}", e);
            db_err(e)
        })?;

        debug!(agent_id = %agent.id, "created agent");
        Ok(agent)
    }

    async fn get_agent(&self, agent_id: Uuid) -> StoreResult<Option<Agent>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, config, created_at, updated_at
            FROM agents
            WHERE id = $1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(decode::agent).transpose()
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, description, config, created_at, updated_at
            FROM agents
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(decode::agent).collect()
    }
}

// ============================================================================
// RunStore
// ============================================================================

#[async_trait]
impl RunStore for PgStore {
    #[instrument(skip(self, transition), fields(run_id = %transition.run.id))]
    async fn persist_transition(&self, transition: &Transition) -> StoreResult<()> {
        let run = &transition.run;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let stored = load_run(&mut *tx, run.id, true).await?;
        if let Err(err) = transition.check(stored.as_ref()) {
            warn!(run_id = %run.id, error = %err, "Rejected run transition");
            return Err(err);
        }

        let trigger = serde_json::to_value(&run.trigger)?;
        let config = serde_json::to_value(&run.config)?;
        let usage = serde_json::to_value(run.usage)?;
        let run_error = run.error.as_ref().map(serde_json::to_value).transpose()?;

        if stored.is_none() {
            sqlx::query(
                r#"
                INSERT INTO runs (id, agent_id, status, trigger, config, usage, output, error,
                                  next_sequence, created_at, started_at, finished_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(run.id)
            .bind(run.agent_id)
            .bind(run.status.as_str())
            .bind(&trigger)
            .bind(&config)
            .bind(&usage)
            .bind(&run.output)
            .bind(&run_error)
            .bind(to_i64(run.next_sequence))
            .bind(run.created_at)
            .bind(run.started_at)
            .bind(run.finished_at)
            .bind(run.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        } else {
            sqlx::query(
                r#"
                UPDATE runs
                SET status = $2, usage = $3, output = $4, error = $5, next_sequence = $6,
                    started_at = $7, finished_at = $8, updated_at = $9
                WHERE id = $1
                "#,
            )
            .bind(run.id)
            .bind(run.status.as_str())
            .bind(&usage)
            .bind(&run.output)
            .bind(&run_error)
            .bind(to_i64(run.next_sequence))
            .bind(run.started_at)
            .bind(run.finished_at)
            .bind(run.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if let Some(step) = &transition.step {
            let data = serde_json::to_value(step)?;
            sqlx::query(
                r#"
                INSERT INTO run_steps (run_id, sequence, kind, data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(run.id)
            .bind(step.sequence as i32)
            .bind(step.kind.as_str())
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if let Some(event) = &transition.event {
            let data = serde_json::to_value(event)?;
            sqlx::query(
                r#"
                INSERT INTO run_events (id, run_id, sequence, event_type, ts, data)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(event.id)
            .bind(run.id)
            .bind(to_i64(event.sequence))
            .bind(&event.event_type)
            .bind(event.ts)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if let Some(record) = &transition.usage {
            sqlx::query(
                r#"
                INSERT INTO run_usage (run_id, step_sequence, model, prompt_tokens,
                                       completion_tokens, cost_usd, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(record.run_id)
            .bind(record.step_sequence as i32)
            .bind(&record.model)
            .bind(record.usage.map(|u| u.prompt_tokens as i32))
            .bind(record.usage.map(|u| u.completion_tokens as i32))
            .bind(decode::cost_to_column(record.cost))
            .bind(record.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(
            run_id = %run.id,
            status = %run.status,
            next_sequence = run.next_sequence,
            "persisted transition"
        );
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        load_run(&mut *conn, run_id, false).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<Run>> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS} FROM runs
            WHERE ($1::uuid IS NULL OR agent_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        );
        let run_rows = sqlx::query(&sql)
            .bind(filter.agent_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.limit.map(|l| l as i64))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        runs_with_steps(&self.pool, run_rows).await
    }

    async fn list_events(&self, run_id: Uuid, after: Option<u64>) -> StoreResult<Vec<RunEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM run_events
            WHERE run_id = $1 AND ($2::bigint IS NULL OR sequence > $2)
            ORDER BY sequence
            "#,
        )
        .bind(run_id)
        .bind(after.map(to_i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load events: {}", e);
            db_err(e)
        })?;

        rows.iter().map(decode::event).collect()
    }

    async fn list_non_terminal_runs(&self) -> StoreResult<Vec<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status IN ('queued', 'running') ORDER BY created_at"
        );
        let run_rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        runs_with_steps(&self.pool, run_rows).await
    }

    async fn list_usage(&self, run_id: Uuid) -> StoreResult<Vec<UsageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_sequence, model, prompt_tokens, completion_tokens, cost_usd, recorded_at
            FROM run_usage
            WHERE run_id = $1
            ORDER BY step_sequence, id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(decode::usage).collect()
    }
}

// ============================================================================
// ScheduleStore
// ============================================================================

#[async_trait]
impl ScheduleStore for PgStore {
    async fn create_schedule(&self, schedule: Schedule) -> StoreResult<Schedule> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, agent_id, cron, input, enabled, next_fire_at,
                                   last_fired_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.agent_id)
        .bind(&schedule.cron)
        .bind(&schedule.input)
        .bind(schedule.enabled)
        .bind(schedule.next_fire_at)
        .bind(schedule.last_fired_at)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(schedule_id = %schedule.id, cron = %schedule.cron, "created schedule");
        Ok(schedule)
    }

    async fn get_schedule(&self, schedule_id: Uuid) -> StoreResult<Option<Schedule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(decode::schedule).transpose()
    }

    async fn list_schedules(&self, agent_id: Option<Uuid>) -> StoreResult<Vec<Schedule>> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE ($1::uuid IS NULL OR agent_id = $1) ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(decode::schedule).collect()
    }

    async fn update_schedule(&self, schedule: Schedule) -> StoreResult<Schedule> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET cron = $2, input = $3, enabled = $4, next_fire_at = $5,
                last_fired_at = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.cron)
        .bind(&schedule.input)
        .bind(schedule.enabled)
        .bind(schedule.next_fire_at)
        .bind(schedule.last_fired_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("schedule {}", schedule.id)));
        }
        Ok(schedule)
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE enabled AND next_fire_at <= $1 ORDER BY next_fire_at"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(decode::schedule).collect()
    }

    #[instrument(skip(self))]
    async fn claim_fire(
        &self,
        schedule_id: Uuid,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET next_fire_at = $3, last_fired_at = $4, updated_at = $4
            WHERE id = $1 AND enabled AND next_fire_at = $2
            "#,
        )
        .bind(schedule_id)
        .bind(expected)
        .bind(next)
        .bind(fired_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }
}
