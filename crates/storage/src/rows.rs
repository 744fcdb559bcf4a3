// Row decoding
//
// Maps Postgres rows onto core domain types. Column names match the
// statements in postgres.rs.

use chrono::{DateTime, Utc};
use runloop_core::{
    Agent, Cost, Run, RunEvent, RunStatus, Schedule, Step, StoreError, StoreResult, TokenUsage,
    UsageRecord,
};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::Row;

pub(crate) fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::database(err.to_string())
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name).map_err(db_err)
}

fn json_col<T: DeserializeOwned>(row: &PgRow, name: &str) -> StoreResult<T> {
    let value: serde_json::Value = col(row, name)?;
    Ok(serde_json::from_value(value)?)
}

fn optional_json_col<T: DeserializeOwned>(row: &PgRow, name: &str) -> StoreResult<Option<T>> {
    let value: Option<serde_json::Value> = col(row, name)?;
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(StoreError::from)
}

pub(crate) fn agent(row: &PgRow) -> StoreResult<Agent> {
    Ok(Agent {
        id: col(row, "id")?,
        name: col(row, "name")?,
        description: col(row, "description")?,
        config: json_col(row, "config")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

/// Decode a run row; steps are loaded separately
pub(crate) fn run(row: &PgRow, steps: Vec<Step>) -> StoreResult<Run> {
    let status: String = col(row, "status")?;
    let next_sequence: i64 = col(row, "next_sequence")?;
    Ok(Run {
        id: col(row, "id")?,
        agent_id: col(row, "agent_id")?,
        trigger: json_col(row, "trigger")?,
        status: status
            .parse::<RunStatus>()
            .map_err(StoreError::database)?,
        config: json_col(row, "config")?,
        steps,
        usage: json_col(row, "usage")?,
        output: col(row, "output")?,
        error: optional_json_col(row, "error")?,
        next_sequence: next_sequence.max(0) as u64,
        created_at: col(row, "created_at")?,
        started_at: col(row, "started_at")?,
        finished_at: col(row, "finished_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

pub(crate) fn step(row: &PgRow) -> StoreResult<Step> {
    json_col(row, "data")
}

pub(crate) fn event(row: &PgRow) -> StoreResult<RunEvent> {
    json_col(row, "data")
}

pub(crate) fn usage(row: &PgRow) -> StoreResult<UsageRecord> {
    let prompt: Option<i32> = col(row, "prompt_tokens")?;
    let completion: Option<i32> = col(row, "completion_tokens")?;
    let cost: Option<f64> = col(row, "cost_usd")?;
    let step_sequence: i32 = col(row, "step_sequence")?;
    Ok(UsageRecord {
        run_id: col(row, "run_id")?,
        step_sequence: step_sequence.max(0) as u32,
        model: col(row, "model")?,
        usage: match (prompt, completion) {
            (Some(p), Some(c)) => Some(TokenUsage {
                prompt_tokens: p.max(0) as u32,
                completion_tokens: c.max(0) as u32,
            }),
            _ => None,
        },
        cost: cost_from_column(cost),
        recorded_at: col(row, "recorded_at")?,
    })
}

pub(crate) fn schedule(row: &PgRow) -> StoreResult<Schedule> {
    let next_fire_at: Option<DateTime<Utc>> = col(row, "next_fire_at")?;
    Ok(Schedule {
        id: col(row, "id")?,
        agent_id: col(row, "agent_id")?,
        cron: col(row, "cron")?,
        input: col(row, "input")?,
        enabled: col(row, "enabled")?,
        next_fire_at,
        last_fired_at: col(row, "last_fired_at")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

pub(crate) fn cost_to_column(cost: Cost) -> Option<f64> {
    cost.usd()
}

pub(crate) fn cost_from_column(cost: Option<f64>) -> Cost {
    match cost {
        Some(usd) => Cost::Known { usd },
        None => Cost::Unknown,
    }
}
