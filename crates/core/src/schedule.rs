// Schedule domain types and cron evaluation
//
// Cron expressions accept the classic 5-field form (seconds implied 0) as well
// as the 6/7-field form with seconds and optional year.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, RunError};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

// ============================================================================
// CronExpr
// ============================================================================

/// Parsed cron expression
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let fields = trimmed.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(RunError::invalid_schedule(format!(
                    "expected 5, 6 or 7 cron fields, got {n}"
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| RunError::invalid_schedule(format!("{trimmed}: {e}")))?;
        Ok(Self {
            source: trimmed.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`. Missed periods are never returned.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).find(|candidate| *candidate > after)
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// Cron schedule that triggers runs of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Schedule {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub cron: String,
    /// Input passed to each triggered run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    pub enabled: bool,
    /// None when disabled or the expression has no future fire time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        agent_id: Uuid,
        cron: &str,
        input: Option<String>,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let expr = CronExpr::parse(cron)?;
        Ok(Self {
            id: Uuid::now_v7(),
            agent_id,
            cron: expr.as_str().to_string(),
            input,
            enabled,
            next_fire_at: if enabled { expr.next_after(now) } else { None },
            last_fired_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn expr(&self) -> Result<CronExpr> {
        CronExpr::parse(&self.cron)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at.is_some_and(|at| at <= now)
    }

    /// Apply a user edit; the next fire time is recomputed from `now`
    pub fn apply(&mut self, update: UpdateScheduleRequest, now: DateTime<Utc>) -> Result<()> {
        if let Some(cron) = update.cron {
            self.cron = CronExpr::parse(&cron)?.as_str().to_string();
        }
        if let Some(input) = update.input {
            self.input = Some(input);
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        self.next_fire_at = if self.enabled {
            self.expr()?.next_after(now)
        } else {
            None
        };
        self.updated_at = now;
        Ok(())
    }
}

/// Request to create a schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct CreateScheduleRequest {
    pub agent_id: Uuid,
    pub cron: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update of a schedule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct UpdateScheduleRequest {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}
