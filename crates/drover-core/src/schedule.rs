//! Schedule types and the next-run calculator.

use crate::error::{Result, TaskManagerError};
use crate::intervals::parse_interval_millis;
use crate::rrule::RecurrenceRule;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Recurrence of a task. Tasks without a schedule run once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fixed interval such as `"5m"`.
    Interval {
        /// Interval string: a positive integer followed by `s`, `m`, `h` or `d`.
        interval: String,
    },
    /// Calendar-aware recurrence rule.
    Rrule {
        rrule: RecurrenceRule,
    },
    /// Cron expression (six fields, seconds first).
    Cron {
        expression: String,
    },
}

impl Schedule {
    /// Fixed interval schedule.
    pub fn interval(interval: impl Into<String>) -> Self {
        Self::Interval {
            interval: interval.into(),
        }
    }

    /// Recurrence rule schedule.
    pub fn rrule(rrule: RecurrenceRule) -> Self {
        Self::Rrule { rrule }
    }

    /// Cron schedule.
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    /// Validate the schedule configuration.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Interval { interval } => parse_interval_millis(interval).map(|_| ()),
            Self::Rrule { rrule } => rrule.validate(),
            Self::Cron { expression } => {
                CronSchedule::from_str(expression)?;
                Ok(())
            }
        }
    }

    /// Interval length in milliseconds, for interval schedules.
    pub fn interval_millis(&self) -> Option<i64> {
        match self {
            Self::Interval { interval } => parse_interval_millis(interval).ok(),
            _ => None,
        }
    }

    /// Compute the next run after `reference`, never earlier than `now`.
    ///
    /// Intervals land on the first `reference + k * interval` (k >= 1) that is
    /// strictly after `now`, so a long stall does not replay missed runs.
    /// Calendar schedules return their first occurrence after `reference`
    /// and at or after `now`. `None` means the schedule is exhausted.
    pub fn next_run_at(
        &self,
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Self::Interval { interval } => {
                let step = parse_interval_millis(interval)?;
                let behind = (now - reference).num_milliseconds();
                let periods = if behind < step { 1 } else { behind / step + 1 };
                let offset = periods
                    .checked_mul(step)
                    .map(Duration::milliseconds)
                    .ok_or_else(|| overflow(interval))?;
                reference
                    .checked_add_signed(offset)
                    .map(Some)
                    .ok_or_else(|| overflow(interval))
            }
            Self::Rrule { rrule } => rrule.next_occurrence(reference, now),
            Self::Cron { expression } => {
                let schedule = CronSchedule::from_str(expression)?;
                let start = reference.max(now - Duration::milliseconds(1));
                Ok(schedule.after(&start).find(|at| *at >= now && *at > reference))
            }
        }
    }

    /// Next run after `after`, relative to the current time.
    pub fn next_run_time(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.next_run_at(after, Utc::now())
    }
}

fn overflow(interval: &str) -> TaskManagerError {
    TaskManagerError::InvalidSchedule(format!("interval '{}' overflows the calendar", interval))
}
