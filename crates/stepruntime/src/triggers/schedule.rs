//! Schedule expressions for schedule triggers.
//!
//! Accepted forms:
//! - fixed intervals: `every 30s`, `@every 5m`, `every 250ms` (units `ms`,
//!   `s`, `m`, `h`, `d`)
//! - aliases: `minutely`, `hourly`, `daily` and `every minute|hour|day`
//! - cron: 5-field (minute precision) or 6-field (with seconds)

use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Schedule expression is empty")]
    Empty,

    #[error("Invalid interval '{0}'")]
    InvalidInterval(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
}

/// A parsed schedule
pub enum Schedule {
    Every(Duration),
    Cron(Box<croner::Cron>),
}

impl Schedule {
    /// The first fire time strictly after `from`
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                from.checked_add_signed(step)
            }
            Schedule::Cron(cron) => cron.iter_after(from).next(),
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ScheduleError::Empty);
        }

        let lower = trimmed.to_lowercase();
        let alias = match lower.as_str() {
            "minutely" | "every minute" => Some("0 * * * * *"),
            "hourly" | "every hour" => Some("0 0 * * * *"),
            "daily" | "every day" => Some("0 0 0 * * *"),
            _ => None,
        };
        if let Some(cron) = alias {
            return parse_cron(cron);
        }

        if let Some(rest) = lower
            .strip_prefix("@every")
            .or_else(|| lower.strip_prefix("every"))
        {
            return parse_interval(rest.trim()).map(Schedule::Every);
        }

        match trimmed.split_whitespace().count() {
            // standard cron has no seconds field
            5 => parse_cron(&format!("0 {}", trimmed)),
            6 => parse_cron(trimmed),
            _ => Err(ScheduleError::InvalidCron {
                expression: trimmed.to_string(),
                reason: "expected 5 or 6 fields".to_string(),
            }),
        }
    }
}

fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    expression
        .parse::<croner::Cron>()
        .map(|cron| Schedule::Cron(Box::new(cron)))
        .map_err(|e| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

fn parse_interval(spec: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(spec.to_string());

    let compact: String = spec.chars().filter(|c| !c.is_whitespace()).collect();
    let split = compact
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (digits, unit) = compact.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }

    let millis_per_unit = match unit {
        "ms" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        "h" | "hour" | "hours" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        _ => return Err(invalid()),
    };
    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}
