//! Cron expression helpers: validation and next-occurrence computation.
//!
//! Standard 5-field syntax. All timestamps are UTC.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use croner::Cron;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronValidation {
    pub valid: bool,
    pub error: Option<String>,
}

fn parse(expr: &str) -> Result<Cron> {
    Cron::new(expr).parse().map_err(|err| EngineError::InvalidCron {
        expr: expr.to_string(),
        reason: err.to_string(),
    })
}

/// Validate an expression without computing anything.
pub fn validate_cron_expression(expr: &str) -> CronValidation {
    match Cron::new(expr).parse() {
        Ok(_) => CronValidation {
            valid: true,
            error: None,
        },
        Err(err) => CronValidation {
            valid: false,
            error: Some(err.to_string()),
        },
    }
}

/// First occurrence strictly after `from` (or after now when omitted).
pub fn next_run_time(expr: &str, from: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
    let reference = from.unwrap_or_else(Utc::now);
    parse(expr)?
        .find_next_occurrence(&reference, false)
        .map_err(|err| EngineError::InvalidCron {
            expr: expr.to_string(),
            reason: err.to_string(),
        })
}

/// The next `count` occurrences, for schedule previews.
pub fn next_run_times(
    expr: &str,
    count: usize,
    from: Option<DateTime<Utc>>,
) -> Result<Vec<DateTime<Utc>>> {
    let cron = parse(expr)?;
    let mut reference = from.unwrap_or_else(Utc::now);
    let mut occurrences = Vec::with_capacity(count);
    for _ in 0..count {
        let next = cron
            .find_next_occurrence(&reference, false)
            .map_err(|err| EngineError::InvalidCron {
                expr: expr.to_string(),
                reason: err.to_string(),
            })?;
        occurrences.push(next);
        reference = next;
    }
    Ok(occurrences)
}
