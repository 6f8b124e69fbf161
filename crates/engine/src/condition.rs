//! Condition evaluation for conditional steps and loop break signals.

use crate::browser::BrowserSession;
use crate::error::Result;
use crate::substitute::{lookup_path, render};
use crate::types::VariableMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Bounded wait used by the visibility check; a timeout counts as "not
/// visible", never as an error.
const VISIBILITY_WAIT: Duration = Duration::from_millis(1000);

/// A typed condition evaluated against the live page and variable bag.
///
/// String-valued fields (`selector`, `text`, `value`) may carry `${...}`
/// placeholders; callers substitute them before evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    ElementExists {
        selector: String,
    },
    ElementVisible {
        selector: String,
    },
    TextContains {
        selector: String,
        text: String,
    },
    ValueEquals {
        variable: String,
        operator: Comparator,
        value: Value,
    },
    CustomJs {
        script: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
}

/// Evaluate a condition. Never errors: any internal fault (selector
/// error, timeout, script failure) yields `false`.
pub async fn evaluate(
    condition: &Condition,
    session: &mut dyn BrowserSession,
    variables: &VariableMap,
) -> bool {
    match try_evaluate(condition, session, variables).await {
        Ok(outcome) => outcome,
        Err(err) => {
            debug!(error = %err, "condition evaluation fault treated as false");
            false
        }
    }
}

async fn try_evaluate(
    condition: &Condition,
    session: &mut dyn BrowserSession,
    variables: &VariableMap,
) -> Result<bool> {
    match condition {
        Condition::ElementExists { selector } => Ok(session.query_count(selector).await? > 0),
        Condition::ElementVisible { selector } => {
            session.is_visible(selector, VISIBILITY_WAIT).await
        }
        Condition::TextContains { selector, text } => Ok(session
            .text_content(selector)
            .await?
            .is_some_and(|content| content.contains(text.as_str()))),
        Condition::ValueEquals {
            variable,
            operator,
            value,
        } => Ok(compare(lookup_path(variable, variables), *operator, value)),
        Condition::CustomJs { script } => {
            let result = session
                .evaluate(script, Value::Object(variables.clone()))
                .await?;
            Ok(is_truthy(&result))
        }
    }
}

/// Compare a variable's current value against a literal.
///
/// String comparisons are case-insensitive; numeric comparisons parse
/// both sides as f64, so non-numeric input becomes NaN and every ordered
/// comparison against it is false. An absent variable compares as the
/// empty string.
fn compare(actual: Option<&Value>, operator: Comparator, expected: &Value) -> bool {
    let text = || actual.map(render).unwrap_or_default().to_lowercase();
    let expected_text = || render(expected).to_lowercase();
    let number = || actual.map(as_f64).unwrap_or(f64::NAN);
    match operator {
        Comparator::Equals => text() == expected_text(),
        Comparator::NotEquals => text() != expected_text(),
        Comparator::Contains => text().contains(&expected_text()),
        Comparator::NotContains => !text().contains(&expected_text()),
        Comparator::GreaterThan => number() > as_f64(expected),
        Comparator::LessThan => number() < as_f64(expected),
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// JavaScript-style truthiness for page script results.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
