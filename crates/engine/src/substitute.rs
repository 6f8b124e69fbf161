//! `${path}` placeholder substitution against a run's variable bag.
//!
//! Pure functions, no I/O. Strings are scanned for `${dotted.path}`
//! markers; everything else passes through untouched (objects and arrays
//! recursively). Unresolved references stay verbatim rather than failing
//! the step.

use crate::types::VariableMap;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern"))
}

/// Substitute placeholders in `value`, returning a new value.
///
/// Non-string scalars are returned unchanged; objects and arrays are
/// rebuilt with substitution applied to every string-valued field.
pub fn substitute(value: &Value, variables: &VariableMap) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, variables)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, variables)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute(v, variables)).collect())
        }
        other => other.clone(),
    }
}

/// Substitute every `${dotted.path}` occurrence in `input`.
pub fn substitute_str(input: &str, variables: &VariableMap) -> String {
    placeholder()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match lookup_path(&caps[1], variables) {
                Some(value) => render(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Walk `dotted.path` through nested objects.
///
/// A path that hits a non-object mid-walk resolves to "not found", it
/// never errors.
pub(crate) fn lookup_path<'a>(path: &str, variables: &'a VariableMap) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Textual form spliced into the surrounding string: strings raw,
/// everything else as its JSON text.
pub(crate) fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
