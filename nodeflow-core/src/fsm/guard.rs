//! Guard condition evaluation against JSON payloads.
//!
//! Guards are pure: the same condition and payload always give the same answer.

use serde_json::Value;
use std::cmp::Ordering;

use crate::error::GuardConditionFailed;
use crate::fsm::definition::Transition;
use crate::models::{GuardCondition, GuardOperator};

/// Resolve a dot-separated path (`order.items.0.sku`) inside a payload
pub fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(payload);
    }

    path.split('.').try_fold(payload, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Evaluate a single condition
pub fn evaluate(condition: &GuardCondition, payload: &Value) -> bool {
    let raw = lookup(payload, &condition.field);
    let actual = raw.filter(|v| !v.is_null());
    let expected = &condition.value;
    // A missing field compares equal to null
    let equal = || values_equal(raw.unwrap_or(&Value::Null), expected);

    match condition.operator {
        GuardOperator::Exists => actual.is_some(),
        GuardOperator::NotExists => actual.is_none(),
        GuardOperator::Equals => equal(),
        GuardOperator::NotEquals => !equal(),
        GuardOperator::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
        GuardOperator::GreaterThanOrEqual => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        GuardOperator::LessThan => compare(actual, expected) == Some(Ordering::Less),
        GuardOperator::LessThanOrEqual => matches!(
            compare(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        GuardOperator::Contains => actual.is_some_and(|a| contains(a, expected)),
        GuardOperator::In => actual.is_some_and(|a| match expected {
            Value::Array(options) => options.iter().any(|o| values_equal(a, o)),
            Value::String(s) => a.as_str().is_some_and(|needle| s.contains(needle)),
            _ => false,
        }),
    }
}

/// Evaluate a transition's guards in order, stopping at the first failure
pub fn check_transition(transition: &Transition, payload: &Value) -> Result<(), GuardConditionFailed> {
    match transition.guards.iter().find(|g| !evaluate(g, payload)) {
        None => Ok(()),
        Some(guard) => Err(GuardConditionFailed {
            from: transition.from.clone(),
            to: transition.to.clone(),
            field: guard.field.clone(),
            operator: guard.operator.to_string(),
            expected: guard.value.clone(),
            actual: lookup(payload, &guard.field).cloned(),
        }),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let actual = actual?;
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}
