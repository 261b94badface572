//! Declarative conditions: field path + operator + value.
//!
//! Routing rules, workflow triggers and policy bindings all describe their
//! predicates with [`Condition`] so that configuration stays serializable and
//! auditable. Paths are dot-separated (`details.zone`); array elements are
//! addressed by index (`entity_ids.0`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    #[default]
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Field value is one of the array `value`.
    In,
    /// Field (string or array) contains `value`.
    Contains,
    Exists,
    NotExists,
}

/// A single predicate over a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(default)]
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: ConditionOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Equality shorthand.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, ConditionOp::Eq, value)
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::new(field, ConditionOp::Exists, Value::Null)
    }

    /// Evaluate against `doc`. Missing fields only satisfy `NotExists`
    /// (and `Ne`).
    pub fn evaluate(&self, doc: &Value) -> bool {
        let found = lookup(doc, &self.field);
        match self.op {
            ConditionOp::Exists => found.is_some_and(|v| !v.is_null()),
            ConditionOp::NotExists => found.map_or(true, Value::is_null),
            ConditionOp::Eq => found.is_some_and(|v| loosely_equal(v, &self.value)),
            ConditionOp::Ne => !found.is_some_and(|v| loosely_equal(v, &self.value)),
            ConditionOp::Gt => compare(found, &self.value).is_some_and(|o| o.is_gt()),
            ConditionOp::Gte => compare(found, &self.value).is_some_and(|o| o.is_ge()),
            ConditionOp::Lt => compare(found, &self.value).is_some_and(|o| o.is_lt()),
            ConditionOp::Lte => compare(found, &self.value).is_some_and(|o| o.is_le()),
            ConditionOp::In => match (&self.value, found) {
                (Value::Array(options), Some(v)) => options.iter().any(|o| loosely_equal(v, o)),
                _ => false,
            },
            ConditionOp::Contains => match found {
                Some(Value::Array(items)) => items.iter().any(|i| loosely_equal(i, &self.value)),
                Some(Value::String(s)) => self.value.as_str().is_some_and(|needle| s.contains(needle)),
                _ => false,
            },
        }
    }
}

/// True when every condition holds (vacuously true for an empty list).
pub fn all_match(conditions: &[Condition], doc: &Value) -> bool {
    conditions.iter().all(|c| c.evaluate(doc))
}

/// Resolve a dot path inside a JSON document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(doc);
    }
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// Numbers compare by value so `2` matches `2.0`.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(found: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let found = found?;
    match (found.as_f64(), expected.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (found.as_str(), expected.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}
