//! Execution context passed to guardrail checkers and step handlers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Facts a caller asserts about a proposed action.
///
/// `satisfied_requirements` and `detected_violations` drive the default
/// guardrail checker; `attributes` is the document that declarative
/// conditions are evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionContext {
    #[serde(default)]
    pub satisfied_requirements: BTreeSet<String>,
    #[serde(default)]
    pub detected_violations: BTreeSet<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ActionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.satisfied_requirements.insert(requirement.into());
        self
    }

    pub fn with_violation(mut self, violation: impl Into<String>) -> Self {
        self.detected_violations.insert(violation.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Attributes as a JSON object, for condition evaluation.
    pub fn document(&self) -> Value {
        Value::Object(self.attributes.clone())
    }

    /// Copy of this context with `extra` merged underneath: existing
    /// attributes win over `extra`.
    pub fn merged_with(&self, extra: &Map<String, Value>) -> Self {
        let mut merged = self.clone();
        for (key, value) in extra {
            merged
                .attributes
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_existing_attributes() {
        let ctx = ActionContext::new().with_attribute("zone", json!("north"));
        let mut extra = Map::new();
        extra.insert("zone".to_string(), json!("south"));
        extra.insert("unit".to_string(), json!(7));

        let merged = ctx.merged_with(&extra);
        assert_eq!(merged.attributes["zone"], json!("north"));
        assert_eq!(merged.attributes["unit"], json!(7));
    }

    #[test]
    fn test_deserializes_with_missing_sections() {
        let ctx: ActionContext =
            serde_json::from_value(json!({"satisfied_requirements": ["warrant"]})).unwrap();
        assert!(ctx.satisfied_requirements.contains("warrant"));
        assert!(ctx.detected_violations.is_empty());
    }
}
