//! Policy bindings and guardrail check records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::types::{CheckId, Result};
use crate::validation::validate_non_empty;

/// Category of a binding. Custom checkers are registered per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    Legal,
    Constitutional,
    Ethical,
    Privacy,
    Operational,
    Safety,
}

/// Only `Blocking` failures stop an action; the rest are recorded and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Blocking,
    Warning,
    Advisory,
    Informational,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Blocking => "blocking",
            Severity::Warning => "warning",
            Severity::Advisory => "advisory",
            Severity::Informational => "informational",
        }
    }
}

/// Wildcard accepted in `applicable_workflows` / `applicable_actions`.
pub const WILDCARD: &str = "*";

/// One named guardrail rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub policy_type: PolicyType,
    #[serde(default = "wildcard")]
    pub applicable_workflows: Vec<String>,
    #[serde(default = "wildcard")]
    pub applicable_actions: Vec<String>,
    /// Must all appear in `ActionContext::satisfied_requirements`.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Must not appear in `ActionContext::detected_violations`.
    #[serde(default)]
    pub prohibitions: Vec<String>,
    /// Evaluated against `ActionContext::attributes`.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn wildcard() -> Vec<String> {
    vec![WILDCARD.to_string()]
}

fn enabled() -> bool {
    true
}

impl PolicyBinding {
    /// A blocking binding that applies everywhere and requires nothing.
    pub fn new(name: impl Into<String>, policy_type: PolicyType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            policy_type,
            applicable_workflows: wildcard(),
            applicable_actions: wildcard(),
            requirements: Vec::new(),
            prohibitions: Vec::new(),
            conditions: Vec::new(),
            severity: Severity::Blocking,
            enabled: true,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_requirements(mut self, requirements: &[&str]) -> Self {
        self.requirements = requirements.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_prohibitions(mut self, prohibitions: &[&str]) -> Self {
        self.prohibitions = prohibitions.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn for_workflows(mut self, workflows: &[&str]) -> Self {
        self.applicable_workflows = workflows.iter().map(|w| w.to_string()).collect();
        self
    }

    pub fn for_actions(mut self, actions: &[&str]) -> Self {
        self.applicable_actions = actions.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_non_empty(&self.name, "policy binding name")
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }

    /// Whether both the workflow and the action fall in scope.
    pub fn applies_to(&self, workflow_name: &str, action_type: &str) -> bool {
        in_scope(&self.applicable_workflows, workflow_name) && in_scope(&self.applicable_actions, action_type)
    }
}

fn in_scope(list: &[String], name: &str) -> bool {
    list.iter().any(|item| item == WILDCARD || item == name)
}

/// Result of evaluating one binding. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailCheck {
    pub id: CheckId,
    pub binding_name: String,
    pub policy_type: PolicyType,
    pub severity: Severity,
    pub passed: bool,
    /// 0-100.
    pub score: u8,
    pub message: String,
    pub recommendations: Vec<String>,
    pub workflow_name: String,
    pub action_type: String,
    pub checked_at: DateTime<Utc>,
}

impl GuardrailCheck {
    /// Record for `binding`; scope fields are filled in by the engine.
    pub fn for_binding(binding: &PolicyBinding, passed: bool, score: u8, message: impl Into<String>) -> Self {
        Self {
            id: CheckId::new(),
            binding_name: binding.name.clone(),
            policy_type: binding.policy_type,
            severity: binding.severity,
            passed,
            score: score.min(100),
            message: message.into(),
            recommendations: Vec::new(),
            workflow_name: String::new(),
            action_type: String::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn with_recommendations(mut self, recommendations: Vec<String>) -> Self {
        self.recommendations = recommendations;
        self
    }

    pub fn is_blocking_failure(&self) -> bool {
        !self.passed && self.severity == Severity::Blocking
    }
}

/// The checks that stop an action.
pub fn blocking_failures(checks: &[GuardrailCheck]) -> Vec<&GuardrailCheck> {
    checks.iter().filter(|c| c.is_blocking_failure()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_with_wildcards() {
        let binding = PolicyBinding::new("fourth_amendment", PolicyType::Constitutional)
            .for_workflows(&["surveillance"])
            .for_actions(&["*"]);
        assert!(binding.applies_to("surveillance", "deploy_drone"));
        assert!(!binding.applies_to("traffic_stop", "deploy_drone"));
        assert!(PolicyBinding::new("any", PolicyType::Safety).applies_to("x", "y"));
    }

    #[test]
    fn test_deserialize_defaults() {
        let binding: PolicyBinding = serde_json::from_value(json!({
            "name": "privacy_minimization",
            "policy_type": "privacy",
            "severity": "advisory"
        }))
        .unwrap();
        assert!(binding.enabled);
        assert_eq!(binding.applicable_workflows, vec!["*"]);
        assert!(!binding.is_blocking());
    }

    #[test]
    fn test_blocking_failures_filter() {
        let blocking = PolicyBinding::new("a", PolicyType::Legal);
        let advisory = PolicyBinding::new("b", PolicyType::Legal).with_severity(Severity::Advisory);
        let checks = vec![
            GuardrailCheck::for_binding(&blocking, false, 0, "no"),
            GuardrailCheck::for_binding(&advisory, false, 0, "no"),
            GuardrailCheck::for_binding(&blocking, true, 100, "ok"),
        ];
        let failures = blocking_failures(&checks);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].binding_name, "a");
    }
}
