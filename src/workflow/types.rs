//! Workflow templates, instances and steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::condition::{all_match, Condition};
use crate::fusion::{FusedEvent, RawEvent};
use crate::router::NormalizedEvent;
use crate::types::{Error, InstanceId, Priority, Result};
use crate::validation::{validate_non_empty, validate_positive};

// =============================================================================
// Status machines
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled | WorkflowStatus::Timeout
        )
    }

    /// `pending -> running -> {completed|failed|cancelled|timeout}`, with
    /// `running <-> paused`. Pending and paused instances may be cancelled;
    /// a paused instance whose in-flight steps finish may still terminate.
    pub fn can_transition_to(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Failed)
                | (Paused, Cancelled)
                | (Paused, Timeout)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Timeout,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

// =============================================================================
// Steps
// =============================================================================

/// One action inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub action_type: String,
    #[serde(default)]
    pub target_subsystem: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub guardrails: Vec<String>,
    /// Id of a later sequential step to jump to on success.
    #[serde(default)]
    pub on_success: Option<String>,
    /// Id of a later sequential step to jump to on failure.
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_step_timeout() -> u64 {
    60
}

impl WorkflowStep {
    pub fn new(
        id: impl Into<String>,
        action_type: impl Into<String>,
        target_subsystem: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            action_type: action_type.into(),
            target_subsystem: target_subsystem.into(),
            parameters: Map::new(),
            execution_mode: ExecutionMode::Sequential,
            timeout_seconds: default_step_timeout(),
            max_retries: 0,
            retry_count: 0,
            guardrails: Vec::new(),
            on_success: None,
            on_failure: None,
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn parallel(mut self) -> Self {
        self.execution_mode = ExecutionMode::Parallel;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_guardrails(mut self, names: &[&str]) -> Self {
        self.guardrails = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn on_success(mut self, step_id: impl Into<String>) -> Self {
        self.on_success = Some(step_id.into());
        self
    }

    pub fn on_failure(mut self, step_id: impl Into<String>) -> Self {
        self.on_failure = Some(step_id.into());
        self
    }

    pub fn is_parallel(&self) -> bool {
        self.execution_mode == ExecutionMode::Parallel
    }
}

// =============================================================================
// Triggers
// =============================================================================

/// Event view that workflow triggers are matched against.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub event_types: Vec<String>,
    pub sources: Vec<String>,
    pub priority: Priority,
    /// JSON document for field conditions.
    pub document: Value,
}

impl From<&NormalizedEvent> for TriggerEvent {
    fn from(event: &NormalizedEvent) -> Self {
        Self {
            event_types: vec![event.event_type.clone()],
            sources: vec![event.source_channel.clone(), event.subsystem.clone()],
            priority: event.priority,
            document: event.document(),
        }
    }
}

impl From<&FusedEvent> for TriggerEvent {
    /// A fused event answers to its rule name and to every member type.
    fn from(event: &FusedEvent) -> Self {
        let mut event_types = vec![event.rule_name.clone()];
        event_types.extend(event.event_types.iter().cloned());
        Self {
            event_types,
            sources: event.sources.clone(),
            priority: event.priority,
            document: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }
}

impl From<&RawEvent> for TriggerEvent {
    fn from(event: &RawEvent) -> Self {
        Self {
            event_types: vec![event.event_type.clone()],
            sources: vec![event.source.clone()],
            priority: event.priority,
            document: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }
}

/// Condition under which a template is instantiated. Empty lists match any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl WorkflowTrigger {
    pub fn on_event_types(types: &[&str]) -> Self {
        Self {
            event_types: types.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_sources(mut self, sources: &[&str]) -> Self {
        self.sources = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, event: &TriggerEvent) -> bool {
        let type_ok = self.event_types.is_empty() || event.event_types.iter().any(|t| self.event_types.contains(t));
        let source_ok = self.sources.is_empty() || event.sources.iter().any(|s| self.sources.contains(s));
        type_ok && source_ok && all_match(&self.conditions, &event.document)
    }
}

// =============================================================================
// Templates and instances
// =============================================================================

/// Reusable declarative workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<WorkflowTrigger>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub guardrails: Vec<String>,
    #[serde(default)]
    pub legal_guardrails: Vec<String>,
    #[serde(default)]
    pub ethical_guardrails: Vec<String>,
    /// Falls back to the engine's default timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub priority: Priority,
}

impl WorkflowTemplate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            triggers: Vec::new(),
            steps: Vec::new(),
            guardrails: Vec::new(),
            legal_guardrails: Vec::new(),
            ethical_guardrails: Vec::new(),
            timeout_seconds: None,
            priority: Priority::Medium,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_trigger(mut self, trigger: WorkflowTrigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_guardrails(mut self, names: &[&str]) -> Self {
        self.guardrails = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_legal_guardrails(mut self, names: &[&str]) -> Self {
        self.legal_guardrails = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_ethical_guardrails(mut self, names: &[&str]) -> Self {
        self.ethical_guardrails = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// General, legal and ethical guardrails, de-duplicated in that order.
    pub fn combined_guardrails(&self) -> Vec<String> {
        let mut combined: Vec<String> = Vec::new();
        for name in self
            .guardrails
            .iter()
            .chain(&self.legal_guardrails)
            .chain(&self.ethical_guardrails)
        {
            if !combined.contains(name) {
                combined.push(name.clone());
            }
        }
        combined
    }

    pub fn matches(&self, event: &TriggerEvent) -> bool {
        self.triggers.iter().any(|t| t.matches(event))
    }

    pub fn validate(&self) -> Result<()> {
        validate_non_empty(&self.id, "workflow template id")?;
        if let Some(seconds) = self.timeout_seconds {
            validate_positive(seconds, &format!("workflow {} timeout_seconds", self.id))?;
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(Error::validation(format!("workflow {} has a step without id", self.id)));
            }
            if step.timeout_seconds == 0 {
                return Err(Error::validation(format!(
                    "workflow {} step {} timeout must be positive",
                    self.id, step.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(Error::validation(format!(
                    "workflow {} has duplicate step id {}",
                    self.id, step.id
                )));
            }
        }
        for step in &self.steps {
            for target in step.on_success.iter().chain(&step.on_failure) {
                if !seen.contains(target.as_str()) {
                    return Err(Error::validation(format!(
                        "workflow {} step {} continues to unknown step {}",
                        self.id, step.id, target
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Live, stateful execution of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub template_id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    pub guardrails: Vec<String>,
    pub status: WorkflowStatus,
    pub priority: Priority,
    pub timeout_seconds: u64,
    pub execution_context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowInstance {
    /// Deep copy of the template with `inputs` merged into every step's
    /// parameters (inputs win).
    pub fn from_template(
        template: &WorkflowTemplate,
        inputs: Map<String, Value>,
        default_timeout: u64,
    ) -> Self {
        let steps = template
            .steps
            .iter()
            .cloned()
            .map(|mut step| {
                for (key, value) in &inputs {
                    step.parameters.insert(key.clone(), value.clone());
                }
                step
            })
            .collect();
        Self {
            id: InstanceId::new(),
            template_id: template.id.clone(),
            name: template.name.clone(),
            steps,
            guardrails: template.combined_guardrails(),
            status: WorkflowStatus::Pending,
            priority: template.priority,
            timeout_seconds: template.timeout_seconds.unwrap_or(default_timeout),
            execution_context: inputs,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn steps_with_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Steps that reached a handler or a guardrail check.
    pub fn steps_attempted(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.started_at.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionOp;
    use serde_json::json;

    #[test]
    fn test_status_machine() {
        use WorkflowStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Timeout.is_terminal());
        assert!(!Paused.is_terminal());
    }

    #[test]
    fn test_instance_merges_inputs_into_steps() {
        let template = WorkflowTemplate::new("wf", "Response")
            .with_step(WorkflowStep::new("a", "notify", "dispatch").with_parameter("zone", json!("A")))
            .with_step(WorkflowStep::new("b", "launch", "drone_ops"))
            .with_guardrails(&["g1"])
            .with_legal_guardrails(&["g2", "g1"])
            .with_ethical_guardrails(&["g3"]);
        let mut inputs = Map::new();
        inputs.insert("zone".to_string(), json!("B"));
        inputs.insert("incident".to_string(), json!("I-1"));

        let instance = WorkflowInstance::from_template(&template, inputs.clone(), 300);
        assert_eq!(instance.steps[0].parameters["zone"], json!("B"));
        assert_eq!(instance.steps[1].parameters["incident"], json!("I-1"));
        assert_eq!(instance.guardrails, vec!["g1", "g2", "g3"]);
        assert_eq!(instance.execution_context, inputs);
        assert_eq!(instance.timeout_seconds, 300);
        assert!(template.steps[0].parameters["zone"] == json!("A"), "template untouched");
    }

    #[test]
    fn test_template_validation() {
        let dup = WorkflowTemplate::new("wf", "x")
            .with_step(WorkflowStep::new("a", "t", "s"))
            .with_step(WorkflowStep::new("a", "t", "s"));
        assert!(dup.validate().is_err());
        let dangling = WorkflowTemplate::new("wf", "x").with_step(WorkflowStep::new("a", "t", "s").on_failure("zzz"));
        assert!(dangling.validate().is_err());
        assert!(WorkflowTemplate::new("", "x").validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let instant = WorkflowTemplate::new("wf", "x")
            .with_timeout_seconds(0)
            .with_step(WorkflowStep::new("a", "t", "s"));
        let err = instant.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_seconds must be positive"));

        let step = WorkflowTemplate::new("wf", "x").with_step(WorkflowStep::new("a", "t", "s").with_timeout_seconds(0));
        assert!(step.validate().is_err());
        let fine = WorkflowTemplate::new("wf", "x")
            .with_timeout_seconds(30)
            .with_step(WorkflowStep::new("a", "t", "s").with_timeout_seconds(5));
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn test_trigger_matching() {
        let trigger = WorkflowTrigger::on_event_types(&["gunshot_cluster"])
            .with_condition(Condition::new("confidence", ConditionOp::Gte, json!(70)));
        let hit = TriggerEvent {
            event_types: vec!["gunshot_cluster".into(), "gunshot_detected".into()],
            sources: vec!["acoustic-1".into()],
            priority: Priority::High,
            document: json!({"confidence": 80}),
        };
        let weak = TriggerEvent {
            document: json!({"confidence": 60}),
            ..hit.clone()
        };
        assert!(trigger.matches(&hit));
        assert!(!trigger.matches(&weak));
        assert!(!trigger.clone().with_sources(&["camera"]).matches(&hit));
        assert!(WorkflowTrigger::default().matches(&weak));
    }
}
