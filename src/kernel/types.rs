//! Kernel types: KernelState, OrchestrationAction, results and run tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::policy::GuardrailCheck;
use crate::types::{ActionId, Priority};

/// Kernel run state.
///
/// State transitions:
/// ```text
/// IDLE → INITIALIZING → RUNNING ⇄ PAUSED → STOPPING → STOPPED
///              ↓           ↓
///            ERROR ← ─ ─ ─ ┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    #[default]
    Idle,
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl KernelState {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelState::Idle => "idle",
            KernelState::Initializing => "initializing",
            KernelState::Running => "running",
            KernelState::Paused => "paused",
            KernelState::Stopping => "stopping",
            KernelState::Stopped => "stopped",
            KernelState::Error => "error",
        }
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: KernelState) -> bool {
        match (self, to) {
            (KernelState::Idle, KernelState::Initializing) => true,
            (KernelState::Initializing, KernelState::Running) => true,
            (KernelState::Initializing, KernelState::Error) => true,
            (KernelState::Running, KernelState::Paused) => true,
            (KernelState::Running, KernelState::Stopping) => true,
            (KernelState::Running, KernelState::Error) => true,
            (KernelState::Paused, KernelState::Running) => true,
            (KernelState::Paused, KernelState::Stopping) => true,
            (KernelState::Error, KernelState::Stopping) => true,
            (KernelState::Stopping, KernelState::Stopped) => true,
            // Restart after a clean stop
            (KernelState::Stopped, KernelState::Initializing) => true,
            _ => false,
        }
    }

    /// States in which new actions may be queued.
    pub fn accepts_actions(self) -> bool {
        matches!(self, KernelState::Running | KernelState::Paused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Completed,
    /// Handler reported failure, or a blocking guardrail refused the action.
    Failed,
    /// Handler panicked.
    Error,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Queued => "queued",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Error => "error",
        }
    }
}

/// One dispatchable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationAction {
    pub id: ActionId,
    pub action_type: String,
    pub target_subsystem: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub guardrails: Vec<String>,
    /// Workflow this action belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrchestrationAction {
    pub fn new(action_type: impl Into<String>, target_subsystem: impl Into<String>) -> Self {
        Self {
            id: ActionId::new(),
            action_type: action_type.into(),
            target_subsystem: target_subsystem.into(),
            parameters: Map::new(),
            priority: Priority::default(),
            guardrails: Vec::new(),
            workflow_id: None,
            retry_count: 0,
            max_retries: 0,
            status: ActionStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_guardrails(mut self, names: &[&str]) -> Self {
        self.guardrails = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn for_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

/// Outcome of dispatching one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub action_id: ActionId,
    pub action_type: String,
    pub target_subsystem: String,
    pub status: ActionStatus,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Blocking guardrails that refused the action. Empty when it ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guardrail_checks: Vec<GuardrailCheck>,
    pub attempt: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl OrchestrationResult {
    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

/// Live progress of an action sequence run through `execute_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunStatus {
    pub workflow_id: String,
    pub state: RunState,
    pub actions_total: usize,
    pub actions_completed: usize,
    pub actions_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_action: Option<ActionId>,
    pub results: Vec<OrchestrationResult>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRunStatus {
    pub(crate) fn started(workflow_id: impl Into<String>, actions_total: usize) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            state: RunState::Running,
            actions_total,
            actions_completed: 0,
            actions_failed: 0,
            current_action: None,
            results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Fraction of actions completed, 0.0..=1.0.
    pub fn progress(&self) -> f64 {
        if self.actions_total == 0 {
            return 1.0;
        }
        self.actions_completed as f64 / self.actions_total as f64
    }
}

/// Kernel-level counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelStats {
    pub events_ingested: u64,
    pub events_rejected: u64,
    pub fusion_cycles: u64,
    pub workflows_triggered: u64,
    pub actions_queued: u64,
    pub action_runs: u64,
}
