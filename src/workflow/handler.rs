//! Step handler seam.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::types::WorkflowStep;
use crate::types::{ActionContext, InstanceId, Priority, Result};

/// What a handler sees of the instance running its step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub instance_id: InstanceId,
    pub workflow_name: String,
    pub priority: Priority,
    pub execution_context: Map<String, Value>,
    pub action_context: ActionContext,
    /// Long-running handlers should stop early once this fires.
    pub cancellation: CancellationToken,
}

/// Executes one workflow step, keyed by `action_type`.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, step: &WorkflowStep, context: &StepContext) -> Result<Value>;
}

/// Acknowledges every step without side effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubStepHandler;

#[async_trait]
impl StepHandler for StubStepHandler {
    async fn execute(&self, step: &WorkflowStep, _context: &StepContext) -> Result<Value> {
        tracing::debug!(
            "step_stub_executed: step={}, action_type={}, subsystem={}",
            step.id,
            step.action_type,
            step.target_subsystem
        );
        Ok(json!({
            "status": "acknowledged",
            "stub": true,
            "action_type": step.action_type,
        }))
    }
}
