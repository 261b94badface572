//! Subsystem dispatch.
//!
//! Actions are routed by `target_subsystem` to a registered
//! [`SubsystemHandler`]. Blocking guardrails are checked first. Handler errors
//! become `Failed` results and panics become `Error` results, so nothing a
//! collaborator does can take the kernel down.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

use super::recovery::catch_panic;
use super::types::{ActionStatus, OrchestrationAction, OrchestrationResult};
use crate::notify::{Notification, NotificationBus};
use crate::policy::{blocking_failures, PolicyEngine};
use crate::types::{ActionContext, Error, Result};
use crate::workflow::{StepContext, StepHandler, WorkflowStep};

/// Workflow name used for guardrail checks on actions outside any workflow.
pub const DIRECT_SCOPE: &str = "direct";

/// One handler per subsystem name (drone ops, dispatch, investigations, ...).
#[async_trait]
pub trait SubsystemHandler: Send + Sync {
    async fn handle(&self, action: &OrchestrationAction) -> Result<Value>;
}

/// Fallback for subsystems with no registration: acknowledges and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubSubsystemHandler;

#[async_trait]
impl SubsystemHandler for StubSubsystemHandler {
    async fn handle(&self, action: &OrchestrationAction) -> Result<Value> {
        tracing::debug!(
            "action_stub_executed: action={}, subsystem={}",
            action.action_type,
            action.target_subsystem
        );
        Ok(json!({
            "status": "acknowledged",
            "stub": true,
            "action_type": action.action_type,
            "subsystem": action.target_subsystem,
        }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errored: u64,
    pub blocked: u64,
    pub by_subsystem: HashMap<String, u64>,
}

#[derive(Debug)]
struct DispatchState {
    history: VecDeque<OrchestrationResult>,
    stats: DispatchStats,
}

pub struct ActionDispatcher {
    policy: Arc<PolicyEngine>,
    notifier: Option<Arc<NotificationBus>>,
    handlers: RwLock<HashMap<String, Arc<dyn SubsystemHandler>>>,
    fallback: Arc<dyn SubsystemHandler>,
    history_capacity: usize,
    state: Mutex<DispatchState>,
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("history_capacity", &self.history_capacity)
            .finish_non_exhaustive()
    }
}

impl ActionDispatcher {
    pub fn new(policy: Arc<PolicyEngine>, history_capacity: usize) -> Self {
        Self {
            policy,
            notifier: None,
            handlers: RwLock::new(HashMap::new()),
            fallback: Arc::new(StubSubsystemHandler),
            history_capacity,
            state: Mutex::new(DispatchState {
                history: VecDeque::new(),
                stats: DispatchStats::default(),
            }),
        }
    }

    pub fn with_notifier(mut self, bus: Arc<NotificationBus>) -> Self {
        self.notifier = Some(bus);
        self
    }

    /// Register (or replace) the handler for `subsystem`.
    pub async fn register_handler(
        &self,
        subsystem: impl Into<String>,
        handler: Arc<dyn SubsystemHandler>,
    ) {
        let subsystem = subsystem.into();
        tracing::debug!("Registered subsystem handler: {}", subsystem);
        self.handlers.write().await.insert(subsystem, handler);
    }

    pub async fn unregister_handler(&self, subsystem: &str) -> bool {
        self.handlers.write().await.remove(subsystem).is_some()
    }

    pub async fn subsystems(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one attempt of `action`, updating its status, result and error in
    /// place.
    pub async fn dispatch(
        &self,
        action: &mut OrchestrationAction,
        context: &ActionContext,
    ) -> OrchestrationResult {
        let started = Instant::now();
        action.status = ActionStatus::Running;

        let mut checks = Vec::new();
        if !action.guardrails.is_empty() {
            let scope = action.workflow_id.as_deref().unwrap_or(DIRECT_SCOPE);
            let context = context.merged_with(&action.parameters);
            checks = self
                .policy
                .check_named(&action.guardrails, scope, &action.action_type, &context)
                .await;
        }
        let blocked_by: Vec<String> = blocking_failures(&checks)
            .iter()
            .map(|c| c.binding_name.clone())
            .collect();

        let (status, data, error) = if !blocked_by.is_empty() {
            (
                ActionStatus::Failed,
                None,
                Some(format!("blocked by guardrail: {}", blocked_by.join(", "))),
            )
        } else {
            let handler = self.handler_for(&action.target_subsystem).await;
            let snapshot: &OrchestrationAction = action;
            match catch_panic(handler.handle(snapshot), &snapshot.target_subsystem).await {
                Ok(Ok(value)) => (ActionStatus::Completed, Some(value), None),
                Ok(Err(e)) => (ActionStatus::Failed, None, Some(e.to_string())),
                Err(panic_msg) => (
                    ActionStatus::Error,
                    None,
                    Some(format!("Panic in {}: {}", snapshot.target_subsystem, panic_msg)),
                ),
            }
        };

        let now = Utc::now();
        action.status = status;
        action.result = data.clone();
        action.error = error.clone();
        action.completed_at = Some(now);

        let result = OrchestrationResult {
            action_id: action.id.clone(),
            action_type: action.action_type.clone(),
            target_subsystem: action.target_subsystem.clone(),
            status,
            success: status == ActionStatus::Completed,
            data,
            error,
            blocked_by,
            guardrail_checks: checks,
            attempt: action.retry_count,
            duration_ms: started.elapsed().as_millis() as u64,
            completed_at: now,
        };
        self.record(&result).await;

        match status {
            ActionStatus::Completed => tracing::debug!(
                "action_completed: action={}, type={}, subsystem={}",
                result.action_id,
                result.action_type,
                result.target_subsystem
            ),
            _ => tracing::warn!(
                "action_failed: action={}, type={}, subsystem={}, status={}, error={}",
                result.action_id,
                result.action_type,
                result.target_subsystem,
                status.as_str(),
                result.error.as_deref().unwrap_or_default()
            ),
        }

        if let Some(bus) = &self.notifier {
            bus.publish(Notification::ActionCompleted {
                action_id: result.action_id.clone(),
                action_type: result.action_type.clone(),
                target_subsystem: result.target_subsystem.clone(),
                status,
                success: result.success,
                error: result.error.clone(),
            })
            .await;
        }
        result
    }

    async fn handler_for(&self, subsystem: &str) -> Arc<dyn SubsystemHandler> {
        match self.handlers.read().await.get(subsystem) {
            Some(handler) => handler.clone(),
            None => self.fallback.clone(),
        }
    }

    async fn record(&self, result: &OrchestrationResult) {
        let mut state = self.state.lock().await;
        let stats = &mut state.stats;
        if result.is_blocked() {
            stats.blocked += 1;
        } else {
            stats.dispatched += 1;
            *stats
                .by_subsystem
                .entry(result.target_subsystem.clone())
                .or_insert(0) += 1;
            match result.status {
                ActionStatus::Completed => stats.succeeded += 1,
                ActionStatus::Error => stats.errored += 1,
                _ => stats.failed += 1,
            }
        }
        if state.history.len() >= self.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(result.clone());
    }

    pub async fn stats(&self) -> DispatchStats {
        self.state.lock().await.stats.clone()
    }

    /// Most recent results, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<OrchestrationResult> {
        let state = self.state.lock().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }
}

/// Step handler that turns each workflow step into an action and dispatches
/// it to the step's target subsystem.
///
/// Step guardrails and retries are owned by the workflow engine, so the
/// generated action carries neither.
#[derive(Debug, Clone)]
pub struct DispatchStepHandler {
    dispatcher: Arc<ActionDispatcher>,
}

impl DispatchStepHandler {
    pub fn new(dispatcher: Arc<ActionDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StepHandler for DispatchStepHandler {
    async fn execute(&self, step: &WorkflowStep, context: &StepContext) -> Result<Value> {
        let mut action = OrchestrationAction::new(step.action_type.clone(), step.target_subsystem.clone())
            .with_parameters(step.parameters.clone())
            .with_priority(context.priority)
            .for_workflow(context.instance_id.to_string());
        action.retry_count = step.retry_count;

        let result = self.dispatcher.dispatch(&mut action, &context.action_context).await;
        if result.success {
            Ok(result.data.unwrap_or(Value::Null))
        } else {
            Err(Error::handler(
                result.error.unwrap_or_else(|| "action failed".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyBinding, PolicyType};
    use crate::types::PolicyConfig;

    struct Refusing;

    #[async_trait]
    impl SubsystemHandler for Refusing {
        async fn handle(&self, _action: &OrchestrationAction) -> Result<Value> {
            Err(Error::handler("drone grounded"))
        }
    }

    struct Exploding;

    #[async_trait]
    impl SubsystemHandler for Exploding {
        async fn handle(&self, _action: &OrchestrationAction) -> Result<Value> {
            panic!("controller crashed");
        }
    }

    fn dispatcher() -> (Arc<PolicyEngine>, ActionDispatcher) {
        let policy = Arc::new(PolicyEngine::new(PolicyConfig::default()));
        let dispatcher = ActionDispatcher::new(policy.clone(), 2);
        (policy, dispatcher)
    }

    #[tokio::test]
    async fn test_unregistered_subsystem_uses_stub() {
        let (_, dispatcher) = dispatcher();
        let mut action = OrchestrationAction::new("notify", "cad");
        let result = dispatcher.dispatch(&mut action, &ActionContext::new()).await;
        assert!(result.success);
        assert_eq!(action.status, ActionStatus::Completed);
        assert_eq!(result.data.unwrap()["stub"], true);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic() {
        let (_, dispatcher) = dispatcher();
        dispatcher.register_handler("drone_ops", Arc::new(Refusing)).await;
        dispatcher.register_handler("robotics", Arc::new(Exploding)).await;

        let mut refused = OrchestrationAction::new("launch", "drone_ops");
        let result = dispatcher.dispatch(&mut refused, &ActionContext::new()).await;
        assert_eq!(result.status, ActionStatus::Failed);
        assert!(result.error.unwrap().contains("drone grounded"));

        let mut crashed = OrchestrationAction::new("enter", "robotics");
        let result = dispatcher.dispatch(&mut crashed, &ActionContext::new()).await;
        assert_eq!(result.status, ActionStatus::Error);
        assert!(result.error.unwrap().contains("controller crashed"));

        let stats = dispatcher.stats().await;
        assert_eq!((stats.dispatched, stats.failed, stats.errored), (2, 1, 1));
    }

    #[tokio::test]
    async fn test_blocking_guardrail_skips_handler() {
        let (policy, dispatcher) = dispatcher();
        dispatcher.register_handler("robotics", Arc::new(Exploding)).await;
        policy
            .add_binding(PolicyBinding::new("warrant", PolicyType::Legal).with_requirements(&["warrant_on_file"]))
            .await
            .unwrap();

        let mut action = OrchestrationAction::new("enter", "robotics").with_guardrails(&["warrant"]);
        let result = dispatcher.dispatch(&mut action, &ActionContext::new()).await;
        assert_eq!(result.status, ActionStatus::Failed);
        assert_eq!(result.blocked_by, vec!["warrant"]);

        let stats = dispatcher.stats().await;
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.dispatched, 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (_, dispatcher) = dispatcher();
        for kind in ["a", "b", "c"] {
            let mut action = OrchestrationAction::new(kind, "cad");
            dispatcher.dispatch(&mut action, &ActionContext::new()).await;
        }
        let history = dispatcher.history(10).await;
        let kinds: Vec<&str> = history.iter().map(|r| r.action_type.as_str()).collect();
        assert_eq!(kinds, vec!["b", "c"]);
    }
}
