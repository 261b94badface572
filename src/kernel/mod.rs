//! Orchestration kernel - the top-level entry point.
//!
//! The kernel owns the run state, the prioritized action queue and the
//! per-run status map, and wires the engines together:
//!
//! ```text
//!   ingest_event ──► EventFusionBus ──(run_fusion_cycle)──┐
//!        │                                                ▼
//!        └────────► EventRouter ──► WorkflowEngine::check_trigger ──► execute
//!                                          │
//!                                  DispatchStepHandler
//!                                          ▼
//!   queue_action / execute_action ──► ActionDispatcher ──► SubsystemHandler
//! ```
//!
//! Engines are plain services shared through `Arc`; nothing is global.

pub mod dispatcher;
pub mod maintenance;
pub mod queue;
pub mod recovery;
pub mod types;

pub use dispatcher::{
    ActionDispatcher, DispatchStats, DispatchStepHandler, StubSubsystemHandler, SubsystemHandler,
};
pub use maintenance::{MaintenanceReport, MaintenanceService};
pub use queue::ActionQueue;
pub use types::{
    ActionStatus, KernelState, KernelStats, OrchestrationAction, OrchestrationResult, RunState,
    WorkflowRunStatus,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::fusion::{EventFusionBus, FusionResult, FusionStats, RawEvent};
use crate::notify::{Notification, NotificationBus, NotifyStats};
use crate::policy::{PolicyEngine, PolicyStats};
use crate::resources::{AllocationRequest, ResourceAllocation, ResourceManager, ResourceStats};
use crate::router::{EventRouter, NormalizedEvent, RouterStats};
use crate::types::{ActionContext, ActionId, Config, Error, KernelConfig, Result};
use crate::workflow::{
    StepHandler, TriggerEvent, WorkflowEngine, WorkflowInstance, WorkflowStats, WorkflowTemplate,
};

/// Outcome of [`OrchestrationKernel::ingest_event`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    /// False when the fusion bus rejected the event (rate limit or debounce).
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<NormalizedEvent>,
    pub workflows: Vec<WorkflowInstance>,
}

/// Outcome of one fusion cycle.
#[derive(Debug, Clone, Serialize)]
pub struct FusionCycle {
    pub result: FusionResult,
    pub workflows: Vec<WorkflowInstance>,
}

/// Point-in-time view across every engine.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub state: KernelState,
    pub queued_actions: usize,
    pub kernel: KernelStats,
    pub dispatch: DispatchStats,
    pub fusion: FusionStats,
    pub router: RouterStats,
    pub policy: PolicyStats,
    pub workflows: WorkflowStats,
    pub resources: ResourceStats,
    pub notifications: NotifyStats,
}

pub struct OrchestrationKernel {
    config: KernelConfig,
    state: RwLock<KernelState>,
    notifier: Arc<NotificationBus>,
    fusion: Arc<EventFusionBus>,
    router: Arc<EventRouter>,
    policy: Arc<PolicyEngine>,
    workflows: Arc<WorkflowEngine>,
    resources: Arc<Mutex<ResourceManager>>,
    dispatcher: Arc<ActionDispatcher>,
    queue: Mutex<ActionQueue>,
    runs: RwLock<HashMap<String, WorkflowRunStatus>>,
    stats: Mutex<KernelStats>,
}

impl std::fmt::Debug for OrchestrationKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationKernel")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrchestrationKernel {
    /// Construct every engine from `config`. The kernel starts `Idle`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let notifier = Arc::new(NotificationBus::new());
        let policy = Arc::new(PolicyEngine::new(config.policy.clone()));
        let dispatcher = Arc::new(
            ActionDispatcher::new(policy.clone(), config.kernel.history_capacity)
                .with_notifier(notifier.clone()),
        );
        let workflows = Arc::new(
            WorkflowEngine::new(config.workflow.clone(), policy.clone())
                .with_notifier(notifier.clone())
                .with_default_handler(Arc::new(DispatchStepHandler::new(dispatcher.clone()))),
        );

        Ok(Self {
            config: config.kernel.clone(),
            state: RwLock::new(KernelState::Idle),
            fusion: Arc::new(EventFusionBus::new(config.fusion.clone())),
            router: Arc::new(EventRouter::new(config.router.clone())),
            resources: Arc::new(Mutex::new(ResourceManager::new(config.resources.clone()))),
            notifier,
            policy,
            workflows,
            dispatcher,
            queue: Mutex::new(ActionQueue::new()),
            runs: RwLock::new(HashMap::new()),
            stats: Mutex::new(KernelStats::default()),
        })
    }

    // =========================================================================
    // Engines
    // =========================================================================

    pub fn fusion(&self) -> &Arc<EventFusionBus> {
        &self.fusion
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    /// The Resource Manager. Lock it for multi-step read-check-then-write
    /// sequences; single operations are also exposed on the kernel.
    pub fn resources(&self) -> &Arc<Mutex<ResourceManager>> {
        &self.resources
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn notifications(&self) -> &Arc<NotificationBus> {
        &self.notifier
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn state(&self) -> KernelState {
        *self.state.read().await
    }

    /// `idle`/`stopped` → `initializing` → `running`.
    pub async fn start(&self) -> Result<()> {
        self.transition(KernelState::Initializing).await?;
        tracing::info!(
            "kernel_initializing: fusion_rules={}, routing_rules={}, templates={}",
            self.fusion.rules().await.len(),
            self.router.rules().await.len(),
            self.workflows.templates().await.len()
        );
        self.transition(KernelState::Running).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.transition(KernelState::Paused).await
    }

    pub async fn resume(&self) -> Result<()> {
        if self.state().await != KernelState::Paused {
            return Err(Error::state_transition("kernel is not paused"));
        }
        self.transition(KernelState::Running).await
    }

    /// `running`/`paused`/`error` → `stopping` → `stopped`. Queued actions
    /// are discarded.
    pub async fn stop(&self) -> Result<()> {
        self.transition(KernelState::Stopping).await?;
        let discarded = self.queue.lock().await.clear();
        if discarded > 0 {
            tracing::warn!("kernel_queue_discarded: count={}", discarded);
        }
        self.transition(KernelState::Stopped).await
    }

    /// Enter `error` after an unrecoverable fault.
    pub async fn fail(&self, reason: &str) -> Result<()> {
        tracing::error!("kernel_fault: reason={}", reason);
        self.transition(KernelState::Error).await
    }

    async fn transition(&self, to: KernelState) -> Result<()> {
        let from = {
            let mut state = self.state.write().await;
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(Error::state_transition(format!(
                    "kernel cannot move from {} to {}",
                    from.as_str(),
                    to.as_str()
                )));
            }
            *state = to;
            from
        };
        tracing::info!("kernel_state_changed: from={}, to={}", from.as_str(), to.as_str());
        self.notifier
            .publish(Notification::KernelStateChanged { from, to })
            .await;
        Ok(())
    }

    async fn require_state(
        &self,
        allowed: impl Fn(KernelState) -> bool,
        operation: &str,
    ) -> Result<()> {
        let state = self.state().await;
        if allowed(state) {
            Ok(())
        } else {
            Err(Error::state_transition(format!(
                "{} not allowed while kernel is {}",
                operation,
                state.as_str()
            )))
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register the handler for a subsystem name. Unregistered subsystems
    /// fall back to a stub that acknowledges the action.
    pub async fn register_handler(
        &self,
        subsystem: impl Into<String>,
        handler: Arc<dyn SubsystemHandler>,
    ) {
        self.dispatcher.register_handler(subsystem, handler).await;
    }

    /// Register a step handler that bypasses subsystem dispatch for one
    /// action type.
    pub async fn register_step_handler(
        &self,
        action_type: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) {
        self.workflows.register_handler(action_type, handler).await;
    }

    pub async fn register_template(&self, template: WorkflowTemplate) -> Result<()> {
        self.workflows.register_template(template).await
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Queue an action. Allowed while running or paused.
    pub async fn queue_action(&self, action: OrchestrationAction) -> Result<ActionId> {
        self.require_state(KernelState::accepts_actions, "queue_action").await?;
        let id = action.id.clone();
        tracing::debug!(
            "action_queued: action={}, type={}, priority={}",
            id,
            action.action_type,
            action.priority.level()
        );
        self.queue.lock().await.push(action);
        self.stats.lock().await.actions_queued += 1;
        Ok(id)
    }

    pub async fn queued_actions(&self) -> Vec<OrchestrationAction> {
        self.queue.lock().await.snapshot()
    }

    /// Drain the queue in priority order, one action at a time. Stops early
    /// if the kernel leaves `running`; the rest stay queued.
    pub async fn process_queue(&self) -> Result<Vec<OrchestrationResult>> {
        self.require_state(|s| s == KernelState::Running, "process_queue").await?;
        let mut results = Vec::new();
        loop {
            if self.state().await != KernelState::Running {
                break;
            }
            let next = self.queue.lock().await.pop();
            let Some(action) = next else {
                break;
            };
            results.push(self.execute_action(action).await);
        }
        Ok(results)
    }

    /// Dispatch one action once. Its parameters double as the guardrail
    /// context.
    pub async fn execute_action(&self, action: OrchestrationAction) -> OrchestrationResult {
        self.execute_action_with(action, &ActionContext::new()).await
    }

    pub async fn execute_action_with(
        &self,
        mut action: OrchestrationAction,
        context: &ActionContext,
    ) -> OrchestrationResult {
        self.dispatcher.dispatch(&mut action, context).await
    }

    /// Run `actions` in order, retrying each failed one up to its own
    /// `max_retries`. The run stops at the first action that fails
    /// terminally. Guardrail refusals are not retried.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        actions: Vec<OrchestrationAction>,
    ) -> WorkflowRunStatus {
        let run = WorkflowRunStatus::started(workflow_id, actions.len());
        self.runs.write().await.insert(workflow_id.to_string(), run);
        self.stats.lock().await.action_runs += 1;
        tracing::info!("action_run_started: workflow={}, actions={}", workflow_id, actions.len());

        let context = ActionContext::new();
        let mut failed = false;
        for mut action in actions {
            if action.workflow_id.is_none() {
                action.workflow_id = Some(workflow_id.to_string());
            }
            self.update_run(workflow_id, |run| run.current_action = Some(action.id.clone()))
                .await;

            let result = loop {
                let result = self.dispatcher.dispatch(&mut action, &context).await;
                let exhausted = action.retry_count >= action.max_retries;
                if result.success || result.is_blocked() || exhausted {
                    break result;
                }
                action.retry_count += 1;
                tracing::debug!(
                    "action_retry: workflow={}, action={}, attempt={}",
                    workflow_id,
                    action.id,
                    action.retry_count
                );
            };

            let success = result.success;
            self.update_run(workflow_id, |run| {
                if success {
                    run.actions_completed += 1;
                } else {
                    run.actions_failed += 1;
                }
                run.results.push(result);
            })
            .await;
            if !success {
                failed = true;
                break;
            }
        }

        let state = if failed { RunState::Failed } else { RunState::Completed };
        self.update_run(workflow_id, |run| {
            run.state = state;
            run.current_action = None;
            run.completed_at = Some(Utc::now());
        })
        .await;
        tracing::info!("action_run_finished: workflow={}, state={:?}", workflow_id, state);

        self.get_workflow_status(workflow_id)
            .await
            .unwrap_or_else(|| WorkflowRunStatus::started(workflow_id, 0))
    }

    async fn update_run(&self, workflow_id: &str, f: impl FnOnce(&mut WorkflowRunStatus)) {
        if let Some(run) = self.runs.write().await.get_mut(workflow_id) {
            f(run);
        }
    }

    pub async fn get_workflow_status(&self, workflow_id: &str) -> Option<WorkflowRunStatus> {
        self.runs.read().await.get(workflow_id).cloned()
    }

    /// Forget finished runs that completed more than `retention` ago.
    /// Runs still in progress are kept.
    pub async fn prune_runs(&self, retention: std::time::Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, run| !run.completed_at.is_some_and(|at| at <= cutoff));
        let pruned = before - runs.len();
        if pruned > 0 {
            tracing::debug!("action_runs_pruned: count={}", pruned);
        }
        pruned
    }

    /// Most recent action results, oldest first.
    pub async fn action_history(&self, limit: usize) -> Vec<OrchestrationResult> {
        self.dispatcher.history(limit).await
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Inbound event boundary: validate, buffer for fusion, normalize and
    /// route, then instantiate and run any triggered workflows.
    ///
    /// Events the fusion bus rejects as noise are not routed.
    pub async fn ingest_event(&self, source: &str, event: &Value) -> Result<IngestOutcome> {
        self.require_state(|s| s == KernelState::Running, "ingest_event").await?;
        let raw = RawEvent::from_json(source, event)?;

        if !self.fusion.ingest(raw).await {
            self.stats.lock().await.events_rejected += 1;
            return Ok(IngestOutcome {
                accepted: false,
                event: None,
                workflows: Vec::new(),
            });
        }
        self.stats.lock().await.events_ingested += 1;

        let subsystem = event
            .get("subsystem")
            .and_then(Value::as_str)
            .unwrap_or(source);
        let normalized = self.router.normalize_and_route(event, source, subsystem).await;
        self.notifier
            .publish(Notification::EventRouted {
                event_id: normalized.id.clone(),
                event_type: normalized.event_type.clone(),
                category: normalized.category,
                routed_to: normalized.routed_to.clone(),
            })
            .await;

        let workflows = self.trigger_workflows(&TriggerEvent::from(&normalized)).await;
        Ok(IngestOutcome {
            accepted: true,
            event: Some(normalized),
            workflows,
        })
    }

    /// Fuse the buffers whose flush condition is met and run the workflows
    /// the fused events trigger.
    pub async fn run_fusion_cycle(&self) -> Result<FusionCycle> {
        self.require_state(|s| s == KernelState::Running, "run_fusion_cycle").await?;
        let result = self.fusion.fuse(None).await;
        Ok(self.complete_fusion_cycle(result).await)
    }

    /// Like [`Self::run_fusion_cycle`] but drains every buffer.
    pub async fn flush_fusion(&self) -> Result<FusionCycle> {
        self.require_state(|s| s == KernelState::Running, "flush_fusion").await?;
        let result = self.fusion.fuse_all().await;
        Ok(self.complete_fusion_cycle(result).await)
    }

    async fn complete_fusion_cycle(&self, result: FusionResult) -> FusionCycle {
        self.stats.lock().await.fusion_cycles += 1;
        if result.processed_count > 0 {
            self.notifier
                .publish(Notification::FusionCompleted {
                    fused_events: result.fused_events.clone(),
                    unfused_count: result.unfused_events.len(),
                    processed_count: result.processed_count,
                })
                .await;
        }
        let mut workflows = Vec::new();
        for fused in &result.fused_events {
            workflows.extend(self.trigger_workflows(&TriggerEvent::from(fused)).await);
        }
        FusionCycle { result, workflows }
    }

    async fn trigger_workflows(&self, event: &TriggerEvent) -> Vec<WorkflowInstance> {
        let created = self.workflows.check_trigger(event).await;
        if created.is_empty() {
            return created;
        }
        self.stats.lock().await.workflows_triggered += created.len() as u64;

        let attributes: Map<String, Value> =
            event.document.as_object().cloned().unwrap_or_default();
        let context = ActionContext::new().merged_with(&attributes);
        let mut finished = Vec::with_capacity(created.len());
        for instance in created {
            match self.workflows.execute(&instance.id, &context).await {
                Ok(done) => finished.push(done),
                Err(e) => {
                    tracing::error!(
                        "triggered_workflow_failed: instance={}, error={}",
                        instance.id,
                        e
                    );
                    finished.push(instance);
                }
            }
        }
        finished
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Allocate under the manager lock and publish the change. `None` is
    /// ordinary contention, not an error.
    pub async fn allocate_resource(
        &self,
        request: AllocationRequest,
    ) -> Option<ResourceAllocation> {
        let (allocation, preempted) = {
            let mut manager = self.resources.lock().await;
            let previous = manager.active_allocation(&request.resource_id).cloned();
            let allocation = manager.allocate(request)?;
            let preempted = previous.and_then(|prev| {
                manager
                    .allocations_for(&allocation.resource_id)
                    .into_iter()
                    .find(|a| a.id == prev.id)
            });
            (allocation, preempted)
        };

        if let Some(released) = preempted {
            self.notifier
                .publish(Notification::ResourceReleased { allocation: released })
                .await;
        }
        self.notifier
            .publish(Notification::ResourceAllocated {
                allocation: allocation.clone(),
            })
            .await;
        Some(allocation)
    }

    pub async fn release_resource(&self, resource_id: &str) -> Option<ResourceAllocation> {
        let released = self.resources.lock().await.release(resource_id)?;
        self.notifier
            .publish(Notification::ResourceReleased {
                allocation: released.clone(),
            })
            .await;
        Some(released)
    }

    /// Close allocations whose window ended before `now`.
    pub async fn expire_allocations(&self, now: DateTime<Utc>) -> Vec<ResourceAllocation> {
        let expired = self.resources.lock().await.expire_allocations(now);
        for allocation in &expired {
            self.notifier
                .publish(Notification::ResourceReleased {
                    allocation: allocation.clone(),
                })
                .await;
        }
        expired
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn stats(&self) -> KernelStats {
        self.stats.lock().await.clone()
    }

    pub async fn status(&self) -> KernelStatus {
        KernelStatus {
            state: self.state().await,
            queued_actions: self.queue.lock().await.len(),
            kernel: self.stats().await,
            dispatch: self.dispatcher.stats().await,
            fusion: self.fusion.stats().await,
            router: self.router.stats().await,
            policy: self.policy.stats().await,
            workflows: self.workflows.stats().await,
            resources: self.resources.lock().await.stats(),
            notifications: self.notifier.stats().await,
        }
    }
}
