//! Workflow execution engine.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::audit::{AuditEntry, AuditLog};
use super::handler::{StepContext, StepHandler, StubStepHandler};
use super::types::{
    StepStatus, TriggerEvent, WorkflowInstance, WorkflowStatus, WorkflowStep, WorkflowTemplate,
};
use crate::kernel::recovery::catch_panic;
use crate::notify::{Notification, NotificationBus};
use crate::policy::{blocking_failures, PolicyEngine};
use crate::types::{ActionContext, Error, InstanceId, Result, WorkflowConfig};

/// Action type recorded for workflow-level guardrail checks.
pub const WORKFLOW_SCOPE: &str = "workflow";

/// Instance lifecycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub instances_created: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub steps_executed: u64,
    pub step_retries: u64,
}

/// Cancellation and pause signals for one instance.
#[derive(Debug, Clone)]
struct InstanceControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl InstanceControl {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    /// Block while paused. Returns false once cancelled.
    async fn wait_while_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}

enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Registry of templates, live instances and step handlers.
pub struct WorkflowEngine {
    config: WorkflowConfig,
    policy: Arc<PolicyEngine>,
    notifier: Option<Arc<NotificationBus>>,
    templates: RwLock<Vec<WorkflowTemplate>>,
    instances: RwLock<HashMap<InstanceId, WorkflowInstance>>,
    controls: Mutex<HashMap<InstanceId, InstanceControl>>,
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
    default_handler: RwLock<Arc<dyn StepHandler>>,
    audit: Mutex<AuditLog>,
    stats: Mutex<WorkflowStats>,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    pub fn new(config: WorkflowConfig, policy: Arc<PolicyEngine>) -> Self {
        let audit = AuditLog::new(config.audit_capacity);
        Self {
            config,
            policy,
            notifier: None,
            templates: RwLock::new(Vec::new()),
            instances: RwLock::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(Arc::new(StubStepHandler)),
            audit: Mutex::new(audit),
            stats: Mutex::new(WorkflowStats::default()),
        }
    }

    /// Publish instance transitions on `bus`.
    pub fn with_notifier(mut self, bus: Arc<NotificationBus>) -> Self {
        self.notifier = Some(bus);
        self
    }

    /// Replace the stub fallback handler at construction time.
    pub fn with_default_handler(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.default_handler = RwLock::new(handler);
        self
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub async fn register_template(&self, template: WorkflowTemplate) -> Result<()> {
        template.validate()?;
        let mut templates = self.templates.write().await;
        if templates.iter().any(|t| t.id == template.id) {
            return Err(Error::validation(format!(
                "workflow template already registered: {}",
                template.id
            )));
        }
        tracing::debug!("Registered workflow template: {}", template.id);
        templates.push(template);
        Ok(())
    }

    pub async fn unregister_template(&self, template_id: &str) -> bool {
        let mut templates = self.templates.write().await;
        let before = templates.len();
        templates.retain(|t| t.id != template_id);
        templates.len() != before
    }

    pub async fn get_template(&self, template_id: &str) -> Option<WorkflowTemplate> {
        self.templates
            .read()
            .await
            .iter()
            .find(|t| t.id == template_id)
            .cloned()
    }

    pub async fn templates(&self) -> Vec<WorkflowTemplate> {
        self.templates.read().await.clone()
    }

    /// Handler for steps whose `action_type` matches.
    pub async fn register_handler(
        &self,
        action_type: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) {
        let action_type = action_type.into();
        tracing::debug!("Registered step handler: {}", action_type);
        self.handlers.write().await.insert(action_type, handler);
    }

    /// Handler for action types with no registration of their own.
    pub async fn set_default_handler(&self, handler: Arc<dyn StepHandler>) {
        *self.default_handler.write().await = handler;
    }

    async fn handler_for(&self, action_type: &str) -> Arc<dyn StepHandler> {
        if let Some(handler) = self.handlers.read().await.get(action_type) {
            return handler.clone();
        }
        self.default_handler.read().await.clone()
    }

    // =========================================================================
    // Instances
    // =========================================================================

    pub async fn create_instance(
        &self,
        template_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowInstance> {
        let template = self
            .get_template(template_id)
            .await
            .ok_or_else(|| {
                Error::not_found(format!("workflow template not found: {}", template_id))
            })?;
        let default_timeout = self.config.default_timeout.as_secs();
        let instance = WorkflowInstance::from_template(&template, inputs, default_timeout);

        self.controls
            .lock()
            .await
            .insert(instance.id.clone(), InstanceControl::new());
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        self.stats.lock().await.instances_created += 1;
        let created = AuditEntry::new(&instance.id, "workflow_created", WorkflowStatus::Pending.as_str());
        self.audit(created).await;
        tracing::info!(
            "workflow_created: instance={}, template={}, steps={}",
            instance.id,
            template_id,
            instance.steps.len()
        );
        Ok(instance)
    }

    pub async fn get_instance(&self, instance_id: &InstanceId) -> Option<WorkflowInstance> {
        self.instances.read().await.get(instance_id).cloned()
    }

    pub async fn instances(&self) -> Vec<WorkflowInstance> {
        let mut all: Vec<WorkflowInstance> =
            self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub async fn instances_with_status(&self, status: WorkflowStatus) -> Vec<WorkflowInstance> {
        self.instances()
            .await
            .into_iter()
            .filter(|i| i.status == status)
            .collect()
    }

    /// One new instance per template with a matching trigger, in
    /// registration order.
    pub async fn check_trigger(&self, event: &TriggerEvent) -> Vec<WorkflowInstance> {
        let matching: Vec<String> = self
            .templates
            .read()
            .await
            .iter()
            .filter(|t| t.matches(event))
            .map(|t| t.id.clone())
            .collect();

        let mut created = Vec::with_capacity(matching.len());
        for template_id in matching {
            let mut inputs = Map::new();
            if let Some(event_type) = event.event_types.first() {
                inputs.insert("trigger_event_type".to_string(), Value::String(event_type.clone()));
            }
            inputs.insert("trigger_event".to_string(), event.document.clone());
            match self.create_instance(&template_id, inputs).await {
                Ok(instance) => created.push(instance),
                Err(e) => {
                    tracing::warn!("workflow_trigger_failed: template={}, error={}", template_id, e)
                }
            }
        }
        created
    }

    /// Create an instance from `template_id` and run it to completion.
    pub async fn execute_template(
        &self,
        template_id: &str,
        inputs: Map<String, Value>,
        context: &ActionContext,
    ) -> Result<WorkflowInstance> {
        let instance = self.create_instance(template_id, inputs).await?;
        self.execute(&instance.id, context).await
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run a pending instance: workflow guardrails, then sequential steps,
    /// then the parallel set, all under the instance timeout.
    pub async fn execute(
        &self,
        instance_id: &InstanceId,
        context: &ActionContext,
    ) -> Result<WorkflowInstance> {
        let instance = self
            .get_instance(instance_id)
            .await
            .ok_or_else(|| {
                Error::not_found(format!("workflow instance not found: {}", instance_id))
            })?;
        if instance.status != WorkflowStatus::Pending {
            return Err(Error::state_transition(format!(
                "workflow instance {} is {}, expected pending",
                instance_id,
                instance.status.as_str()
            )));
        }
        let control = self
            .controls
            .lock()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| {
                Error::internal(format!("no control block for instance {}", instance_id))
            })?;

        self.transition(instance_id, WorkflowStatus::Running, None, None).await?;
        let action_context = context.merged_with(&instance.execution_context);

        if !instance.guardrails.is_empty() {
            let checks = self
                .policy
                .check_named(&instance.guardrails, &instance.name, WORKFLOW_SCOPE, &action_context)
                .await;
            let blocked: Vec<String> = blocking_failures(&checks)
                .iter()
                .map(|c| c.binding_name.clone())
                .collect();
            if !blocked.is_empty() {
                let reason = format!("blocked by guardrail: {}", blocked.join(", "));
                self.audit(
                    AuditEntry::new(
                        instance_id,
                        "workflow_guardrail_blocked",
                        WorkflowStatus::Failed.as_str(),
                    )
                    .with_detail(Some(reason.clone())),
                )
                .await;
                let all: Vec<usize> = (0..instance.steps.len()).collect();
                self.skip_steps(instance_id, &all).await;
                self.finish(instance_id, WorkflowStatus::Failed, Some(reason)).await;
                return self.snapshot(instance_id).await;
            }
        }

        let scope = StepContext {
            instance_id: instance_id.clone(),
            workflow_name: instance.name.clone(),
            priority: instance.priority,
            execution_context: instance.execution_context.clone(),
            action_context,
            cancellation: control.cancel.clone(),
        };
        let budget = Duration::from_secs(instance.timeout_seconds);

        let run = self.run_steps(&instance.steps, &scope, &control);
        match tokio::time::timeout(budget, run).await {
            Ok(RunOutcome::Completed) => {
                self.finish(instance_id, WorkflowStatus::Completed, None).await;
            }
            Ok(RunOutcome::Failed(reason)) => {
                self.finish(instance_id, WorkflowStatus::Failed, Some(reason)).await;
            }
            Ok(RunOutcome::Cancelled) => {}
            Err(_) => {
                self.interrupt_steps(instance_id).await;
                self.finish(
                    instance_id,
                    WorkflowStatus::Timeout,
                    Some(format!("workflow exceeded {}s", instance.timeout_seconds)),
                )
                .await;
            }
        }
        self.snapshot(instance_id).await
    }

    /// Sequential steps run first, one at a time; the parallel group is
    /// dispatched only after they finish. Parallel steps are therefore never
    /// in flight when a sequential step fails, and a terminal sequential
    /// failure skips the whole parallel group.
    async fn run_steps(
        &self,
        steps: &[WorkflowStep],
        scope: &StepContext,
        control: &InstanceControl,
    ) -> RunOutcome {
        let id = &scope.instance_id;
        let sequential: Vec<usize> =
            (0..steps.len()).filter(|&i| !steps[i].is_parallel()).collect();
        let parallel: Vec<usize> = (0..steps.len()).filter(|&i| steps[i].is_parallel()).collect();

        let mut failure: Option<String> = None;
        let mut cursor = 0;
        while cursor < sequential.len() {
            if !control.wait_while_paused().await {
                self.skip_steps(id, &sequential[cursor..]).await;
                self.skip_steps(id, &parallel).await;
                return RunOutcome::Cancelled;
            }

            let idx = sequential[cursor];
            let step = &steps[idx];
            let status = self.run_step(idx, step.clone(), scope).await;
            let continuation = if status == StepStatus::Completed {
                step.on_success.as_ref()
            } else {
                step.on_failure.as_ref()
            };

            let target = continuation.and_then(|target| {
                let pos = sequential.iter().position(|&i| &steps[i].id == target);
                match pos {
                    Some(pos) if pos > cursor => Some(pos),
                    _ => {
                        tracing::warn!(
                            "workflow_continuation_ignored: instance={}, step={}, target={}",
                            id,
                            step.id,
                            target
                        );
                        None
                    }
                }
            });

            if status.is_failure() && target.is_none() {
                failure = Some(format!("step {} {}", step.id, status.as_str()));
                self.skip_steps(id, &sequential[cursor + 1..]).await;
                break;
            }
            cursor = match target {
                Some(pos) => {
                    self.skip_steps(id, &sequential[cursor + 1..pos]).await;
                    pos
                }
                None => cursor + 1,
            };
        }

        if control.cancel.is_cancelled() {
            self.skip_steps(id, &parallel).await;
            return RunOutcome::Cancelled;
        }
        if let Some(reason) = failure {
            self.skip_steps(id, &parallel).await;
            return RunOutcome::Failed(reason);
        }

        if !parallel.is_empty() {
            if !control.wait_while_paused().await {
                self.skip_steps(id, &parallel).await;
                return RunOutcome::Cancelled;
            }
            // Every future is created before any is polled.
            let runs = parallel
                .iter()
                .map(|&idx| self.run_step(idx, steps[idx].clone(), scope));
            let statuses = join_all(runs).await;
            let failed: Vec<&str> = parallel
                .iter()
                .zip(statuses)
                .filter(|(idx, status)| status.is_failure() && steps[**idx].on_failure.is_none())
                .map(|(idx, _)| steps[*idx].id.as_str())
                .collect();
            if !failed.is_empty() {
                return RunOutcome::Failed(format!("parallel steps failed: {}", failed.join(", ")));
            }
        }

        if control.cancel.is_cancelled() {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Completed
        }
    }

    /// Guardrails, then the handler with retries under the step timeout.
    async fn run_step(
        &self,
        idx: usize,
        mut step: WorkflowStep,
        scope: &StepContext,
    ) -> StepStatus {
        let id = &scope.instance_id;
        let started = Utc::now();
        step.status = StepStatus::Running;
        step.started_at = Some(started);
        self.update_step(id, idx, |s| {
            s.status = StepStatus::Running;
            s.started_at = Some(started);
        })
        .await;
        self.audit(AuditEntry::new(id, "step_started", StepStatus::Running.as_str()).with_step(&step.id))
            .await;
        tracing::debug!(
            "step_started: instance={}, step={}, action={}",
            id,
            step.id,
            step.action_type
        );

        if !step.guardrails.is_empty() {
            let context = scope.action_context.merged_with(&step.parameters);
            let checks = self
                .policy
                .check_named(&step.guardrails, &scope.workflow_name, &step.action_type, &context)
                .await;
            let blocked: Vec<String> = blocking_failures(&checks)
                .iter()
                .map(|c| c.binding_name.clone())
                .collect();
            if !blocked.is_empty() {
                let reason = format!("blocked by guardrail: {}", blocked.join(", "));
                return self
                    .finish_step(id, idx, &step, StepStatus::Failed, None, Some(reason))
                    .await;
            }
        }

        let handler = self.handler_for(&step.action_type).await;
        let budget = Duration::from_secs(step.timeout_seconds);
        loop {
            let guarded = catch_panic(handler.execute(&step, scope), &step.action_type);
            let attempt = tokio::time::timeout(budget, guarded);
            let (status, result, error) = match attempt.await {
                Ok(Ok(Ok(value))) => (StepStatus::Completed, Some(value), None),
                Ok(Ok(Err(e))) => (StepStatus::Failed, None, Some(e.to_string())),
                Ok(Err(panic_msg)) => {
                    (StepStatus::Failed, None, Some(format!("handler panicked: {}", panic_msg)))
                }
                Err(_) => (
                    StepStatus::Timeout,
                    None,
                    Some(format!("step exceeded {}s", step.timeout_seconds)),
                ),
            };
            self.stats.lock().await.steps_executed += 1;

            let exhausted = step.retry_count >= step.max_retries;
            if status == StepStatus::Completed || exhausted || scope.cancellation.is_cancelled() {
                return self.finish_step(id, idx, &step, status, result, error).await;
            }

            step.retry_count += 1;
            let retry_count = step.retry_count;
            self.update_step(id, idx, |s| s.retry_count = retry_count).await;
            self.stats.lock().await.step_retries += 1;
            tracing::debug!(
                "step_retry: instance={}, step={}, attempt={}, error={}",
                id,
                step.id,
                retry_count,
                error.as_deref().unwrap_or_default()
            );
        }
    }

    async fn finish_step(
        &self,
        id: &InstanceId,
        idx: usize,
        step: &WorkflowStep,
        status: StepStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> StepStatus {
        let retry_count = step.retry_count;
        let detail = error.clone();
        self.update_step(id, idx, |s| {
            s.status = status;
            s.result = result;
            s.error = error;
            s.retry_count = retry_count;
            s.completed_at = Some(Utc::now());
        })
        .await;
        self.audit(
            AuditEntry::new(id, "step_completed", status.as_str())
                .with_step(&step.id)
                .with_detail(detail.clone()),
        )
        .await;
        if status.is_failure() {
            tracing::warn!(
                "step_failed: instance={}, step={}, status={}, error={}",
                id,
                step.id,
                status.as_str(),
                detail.unwrap_or_default()
            );
        } else {
            tracing::debug!("step_completed: instance={}, step={}", id, step.id);
        }
        status
    }

    async fn update_step(&self, id: &InstanceId, idx: usize, f: impl FnOnce(&mut WorkflowStep)) {
        let mut instances = self.instances.write().await;
        if let Some(step) = instances.get_mut(id).and_then(|i| i.steps.get_mut(idx)) {
            f(step);
        }
    }

    /// Mark the still-pending steps among `indices` as skipped.
    async fn skip_steps(&self, id: &InstanceId, indices: &[usize]) {
        if indices.is_empty() {
            return;
        }
        let skipped: Vec<String> = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(id) else {
                return;
            };
            instance
                .steps
                .iter_mut()
                .enumerate()
                .filter(|(idx, s)| s.status == StepStatus::Pending && indices.contains(idx))
                .map(|(_, s)| {
                    s.status = StepStatus::Skipped;
                    s.id.clone()
                })
                .collect()
        };
        for step_id in skipped {
            let entry = AuditEntry::new(id, "step_skipped", StepStatus::Skipped.as_str());
            self.audit(entry.with_step(step_id)).await;
        }
    }

    /// After a workflow timeout: running steps time out, pending ones skip.
    async fn interrupt_steps(&self, id: &InstanceId) {
        let (timed_out, pending): (Vec<String>, Vec<usize>) = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(id) else {
                return;
            };
            let now = Utc::now();
            let mut timed_out = Vec::new();
            for step in instance.steps.iter_mut().filter(|s| s.status == StepStatus::Running) {
                step.status = StepStatus::Timeout;
                step.error = Some("workflow timed out".to_string());
                step.completed_at = Some(now);
                timed_out.push(step.id.clone());
            }
            let pending = instance
                .steps
                .iter()
                .enumerate()
                .filter(|(_, s)| s.status == StepStatus::Pending)
                .map(|(i, _)| i)
                .collect();
            (timed_out, pending)
        };
        for step_id in timed_out {
            self.audit(
                AuditEntry::new(id, "step_completed", StepStatus::Timeout.as_str())
                    .with_step(step_id)
                    .with_detail(Some("workflow timed out".to_string())),
            )
            .await;
        }
        self.skip_steps(id, &pending).await;
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Stop scheduling further steps. Handlers already dispatched run on but
    /// see their cancellation token fire.
    pub async fn cancel(&self, instance_id: &InstanceId, actor: Option<&str>) -> Result<()> {
        self.transition(instance_id, WorkflowStatus::Cancelled, None, actor).await?;
        if let Some(control) = self.controls.lock().await.get(instance_id) {
            control.cancel.cancel();
        }
        let instance = self.snapshot(instance_id).await?;
        if instance.started_at.is_none() {
            let all: Vec<usize> = (0..instance.steps.len()).collect();
            self.skip_steps(instance_id, &all).await;
        }
        Ok(())
    }

    pub async fn pause(&self, instance_id: &InstanceId, actor: Option<&str>) -> Result<()> {
        self.transition(instance_id, WorkflowStatus::Paused, None, actor).await?;
        if let Some(control) = self.controls.lock().await.get(instance_id) {
            control.paused.send_replace(true);
        }
        Ok(())
    }

    pub async fn resume(&self, instance_id: &InstanceId, actor: Option<&str>) -> Result<()> {
        let current = self
            .get_instance(instance_id)
            .await
            .ok_or_else(|| {
                Error::not_found(format!("workflow instance not found: {}", instance_id))
            })?;
        if current.status != WorkflowStatus::Paused {
            return Err(Error::state_transition(format!(
                "workflow instance {} is {}, expected paused",
                instance_id,
                current.status.as_str()
            )));
        }
        self.transition(instance_id, WorkflowStatus::Running, None, actor).await?;
        if let Some(control) = self.controls.lock().await.get(instance_id) {
            control.paused.send_replace(false);
        }
        Ok(())
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    async fn transition(
        &self,
        id: &InstanceId,
        to: WorkflowStatus,
        error: Option<String>,
        actor: Option<&str>,
    ) -> Result<WorkflowStatus> {
        let (from, template_id) = {
            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("workflow instance not found: {}", id)))?;
            let from = instance.status;
            if !from.can_transition_to(to) {
                return Err(Error::state_transition(format!(
                    "workflow instance {}: {} -> {}",
                    id,
                    from.as_str(),
                    to.as_str()
                )));
            }
            let now = Utc::now();
            instance.status = to;
            if to == WorkflowStatus::Running && instance.started_at.is_none() {
                instance.started_at = Some(now);
            }
            if to.is_terminal() {
                instance.completed_at = Some(now);
            }
            if error.is_some() {
                instance.error = error.clone();
            }
            (from, instance.template_id.clone())
        };

        let event = match (from, to) {
            (WorkflowStatus::Pending, WorkflowStatus::Running) => "workflow_started",
            (_, WorkflowStatus::Running) => "workflow_resumed",
            (_, WorkflowStatus::Paused) => "workflow_paused",
            (_, WorkflowStatus::Completed) => "workflow_completed",
            (_, WorkflowStatus::Failed) => "workflow_failed",
            (_, WorkflowStatus::Cancelled) => "workflow_cancelled",
            (_, WorkflowStatus::Timeout) => "workflow_timeout",
            (_, WorkflowStatus::Pending) => "workflow_reset",
        };
        self.audit(
            AuditEntry::new(id, event, to.as_str())
                .with_actor(actor)
                .with_detail(error.clone()),
        )
        .await;

        if to.is_terminal() {
            let mut stats = self.stats.lock().await;
            match to {
                WorkflowStatus::Completed => stats.completed += 1,
                WorkflowStatus::Failed => stats.failed += 1,
                WorkflowStatus::Cancelled => stats.cancelled += 1,
                WorkflowStatus::Timeout => stats.timed_out += 1,
                _ => {}
            }
        }
        match to {
            WorkflowStatus::Failed | WorkflowStatus::Timeout => tracing::warn!(
                "{}: instance={}, template={}, error={}",
                event,
                id,
                template_id,
                error.unwrap_or_default()
            ),
            _ => tracing::info!("{}: instance={}, template={}", event, id, template_id),
        }

        if let Some(bus) = &self.notifier {
            bus.publish(Notification::WorkflowStateChanged {
                instance_id: id.clone(),
                template_id,
                from,
                to,
                at: Utc::now(),
            })
            .await;
        }
        Ok(from)
    }

    /// Terminal transition at the end of a run. A concurrent cancel wins.
    async fn finish(&self, id: &InstanceId, to: WorkflowStatus, error: Option<String>) {
        if let Err(e) = self.transition(id, to, error, None).await {
            tracing::debug!("workflow_finish_skipped: instance={}, reason={}", id, e);
        }
    }

    async fn snapshot(&self, id: &InstanceId) -> Result<WorkflowInstance> {
        self.get_instance(id)
            .await
            .ok_or_else(|| Error::not_found(format!("workflow instance not found: {}", id)))
    }

    // =========================================================================
    // Audit, stats, maintenance
    // =========================================================================

    async fn audit(&self, entry: AuditEntry) {
        self.audit.lock().await.append(entry);
    }

    /// Most recent audit entries, newest last.
    pub async fn audit_log(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.lock().await.recent(limit)
    }

    pub async fn audit_for(&self, instance_id: &InstanceId) -> Vec<AuditEntry> {
        self.audit.lock().await.for_instance(instance_id)
    }

    pub async fn stats(&self) -> WorkflowStats {
        self.stats.lock().await.clone()
    }

    /// Drop terminal instances that finished more than `retention` ago.
    pub async fn prune_finished(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let pruned: Vec<InstanceId> = {
            let mut instances = self.instances.write().await;
            let stale: Vec<InstanceId> = instances
                .values()
                .filter(|i| i.status.is_terminal() && i.completed_at.is_some_and(|t| t <= cutoff))
                .map(|i| i.id.clone())
                .collect();
            for id in &stale {
                instances.remove(id);
            }
            stale
        };
        if !pruned.is_empty() {
            let mut controls = self.controls.lock().await;
            for id in &pruned {
                controls.remove(id);
            }
            tracing::debug!("workflow_instances_pruned: count={}", pruned.len());
        }
        pruned.len()
    }
}
