//! End-to-end scenarios through the public kernel API: ingest → fuse/route →
//! trigger → guardrails → dispatch, plus allocation contention.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use orchestration_core::fusion::FusionRule;
use orchestration_core::kernel::{OrchestrationAction, OrchestrationKernel, SubsystemHandler};
use orchestration_core::notify::{topics, Notification};
use orchestration_core::policy::{GuardrailCheck, GuardrailChecker, PolicyBinding, PolicyType};
use orchestration_core::resources::{
    AllocationRequest, AllocationStatus, ReleaseReason, Resource, ResourceType,
};
use orchestration_core::router::{NormalizedEvent, PipelineHandler, RoutingRule};
use orchestration_core::types::{ActionContext, Priority};
use orchestration_core::workflow::{
    StepStatus, WorkflowStatus, WorkflowStep, WorkflowTemplate, WorkflowTrigger,
};
use orchestration_core::{Config, Result};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn running_kernel(config: Config) -> OrchestrationKernel {
    let kernel = OrchestrationKernel::new(config).unwrap();
    kernel.start().await.unwrap();
    kernel
}

/// Test double: every binding of its policy type fails, blocking.
struct AlwaysFails;

#[async_trait]
impl GuardrailChecker for AlwaysFails {
    async fn check(
        &self,
        binding: &PolicyBinding,
        _context: &ActionContext,
    ) -> Result<GuardrailCheck> {
        Ok(GuardrailCheck::for_binding(binding, false, 0, "always fails"))
    }
}

/// Tracks how many actions are in flight at once.
#[derive(Default)]
struct InFlightCounter {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl SubsystemHandler for InFlightCounter {
    async fn handle(&self, action: &OrchestrationAction) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({"handled": action.action_type}))
    }
}

#[derive(Default)]
struct CountingPipeline {
    deliveries: AtomicUsize,
}

#[async_trait]
impl PipelineHandler for CountingPipeline {
    async fn handle(&self, _event: &NormalizedEvent) -> Result<()> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn gunshot_cluster_fuses_once_and_triggers_response() {
    let kernel = running_kernel(Config::default()).await;
    kernel
        .fusion()
        .add_rule(
            FusionRule::new("gunshot_cluster", &["gunshot_detected"], 2)
                .with_time_window(Duration::from_secs(30))
                .with_geo_radius(500.0),
        )
        .await
        .unwrap();
    let counter = Arc::new(InFlightCounter::default());
    kernel.register_handler("drone_ops", counter.clone()).await;
    kernel
        .register_template(
            WorkflowTemplate::new("gunshot_response", "Gunshot response")
                .with_trigger(WorkflowTrigger::on_event_types(&["gunshot_cluster"]))
                .with_step(WorkflowStep::new("notify", "notify_dispatch", "cad"))
                .with_step(WorkflowStep::new("overwatch", "launch_drone", "drone_ops").parallel())
                .with_step(WorkflowStep::new("perimeter", "launch_drone", "drone_ops").parallel()),
        )
        .await
        .unwrap();

    // Three reports about 100m apart, then one about 4km north.
    let base = Utc::now();
    let reports = [
        ("acoustic-north", 40.7128),
        ("acoustic-east", 40.7138),
        ("camera-7", 40.7148),
        ("acoustic-harlem", 40.7528),
    ];
    for (i, (source, lat)) in reports.iter().enumerate() {
        let event = json!({
            "event_type": "gunshot_detected",
            "priority": "high",
            "entity_id": format!("sensor-{}", i),
            "geolocation": {"lat": lat, "lon": -74.0060},
            "timestamp": (base + ChronoDuration::seconds(i as i64 * 4)).to_rfc3339(),
        });
        let outcome = kernel.ingest_event(source, &event).await.unwrap();
        assert!(outcome.accepted);
    }

    let cycle = kernel.flush_fusion().await.unwrap();
    assert_eq!(cycle.result.fused_events.len(), 1);
    let fused = &cycle.result.fused_events[0];
    assert_eq!(fused.source_count, 3);
    assert_eq!(fused.source_events.len(), 3);
    assert!(fused.requires_action);
    assert_eq!(fused.confidence, 80);
    assert!(!fused.sources.contains(&"acoustic-harlem".to_string()));
    assert_eq!(cycle.result.unfused_events.len(), 1);
    assert_eq!(cycle.result.unfused_events[0].source, "acoustic-harlem");

    assert_eq!(cycle.workflows.len(), 1);
    let instance = &cycle.workflows[0];
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.steps_with_status(StepStatus::Completed), 3);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    assert_eq!(counter.max_in_flight.load(Ordering::SeqCst), 2, "parallel steps should overlap");
    assert_eq!(kernel.dispatcher().stats().await.dispatched, 3);
}

#[tokio::test]
async fn always_failing_guardrail_dispatches_nothing() {
    let kernel = running_kernel(Config::default()).await;
    kernel.policy().register_checker(PolicyType::Constitutional, Arc::new(AlwaysFails)).await;
    kernel
        .policy()
        .add_binding(PolicyBinding::new("always_fails", PolicyType::Constitutional))
        .await
        .unwrap();

    kernel
        .register_template(
            WorkflowTemplate::new("step_gated", "Step gated")
                .with_step(
                    WorkflowStep::new("enter", "enter_building", "robotics")
                        .with_guardrails(&["always_fails"]),
                ),
        )
        .await
        .unwrap();
    kernel
        .register_template(
            WorkflowTemplate::new("workflow_gated", "Workflow gated")
                .with_guardrails(&["always_fails"])
                .with_step(WorkflowStep::new("a", "notify", "cad"))
                .with_step(WorkflowStep::new("b", "notify", "cad").parallel()),
        )
        .await
        .unwrap();

    let step_gated = kernel
        .workflows()
        .execute_template("step_gated", Map::new(), &ActionContext::new())
        .await
        .unwrap();
    assert_eq!(step_gated.status, WorkflowStatus::Failed);
    assert_eq!(step_gated.steps[0].status, StepStatus::Failed);

    let workflow_gated = kernel
        .workflows()
        .execute_template("workflow_gated", Map::new(), &ActionContext::new())
        .await
        .unwrap();
    assert_eq!(workflow_gated.status, WorkflowStatus::Failed);
    assert_eq!(workflow_gated.steps_attempted(), 0);

    assert!(kernel.action_history(100).await.is_empty());
    assert_eq!(kernel.dispatcher().stats().await.dispatched, 0);
    let policy = kernel.policy().stats().await;
    assert_eq!(policy.blocked, 2);
}

#[tokio::test]
async fn emergency_request_preempts_high_holder() {
    let kernel = running_kernel(Config::default()).await;
    kernel
        .resources()
        .lock()
        .await
        .register(Resource::new("R1", "Drone One", ResourceType::Drone))
        .unwrap();

    let w1 = kernel
        .allocate_resource(AllocationRequest::new("R1", "W1", Priority::High))
        .await
        .unwrap();
    let w2 = kernel
        .allocate_resource(AllocationRequest::new("R1", "W2", Priority::Emergency))
        .await
        .unwrap();
    assert_eq!(w2.workflow_id, "W2");

    // Equal priority against a held resource fails.
    assert!(kernel
        .allocate_resource(AllocationRequest::new("R1", "W3", Priority::Emergency))
        .await
        .is_none());

    let history = kernel.resources().lock().await.allocations_for("R1");
    let completed: Vec<_> = history
        .iter()
        .filter(|a| a.status == AllocationStatus::Completed)
        .collect();
    let active: Vec<_> = history.iter().filter(|a| a.status == AllocationStatus::Active).collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(active.len(), 1);
    assert_eq!(completed[0].id, w1.id);
    assert_eq!(completed[0].release_reason, Some(ReleaseReason::Preempted));
    assert_eq!(active[0].id, w2.id);
}

#[tokio::test]
async fn rate_limit_accepts_exactly_the_limit() {
    let mut config = Config::default();
    config.fusion.rate_limit_per_second = 5;
    let kernel = running_kernel(config).await;

    let mut accepted = 0;
    for i in 0..8 {
        let event = json!({"event_type": "motion_detected", "entity_id": format!("cam-{}", i)});
        if kernel.ingest_event("camera-grid", &event).await.unwrap().accepted {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 5);
    let fusion = kernel.fusion().stats().await;
    assert_eq!(fusion.dropped_rate_limited, 3);
    assert_eq!(kernel.stats().await.events_rejected, 3);
}

#[tokio::test]
async fn routing_delivers_each_event_once() {
    let kernel = running_kernel(Config::default()).await;
    let pipeline = Arc::new(CountingPipeline::default());
    kernel.router().register_pipeline("tactical", pipeline.clone()).await;
    kernel
        .router()
        .add_rule(
            RoutingRule::new("urgent_threats", &["tactical"]).with_min_priority(Priority::High),
        )
        .await
        .unwrap();
    kernel
        .router()
        .add_rule(
            RoutingRule::new("acoustic_feed", &["tactical", "archive"])
                .with_channels(&["acoustic"]),
        )
        .await
        .unwrap();

    let outcome = kernel
        .ingest_event("acoustic", &json!({"event_type": "gunshot_detected", "priority": 1}))
        .await
        .unwrap();
    let mut event = outcome.event.unwrap();
    assert_eq!(event.routed_to, vec!["tactical", "archive"]);
    assert!(event.processed);
    assert_eq!(pipeline.deliveries.load(Ordering::SeqCst), 1);

    let again = kernel.router().route(&mut event).await;
    assert!(again.is_empty());
    assert_eq!(pipeline.deliveries.load(Ordering::SeqCst), 1);

    // Low-priority event on another channel matches nothing.
    let dropped = kernel
        .ingest_event("weather", &json!({"event_type": "rain", "priority": "low"}))
        .await
        .unwrap();
    assert!(dropped.event.unwrap().routed_to.is_empty());
    let stats = kernel.router().stats().await;
    assert_eq!((stats.events_routed, stats.events_dropped), (1, 1));
}

#[tokio::test]
async fn workflow_transitions_are_published() {
    let kernel = running_kernel(Config::default()).await;
    let (_subscription, mut rx) = kernel
        .notifications()
        .subscribe(
            "ws-relay",
            vec![
                topics::WORKFLOW_STATE_CHANGED.to_string(),
                topics::ACTION_COMPLETED.to_string(),
            ],
        )
        .await;
    kernel
        .register_template(
            WorkflowTemplate::new("notify", "Notify")
                .with_step(WorkflowStep::new("a", "page", "cad")),
        )
        .await
        .unwrap();

    let instance = kernel
        .workflows()
        .execute_template("notify", Map::new(), &ActionContext::new())
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);

    let mut seen = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        match notification {
            Notification::WorkflowStateChanged { to, .. } => {
                seen.push(format!("workflow:{}", to.as_str()))
            }
            Notification::ActionCompleted { success, .. } => seen.push(format!("action:{}", success)),
            other => panic!("unexpected topic {}", other.topic()),
        }
    }
    assert_eq!(seen, vec!["workflow:running", "action:true", "workflow:completed"]);
}
