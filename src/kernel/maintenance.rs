//! Background maintenance for long-running deployments.
//!
//! Each cycle:
//! - runs a fusion cycle over buffers whose flush condition is met
//! - expires resource allocations past their window
//! - prunes finished workflow instances and action runs past retention
//! - forgets idle rate-limit and debounce tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};

use super::{KernelState, OrchestrationKernel};
use crate::types::{MaintenanceConfig, Result};

/// What one maintenance cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub fused_events: usize,
    pub workflows_triggered: usize,
    pub allocations_expired: usize,
    pub instances_pruned: usize,
    pub runs_pruned: usize,
    pub tracking_entries_cleaned: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct MaintenanceService {
    kernel: Arc<OrchestrationKernel>,
    config: MaintenanceConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MaintenanceService {
    pub fn new(kernel: Arc<OrchestrationKernel>, config: MaintenanceConfig) -> Self {
        Self {
            kernel,
            config,
            stop_tx: None,
        }
    }

    /// Start the maintenance loop in the background.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let kernel = self.kernel.clone();
        let config = self.config.clone();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::run_cycle(&kernel, &config).await {
                            tracing::error!("maintenance_cycle_failed: {}", e);
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("maintenance_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single cycle. Fusion only runs while the kernel is `running`.
    pub async fn run_cycle(kernel: &OrchestrationKernel, config: &MaintenanceConfig) -> Result<MaintenanceReport> {
        let now = Utc::now();
        let mut report = MaintenanceReport::default();

        if kernel.state().await == KernelState::Running {
            let cycle = kernel.run_fusion_cycle().await?;
            report.fused_events = cycle.result.fused_events.len();
            report.workflows_triggered = cycle.workflows.len();
        }

        report.allocations_expired = kernel.expire_allocations(now).await.len();
        report.instances_pruned = kernel.workflows().prune_finished(config.instance_retention).await;
        report.runs_pruned = kernel.prune_runs(config.instance_retention).await;
        report.tracking_entries_cleaned = kernel.fusion().cleanup(now).await;

        tracing::debug!(
            "maintenance_cycle_completed: fused={}, triggered={}, expired={}, pruned={}, runs={}, cleaned={}",
            report.fused_events,
            report.workflows_triggered,
            report.allocations_expired,
            report.instances_pruned,
            report.runs_pruned,
            report.tracking_entries_cleaned,
        );
        report.completed_at = Some(Utc::now());
        Ok(report)
    }
}

impl Drop for MaintenanceService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::OrchestrationAction;
    use crate::resources::{AllocationRequest, Resource, ResourceType};
    use crate::types::{Config, Priority};
    use std::time::Duration;

    #[tokio::test]
    async fn test_cycle_expires_allocations_and_prunes() {
        let kernel = OrchestrationKernel::new(Config::default()).unwrap();
        kernel.start().await.unwrap();
        {
            let mut resources = kernel.resources().lock().await;
            resources
                .register(Resource::new("D1", "Drone", ResourceType::Drone))
                .unwrap();
            let request = AllocationRequest::new("D1", "wf", Priority::High).with_duration_minutes(1);
            resources
                .allocate_at(request, Utc::now() - chrono::Duration::minutes(5))
                .unwrap();
        }

        let config = MaintenanceConfig {
            interval: Duration::from_secs(30),
            instance_retention: Duration::ZERO,
        };
        let report = MaintenanceService::run_cycle(&kernel, &config).await.unwrap();
        assert_eq!(report.allocations_expired, 1);
        assert!(report.completed_at.is_some());
        assert!(kernel.resources().lock().await.active_allocation("D1").is_none());
    }

    #[tokio::test]
    async fn test_cycle_prunes_finished_action_runs() {
        let kernel = OrchestrationKernel::new(Config::default()).unwrap();
        kernel.start().await.unwrap();
        kernel
            .execute_workflow("wf-done", vec![OrchestrationAction::new("notify", "cad")])
            .await;

        let keep = MaintenanceConfig {
            interval: Duration::from_secs(30),
            instance_retention: Duration::from_secs(3600),
        };
        let report = MaintenanceService::run_cycle(&kernel, &keep).await.unwrap();
        assert_eq!(report.runs_pruned, 0);
        assert!(kernel.get_workflow_status("wf-done").await.is_some());

        let expire = MaintenanceConfig {
            instance_retention: Duration::ZERO,
            ..keep
        };
        let report = MaintenanceService::run_cycle(&kernel, &expire).await.unwrap();
        assert_eq!(report.runs_pruned, 1);
        assert!(kernel.get_workflow_status("wf-done").await.is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let kernel = Arc::new(OrchestrationKernel::new(Config::default()).unwrap());
        let mut service = MaintenanceService::new(
            kernel,
            MaintenanceConfig {
                interval: Duration::from_millis(10),
                instance_retention: Duration::from_secs(60),
            },
        );
        let handle = service.start();
        tokio::time::sleep(Duration::from_millis(35)).await;
        service.stop();
        handle.await.unwrap();
    }
}
