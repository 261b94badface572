//! Event Router.
//!
//! Canonicalizes heterogeneous event shapes ([`normalize`]) and fans each
//! event out to the pipelines whose [`RoutingRule`]s match it. Routing is
//! idempotent per event: pipelines already recorded in `routed_to` are never
//! invoked again.

mod normalize;
mod rules;

pub use normalize::{normalize, EventCategory, NormalizedEvent};
pub use rules::RoutingRule;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::kernel::recovery::with_recovery_async;
use crate::types::{Error, Result, RouterConfig};

/// Consumer of routed events, registered by pipeline name.
#[async_trait]
pub trait PipelineHandler: Send + Sync {
    async fn handle(&self, event: &NormalizedEvent) -> Result<()>;
}

/// Routing counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterStats {
    pub events_routed: u64,
    /// Events that matched no rule.
    pub events_dropped: u64,
    pub deliveries: HashMap<String, u64>,
    pub delivery_failures: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct RouterState {
    history: VecDeque<NormalizedEvent>,
    stats: RouterStats,
}

/// Rule-driven fan-out of normalized events to pipeline handlers.
pub struct EventRouter {
    config: RouterConfig,
    rules: RwLock<Vec<RoutingRule>>,
    pipelines: RwLock<HashMap<String, Arc<dyn PipelineHandler>>>,
    state: Mutex<RouterState>,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            rules: RwLock::new(Vec::new()),
            pipelines: RwLock::new(HashMap::new()),
            state: Mutex::new(RouterState::default()),
        }
    }

    // =========================================================================
    // Rules
    // =========================================================================

    pub async fn add_rule(&self, rule: RoutingRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.name == rule.name) {
            return Err(Error::validation(format!(
                "routing rule already registered: {}",
                rule.name
            )));
        }
        rules.push(rule);
        Ok(())
    }

    pub async fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    /// Enable or disable a rule at runtime.
    pub async fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::not_found(format!("routing rule not found: {}", name)))?;
        rule.enabled = enabled;
        tracing::info!("routing_rule_toggled: rule={}, enabled={}", name, enabled);
        Ok(())
    }

    pub async fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().await.clone()
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Register (or replace) the handler for a pipeline name.
    pub async fn register_pipeline(&self, name: impl Into<String>, handler: Arc<dyn PipelineHandler>) {
        let name = name.into();
        tracing::debug!("Registered pipeline handler: {}", name);
        self.pipelines.write().await.insert(name, handler);
    }

    pub async fn unregister_pipeline(&self, name: &str) -> bool {
        self.pipelines.write().await.remove(name).is_some()
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Normalize and route in one call.
    pub async fn normalize_and_route(
        &self,
        raw: &serde_json::Value,
        channel: &str,
        subsystem: &str,
    ) -> NormalizedEvent {
        let mut event = normalize(raw, channel, subsystem);
        self.route(&mut event).await;
        event
    }

    /// Deliver `event` to every pipeline named by a matching rule.
    ///
    /// Returns the pipelines newly delivered to by this call. Handler errors
    /// count as a failed delivery for that pipeline only.
    pub async fn route(&self, event: &mut NormalizedEvent) -> Vec<String> {
        let first_time = !event.processed;

        let targets: Vec<String> = {
            let rules = self.rules.read().await;
            let mut targets: Vec<String> = Vec::new();
            for rule in rules.iter().filter(|r| r.matches(event)) {
                for target in &rule.target_pipelines {
                    if !targets.contains(target) {
                        targets.push(target.clone());
                    }
                }
            }
            targets
        };

        let pending: Vec<String> = targets
            .iter()
            .filter(|t| !event.routed_to.contains(t))
            .cloned()
            .collect();

        // Snapshot handlers so no lock is held across handler awaits.
        let handlers: Vec<(String, Option<Arc<dyn PipelineHandler>>)> = {
            let pipelines = self.pipelines.read().await;
            pending
                .iter()
                .map(|name| (name.clone(), pipelines.get(name).cloned()))
                .collect()
        };

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (name, handler) in handlers {
            if let Some(handler) = handler {
                let current: &NormalizedEvent = event;
                match with_recovery_async(|| handler.handle(current), &name).await {
                    Ok(()) => delivered.push(name.clone()),
                    Err(e) => {
                        tracing::warn!(
                            "route_delivery_dropped: pipeline={}, event={}, error={}",
                            name,
                            event.id,
                            e
                        );
                        failed.push(name.clone());
                    }
                }
            }
            event.routed_to.push(name);
        }
        event.processed = true;

        let mut state = self.state.lock().await;
        for name in &delivered {
            *state.stats.deliveries.entry(name.clone()).or_default() += 1;
        }
        for name in &failed {
            *state.stats.delivery_failures.entry(name.clone()).or_default() += 1;
        }
        if first_time {
            if targets.is_empty() {
                state.stats.events_dropped += 1;
                tracing::debug!(
                    "event_unrouted: event={}, channel={}, type={}",
                    event.id,
                    event.source_channel,
                    event.event_type
                );
            } else {
                state.stats.events_routed += 1;
            }
            if state.history.len() >= self.config.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }

        pending
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn stats(&self) -> RouterStats {
        self.state.lock().await.stats.clone()
    }

    /// Most recent routed events, newest last.
    pub async fn recent_history(&self, limit: usize) -> Vec<NormalizedEvent> {
        let state = self.state.lock().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }
}
