//! Outbound notification bus.
//!
//! Fusion results, routed events, workflow and action transitions, and
//! allocation changes are published here for transport adapters to relay.
//! The core knows nothing about the transports themselves.
//!
//! Delivery is fan-out over unbounded channels: publishing never blocks,
//! and subscribers whose receiver was dropped are pruned on the next publish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::fusion::FusedEvent;
use crate::kernel::{ActionStatus, KernelState};
use crate::resources::ResourceAllocation;
use crate::router::EventCategory;
use crate::types::{ActionId, EventId, InstanceId};
use crate::workflow::WorkflowStatus;

/// Topic names.
pub mod topics {
    pub const FUSION_COMPLETED: &str = "fusion.completed";
    pub const EVENT_ROUTED: &str = "event.routed";
    pub const WORKFLOW_STATE_CHANGED: &str = "workflow.state_changed";
    pub const ACTION_COMPLETED: &str = "action.completed";
    pub const RESOURCE_ALLOCATED: &str = "resource.allocated";
    pub const RESOURCE_RELEASED: &str = "resource.released";
    pub const KERNEL_STATE_CHANGED: &str = "kernel.state_changed";
    /// Subscribe to every topic.
    pub const ALL: &str = "*";
}

/// One published notification. Serialized with its topic as the `topic` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum Notification {
    #[serde(rename = "fusion.completed")]
    FusionCompleted {
        fused_events: Vec<FusedEvent>,
        unfused_count: usize,
        processed_count: usize,
    },
    #[serde(rename = "event.routed")]
    EventRouted {
        event_id: EventId,
        event_type: String,
        category: EventCategory,
        routed_to: Vec<String>,
    },
    #[serde(rename = "workflow.state_changed")]
    WorkflowStateChanged {
        instance_id: InstanceId,
        template_id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
        at: DateTime<Utc>,
    },
    #[serde(rename = "action.completed")]
    ActionCompleted {
        action_id: ActionId,
        action_type: String,
        target_subsystem: String,
        status: ActionStatus,
        success: bool,
        error: Option<String>,
    },
    #[serde(rename = "resource.allocated")]
    ResourceAllocated { allocation: ResourceAllocation },
    #[serde(rename = "resource.released")]
    ResourceReleased { allocation: ResourceAllocation },
    #[serde(rename = "kernel.state_changed")]
    KernelStateChanged { from: KernelState, to: KernelState },
}

impl Notification {
    pub fn topic(&self) -> &'static str {
        match self {
            Notification::FusionCompleted { .. } => topics::FUSION_COMPLETED,
            Notification::EventRouted { .. } => topics::EVENT_ROUTED,
            Notification::WorkflowStateChanged { .. } => topics::WORKFLOW_STATE_CHANGED,
            Notification::ActionCompleted { .. } => topics::ACTION_COMPLETED,
            Notification::ResourceAllocated { .. } => topics::RESOURCE_ALLOCATED,
            Notification::ResourceReleased { .. } => topics::RESOURCE_RELEASED,
            Notification::KernelStateChanged { .. } => topics::KERNEL_STATE_CHANGED,
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: String,
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<Notification>,
}

impl Subscriber {
    fn wants(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topics::ALL || t == topic)
    }
}

/// Subscription receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyStats {
    pub published: u64,
    pub delivered: u64,
    pub active_subscribers: usize,
}

#[derive(Debug, Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
    stats: NotifyStats,
}

/// In-memory pub/sub for outbound notifications.
#[derive(Debug, Default)]
pub struct NotificationBus {
    inner: RwLock<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topics` (or [`topics::ALL`]). Re-subscribing with an
    /// existing id replaces the old subscription.
    pub async fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        topics: Vec<String>,
    ) -> (Subscription, mpsc::UnboundedReceiver<Notification>) {
        let id = subscriber_id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.write().await;
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.push(Subscriber {
            id: id.clone(),
            topics: topics.clone(),
            tx,
        });
        inner.stats.active_subscribers = inner.subscribers.len();

        tracing::debug!("Subscriber {} registered for topics: {:?}", id, topics);
        (Subscription { id, topics }, rx)
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut inner = self.inner.write().await;
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != subscription.id);
        inner.stats.active_subscribers = inner.subscribers.len();
        tracing::debug!("Unsubscribed: {}", subscription.id);
        inner.subscribers.len() != before
    }

    /// Fan out to every interested subscriber. Returns the delivery count.
    pub async fn publish(&self, notification: Notification) -> usize {
        let topic = notification.topic();
        let mut inner = self.inner.write().await;

        let mut delivered = 0;
        inner.subscribers.retain(|subscriber| {
            if !subscriber.wants(topic) {
                return !subscriber.tx.is_closed();
            }
            match subscriber.tx.send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    tracing::debug!("Dropping disconnected subscriber: {}", subscriber.id);
                    false
                }
            }
        });

        inner.stats.published += 1;
        inner.stats.delivered += delivered as u64;
        inner.stats.active_subscribers = inner.subscribers.len();

        tracing::trace!("Published topic={} to {} subscribers", topic, delivered);
        delivered
    }

    pub async fn stats(&self) -> NotifyStats {
        self.inner.read().await.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kernel_change() -> Notification {
        Notification::KernelStateChanged {
            from: KernelState::Idle,
            to: KernelState::Initializing,
        }
    }

    fn routed() -> Notification {
        Notification::EventRouted {
            event_id: EventId::new(),
            event_type: "gunshot_detected".to_string(),
            category: EventCategory::Threat,
            routed_to: vec!["dispatch".to_string()],
        }
    }

    #[tokio::test]
    async fn test_topic_filtering_and_wildcard() {
        let bus = NotificationBus::new();
        let (_kernel_sub, mut kernel_rx) = bus.subscribe("kernel-watch", vec![topics::KERNEL_STATE_CHANGED.to_string()]).await;
        let (_all_sub, mut all_rx) = bus.subscribe("relay", vec![topics::ALL.to_string()]).await;

        assert_eq!(bus.publish(kernel_change()).await, 2);
        assert_eq!(bus.publish(routed()).await, 1);

        assert_eq!(kernel_rx.recv().await.unwrap().topic(), "kernel.state_changed");
        assert!(kernel_rx.try_recv().is_err());
        assert_eq!(all_rx.recv().await.unwrap().topic(), "kernel.state_changed");
        assert_eq!(all_rx.recv().await.unwrap().topic(), "event.routed");

        let stats = bus.stats().await;
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 3);
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let bus = NotificationBus::new();
        let (_sub, rx) = bus.subscribe("ephemeral", vec![topics::ALL.to_string()]).await;
        drop(rx);
        assert_eq!(bus.publish(kernel_change()).await, 0);
        assert_eq!(bus.stats().await.active_subscribers, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_and_unsubscribe() {
        let bus = NotificationBus::new();
        let (_first, _rx1) = bus.subscribe("relay", vec![topics::ALL.to_string()]).await;
        let (second, mut rx2) = bus.subscribe("relay", vec![topics::EVENT_ROUTED.to_string()]).await;
        assert_eq!(bus.stats().await.active_subscribers, 1);

        bus.publish(routed()).await;
        assert!(rx2.recv().await.is_some());
        assert!(bus.unsubscribe(&second).await);
        assert!(!bus.unsubscribe(&second).await);
    }

    #[test]
    fn test_serialized_with_topic_tag() {
        let json = serde_json::to_value(kernel_change()).unwrap();
        assert_eq!(json["topic"], "kernel.state_changed");
        assert_eq!(json["from"], "idle");
    }
}
