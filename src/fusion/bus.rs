//! Event Fusion Bus: ingest, throttle, buffer and correlate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

use super::buffer::EventBuffer;
use super::correlate::correlate;
use super::limiter::{Debouncer, SourceRateLimiter};
use super::types::{FusionResult, FusionRule, FusionStats, RawEvent};
use crate::types::{Error, FusionConfig, Result};

/// Receives the full result of every fusion pass.
#[async_trait]
pub trait FusionSubscriber: Send + Sync {
    async fn on_fusion(&self, result: &FusionResult) -> Result<()>;
}

/// Which events a fusion pass works on.
#[derive(Debug)]
enum Batch {
    Explicit(Vec<RawEvent>),
    /// Buffers whose flush condition is met.
    Due,
    /// Every non-empty buffer.
    Everything,
}

#[derive(Debug)]
struct FusionState {
    buffers: BTreeMap<String, EventBuffer>,
    history: VecDeque<RawEvent>,
    limiter: SourceRateLimiter,
    debouncer: Debouncer,
    stats: FusionStats,
}

/// Buffers raw events per source and correlates them into fused events.
pub struct EventFusionBus {
    config: FusionConfig,
    rules: RwLock<Vec<FusionRule>>,
    state: Mutex<FusionState>,
    subscribers: RwLock<Vec<(String, Arc<dyn FusionSubscriber>)>>,
}

impl fmt::Debug for EventFusionBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFusionBus")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventFusionBus {
    pub fn new(config: FusionConfig) -> Self {
        let state = FusionState {
            buffers: BTreeMap::new(),
            history: VecDeque::new(),
            limiter: SourceRateLimiter::new(config.rate_limit_per_second),
            debouncer: Debouncer::new(config.debounce_window),
            stats: FusionStats::default(),
        };
        Self {
            config,
            rules: RwLock::new(Vec::new()),
            state: Mutex::new(state),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    // =========================================================================
    // Rules
    // =========================================================================

    /// Register a rule; rules run in registration order.
    pub async fn add_rule(&self, rule: FusionRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.name == rule.name) {
            return Err(Error::validation(format!(
                "fusion rule already registered: {}",
                rule.name
            )));
        }
        tracing::debug!("Registered fusion rule: {}", rule.name);
        rules.push(rule);
        Ok(())
    }

    pub async fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    pub async fn rules(&self) -> Vec<FusionRule> {
        self.rules.read().await.clone()
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Accept an event into its source buffer. Returns false when the event
    /// is rate limited or debounced.
    pub async fn ingest(&self, event: RawEvent) -> bool {
        self.ingest_at(event, Utc::now()).await
    }

    /// `ingest` with an explicit arrival clock.
    pub async fn ingest_at(&self, event: RawEvent, now: DateTime<Utc>) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.stats.events_received += 1;

        let key = event.debounce_key();
        if state.debouncer.is_duplicate(&key, now) {
            state.stats.dropped_debounced += 1;
            tracing::debug!(
                "fusion_event_debounced: source={}, event_type={}",
                event.source,
                event.event_type
            );
            return false;
        }

        if let Err(e) = state.limiter.check(&event.source, now) {
            state.stats.dropped_rate_limited += 1;
            tracing::warn!("fusion_event_rate_limited: source={}, reason={}", event.source, e);
            return false;
        }
        state.debouncer.record(key, now);

        if state.history.len() >= self.config.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());

        let buffer = state.buffers.entry(event.source.clone()).or_insert_with(|| {
            EventBuffer::new(
                event.source.clone(),
                self.config.buffer_capacity,
                self.config.flush_interval,
                now,
            )
        });
        if let Some(evicted) = buffer.push(event) {
            state.stats.dropped_overflow += 1;
            tracing::warn!(
                "fusion_buffer_overflow: source={}, evicted={}",
                evicted.source,
                evicted.id
            );
        }
        state.stats.events_accepted += 1;
        true
    }

    // =========================================================================
    // Fusion
    // =========================================================================

    /// Run one fusion pass. With `None`, drains the buffers whose flush
    /// condition is met; otherwise fuses exactly the given batch.
    pub async fn fuse(&self, events: Option<Vec<RawEvent>>) -> FusionResult {
        let batch = match events {
            Some(events) => Batch::Explicit(events),
            None => Batch::Due,
        };
        self.run_pass(batch, Utc::now()).await
    }

    /// `fuse(None)` with an explicit clock.
    pub async fn fuse_due_at(&self, now: DateTime<Utc>) -> FusionResult {
        self.run_pass(Batch::Due, now).await
    }

    /// Drain every buffer regardless of flush condition and fuse.
    pub async fn fuse_all(&self) -> FusionResult {
        self.run_pass(Batch::Everything, Utc::now()).await
    }

    async fn run_pass(&self, batch: Batch, now: DateTime<Utc>) -> FusionResult {
        let started = Instant::now();
        let events = match batch {
            Batch::Explicit(events) => events,
            Batch::Due => self.drain_buffers(now, false).await,
            Batch::Everything => self.drain_buffers(now, true).await,
        };

        let processed_count = events.len();
        let rules = self.rules.read().await.clone();
        let (fused_events, unfused_events) = correlate(&rules, events, now);

        {
            let mut state = self.state.lock().await;
            state.stats.fusion_passes += 1;
            state.stats.fused_events_created += fused_events.len() as u64;
            state.stats.events_fused += fused_events
                .iter()
                .map(|f| f.source_events.len() as u64)
                .sum::<u64>();
        }

        let result = FusionResult {
            fused_events,
            unfused_events,
            processed_count,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };

        if processed_count > 0 {
            tracing::info!(
                "fusion_pass_completed: processed={}, fused={}, unfused={}",
                result.processed_count,
                result.fused_events.len(),
                result.unfused_events.len()
            );
        }

        self.notify_subscribers(&result).await;
        result
    }

    /// Drained events come out in timestamp order, ties by source name.
    async fn drain_buffers(&self, now: DateTime<Utc>, force: bool) -> Vec<RawEvent> {
        let mut state = self.state.lock().await;
        let mut drained = Vec::new();
        for buffer in state.buffers.values_mut() {
            if !buffer.is_empty() && (force || buffer.should_flush(now)) {
                drained.extend(buffer.drain(now));
            }
        }
        drained.sort_by_key(|e| e.timestamp);
        drained
    }

    // =========================================================================
    // Subscribers
    // =========================================================================

    /// Subscribers are notified in registration order after every pass.
    /// Re-subscribing with an existing id replaces the previous callback.
    pub async fn subscribe(&self, id: impl Into<String>, subscriber: Arc<dyn FusionSubscriber>) {
        let id = id.into();
        let mut subscribers = self.subscribers.write().await;
        if let Some(slot) = subscribers.iter_mut().find(|(sid, _)| *sid == id) {
            slot.1 = subscriber;
        } else {
            tracing::debug!("Fusion subscriber registered: {}", id);
            subscribers.push((id, subscriber));
        }
    }

    pub async fn unsubscribe(&self, id: &str) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| sid != id);
        subscribers.len() != before
    }

    async fn notify_subscribers(&self, result: &FusionResult) {
        let snapshot: Vec<(String, Arc<dyn FusionSubscriber>)> =
            self.subscribers.read().await.clone();
        for (id, subscriber) in snapshot {
            if let Err(e) = subscriber.on_fusion(result).await {
                tracing::warn!("fusion_subscriber_failed: id={}, error={}", id, e);
            }
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn stats(&self) -> FusionStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn buffered_count(&self, source: &str) -> usize {
        self.state
            .lock()
            .await
            .buffers
            .get(source)
            .map(EventBuffer::len)
            .unwrap_or(0)
    }

    pub async fn total_buffered(&self) -> usize {
        self.state
            .lock()
            .await
            .buffers
            .values()
            .map(EventBuffer::len)
            .sum()
    }

    /// Most recent accepted events, newest last.
    pub async fn recent_history(&self, limit: usize) -> Vec<RawEvent> {
        let state = self.state.lock().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Forget idle rate windows, expired debounce keys and empty buffers.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().await;
        let mut removed = state.limiter.cleanup_expired(now);
        removed += state.debouncer.cleanup_expired(now);
        let before = state.buffers.len();
        state.buffers.retain(|_, b| !b.is_empty());
        removed + (before - state.buffers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoPoint, Priority};
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn bus() -> EventFusionBus {
        EventFusionBus::new(FusionConfig::default())
    }

    #[tokio::test]
    async fn test_debounce_rejects_identical_key() {
        let bus = bus();
        let now = Utc::now();
        let first = RawEvent::new("cam-1", "motion").with_entity("door-3");
        let second = RawEvent::new("cam-1", "motion").with_entity("door-3");
        let other_entity = RawEvent::new("cam-1", "motion").with_entity("door-4");

        assert!(bus.ingest_at(first, now).await);
        assert!(!bus.ingest_at(second.clone(), now + Duration::milliseconds(300)).await);
        assert!(bus.ingest_at(other_entity, now + Duration::milliseconds(300)).await);
        assert!(bus.ingest_at(second, now + Duration::milliseconds(1500)).await);

        let stats = bus.stats().await;
        assert_eq!(stats.events_received, 4);
        assert_eq!(stats.dropped_debounced, 1);
        assert_eq!(bus.buffered_count("cam-1").await, 3);
    }

    #[tokio::test]
    async fn test_rate_limit_accepts_exactly_limit() {
        let config = FusionConfig {
            rate_limit_per_second: 10,
            ..FusionConfig::default()
        };
        let bus = EventFusionBus::new(config);
        let now = Utc::now();

        let mut accepted = 0;
        for i in 0..25 {
            let event = RawEvent::new("radar", "contact").with_entity(format!("track-{i}"));
            if bus.ingest_at(event, now + Duration::milliseconds(i)).await {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
        let stats = bus.stats().await;
        assert_eq!(stats.dropped_rate_limited, 15);
        assert_eq!(stats.events_accepted, 10);
    }

    #[tokio::test]
    async fn test_buffer_overflow_counts_drop() {
        let config = FusionConfig {
            buffer_capacity: 2,
            ..FusionConfig::default()
        };
        let bus = EventFusionBus::new(config);
        for i in 0..3 {
            let event = RawEvent::new("s", "t").with_entity(format!("e{i}"));
            assert!(bus.ingest(event).await);
        }
        assert_eq!(bus.buffered_count("s").await, 2);
        assert_eq!(bus.stats().await.dropped_overflow, 1);
        assert_eq!(bus.recent_history(10).await.len(), 3);
    }

    #[tokio::test]
    async fn test_fuse_drains_only_due_buffers() {
        let config = FusionConfig {
            flush_interval: StdDuration::from_secs(5),
            ..FusionConfig::default()
        };
        let bus = EventFusionBus::new(config);
        let t0 = Utc::now();
        bus.ingest_at(RawEvent::new("s", "t").with_entity("1"), t0).await;

        let early = bus.fuse_due_at(t0 + Duration::seconds(1)).await;
        assert_eq!(early.processed_count, 0);
        let late = bus.fuse_due_at(t0 + Duration::seconds(6)).await;
        assert_eq!(late.processed_count, 1);
        assert_eq!(late.unfused_events.len(), 1);
        assert_eq!(bus.total_buffered().await, 0);
    }

    #[tokio::test]
    async fn test_drain_order_is_by_timestamp_across_sources() {
        let bus = bus();
        let t0 = Utc::now();
        let sources = ["zulu", "alpha", "mike", "bravo"];
        for (i, source) in sources.iter().enumerate() {
            let event = RawEvent::new(*source, "t")
                .with_entity(i.to_string())
                .with_timestamp(t0 + Duration::seconds(10 - i as i64));
            bus.ingest_at(event, t0).await;
        }
        bus.ingest_at(RawEvent::new("charlie", "t").with_timestamp(t0 + Duration::seconds(7)), t0)
            .await;

        let result = bus.fuse_all().await;
        let order: Vec<&str> = result.unfused_events.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(order, vec!["bravo", "charlie", "mike", "alpha", "zulu"]);
    }

    #[tokio::test]
    async fn test_explicit_batch_fusion_and_stats() {
        let bus = bus();
        bus.add_rule(FusionRule::new("pair", &["gunshot_detected"], 2))
            .await
            .unwrap();
        let point = GeoPoint::new(10.0, 10.0);
        let batch = vec![
            RawEvent::new("a", "gunshot_detected").with_geolocation(point).with_priority(Priority::High),
            RawEvent::new("b", "gunshot_detected").with_geolocation(point),
        ];
        let result = bus.fuse(Some(batch)).await;
        assert_eq!(result.fused_events.len(), 1);
        let stats = bus.stats().await;
        assert_eq!(stats.fusion_passes, 1);
        assert_eq!(stats.events_fused, 2);
        assert_eq!(stats.fused_events_created, 1);
    }

    #[tokio::test]
    async fn test_duplicate_rule_rejected() {
        let bus = bus();
        bus.add_rule(FusionRule::new("r", &["a"], 1)).await.unwrap();
        assert!(bus.add_rule(FusionRule::new("r", &["b"], 1)).await.is_err());
        assert!(bus.remove_rule("r").await);
        assert!(bus.rules().await.is_empty());
    }

    struct Recorder {
        order: Arc<std::sync::Mutex<Vec<String>>>,
        name: &'static str,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl FusionSubscriber for Recorder {
        async fn on_fusion(&self, _result: &FusionResult) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name.to_string());
            if self.fail {
                return Err(Error::handler("subscriber down"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_subscribers_notified_in_order_even_after_failure() {
        let bus = bus();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let first = Arc::new(Recorder { order: order.clone(), name: "first", calls: AtomicUsize::new(0), fail: true });
        let second = Arc::new(Recorder { order: order.clone(), name: "second", calls: AtomicUsize::new(0), fail: false });
        bus.subscribe("first", first.clone()).await;
        bus.subscribe("second", second.clone()).await;

        bus.fuse(Some(vec![])).await;
        bus.fuse(None).await;

        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "first", "second"]);

        assert!(bus.unsubscribe("first").await);
        bus.fuse(None).await;
        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
    }
}
