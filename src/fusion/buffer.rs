//! Per-source holding area.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use super::types::RawEvent;

/// Bounded FIFO of raw events for one source.
#[derive(Debug)]
pub struct EventBuffer {
    pub source: String,
    events: VecDeque<RawEvent>,
    capacity: usize,
    flush_interval: Duration,
    last_flush: DateTime<Utc>,
}

impl EventBuffer {
    pub fn new(source: impl Into<String>, capacity: usize, flush_interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            flush_interval,
            last_flush: now,
        }
    }

    /// Append; returns the evicted oldest event when the buffer was full.
    pub fn push(&mut self, event: RawEvent) -> Option<RawEvent> {
        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.capacity
    }

    /// Full, or the flush interval elapsed since the last flush.
    pub fn should_flush(&self, now: DateTime<Utc>) -> bool {
        if self.events.is_empty() {
            return false;
        }
        let elapsed = (now - self.last_flush).to_std().unwrap_or_default();
        self.is_full() || elapsed >= self.flush_interval
    }

    /// Take every buffered event and reset the flush clock.
    pub fn drain(&mut self, now: DateTime<Utc>) -> Vec<RawEvent> {
        self.last_flush = now;
        self.events.drain(..).collect()
    }

    pub fn last_flush(&self) -> DateTime<Utc> {
        self.last_flush
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn event(n: usize) -> RawEvent {
        RawEvent::new("cam-1", format!("motion_{n}"))
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let now = Utc::now();
        let mut buffer = EventBuffer::new("cam-1", 2, Duration::from_secs(5), now);
        assert!(buffer.push(event(1)).is_none());
        assert!(buffer.push(event(2)).is_none());
        let evicted = buffer.push(event(3)).unwrap();
        assert_eq!(evicted.event_type, "motion_1");
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_flush_conditions() {
        let now = Utc::now();
        let mut buffer = EventBuffer::new("cam-1", 3, Duration::from_secs(5), now);
        assert!(!buffer.should_flush(now), "empty buffer never flushes");

        buffer.push(event(1));
        assert!(!buffer.should_flush(now));
        assert!(buffer.should_flush(now + ChronoDuration::seconds(5)));

        buffer.push(event(2));
        buffer.push(event(3));
        assert!(buffer.should_flush(now), "full buffer flushes immediately");

        let drained = buffer.drain(now);
        assert_eq!(drained.len(), 3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.last_flush(), now);
    }
}
