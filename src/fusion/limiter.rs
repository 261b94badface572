//! Ingestion throttling.
//!
//! Sliding 1-second window rate limiter per source, plus a debouncer that
//! suppresses identical (source, event_type, entity_id) keys within a short
//! window. Both take `now` explicitly so callers control the clock.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

use crate::types::{Error, Result};

/// Sliding window for tracking accepted events.
#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&ts) = self.timestamps.front() {
            if ts <= cutoff {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Check if an event is allowed and record it.
    fn check_and_record(&mut self, now: DateTime<Utc>, limit: u32) -> Result<()> {
        self.evict_before(now - Duration::seconds(1));

        if self.timestamps.len() >= limit as usize {
            return Err(Error::quota_exceeded(format!(
                "Rate limit exceeded: {} events per second",
                limit
            )));
        }

        self.timestamps.push_back(now);
        Ok(())
    }
}

/// Per-source rate limiter.
#[derive(Debug)]
pub struct SourceRateLimiter {
    limit_per_second: u32,
    windows: HashMap<String, SlidingWindow>,
}

impl SourceRateLimiter {
    pub fn new(limit_per_second: u32) -> Self {
        Self {
            limit_per_second,
            windows: HashMap::new(),
        }
    }

    pub fn check(&mut self, source: &str, now: DateTime<Utc>) -> Result<()> {
        self.windows
            .entry(source.to_string())
            .or_default()
            .check_and_record(now, self.limit_per_second)
    }

    /// Events accepted for a source within the last second.
    pub fn current_rate(&self, source: &str, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(1);
        self.windows
            .get(source)
            .map(|w| w.timestamps.iter().filter(|&&ts| ts > cutoff).count())
            .unwrap_or(0)
    }

    /// Drop windows with no activity in the last second.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(1);
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            w.evict_before(cutoff);
            !w.timestamps.is_empty()
        });
        before - self.windows.len()
    }
}

/// Key type for near-duplicate suppression.
pub type DebounceKey = (String, String, String);

/// Remembers when each key was last accepted.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_seen: HashMap<DebounceKey, DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(1)),
            last_seen: HashMap::new(),
        }
    }

    /// True if `key` was accepted less than one window ago.
    pub fn is_duplicate(&self, key: &DebounceKey, now: DateTime<Utc>) -> bool {
        self.last_seen
            .get(key)
            .is_some_and(|&seen| now - seen < self.window)
    }

    pub fn record(&mut self, key: DebounceKey, now: DateTime<Utc>) {
        self.last_seen.insert(key, now);
    }

    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.last_seen.len();
        let window = self.window;
        self.last_seen.retain(|_, seen| now - *seen < window);
        before - self.last_seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_per_source() {
        let mut limiter = SourceRateLimiter::new(3);
        let now = Utc::now();
        for _ in 0..3 {
            assert!(limiter.check("a", now).is_ok());
        }
        assert!(limiter.check("a", now).is_err());
        // Independent source
        assert!(limiter.check("b", now).is_ok());
        assert_eq!(limiter.current_rate("a", now), 3);
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = SourceRateLimiter::new(1);
        let t0 = Utc::now();
        assert!(limiter.check("a", t0).is_ok());
        assert!(limiter.check("a", t0 + Duration::milliseconds(500)).is_err());
        assert!(limiter.check("a", t0 + Duration::milliseconds(1001)).is_ok());
    }

    #[test]
    fn test_cleanup_expired_windows() {
        let mut limiter = SourceRateLimiter::new(10);
        let t0 = Utc::now();
        limiter.check("a", t0).unwrap();
        assert_eq!(limiter.cleanup_expired(t0 + Duration::seconds(2)), 1);
        assert_eq!(limiter.current_rate("a", t0), 0);
    }

    #[test]
    fn test_debounce_window() {
        let mut debouncer = Debouncer::new(std::time::Duration::from_secs(1));
        let key = ("s".to_string(), "t".to_string(), "e".to_string());
        let t0 = Utc::now();
        assert!(!debouncer.is_duplicate(&key, t0));
        debouncer.record(key.clone(), t0);
        assert!(debouncer.is_duplicate(&key, t0 + Duration::milliseconds(999)));
        assert!(!debouncer.is_duplicate(&key, t0 + Duration::seconds(1)));
        assert_eq!(debouncer.cleanup_expired(t0 + Duration::seconds(2)), 1);
    }
}
