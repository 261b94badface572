//! Event Fusion Bus.
//!
//! Ingests raw events from independent feeds, suppresses noise (per-source
//! rate limiting, debouncing, bounded buffers) and correlates related events
//! into higher-confidence [`FusedEvent`]s:
//!
//! ```text
//!   ingest ─► debounce ─► rate limit ─► EventBuffer (per source)
//!                                            │ flush (full | interval)
//!                                            ▼
//!                        FusionRule[0..n] ─► correlate ─► FusionResult ─► subscribers
//! ```

mod buffer;
mod bus;
mod correlate;
mod limiter;
mod types;

pub use buffer::EventBuffer;
pub use bus::{EventFusionBus, FusionSubscriber};
pub use correlate::{confidence_score, correlate};
pub use limiter::{Debouncer, SourceRateLimiter};
pub use types::{parse_timestamp, FusedEvent, FusionResult, FusionRule, FusionStats, RawEvent};
