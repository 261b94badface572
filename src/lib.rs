//! # Orchestration Core - cross-subsystem response coordination
//!
//! Rust implementation of the orchestration subsystem providing:
//! - Event fusion: per-source buffering, rate limiting, debounce, and
//!   time/geo-windowed correlation into composite events
//! - Event routing: normalization to a canonical schema and rule-based
//!   fan-out to named pipelines
//! - Workflow execution: sequential and parallel steps with retries,
//!   timeouts, continuations and an audit log
//! - Policy guardrails: blocking and advisory bindings with pluggable checkers
//! - Resource allocation: priority preemption, nearest-asset search,
//!   utilization reporting
//! - An orchestration kernel tying them together behind a prioritized action
//!   queue and subsystem handler registry
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────────────────────────┐
//!   raw events  ───►  │          OrchestrationKernel         │
//!                     │  ┌────────────┐   ┌────────────┐     │
//!                     │  │ FusionBus  │   │   Router   │     │
//!                     │  └─────┬──────┘   └─────┬──────┘     │
//!                     │        └──► Workflow ◄──┘            │
//!                     │             Engine ──► Policy        │
//!                     │               │                      │
//!                     │        ActionDispatcher ──► handlers │
//!                     │  ┌────────────┐   ┌────────────┐     │
//!                     │  │ Resources  │   │ Notify bus │ ──► │ adapters
//!                     │  └────────────┘   └────────────┘     │
//!                     └──────────────────────────────────────┘
//! ```
//!
//! Priorities use one convention throughout: a lower level is more urgent
//! (`Emergency` = 1 ... `Info` = 5).

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod condition;
pub mod fusion;
pub mod kernel;
pub mod notify;
pub mod policy;
pub mod resources;
pub mod router;
pub mod types;
pub mod workflow;

// Internal utilities
pub mod observability;
pub mod validation;

pub use kernel::OrchestrationKernel;
pub use types::{Config, Error, Result};
