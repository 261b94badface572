//! Core types for the orchestration core.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (EventId, InstanceId, ActionId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for every engine
//! - **Scales**: Priority and threat level, geographic points, action context

mod config;
mod context;
mod errors;
mod geo;
mod ids;
mod priority;

pub use config::{
    Config, FusionConfig, KernelConfig, MaintenanceConfig, ObservabilityConfig, PolicyConfig,
    ResourceConfig, RouterConfig, WorkflowConfig,
};
pub use context::ActionContext;
pub use errors::{Error, Result};
pub use geo::GeoPoint;
pub use ids::{ActionId, AllocationId, CheckId, EventId, FusedEventId, InstanceId};
pub use priority::{Priority, ThreatLevel};
