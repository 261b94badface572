//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Expected orchestration outcomes
//! (guardrail failures, resource contention, rejected ingestion) are plain
//! values and never surface through this type.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the orchestration core.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing fields in a request, rejected at the boundary.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown resource, template, instance or binding.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limit or capacity exhaustion.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Invalid state transition (kernel, workflow instance).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// A subsystem, step or pipeline handler reported a failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// Internal errors, including recovered handler panics.
    #[error("internal error: {0}")]
    Internal(String),

    /// Cooperative cancellation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Wall-clock budget exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable, lowercase kind label used in audit records and notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::StateTransition(_) => "state_transition",
            Error::Handler(_) => "handler",
            Error::Internal(_) => "internal",
            Error::Cancelled(_) => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}
