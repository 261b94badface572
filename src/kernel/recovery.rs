//! Panic recovery at handler boundaries.
//!
//! Subsystem and step handlers are supplied by collaborators. A panic in one
//! of them must become a failed result, not a crashed orchestrator.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Poll `future` to completion, capturing a panic as its message.
pub async fn catch_panic<Fut>(future: Fut, operation_name: &str) -> std::result::Result<Fut::Output, String>
where
    Fut: Future,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(output) => Ok(output),
        Err(payload) => {
            let panic_msg = extract_panic_message(payload.as_ref());
            tracing::error!("async_panic_recovered: operation={}, panic={}", operation_name, panic_msg);
            Err(panic_msg)
        }
    }
}

/// Run a fallible async operation; a panic becomes `Error::Internal`.
pub async fn with_recovery_async<F, Fut, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match catch_panic(operation(), operation_name).await {
        Ok(result) => result,
        Err(panic_msg) => Err(Error::internal(format!("Panic in {}: {}", operation_name, panic_msg))),
    }
}

fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}
