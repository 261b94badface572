//! Global subscriber installation. Kept out of the unit test binary so
//! `traced_test` there can own the global default.

use orchestration_core::observability::{init_tracing, init_tracing_with};
use orchestration_core::types::ObservabilityConfig;

#[test]
fn init_tracing_is_idempotent() {
    init_tracing();
    init_tracing_with(&ObservabilityConfig::default());
    init_tracing();
    tracing::info!("tracing_ready: after=3 installs");
}
