//! Configuration structures.
//!
//! Configuration is loaded from a JSON file with environment overrides.
//! Every section is optional and falls back to its `Default`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Event Fusion Bus tuning.
    #[serde(default)]
    pub fusion: FusionConfig,

    /// Event Router tuning.
    #[serde(default)]
    pub router: RouterConfig,

    /// Policy Binding Engine tuning.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Workflow Engine tuning.
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Resource Manager tuning.
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Orchestration Kernel tuning.
    #[serde(default)]
    pub kernel: KernelConfig,

    /// Background maintenance task.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ORCHESTRATION_LOG_LEVEL` / `ORCHESTRATION_LOG_FORMAT`.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("ORCHESTRATION_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.observability.log_level = level;
            }
        }
        if let Ok(format) = std::env::var("ORCHESTRATION_LOG_FORMAT") {
            self.observability.json_logs = format.eq_ignore_ascii_case("json");
        }
        self
    }

    /// Reject configurations that would disable core bookkeeping.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, usize); 7] = [
            ("fusion.rate_limit_per_second", self.fusion.rate_limit_per_second as usize),
            ("fusion.buffer_capacity", self.fusion.buffer_capacity),
            ("fusion.history_capacity", self.fusion.history_capacity),
            ("router.history_capacity", self.router.history_capacity),
            ("policy.history_capacity", self.policy.history_capacity),
            ("workflow.audit_capacity", self.workflow.audit_capacity),
            ("kernel.history_capacity", self.kernel.history_capacity),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(Error::validation(format!("{} must be positive", field)));
            }
        }
        if !(0.0..=100.0).contains(&self.resources.min_health_score) {
            return Err(Error::validation(
                "resources.min_health_score must be within 0..=100",
            ));
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Event Fusion Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Accepted events per source within a sliding 1-second window.
    pub rate_limit_per_second: u32,

    /// Identical (source, event_type, entity_id) keys inside this window are dropped.
    #[serde(with = "humantime_serde")]
    pub debounce_window: Duration,

    /// Per-source buffer bound; oldest events drop on overflow.
    pub buffer_capacity: usize,

    /// A buffer is drained once this much time passed since its last flush.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Global ring buffer of accepted events.
    pub history_capacity: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_second: 100,
            debounce_window: Duration::from_secs(1),
            buffer_capacity: 1000,
            flush_interval: Duration::from_secs(5),
            history_capacity: 10_000,
        }
    }
}

/// Event Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Bounded history of routed events.
    pub history_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

/// Policy Binding Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Bounded history of guardrail checks.
    pub history_capacity: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10_000,
        }
    }
}

/// Workflow Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Bounded audit log.
    pub audit_capacity: usize,

    /// Timeout applied to templates that declare none.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            audit_capacity: 10_000,
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// Resource Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// A resource is available only above this health score.
    pub min_health_score: f64,

    /// Closed allocations kept for reporting.
    pub history_capacity: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            min_health_score: 50.0,
            history_capacity: 10_000,
        }
    }
}

/// Orchestration Kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Bounded action history.
    pub history_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// How often the maintenance cycle runs.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Finished workflow instances and action runs older than this are pruned.
    #[serde(with = "humantime_serde")]
    pub instance_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            instance_retention: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        tokio_test::assert_ok!(config.validate());
        assert_eq!(config.fusion.rate_limit_per_second, 100);
        assert_eq!(config.fusion.history_capacity, 10_000);
    }

    #[test]
    fn test_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"fusion": {{"rate_limit_per_second": 5, "flush_interval": "250ms"}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.fusion.rate_limit_per_second, 5);
        assert_eq!(config.fusion.flush_interval, Duration::from_millis(250));
        assert_eq!(config.fusion.buffer_capacity, 1000);
        assert_eq!(config.router.history_capacity, 1000);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.kernel.history_capacity = 0;
        let err = tokio_test::assert_err!(config.validate());
        assert!(err.to_string().contains("kernel.history_capacity"));
    }
}
