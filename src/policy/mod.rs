//! Policy Binding Engine.
//!
//! Evaluates named guardrails before workflows and actions proceed. Only a
//! failed check with [`Severity::Blocking`] stops anything; every other
//! outcome is recorded and counted.

mod checker;
mod types;

pub use checker::{DefaultChecker, GuardrailChecker};
pub use types::{blocking_failures, GuardrailCheck, PolicyBinding, PolicyType, Severity, WILDCARD};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::kernel::recovery::catch_panic;
use crate::types::{ActionContext, Error, PolicyConfig, Result};

/// Check counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyStats {
    pub total_checks: u64,
    pub passed: u64,
    pub failed: u64,
    /// Failures that blocked an action.
    pub blocked: u64,
    /// Failures keyed by severity label.
    pub failures_by_severity: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct PolicyState {
    history: VecDeque<GuardrailCheck>,
    stats: PolicyStats,
}

/// Registry of bindings and checkers plus the check history.
pub struct PolicyEngine {
    config: PolicyConfig,
    bindings: RwLock<Vec<PolicyBinding>>,
    checkers: RwLock<HashMap<PolicyType, Arc<dyn GuardrailChecker>>>,
    state: Mutex<PolicyState>,
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            bindings: RwLock::new(Vec::new()),
            checkers: RwLock::new(HashMap::new()),
            state: Mutex::new(PolicyState::default()),
        }
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    pub async fn add_binding(&self, binding: PolicyBinding) -> Result<()> {
        binding.validate()?;
        let mut bindings = self.bindings.write().await;
        if bindings.iter().any(|b| b.name == binding.name) {
            return Err(Error::validation(format!(
                "policy binding already registered: {}",
                binding.name
            )));
        }
        tracing::debug!("Registered policy binding: {}", binding.name);
        bindings.push(binding);
        Ok(())
    }

    pub async fn remove_binding(&self, name: &str) -> bool {
        let mut bindings = self.bindings.write().await;
        let before = bindings.len();
        bindings.retain(|b| b.name != name);
        bindings.len() != before
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut bindings = self.bindings.write().await;
        let binding = bindings
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| Error::not_found(format!("policy binding not found: {}", name)))?;
        binding.enabled = enabled;
        tracing::info!("policy_binding_toggled: binding={}, enabled={}", name, enabled);
        Ok(())
    }

    pub async fn bindings(&self) -> Vec<PolicyBinding> {
        self.bindings.read().await.clone()
    }

    /// Override the default checker for one policy type.
    pub async fn register_checker(
        &self,
        policy_type: PolicyType,
        checker: Arc<dyn GuardrailChecker>,
    ) {
        tracing::debug!("Registered guardrail checker for {:?}", policy_type);
        self.checkers.write().await.insert(policy_type, checker);
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluate every enabled binding in scope for `workflow_name` / `action_type`.
    pub async fn check(
        &self,
        workflow_name: &str,
        action_type: &str,
        context: &ActionContext,
    ) -> Vec<GuardrailCheck> {
        let selected: Vec<PolicyBinding> = self
            .bindings
            .read()
            .await
            .iter()
            .filter(|b| b.enabled && b.applies_to(workflow_name, action_type))
            .cloned()
            .collect();
        self.evaluate(selected, workflow_name, action_type, context).await
    }

    /// Evaluate the named bindings, in the order given. Unknown and disabled
    /// names are skipped.
    pub async fn check_named(
        &self,
        names: &[String],
        workflow_name: &str,
        action_type: &str,
        context: &ActionContext,
    ) -> Vec<GuardrailCheck> {
        let selected: Vec<PolicyBinding> = {
            let bindings = self.bindings.read().await;
            names
                .iter()
                .filter_map(|name| match bindings.iter().find(|b| &b.name == name) {
                    Some(b) if b.enabled => Some(b.clone()),
                    Some(_) => {
                        tracing::debug!("guardrail_disabled: binding={}", name);
                        None
                    }
                    None => {
                        tracing::warn!("guardrail_unknown: binding={}, workflow={}", name, workflow_name);
                        None
                    }
                })
                .collect()
        };
        self.evaluate(selected, workflow_name, action_type, context).await
    }

    /// True unless a blocking binding in scope fails.
    pub async fn is_action_allowed(
        &self,
        workflow_name: &str,
        action_type: &str,
        context: &ActionContext,
    ) -> bool {
        let checks = self.check(workflow_name, action_type, context).await;
        blocking_failures(&checks).is_empty()
    }

    async fn evaluate(
        &self,
        bindings: Vec<PolicyBinding>,
        workflow_name: &str,
        action_type: &str,
        context: &ActionContext,
    ) -> Vec<GuardrailCheck> {
        if bindings.is_empty() {
            return Vec::new();
        }
        let checkers = self.checkers.read().await.clone();

        let mut checks = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            let outcome = match checkers.get(&binding.policy_type) {
                Some(checker) => catch_panic(checker.check(binding, context), &binding.name).await,
                None => Ok(Ok(DefaultChecker::evaluate(binding, context))),
            };
            // A panicking checker fails closed, whatever the binding's severity.
            let (mut check, severity) = match outcome {
                Ok(Ok(check)) => (check, binding.severity),
                Ok(Err(e)) => {
                    tracing::warn!("guardrail_checker_error: binding={}, error={}", binding.name, e);
                    let message = format!("checker error: {}", e);
                    (GuardrailCheck::for_binding(binding, false, 0, message), binding.severity)
                }
                Err(panic_msg) => {
                    let message = format!("checker panicked: {}", panic_msg);
                    (GuardrailCheck::for_binding(binding, false, 0, message), Severity::Blocking)
                }
            };
            // Scope and identity come from the engine, not the checker.
            check.binding_name = binding.name.clone();
            check.policy_type = binding.policy_type;
            check.severity = severity;
            check.workflow_name = workflow_name.to_string();
            check.action_type = action_type.to_string();

            if check.is_blocking_failure() {
                tracing::warn!(
                    "guardrail_blocked: binding={}, workflow={}, action={}, reason={}",
                    check.binding_name,
                    workflow_name,
                    action_type,
                    check.message
                );
            }
            checks.push(check);
        }

        let mut state = self.state.lock().await;
        for check in &checks {
            state.stats.total_checks += 1;
            if check.passed {
                state.stats.passed += 1;
            } else {
                state.stats.failed += 1;
                if check.is_blocking_failure() {
                    state.stats.blocked += 1;
                }
                *state
                    .stats
                    .failures_by_severity
                    .entry(check.severity.as_str().to_string())
                    .or_default() += 1;
            }
            if state.history.len() >= self.config.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(check.clone());
        }
        checks
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn stats(&self) -> PolicyStats {
        self.state.lock().await.stats.clone()
    }

    /// Most recent checks, newest last.
    pub async fn recent_checks(&self, limit: usize) -> Vec<GuardrailCheck> {
        let state = self.state.lock().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AlwaysFails;

    #[async_trait]
    impl GuardrailChecker for AlwaysFails {
        async fn check(&self, binding: &PolicyBinding, _context: &ActionContext) -> Result<GuardrailCheck> {
            Ok(GuardrailCheck::for_binding(binding, false, 0, "constitutional review rejected"))
        }
    }

    struct Erroring;

    #[async_trait]
    impl GuardrailChecker for Erroring {
        async fn check(&self, _binding: &PolicyBinding, _context: &ActionContext) -> Result<GuardrailCheck> {
            Err(Error::handler("review service unreachable"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl GuardrailChecker for Panicking {
        async fn check(&self, _binding: &PolicyBinding, _context: &ActionContext) -> Result<GuardrailCheck> {
            panic!("review model crashed");
        }
    }

    async fn engine() -> PolicyEngine {
        let engine = PolicyEngine::new(PolicyConfig::default());
        engine
            .add_binding(
                PolicyBinding::new("use_of_force", PolicyType::Legal)
                    .for_actions(&["deploy_robot"])
                    .with_requirements(&["supervisor_approval"]),
            )
            .await
            .unwrap();
        engine
            .add_binding(
                PolicyBinding::new("privacy_notice", PolicyType::Privacy)
                    .with_severity(Severity::Advisory)
                    .with_requirements(&["notice_posted"]),
            )
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_check_selects_bindings_in_scope() {
        let engine = engine().await;
        let checks = engine.check("patrol", "send_alert", &ActionContext::new()).await;
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].binding_name, "privacy_notice");

        let checks = engine.check("patrol", "deploy_robot", &ActionContext::new()).await;
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].workflow_name, "patrol");
        assert_eq!(checks[0].action_type, "deploy_robot");
    }

    #[tokio::test]
    async fn test_only_blocking_failures_disallow() {
        let engine = engine().await;
        assert!(engine.is_action_allowed("patrol", "send_alert", &ActionContext::new()).await);
        assert!(!engine.is_action_allowed("patrol", "deploy_robot", &ActionContext::new()).await);
        let approved = ActionContext::new().with_requirement("supervisor_approval");
        assert!(engine.is_action_allowed("patrol", "deploy_robot", &approved).await);

        let stats = engine.stats().await;
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.failures_by_severity.get("advisory"), Some(&3));
        assert_eq!(stats.total_checks, 5);
    }

    #[tokio::test]
    async fn test_custom_checker_overrides_default() {
        let engine = engine().await;
        engine.add_binding(PolicyBinding::new("always_fails", PolicyType::Constitutional)).await.unwrap();
        engine.register_checker(PolicyType::Constitutional, Arc::new(AlwaysFails)).await;

        let checks = engine
            .check_named(&["always_fails".to_string()], "surveillance", "", &ActionContext::new())
            .await;
        assert_eq!(checks.len(), 1);
        assert!(checks[0].is_blocking_failure());
        assert_eq!(checks[0].message, "constitutional review rejected");
    }

    #[tokio::test]
    async fn test_checker_error_recorded_as_failure() {
        let engine = engine().await;
        engine.register_checker(PolicyType::Privacy, Arc::new(Erroring)).await;
        let checks = engine
            .check_named(&["privacy_notice".to_string()], "w", "a", &ActionContext::new())
            .await;
        assert!(!checks[0].passed);
        assert!(checks[0].message.contains("unreachable"));
        assert_eq!(checks[0].severity, Severity::Advisory);
    }

    #[tokio::test]
    async fn test_panicking_checker_fails_closed() {
        let engine = engine().await;
        engine.register_checker(PolicyType::Privacy, Arc::new(Panicking)).await;
        let context = ActionContext::new();
        let checks = engine
            .check_named(&["privacy_notice".to_string()], "w", "a", &context)
            .await;
        assert!(!checks[0].passed);
        assert!(checks[0].message.contains("review model crashed"));
        assert!(checks[0].is_blocking_failure());
        assert!(!engine.is_action_allowed("w", "a", &context).await);
        assert_eq!(engine.stats().await.blocked, 2);
    }

    #[tokio::test]
    async fn test_check_named_skips_unknown_and_disabled() {
        let engine = engine().await;
        engine.set_enabled("use_of_force", false).await.unwrap();
        let names = vec![
            "missing".to_string(),
            "use_of_force".to_string(),
            "privacy_notice".to_string(),
        ];
        let checks = engine.check_named(&names, "w", "deploy_robot", &ActionContext::new()).await;
        assert_eq!(checks.len(), 1);
        assert_eq!(engine.recent_checks(10).await.len(), 1);
        assert!(engine.set_enabled("missing", true).await.is_err());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let engine = PolicyEngine::new(PolicyConfig { history_capacity: 3 });
        engine.add_binding(PolicyBinding::new("b", PolicyType::Safety)).await.unwrap();
        for _ in 0..5 {
            engine.check("w", "a", &ActionContext::new()).await;
        }
        assert_eq!(engine.recent_checks(100).await.len(), 3);
        assert!(engine.add_binding(PolicyBinding::new("b", PolicyType::Safety)).await.is_err());
        assert!(engine.remove_binding("b").await);
    }
}
