//! Guardrail checkers.

use async_trait::async_trait;

use super::types::{GuardrailCheck, PolicyBinding};
use crate::types::{ActionContext, Result};

/// Evaluates one binding against a context.
#[async_trait]
pub trait GuardrailChecker: Send + Sync {
    async fn check(&self, binding: &PolicyBinding, context: &ActionContext) -> Result<GuardrailCheck>;
}

const BLOCKING_PENALTY: u8 = 25;
const ADVISORY_PENALTY: u8 = 10;

/// Requirement/prohibition/condition checker used when no custom checker
/// is registered for the binding's type.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultChecker;

impl DefaultChecker {
    pub fn evaluate(binding: &PolicyBinding, context: &ActionContext) -> GuardrailCheck {
        let missing: Vec<&str> = binding
            .requirements
            .iter()
            .filter(|r| !context.satisfied_requirements.contains(*r))
            .map(String::as_str)
            .collect();
        let hits: Vec<&str> = binding
            .prohibitions
            .iter()
            .filter(|p| context.detected_violations.contains(*p))
            .map(String::as_str)
            .collect();
        let doc = context.document();
        let failed_conditions: Vec<&str> = binding
            .conditions
            .iter()
            .filter(|c| !c.evaluate(&doc))
            .map(|c| c.field.as_str())
            .collect();

        let penalty = if binding.is_blocking() {
            BLOCKING_PENALTY
        } else {
            ADVISORY_PENALTY
        };
        let deficits = missing.len() + failed_conditions.len();
        let score = if hits.is_empty() {
            100u8.saturating_sub(penalty.saturating_mul(deficits.min(u8::MAX as usize) as u8))
        } else {
            0
        };
        let passed = deficits == 0 && hits.is_empty();

        let mut problems = Vec::new();
        let mut recommendations = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing requirements: {}", missing.join(", ")));
            recommendations.extend(missing.iter().map(|r| format!("satisfy requirement: {}", r)));
        }
        if !failed_conditions.is_empty() {
            problems.push(format!("conditions not met: {}", failed_conditions.join(", ")));
            recommendations.extend(failed_conditions.iter().map(|f| format!("review condition on: {}", f)));
        }
        if !hits.is_empty() {
            problems.push(format!("prohibited conditions present: {}", hits.join(", ")));
            recommendations.extend(hits.iter().map(|p| format!("resolve violation: {}", p)));
        }
        let message = if passed {
            format!("{} satisfied", binding.name)
        } else {
            problems.join("; ")
        };

        GuardrailCheck::for_binding(binding, passed, score, message).with_recommendations(recommendations)
    }
}

#[async_trait]
impl GuardrailChecker for DefaultChecker {
    async fn check(&self, binding: &PolicyBinding, context: &ActionContext) -> Result<GuardrailCheck> {
        Ok(Self::evaluate(binding, context))
    }
}
