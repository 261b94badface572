//! Declarative routing rules.

use serde::{Deserialize, Serialize};

use super::normalize::{EventCategory, NormalizedEvent};
use crate::condition::{all_match, Condition};
use crate::types::{Error, Priority, Result};
use crate::validation::validate_non_empty;

/// Match an event against channel, category, urgency and field conditions,
/// and name the pipelines that should receive it. Empty lists match anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    #[serde(default)]
    pub source_channels: Vec<String>,
    #[serde(default)]
    pub categories: Vec<EventCategory>,
    /// Least urgent priority that still matches.
    #[serde(default)]
    pub min_priority: Option<Priority>,
    #[serde(default)]
    pub field_conditions: Vec<Condition>,
    pub target_pipelines: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RoutingRule {
    pub fn new(name: impl Into<String>, targets: &[&str]) -> Self {
        Self {
            name: name.into(),
            source_channels: Vec::new(),
            categories: Vec::new(),
            min_priority: None,
            field_conditions: Vec::new(),
            target_pipelines: targets.iter().map(|t| t.to_string()).collect(),
            enabled: true,
        }
    }

    pub fn with_channels(mut self, channels: &[&str]) -> Self {
        self.source_channels = channels.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_categories(mut self, categories: &[EventCategory]) -> Self {
        self.categories = categories.to_vec();
        self
    }

    pub fn with_min_priority(mut self, priority: Priority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.field_conditions.push(condition);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_non_empty(&self.name, "routing rule name")?;
        if self.target_pipelines.is_empty() {
            return Err(Error::validation(format!(
                "routing rule {} has no target pipelines",
                self.name
            )));
        }
        Ok(())
    }

    /// Enabled and every dimension satisfied.
    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.source_channels.is_empty()
            && !self
                .source_channels
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&event.source_channel))
        {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&event.category) {
            return false;
        }
        if let Some(min) = self.min_priority {
            if min.is_more_urgent_than(event.priority) {
                return false;
            }
        }
        self.field_conditions.is_empty() || all_match(&self.field_conditions, &event.document())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionOp;
    use crate::router::normalize;
    use serde_json::json;

    #[test]
    fn test_empty_dimensions_match_everything() {
        let event = normalize(&json!({"event_type": "x"}), "weather", "noaa");
        assert!(RoutingRule::new("all", &["archive"]).matches(&event));
    }

    #[test]
    fn test_min_priority_threshold() {
        let rule = RoutingRule::new("urgent", &["dispatch"]).with_min_priority(Priority::High);
        let emergency = normalize(&json!({"priority": "emergency"}), "alerts", "s");
        let high = normalize(&json!({"priority": "high"}), "alerts", "s");
        let low = normalize(&json!({"priority": "low"}), "alerts", "s");
        assert!(rule.matches(&emergency));
        assert!(rule.matches(&high));
        assert!(!rule.matches(&low));
    }

    #[test]
    fn test_channels_categories_and_conditions() {
        let rule = RoutingRule::new("zone", &["patrol"])
            .with_channels(&["Sensors"])
            .with_categories(&[EventCategory::Sensor])
            .with_condition(Condition::new("details.zone", ConditionOp::In, json!(["A", "B"])));

        let hit = normalize(&json!({"zone": "A"}), "sensors", "lidar");
        let wrong_zone = normalize(&json!({"zone": "C"}), "sensors", "lidar");
        let wrong_channel = normalize(&json!({"zone": "A"}), "camera", "lidar");
        assert!(rule.matches(&hit));
        assert!(!rule.matches(&wrong_zone));
        assert!(!rule.matches(&wrong_channel));

        let mut disabled = rule.clone();
        disabled.enabled = false;
        assert!(!disabled.matches(&hit));
    }

    #[test]
    fn test_validation() {
        assert!(RoutingRule::new("", &["x"]).validate().is_err());
        assert!(RoutingRule::new("empty", &[]).validate().is_err());
        assert!(RoutingRule::new("ok", &["x"]).validate().is_ok());
    }
}
