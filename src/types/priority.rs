//! Urgency scales shared by every component.
//!
//! One convention everywhere: a lower numeric level is more urgent
//! (`Emergency` = 1 ... `Info` = 5). The kernel queue, resource preemption
//! and event normalization all compare through [`Priority::is_more_urgent_than`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Urgency of an event, action or allocation request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Emergency,
    High,
    #[default]
    Medium,
    Low,
    Info,
}

impl Priority {
    /// Numeric level, 1 (emergency) to 5 (informational).
    pub fn level(self) -> u8 {
        match self {
            Priority::Emergency => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
            Priority::Info => 5,
        }
    }

    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(Priority::Emergency),
            2 => Some(Priority::High),
            3 => Some(Priority::Medium),
            4 => Some(Priority::Low),
            5 => Some(Priority::Info),
            _ => None,
        }
    }

    /// Parse a free-form label; accepts the common severity synonyms.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "emergency" | "critical" | "urgent" | "p1" => Some(Priority::Emergency),
            "high" | "major" | "p2" => Some(Priority::High),
            "medium" | "normal" | "moderate" | "p3" => Some(Priority::Medium),
            "low" | "minor" | "p4" => Some(Priority::Low),
            "info" | "informational" | "debug" | "p5" => Some(Priority::Info),
            _ => None,
        }
    }

    /// Lenient conversion from a JSON string or integer. Anything
    /// unrecognised yields `None`; callers decide the fallback.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Self::from_label(s).or_else(|| {
                s.trim().parse::<i64>().ok().and_then(Self::from_level)
            }),
            Value::Number(n) => n.as_i64().and_then(Self::from_level),
            _ => None,
        }
    }

    pub fn is_more_urgent_than(self, other: Priority) -> bool {
        self.level() < other.level()
    }

    /// True for `Emergency` and `High`.
    pub fn requires_action(self) -> bool {
        self.level() <= Priority::High.level()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Emergency => "emergency",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Info => "info",
        };
        f.write_str(label)
    }
}

/// Assessed threat of an event. Ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" | "minimal" => Some(ThreatLevel::Low),
            "medium" | "moderate" | "elevated" => Some(ThreatLevel::Medium),
            "high" | "severe" => Some(ThreatLevel::High),
            "critical" | "extreme" => Some(ThreatLevel::Critical),
            _ => None,
        }
    }

    /// Threat implied by urgency when a source reports none.
    pub fn from_priority(priority: Priority) -> Self {
        match priority {
            Priority::Emergency => ThreatLevel::Critical,
            Priority::High => ThreatLevel::High,
            Priority::Medium => ThreatLevel::Medium,
            Priority::Low | Priority::Info => ThreatLevel::Low,
        }
    }
}
