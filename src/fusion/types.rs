//! Fusion data model: raw events, correlation rules, fused composites.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::types::{Error, EventId, FusedEventId, GeoPoint, Priority, Result, ThreatLevel};
use crate::validation::validate_non_empty;

/// Fields lifted out of an inbound payload into typed attributes.
const RESERVED_FIELDS: &[&str] = &[
    "event_type",
    "priority",
    "severity",
    "geolocation",
    "location",
    "entity_id",
    "threat_level",
    "timestamp",
];

/// Unprocessed input from a source. Consumed once by the router or the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: EventId,
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_level: Option<ThreatLevel>,
    /// Free-form fields not lifted into typed attributes.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
}

impl RawEvent {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            priority: Priority::default(),
            geolocation: None,
            entity_id: None,
            threat_level: None,
            payload: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_geolocation(mut self, point: GeoPoint) -> Self {
        self.geolocation = Some(point);
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_threat_level(mut self, level: ThreatLevel) -> Self {
        self.threat_level = Some(level);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Build from an inbound JSON object. `event_type` is the only required
    /// field; unknown fields are preserved in `payload`.
    pub fn from_json(source: &str, value: &Value) -> Result<Self> {
        if source.trim().is_empty() {
            return Err(Error::validation("event source cannot be empty"));
        }
        let obj = value
            .as_object()
            .ok_or_else(|| Error::validation("event must be a JSON object"))?;
        let event_type = obj
            .get("event_type")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::validation("event_type is required"))?;

        let mut event = RawEvent::new(source, event_type);
        event.priority = obj
            .get("priority")
            .or_else(|| obj.get("severity"))
            .and_then(Priority::from_value)
            .unwrap_or_default();
        event.geolocation = obj
            .get("geolocation")
            .or_else(|| obj.get("location"))
            .and_then(GeoPoint::from_value);
        event.entity_id = obj.get("entity_id").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        event.threat_level = obj
            .get("threat_level")
            .and_then(Value::as_str)
            .and_then(ThreatLevel::from_label);
        if let Some(ts) = obj.get("timestamp").and_then(parse_timestamp) {
            event.timestamp = ts;
        }
        event.payload = obj
            .iter()
            .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(event)
    }

    /// Key used for debouncing near-duplicates.
    pub fn debounce_key(&self) -> (String, String, String) {
        (
            self.source.clone(),
            self.event_type.clone(),
            self.entity_id.clone().unwrap_or_default(),
        )
    }

    /// Threat as reported, or as implied by priority.
    pub fn effective_threat(&self) -> ThreatLevel {
        self.threat_level
            .unwrap_or_else(|| ThreatLevel::from_priority(self.priority))
    }
}

/// Parse an RFC 3339 string or an epoch number (seconds, or milliseconds
/// when large enough to be unambiguous).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

/// Declarative correlation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionRule {
    pub name: String,
    /// Event types eligible for this rule.
    pub event_types: Vec<String>,
    /// Members must fall within this span of the earliest member.
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
    /// Members must lie within this many meters of the earliest member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_radius_m: Option<f64>,
    pub min_events: usize,
    /// Actions attached to every fused event this rule produces.
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

impl FusionRule {
    pub fn new(name: impl Into<String>, event_types: &[&str], min_events: usize) -> Self {
        Self {
            name: name.into(),
            event_types: event_types.iter().map(|s| s.to_string()).collect(),
            time_window: Duration::from_secs(60),
            geo_radius_m: None,
            min_events,
            recommended_actions: Vec::new(),
        }
    }

    pub fn with_time_window(mut self, window: Duration) -> Self {
        self.time_window = window;
        self
    }

    pub fn with_geo_radius(mut self, meters: f64) -> Self {
        self.geo_radius_m = Some(meters);
        self
    }

    pub fn with_actions(mut self, actions: &[&str]) -> Self {
        self.recommended_actions = actions.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn matches_type(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == event_type)
    }

    pub fn validate(&self) -> Result<()> {
        validate_non_empty(&self.name, "fusion rule name")?;
        if self.event_types.is_empty() {
            return Err(Error::validation(format!(
                "fusion rule {} must list at least one event type",
                self.name
            )));
        }
        if self.min_events == 0 {
            return Err(Error::validation(format!(
                "fusion rule {} min_events must be positive",
                self.name
            )));
        }
        if let Some(radius) = self.geo_radius_m {
            if radius.is_nan() || radius <= 0.0 {
                return Err(Error::validation(format!(
                    "fusion rule {} geo_radius_m must be positive",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Built-in correlation catalogue for public-safety feeds.
    pub fn default_catalogue() -> Vec<FusionRule> {
        vec![
            FusionRule::new("gunshot_cluster", &["gunshot_detected", "shots_fired"], 2)
                .with_time_window(Duration::from_secs(30))
                .with_geo_radius(500.0)
                .with_actions(&[
                    "dispatch_nearest_units",
                    "launch_drone_overwatch",
                    "notify_dispatch",
                ]),
            FusionRule::new("officer_distress", &["officer_distress", "panic_button"], 1)
                .with_time_window(Duration::from_secs(60))
                .with_actions(&["dispatch_immediate_backup", "notify_supervisor"]),
            FusionRule::new(
                "vehicle_pursuit",
                &["lpr_hit", "vehicle_speeding", "pursuit_initiated"],
                2,
            )
            .with_time_window(Duration::from_secs(120))
            .with_geo_radius(2_000.0)
            .with_actions(&["track_vehicle", "coordinate_intercept"]),
            FusionRule::new("crowd_anomaly", &["crowd_density", "crowd_surge"], 3)
                .with_time_window(Duration::from_secs(300))
                .with_geo_radius(1_000.0)
                .with_actions(&["deploy_crowd_monitoring", "alert_event_command"]),
        ]
    }
}

/// Correlated composite event. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedEvent {
    pub id: FusedEventId,
    pub rule_name: String,
    pub source_events: Vec<EventId>,
    /// Distinct sources, first-seen order.
    pub sources: Vec<String>,
    pub source_count: usize,
    pub event_types: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeoPoint>,
    pub entity_ids: Vec<String>,
    pub priority: Priority,
    pub threat_level: ThreatLevel,
    /// 0-100.
    pub confidence: u8,
    pub recommended_actions: Vec<String>,
    pub requires_action: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one fusion pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionResult {
    pub fused_events: Vec<FusedEvent>,
    pub unfused_events: Vec<RawEvent>,
    pub processed_count: usize,
    pub processing_time_ms: u64,
}

/// Counters maintained by the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionStats {
    pub events_received: u64,
    pub events_accepted: u64,
    pub dropped_rate_limited: u64,
    pub dropped_debounced: u64,
    pub dropped_overflow: u64,
    pub events_fused: u64,
    pub fused_events_created: u64,
    pub fusion_passes: u64,
}

impl FusionStats {
    pub fn events_dropped(&self) -> u64 {
        self.dropped_rate_limited + self.dropped_debounced + self.dropped_overflow
    }
}
