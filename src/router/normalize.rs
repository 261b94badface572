//! Canonical event schema and the normalizer that produces it.
//!
//! Normalization never fails: malformed input degrades to defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fusion::parse_timestamp;
use crate::types::{EventId, GeoPoint, Priority, ThreatLevel};

/// Canonical category derived from the source channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Threat,
    Alert,
    Incident,
    Sensor,
    Drone,
    Robotics,
    Dispatch,
    Investigation,
    Intelligence,
    Environmental,
    Traffic,
    Infrastructure,
    Compliance,
    System,
}

impl EventCategory {
    /// Fixed channel table; unknown channels map to `System`.
    pub fn from_channel(channel: &str) -> Self {
        match channel.trim().to_ascii_lowercase().as_str() {
            "threat" | "threats" | "threat_detection" | "gunshot" | "acoustic" => EventCategory::Threat,
            "alert" | "alerts" | "alarm" | "alarms" => EventCategory::Alert,
            "incident" | "incidents" | "cad" => EventCategory::Incident,
            "sensor" | "sensors" | "sensor_fusion" | "iot" | "camera" | "cameras" => EventCategory::Sensor,
            "drone" | "drones" | "drone_ops" | "uav" => EventCategory::Drone,
            "robot" | "robots" | "robotics" => EventCategory::Robotics,
            "dispatch" | "units" | "patrol" => EventCategory::Dispatch,
            "investigation" | "investigations" | "case" | "cases" => EventCategory::Investigation,
            "intel" | "intelligence" | "osint" => EventCategory::Intelligence,
            "environment" | "environmental" | "weather" | "air_quality" => EventCategory::Environmental,
            "traffic" | "lpr" | "transit" => EventCategory::Traffic,
            "infrastructure" | "utilities" | "power_grid" => EventCategory::Infrastructure,
            "compliance" | "policy" | "legal" | "audit" => EventCategory::Compliance,
            _ => EventCategory::System,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::Threat => "threat",
            EventCategory::Alert => "alert",
            EventCategory::Incident => "incident",
            EventCategory::Sensor => "sensor",
            EventCategory::Drone => "drone",
            EventCategory::Robotics => "robotics",
            EventCategory::Dispatch => "dispatch",
            EventCategory::Investigation => "investigation",
            EventCategory::Intelligence => "intelligence",
            EventCategory::Environmental => "environmental",
            EventCategory::Traffic => "traffic",
            EventCategory::Infrastructure => "infrastructure",
            EventCategory::Compliance => "compliance",
            EventCategory::System => "system",
        }
    }
}

/// Canonicalized event. Immutable apart from `routed_to` and `processed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: EventId,
    pub source_channel: String,
    pub subsystem: String,
    pub category: EventCategory,
    pub event_type: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub summary: String,
    pub details: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeoPoint>,
    pub entity_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_level: Option<ThreatLevel>,
    pub routed_to: Vec<String>,
    pub processed: bool,
}

impl NormalizedEvent {
    /// JSON view used for field conditions.
    pub fn document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

const KNOWN_FIELDS: &[&str] = &[
    "id",
    "event_type",
    "type",
    "priority",
    "severity",
    "timestamp",
    "title",
    "summary",
    "details",
    "geolocation",
    "location",
    "entity_ids",
    "entity_id",
    "threat_level",
];

/// Map a heterogeneous raw event into the canonical schema.
pub fn normalize(raw: &Value, channel: &str, subsystem: &str) -> NormalizedEvent {
    let empty = Map::new();
    let obj = raw.as_object().unwrap_or(&empty);
    let category = EventCategory::from_channel(channel);

    let event_type = obj
        .get("event_type")
        .or_else(|| obj.get("type"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("unknown")
        .to_string();

    let priority = obj
        .get("priority")
        .or_else(|| obj.get("severity"))
        .and_then(Priority::from_value)
        .unwrap_or(Priority::Medium);

    let timestamp = obj
        .get("timestamp")
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    let title = obj
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} event: {}", category.as_str(), event_type));

    let summary = obj
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // Explicit details first, then every unrecognised top-level field.
    let mut details = obj
        .get("details")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (key, value) in obj {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            details.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    let geolocation = obj
        .get("geolocation")
        .or_else(|| obj.get("location"))
        .and_then(GeoPoint::from_value);

    let mut entity_ids: Vec<String> = obj
        .get("entity_ids")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    if let Some(single) = obj.get("entity_id").and_then(Value::as_str) {
        if !entity_ids.iter().any(|e| e == single) {
            entity_ids.push(single.to_string());
        }
    }

    let threat_level = obj
        .get("threat_level")
        .and_then(Value::as_str)
        .and_then(ThreatLevel::from_label);

    NormalizedEvent {
        id: EventId::new(),
        source_channel: channel.to_string(),
        subsystem: subsystem.to_string(),
        category,
        event_type,
        priority,
        timestamp,
        title,
        summary,
        details,
        geolocation,
        entity_ids,
        threat_level,
        routed_to: Vec::new(),
        processed: false,
    }
}
