//! Resource inventory and allocation records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{AllocationId, Error, GeoPoint, Priority, Result};
use crate::validation::{validate_non_empty, validate_percent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Drone,
    Robot,
    Vehicle,
    Compute,
    Sensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Available,
    Allocated,
    Maintenance,
    Charging,
    Offline,
}

/// An allocatable asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub current_load: u32,
    /// Battery or fuel, percent.
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default = "default_health")]
    pub health_score: f64,
    #[serde(default)]
    pub current_workflow: Option<String>,
    #[serde(default)]
    pub current_allocation: Option<AllocationId>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

fn default_capacity() -> u32 {
    1
}

fn default_health() -> f64 {
    100.0
}

impl Resource {
    pub fn new(id: impl Into<String>, name: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            resource_type,
            status: ResourceStatus::Available,
            location: None,
            capabilities: Vec::new(),
            capacity: default_capacity(),
            current_load: 0,
            battery_level: None,
            health_score: default_health(),
            current_workflow: None,
            current_allocation: None,
            assigned_to: None,
            metadata: Map::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_health(mut self, health_score: f64) -> Self {
        self.health_score = health_score;
        self
    }

    pub fn with_battery(mut self, level: f64) -> Self {
        self.battery_level = Some(level);
        self
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_non_empty(&self.id, "resource id")?;
        validate_percent(self.health_score, "health_score")?;
        if let Some(level) = self.battery_level {
            validate_percent(level, "battery_level")?;
        }
        if self.current_load > self.capacity {
            return Err(Error::validation(format!(
                "resource {} load {} exceeds capacity {}",
                self.id, self.current_load, self.capacity
            )));
        }
        Ok(())
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.capabilities.contains(r))
    }

    pub(crate) fn clear_assignment(&mut self, now: DateTime<Utc>) {
        self.current_workflow = None;
        self.current_allocation = None;
        self.assigned_to = None;
        self.last_updated = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Active,
    Completed,
}

/// Why a closed allocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Released,
    Preempted,
    Expired,
}

/// A reservation of one resource for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: AllocationId,
    pub resource_id: String,
    pub requester_id: String,
    pub workflow_id: String,
    pub priority: Priority,
    pub purpose: String,
    pub location: Option<GeoPoint>,
    pub allocated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub status: AllocationStatus,
    pub release_reason: Option<ReleaseReason>,
}

impl ResourceAllocation {
    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }

    pub(crate) fn close(&mut self, reason: ReleaseReason, now: DateTime<Utc>) {
        self.status = AllocationStatus::Completed;
        self.released_at = Some(now);
        self.release_reason = Some(reason);
    }
}

/// Arguments for [`super::ResourceManager::allocate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRequest {
    pub resource_id: String,
    pub workflow_id: String,
    pub requester_id: String,
    pub priority: Priority,
    pub duration_minutes: u32,
    pub purpose: String,
    pub location: Option<GeoPoint>,
}

impl AllocationRequest {
    pub fn new(resource_id: impl Into<String>, workflow_id: impl Into<String>, priority: Priority) -> Self {
        let workflow_id = workflow_id.into();
        Self {
            resource_id: resource_id.into(),
            requester_id: workflow_id.clone(),
            workflow_id,
            priority,
            duration_minutes: 60,
            purpose: String::new(),
            location: None,
        }
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = requester_id.into();
        self
    }

    pub fn with_duration_minutes(mut self, minutes: u32) -> Self {
        self.duration_minutes = minutes;
        self
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub(crate) fn into_allocation(self, now: DateTime<Utc>) -> ResourceAllocation {
        ResourceAllocation {
            id: AllocationId::new(),
            resource_id: self.resource_id,
            requester_id: self.requester_id,
            workflow_id: self.workflow_id,
            priority: self.priority,
            purpose: self.purpose,
            location: self.location,
            allocated_at: now,
            expires_at: now + Duration::minutes(i64::from(self.duration_minutes)),
            released_at: None,
            status: AllocationStatus::Active,
            release_reason: None,
        }
    }
}
