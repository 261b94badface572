//! Resource Manager.
//!
//! Inventory of allocatable assets and their reservations. At most one
//! active allocation exists per resource; a strictly more urgent request
//! preempts the current holder.
//!
//! Not an actor: the kernel owns it behind a mutex and calls it via
//! `&mut self`, so read-check-then-write allocation is atomic.

mod types;

pub use types::{
    AllocationRequest, AllocationStatus, ReleaseReason, Resource, ResourceAllocation,
    ResourceStatus, ResourceType,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::types::{Error, GeoPoint, ResourceConfig, Result};
use crate::validation::validate_percent;

/// Allocation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub allocations: u64,
    pub failed_allocations: u64,
    pub preemptions: u64,
    pub releases: u64,
    pub expirations: u64,
}

/// Status counts for one resource type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeUtilization {
    pub total: usize,
    pub by_status: BTreeMap<ResourceStatus, usize>,
    /// Share of resources currently allocated, 0-100.
    pub utilization_percent: f64,
}

#[derive(Debug)]
pub struct ResourceManager {
    config: ResourceConfig,
    resources: HashMap<String, Resource>,
    /// Active allocations keyed by resource id.
    active: HashMap<String, ResourceAllocation>,
    closed: VecDeque<ResourceAllocation>,
    stats: ResourceStats,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            config,
            resources: HashMap::new(),
            active: HashMap::new(),
            closed: VecDeque::new(),
            stats: ResourceStats::default(),
        }
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    pub fn register(&mut self, resource: Resource) -> Result<()> {
        resource.validate()?;
        if self.resources.contains_key(&resource.id) {
            return Err(Error::validation(format!("resource already registered: {}", resource.id)));
        }
        if resource.status == ResourceStatus::Allocated {
            return Err(Error::validation(format!(
                "resource {} cannot be registered as allocated",
                resource.id
            )));
        }
        tracing::debug!("resource_registered: id={}, type={:?}", resource.id, resource.resource_type);
        self.resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    /// Remove a resource, closing any active allocation on it.
    pub fn unregister(&mut self, resource_id: &str) -> Result<Resource> {
        self.close_active(resource_id, ReleaseReason::Released, Utc::now());
        self.resources
            .remove(resource_id)
            .ok_or_else(|| Error::not_found(format!("resource not found: {}", resource_id)))
    }

    pub fn get(&self, resource_id: &str) -> Option<&Resource> {
        self.resources.get(resource_id)
    }

    pub fn resources(&self) -> Vec<&Resource> {
        let mut all: Vec<&Resource> = self.resources.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Set an operational status. Leaving `Allocated` closes the active
    /// allocation; entering it directly is rejected.
    pub fn update_status(&mut self, resource_id: &str, status: ResourceStatus) -> Result<()> {
        if status == ResourceStatus::Allocated {
            return Err(Error::state_transition("resources become allocated only through allocate"));
        }
        let now = Utc::now();
        if !self.resources.contains_key(resource_id) {
            return Err(Error::not_found(format!("resource not found: {}", resource_id)));
        }
        self.close_active(resource_id, ReleaseReason::Released, now);
        let resource = self.resource_mut(resource_id)?;
        resource.status = status;
        resource.last_updated = now;
        Ok(())
    }

    pub fn update_health(&mut self, resource_id: &str, health_score: f64) -> Result<()> {
        validate_percent(health_score, "health_score")?;
        let resource = self.resource_mut(resource_id)?;
        resource.health_score = health_score;
        resource.last_updated = Utc::now();
        Ok(())
    }

    pub fn update_battery(&mut self, resource_id: &str, level: f64) -> Result<()> {
        validate_percent(level, "battery_level")?;
        let resource = self.resource_mut(resource_id)?;
        resource.battery_level = Some(level);
        resource.last_updated = Utc::now();
        Ok(())
    }

    pub fn update_location(&mut self, resource_id: &str, location: GeoPoint) -> Result<()> {
        let resource = self.resource_mut(resource_id)?;
        resource.location = Some(location);
        resource.last_updated = Utc::now();
        Ok(())
    }

    pub fn update_load(&mut self, resource_id: &str, load: u32) -> Result<()> {
        let resource = self.resource_mut(resource_id)?;
        if load > resource.capacity {
            return Err(Error::quota_exceeded(format!(
                "resource {} load {} exceeds capacity {}",
                resource_id, load, resource.capacity
            )));
        }
        resource.current_load = load;
        resource.last_updated = Utc::now();
        Ok(())
    }

    fn resource_mut(&mut self, resource_id: &str) -> Result<&mut Resource> {
        self.resources
            .get_mut(resource_id)
            .ok_or_else(|| Error::not_found(format!("resource not found: {}", resource_id)))
    }

    /// Status `Available` and health above the configured threshold.
    pub fn is_available(&self, resource: &Resource) -> bool {
        resource.status == ResourceStatus::Available && resource.health_score > self.config.min_health_score
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    pub fn allocate(&mut self, request: AllocationRequest) -> Option<ResourceAllocation> {
        self.allocate_at(request, Utc::now())
    }

    /// Reserve a resource. `None` is the normal contention outcome: unknown
    /// resource, unhealthy or out of service, or held at equal or higher
    /// urgency.
    pub fn allocate_at(
        &mut self,
        request: AllocationRequest,
        now: DateTime<Utc>,
    ) -> Option<ResourceAllocation> {
        let Some(resource) = self.resources.get(&request.resource_id) else {
            self.stats.failed_allocations += 1;
            tracing::debug!(
                "allocation_failed: resource={}, reason=not_found",
                request.resource_id
            );
            return None;
        };

        let (status, health) = (resource.status, resource.health_score);
        if health <= self.config.min_health_score {
            self.stats.failed_allocations += 1;
            tracing::debug!(
                "allocation_failed: resource={}, reason=unhealthy, health={}",
                request.resource_id,
                health
            );
            return None;
        }

        match status {
            ResourceStatus::Available => {}
            ResourceStatus::Allocated => {
                let holder = self
                    .active
                    .get(&request.resource_id)
                    .map(|a| (a.priority, a.workflow_id.clone()));
                match holder {
                    Some((held, holder_workflow)) if request.priority.is_more_urgent_than(held) => {
                        tracing::warn!(
                            "allocation_preempted: resource={}, holder={}, holder_priority={}, requester={}, priority={}",
                            request.resource_id,
                            holder_workflow,
                            held,
                            request.workflow_id,
                            request.priority
                        );
                        self.close_active(&request.resource_id, ReleaseReason::Preempted, now);
                        self.stats.preemptions += 1;
                    }
                    Some(_) => {
                        self.stats.failed_allocations += 1;
                        tracing::debug!(
                            "allocation_failed: resource={}, reason=held, requester={}",
                            request.resource_id,
                            request.workflow_id
                        );
                        return None;
                    }
                    // Allocated without a record; treat as free.
                    None => {}
                }
            }
            ResourceStatus::Maintenance | ResourceStatus::Charging | ResourceStatus::Offline => {
                self.stats.failed_allocations += 1;
                tracing::debug!(
                    "allocation_failed: resource={}, reason=status_{:?}",
                    request.resource_id,
                    status
                );
                return None;
            }
        }

        let allocation = request.into_allocation(now);
        let resource = self.resources.get_mut(&allocation.resource_id)?;
        resource.status = ResourceStatus::Allocated;
        resource.current_workflow = Some(allocation.workflow_id.clone());
        resource.current_allocation = Some(allocation.id.clone());
        resource.assigned_to = Some(allocation.requester_id.clone());
        resource.last_updated = now;

        self.stats.allocations += 1;
        tracing::info!(
            "resource_allocated: resource={}, workflow={}, priority={}, allocation={}",
            allocation.resource_id,
            allocation.workflow_id,
            allocation.priority,
            allocation.id
        );
        self.active.insert(allocation.resource_id.clone(), allocation.clone());
        Some(allocation)
    }

    /// Close the active allocation on `resource_id`. Idempotent: `None`
    /// when nothing is allocated.
    pub fn release(&mut self, resource_id: &str) -> Option<ResourceAllocation> {
        let closed = self.close_active(resource_id, ReleaseReason::Released, Utc::now());
        if closed.is_some() {
            self.stats.releases += 1;
        }
        closed
    }

    /// Close every allocation whose window ended before `now`.
    pub fn expire_allocations(&mut self, now: DateTime<Utc>) -> Vec<ResourceAllocation> {
        let mut due: Vec<String> = self
            .active
            .values()
            .filter(|a| a.expires_at <= now)
            .map(|a| a.resource_id.clone())
            .collect();
        due.sort();

        let mut expired = Vec::with_capacity(due.len());
        for resource_id in due {
            if let Some(allocation) = self.close_active(&resource_id, ReleaseReason::Expired, now) {
                self.stats.expirations += 1;
                expired.push(allocation);
            }
        }
        expired
    }

    fn close_active(
        &mut self,
        resource_id: &str,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Option<ResourceAllocation> {
        let mut allocation = self.active.remove(resource_id)?;
        allocation.close(reason, now);

        if let Some(resource) = self.resources.get_mut(resource_id) {
            if resource.status == ResourceStatus::Allocated {
                resource.status = ResourceStatus::Available;
            }
            resource.clear_assignment(now);
        }
        tracing::debug!(
            "resource_released: resource={}, allocation={}, reason={:?}",
            resource_id,
            allocation.id,
            reason
        );

        if self.closed.len() >= self.config.history_capacity {
            self.closed.pop_front();
        }
        self.closed.push_back(allocation.clone());
        Some(allocation)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Closest available resource of `resource_type` holding every listed
    /// capability, by planar coordinate distance.
    pub fn get_nearest(
        &self,
        location: &GeoPoint,
        resource_type: ResourceType,
        capabilities: &[String],
    ) -> Option<&Resource> {
        self.resources
            .values()
            .filter(|r| r.resource_type == resource_type && self.is_available(r))
            .filter(|r| r.has_capabilities(capabilities))
            .filter_map(|r| r.location.map(|loc| (r, loc.planar_distance(location))))
            .min_by(|(a, da), (b, db)| da.total_cmp(db).then_with(|| a.id.cmp(&b.id)))
            .map(|(r, _)| r)
    }

    pub fn active_allocation(&self, resource_id: &str) -> Option<&ResourceAllocation> {
        self.active.get(resource_id)
    }

    pub fn active_allocations(&self) -> Vec<&ResourceAllocation> {
        let mut active: Vec<&ResourceAllocation> = self.active.values().collect();
        active.sort_by(|a, b| a.allocated_at.cmp(&b.allocated_at));
        active
    }

    /// Closed and active allocations that referenced `resource_id`, oldest first.
    pub fn allocations_for(&self, resource_id: &str) -> Vec<ResourceAllocation> {
        self.closed
            .iter()
            .filter(|a| a.resource_id == resource_id)
            .chain(self.active.get(resource_id))
            .cloned()
            .collect()
    }

    pub fn utilization(&self) -> BTreeMap<ResourceType, TypeUtilization> {
        let mut report: BTreeMap<ResourceType, TypeUtilization> = BTreeMap::new();
        for resource in self.resources.values() {
            let entry = report.entry(resource.resource_type).or_default();
            entry.total += 1;
            *entry.by_status.entry(resource.status).or_default() += 1;
        }
        for entry in report.values_mut() {
            let allocated = entry.by_status.get(&ResourceStatus::Allocated).copied().unwrap_or(0);
            entry.utilization_percent = allocated as f64 * 100.0 / entry.total as f64;
        }
        report
    }

    pub fn stats(&self) -> ResourceStats {
        self.stats.clone()
    }
}
