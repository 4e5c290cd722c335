use std::collections::BTreeSet;

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::index::{overlapping, OverlapQuery};

/// A resource counts as fragmented at this many distinct concurrent projects.
pub const FRAGMENTATION_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    /// Nothing allocated.
    Available,
    /// Allocated, with headroom left.
    Partial,
    /// Allocated exactly to capacity.
    Full,
    /// Allocated beyond capacity.
    Overloaded,
}

impl AvailabilityStatus {
    pub fn classify(allocated: Hours, capacity: Hours) -> Self {
        if allocated.is_zero() {
            AvailabilityStatus::Available
        } else if allocated < capacity {
            AvailabilityStatus::Partial
        } else if allocated == capacity {
            AvailabilityStatus::Full
        } else {
            AvailabilityStatus::Overloaded
        }
    }
}

/// Commitments of one resource over one date range.
///
/// `total_allocated_hours` is the plain sum over every overlapping active
/// allocation, not the peak concurrent load (see `peak`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailabilityReport {
    pub resource_id: Ulid,
    pub resource_name: Option<String>,
    pub range: DateRange,
    pub capacity_weekly: Hours,
    pub total_allocated_hours: Hours,
    /// May be negative when the resource is already overloaded.
    pub remaining_capacity: Hours,
    pub active_project_count: usize,
    /// Distinct project ids, sorted.
    pub concurrent_projects: Vec<Ulid>,
    pub is_fragmented: bool,
    pub utilization_percentage: f64,
    pub status: AvailabilityStatus,
    pub can_allocate_hours: Hours,
}

/// Pure: derived only from `rs` and the arguments, never mutates.
pub fn calculate_availability(
    rs: &ResourceState,
    capacity: Hours,
    query: &OverlapQuery,
) -> AvailabilityReport {
    let mut total = Hours::ZERO;
    let mut projects = BTreeSet::new();
    for a in overlapping(rs, query) {
        total += a.hours_per_week;
        projects.insert(a.project_id);
    }

    let remaining = capacity - total;
    let active_project_count = projects.len();

    AvailabilityReport {
        resource_id: rs.id,
        resource_name: rs.name.clone(),
        range: query.range,
        capacity_weekly: capacity,
        total_allocated_hours: total,
        remaining_capacity: remaining,
        active_project_count,
        concurrent_projects: projects.into_iter().collect(),
        is_fragmented: active_project_count >= FRAGMENTATION_THRESHOLD,
        utilization_percentage: round2(total.percent_of(capacity)),
        status: AvailabilityStatus::classify(total, capacity),
        can_allocate_hours: remaining.max(Hours::ZERO),
    }
}
