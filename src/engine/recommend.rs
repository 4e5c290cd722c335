use serde::Serialize;

use crate::model::*;

use super::availability::AvailabilityReport;
use super::error::CapacityOverflow;
use super::validator::{Warning, FRAGMENTATION_WARN_AT};

/// Projected utilization at or above this (and below 100) is flagged as high load.
pub const HIGH_LOAD_FROM: f64 = 80.0;

/// Read-only pre-flight verdict on a proposed allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub availability: AvailabilityReport,
    pub is_viable: bool,
    pub block_reason: Option<CapacityOverflow>,
    pub warnings: Vec<Warning>,
    pub recommendations: Vec<String>,
    pub projected_utilization: f64,
}

impl Recommendation {
    /// No hours proposed: just the current state, trivially viable.
    pub fn availability_only(availability: AvailabilityReport) -> Self {
        let projected_utilization = availability.utilization_percentage;
        Self {
            availability,
            is_viable: true,
            block_reason: None,
            warnings: Vec::new(),
            recommendations: Vec::new(),
            projected_utilization,
        }
    }
}

/// Evaluate `requested` hours/week on top of the state in `availability`.
pub fn recommend(availability: AvailabilityReport, requested: Hours) -> Recommendation {
    let capacity = availability.capacity_weekly;
    let projected_total = availability.total_allocated_hours + requested;
    let projected_utilization = round2(projected_total.percent_of(capacity));

    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();

    let block_reason = (projected_total > capacity).then(|| {
        CapacityOverflow::new(
            availability.resource_id,
            availability.total_allocated_hours,
            requested,
            capacity,
        )
    });
    if let Some(block) = &block_reason {
        recommendations.push(format!(
            "reduce the requested hours to at most {}h/week",
            block.max_allocatable
        ));
        recommendations.push("or select another resource with more availability".to_string());
    }
    let is_viable = block_reason.is_none();

    if availability.active_project_count >= FRAGMENTATION_WARN_AT {
        warnings.push(Warning::Fragmentation {
            resource_id: availability.resource_id,
            concurrent_project_count: availability.active_project_count,
        });
        recommendations
            .push("consider consolidating work or assigning a less fragmented resource".to_string());
    }

    if is_viable && (HIGH_LOAD_FROM..100.0).contains(&projected_utilization) {
        warnings.push(Warning::HighLoad {
            resource_id: availability.resource_id,
            projected_utilization,
        });
        recommendations.push("leave at least 20% of capacity free for unplanned work".to_string());
    }

    if is_viable && warnings.is_empty() {
        let headroom = capacity - projected_total;
        recommendations.push(format!(
            "resource has adequate capacity: {headroom}h/week remain free after this allocation ({:.1}% of capacity)",
            round2(headroom.percent_of(capacity))
        ));
    }

    Recommendation {
        availability,
        is_viable,
        block_reason,
        warnings,
        recommendations,
        projected_utilization,
    }
}
