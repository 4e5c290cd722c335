use std::collections::HashSet;

use serde::Serialize;
use ulid::Ulid;

use crate::limits::MAX_HOURS_PER_WEEK;
use crate::model::*;

use super::error::{CapacityOverflow, ValidationError};
use super::index::{overlapping, OverlapQuery};
use super::EngineError;

/// Existing distinct projects in the window at which adding another one warns.
pub const FRAGMENTATION_WARN_AT: usize = 2;

/// Advisory signals. Never block a write; returned to the caller as values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// The resource already works on `concurrent_project_count` projects in the window.
    Fragmentation {
        resource_id: Ulid,
        concurrent_project_count: usize,
    },
    /// The projected utilization lands in `[80, 100)`.
    HighLoad {
        resource_id: Ulid,
        projected_utilization: f64,
    },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::Fragmentation {
                concurrent_project_count,
                ..
            } => write!(
                f,
                "resource already works on {concurrent_project_count} concurrent projects; adding another ({} total) risks efficiency loss from context switching",
                concurrent_project_count + 1
            ),
            Warning::HighLoad {
                projected_utilization,
                ..
            } => write!(
                f,
                "allocation would bring the resource to {projected_utilization:.1}% utilization, leaving little slack"
            ),
        }
    }
}

/// A proposed allocation, new or edited in place.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub range: DateRange,
    pub hours_per_week: Hours,
    /// Set when editing, so the stored version is not counted twice.
    pub exclude: Option<Ulid>,
}

/// Result of a passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    /// Hours of the other overlapping active allocations.
    pub overlap_sum: Hours,
    pub warnings: Vec<Warning>,
}

/// Date order and hour bounds. Checked before anything touches the index.
pub fn check_structure(range: &DateRange, hours_per_week: Hours) -> Result<(), ValidationError> {
    if !range.is_ordered() {
        return Err(ValidationError::EndBeforeStart {
            start: range.start,
            end: range.end,
        });
    }
    if !hours_per_week.is_positive() || hours_per_week > MAX_HOURS_PER_WEEK {
        return Err(ValidationError::HoursOutOfRange(hours_per_week));
    }
    Ok(())
}

/// Full validation of a candidate against the resource's other active allocations.
///
/// Order: structure, resource active, capacity (hard), fragmentation (soft).
pub fn validate_allocation(
    rs: &ResourceState,
    capacity: Hours,
    candidate: &Candidate,
) -> Result<Validated, EngineError> {
    check_structure(&candidate.range, candidate.hours_per_week)?;
    if !rs.is_active {
        return Err(ValidationError::ResourceInactive(rs.id).into());
    }

    let query = OverlapQuery::active(candidate.range).excluding(candidate.exclude);
    let mut overlap_sum = Hours::ZERO;
    let mut projects = HashSet::new();
    for a in overlapping(rs, &query) {
        overlap_sum += a.hours_per_week;
        projects.insert(a.project_id);
    }

    if overlap_sum + candidate.hours_per_week > capacity {
        return Err(EngineError::CapacityExceeded(CapacityOverflow::new(
            rs.id,
            overlap_sum,
            candidate.hours_per_week,
            capacity,
        )));
    }

    let mut warnings = Vec::new();
    if projects.len() >= FRAGMENTATION_WARN_AT {
        warnings.push(Warning::Fragmentation {
            resource_id: rs.id,
            concurrent_project_count: projects.len(),
        });
    }

    Ok(Validated {
        overlap_sum,
        warnings,
    })
}
