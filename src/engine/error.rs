use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::model::Hours;

/// Structural problems with a proposed allocation. Always fatal to the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EndBeforeStart { start: NaiveDate, end: NaiveDate },
    /// `hours_per_week` must lie in `(0, 168]`.
    HoursOutOfRange(Hours),
    ResourceInactive(Ulid),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EndBeforeStart { start, end } => {
                write!(f, "end date {end} is before start date {start}")
            }
            ValidationError::HoursOutOfRange(h) => {
                write!(f, "hours per week {h} outside (0, 168]")
            }
            ValidationError::ResourceInactive(id) => write!(f, "resource {id} is not active"),
        }
    }
}

/// Numeric detail of a hard capacity block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityOverflow {
    pub resource_id: Ulid,
    /// Sum of the other active allocations overlapping the candidate range.
    pub overlap_sum: Hours,
    pub requested: Hours,
    pub capacity: Hours,
    /// `overlap_sum + requested - capacity`, always positive.
    pub overflow: Hours,
    /// Largest request that would have been accepted.
    pub max_allocatable: Hours,
}

impl CapacityOverflow {
    pub fn new(resource_id: Ulid, overlap_sum: Hours, requested: Hours, capacity: Hours) -> Self {
        Self {
            resource_id,
            overlap_sum,
            requested,
            capacity,
            overflow: overlap_sum + requested - capacity,
            max_allocatable: (capacity - overlap_sum).max(Hours::ZERO),
        }
    }
}

impl std::fmt::Display for CapacityOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "resource {} already has {}h/week in this period; adding {}h/week exceeds capacity {}h/week by {}h (at most {}h/week can be allocated)",
            self.resource_id,
            self.overlap_sum,
            self.requested,
            self.capacity,
            self.overflow,
            self.max_allocatable
        )
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    CapacityExceeded(CapacityOverflow),
    ResourceNotFound(Ulid),
    ProjectNotFound(Ulid),
    AllocationNotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "validation error: {e}"),
            EngineError::CapacityExceeded(o) => write!(f, "capacity exceeded: {o}"),
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::ProjectNotFound(id) => write!(f, "project not found: {id}"),
            EngineError::AllocationNotFound(id) => write!(f, "allocation not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
