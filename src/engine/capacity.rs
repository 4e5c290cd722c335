use crate::model::*;

/// Weekly capacity every resource starts with unless it states its own.
pub const DEFAULT_WEEKLY_CAPACITY: Hours = Hours::whole(40);

/// The single capacity function shared by validation, availability,
/// recommendation and peak-load reporting.
///
/// Effective capacity = `capacity_weekly × availability_percentage / 100`.
/// A resource created without `capacity_weekly` gets `default_weekly`,
/// resolved once at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPolicy {
    pub default_weekly: Hours,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            default_weekly: DEFAULT_WEEKLY_CAPACITY,
        }
    }
}

impl CapacityPolicy {
    pub fn new(default_weekly: Hours) -> Self {
        Self { default_weekly }
    }

    pub fn resolve_weekly(&self, requested: Option<Hours>) -> Hours {
        requested.unwrap_or(self.default_weekly)
    }

    pub fn effective(&self, rs: &ResourceState) -> Hours {
        rs.capacity_weekly.scale_percent(rs.availability_percentage)
    }
}
