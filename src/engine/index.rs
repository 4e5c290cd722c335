use ulid::Ulid;

use crate::model::*;

/// Which allocations an overlap lookup should return.
#[derive(Debug, Clone, Copy)]
pub struct OverlapQuery {
    pub range: DateRange,
    /// Retired allocations are skipped unless this is set (reporting only).
    pub include_inactive: bool,
    /// The allocation being edited, so it never collides with itself.
    pub exclude: Option<Ulid>,
}

impl OverlapQuery {
    pub fn active(range: DateRange) -> Self {
        Self {
            range,
            include_inactive: false,
            exclude: None,
        }
    }

    pub fn excluding(mut self, id: Option<Ulid>) -> Self {
        self.exclude = id;
        self
    }

    pub fn with_inactive(mut self, include: bool) -> Self {
        self.include_inactive = include;
        self
    }
}

/// Allocations of `rs` overlapping `query.range` (`a.start <= q.end && a.end >= q.start`).
/// Uses binary search to skip allocations starting after `query.range.end`.
pub fn overlapping<'a>(
    rs: &'a ResourceState,
    query: &OverlapQuery,
) -> impl Iterator<Item = &'a Allocation> + use<'a> {
    let OverlapQuery {
        range,
        include_inactive,
        exclude,
    } = *query;
    // Everything at index >= right_bound starts after range.end → can't overlap.
    let right_bound = rs
        .allocations
        .partition_point(|a| a.range.start <= range.end);
    rs.allocations[..right_bound].iter().filter(move |a| {
        a.range.end >= range.start
            && (include_inactive || a.is_active)
            && exclude.is_none_or(|id| id != a.id)
    })
}
