use chrono::{Datelike, Months, NaiveDate};
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::index::{overlapping, OverlapQuery};

/// Sweep-line edge. At the same date, `End` sorts before `Start`: an allocation
/// ending on day `d` releases its hours at `d + 1`, before one starting on
/// `d + 1` takes them, so day-adjacent allocations are never simultaneous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Edge {
    End,
    Start,
}

/// Maximum simultaneous weekly-hour commitment inside `window`.
///
/// Each allocation is clamped to the window and contributes `+h` on its first
/// day and `-h` on the day after its last. Never exceeds the plain sum.
pub fn peak_load<'a>(
    allocations: impl IntoIterator<Item = &'a Allocation>,
    window: &DateRange,
) -> Hours {
    let mut events: Vec<(NaiveDate, Edge, Hours)> = Vec::new();
    for a in allocations {
        let Some(clamped) = a.range.clamp_to(window) else {
            continue;
        };
        events.push((clamped.start, Edge::Start, a.hours_per_week));
        // No successor only at NaiveDate::MAX, where nothing follows anyway.
        if let Some(after) = clamped.end.succ_opt() {
            events.push((after, Edge::End, a.hours_per_week));
        }
    }
    events.sort_by_key(|&(day, edge, _)| (day, edge));

    let mut current = Hours::ZERO;
    let mut peak = Hours::ZERO;
    for (_, edge, hours) in events {
        match edge {
            Edge::Start => {
                current += hours;
                peak = peak.max(current);
            }
            Edge::End => current -= hours,
        }
    }
    peak
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Overbooked,
    Optimal,
    Partial,
    Available,
}

impl BookingStatus {
    pub fn classify(occupancy_percentage: f64) -> Self {
        if occupancy_percentage >= 100.0 {
            BookingStatus::Overbooked
        } else if occupancy_percentage >= 80.0 {
            BookingStatus::Optimal
        } else if occupancy_percentage >= 50.0 {
            BookingStatus::Partial
        } else {
            BookingStatus::Available
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationLoad {
    pub allocation_id: Ulid,
    pub project_id: Ulid,
    pub range: DateRange,
    pub hours_per_week: Hours,
    pub is_active: bool,
    /// Days from `today` to the allocation end, 0 once it has ended.
    pub days_remaining: i64,
    /// Share of the resource's effective capacity.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceBooking {
    pub resource_id: Ulid,
    pub resource_name: Option<String>,
    pub peak_hours: Hours,
    pub capacity: Hours,
    pub occupancy_percentage: f64,
    pub status: BookingStatus,
    pub allocations: Vec<AllocationLoad>,
}

/// Peak-load booking line for one resource.
pub fn book_resource(
    rs: &ResourceState,
    capacity: Hours,
    query: &OverlapQuery,
    today: NaiveDate,
) -> ResourceBooking {
    let hits: Vec<&Allocation> = overlapping(rs, query).collect();
    let peak_hours = peak_load(hits.iter().copied(), &query.range);
    let occupancy_percentage = round2(peak_hours.percent_of(capacity));

    let allocations = hits
        .iter()
        .map(|a| AllocationLoad {
            allocation_id: a.id,
            project_id: a.project_id,
            range: a.range,
            hours_per_week: a.hours_per_week,
            is_active: a.is_active,
            days_remaining: if a.range.end >= today {
                (a.range.end - today).num_days()
            } else {
                0
            },
            percentage: round2(a.hours_per_week.percent_of(capacity)),
        })
        .collect();

    ResourceBooking {
        resource_id: rs.id,
        resource_name: rs.name.clone(),
        peak_hours,
        capacity,
        occupancy_percentage,
        status: BookingStatus::classify(occupancy_percentage),
        allocations,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingReport {
    pub range: DateRange,
    /// Sorted by occupancy, highest first.
    pub resources: Vec<ResourceBooking>,
    pub total_resources: usize,
    /// Overbooked or optimal.
    pub fully_assigned: usize,
    pub partially_assigned: usize,
    pub available: usize,
}

impl BookingReport {
    pub fn new(range: DateRange, mut resources: Vec<ResourceBooking>) -> Self {
        resources.sort_by(|a, b| {
            b.occupancy_percentage
                .total_cmp(&a.occupancy_percentage)
                .then(a.resource_id.cmp(&b.resource_id))
        });
        let count = |f: fn(BookingStatus) -> bool| resources.iter().filter(|r| f(r.status)).count();
        let fully_assigned =
            count(|s| matches!(s, BookingStatus::Overbooked | BookingStatus::Optimal));
        let partially_assigned = count(|s| s == BookingStatus::Partial);
        let available = count(|s| s == BookingStatus::Available);
        Self {
            range,
            total_resources: resources.len(),
            resources,
            fully_assigned,
            partially_assigned,
            available,
        }
    }
}

/// Booking window used when none is given: the first day of `today`'s month
/// through the last day of the following month.
pub fn default_booking_window(today: NaiveDate) -> DateRange {
    let first = today.with_day(1).unwrap_or(today);
    let last = first
        .checked_add_months(Months::new(2))
        .and_then(|d| d.pred_opt())
        .unwrap_or(today);
    DateRange::new(first, last)
}
