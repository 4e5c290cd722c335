use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{calculate_availability, AvailabilityReport};
use super::index::{overlapping, OverlapQuery};
use super::peak::{book_resource, peak_load, BookingReport};
use super::recommend::{recommend, Recommendation};
use super::validator::check_structure;
use super::{Engine, EngineError, ValidationError};

/// Reject reversed or oversized query windows.
fn check_window(range: &DateRange) -> Result<(), EngineError> {
    if !range.is_ordered() {
        return Err(ValidationError::EndBeforeStart {
            start: range.start,
            end: range.end,
        }
        .into());
    }
    if range.days() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    pub async fn availability(
        &self,
        resource_id: Ulid,
        range: DateRange,
    ) -> Result<AvailabilityReport, EngineError> {
        check_window(&range)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        let capacity = self.policy.effective(&guard);
        Ok(calculate_availability(&guard, capacity, &OverlapQuery::active(range)))
    }

    /// Pre-flight a proposed allocation. Read-only.
    ///
    /// Zero hours means "just show availability".
    pub async fn recommend(
        &self,
        resource_id: Ulid,
        project_id: Option<Ulid>,
        range: DateRange,
        hours_per_week: Hours,
    ) -> Result<Recommendation, EngineError> {
        if let Some(pid) = project_id
            && !self.projects.contains_key(&pid)
        {
            return Err(EngineError::ProjectNotFound(pid));
        }
        if !hours_per_week.is_zero() {
            check_structure(&range, hours_per_week)?;
        }
        let report = self.availability(resource_id, range).await?;
        if hours_per_week.is_zero() {
            return Ok(Recommendation::availability_only(report));
        }
        Ok(recommend(report, hours_per_week))
    }

    /// Peak concurrent weekly hours for one resource inside `range`.
    pub async fn peak_load(
        &self,
        resource_id: Ulid,
        range: DateRange,
        include_inactive: bool,
    ) -> Result<Hours, EngineError> {
        check_window(&range)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        let query = OverlapQuery::active(range).with_inactive(include_inactive);
        Ok(peak_load(overlapping(&guard, &query), &range))
    }

    /// Booking dashboard over every active resource, or just `resource`.
    pub async fn booking_report(
        &self,
        range: DateRange,
        resource: Option<Ulid>,
        include_inactive: bool,
        today: NaiveDate,
    ) -> Result<BookingReport, EngineError> {
        check_window(&range)?;
        let resource_ids: Vec<Ulid> = match resource {
            Some(id) => {
                if !self.state.contains_key(&id) {
                    return Err(EngineError::ResourceNotFound(id));
                }
                vec![id]
            }
            None => self.state.iter().map(|e| *e.key()).collect(),
        };

        let query = OverlapQuery::active(range).with_inactive(include_inactive);
        let mut lines = Vec::with_capacity(resource_ids.len());
        for rid in resource_ids {
            // Deleted since the id list was taken.
            let Some(rs) = self.get_resource(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            if !guard.is_active && resource.is_none() {
                continue;
            }
            let capacity = self.policy.effective(&guard);
            lines.push(book_resource(&guard, capacity, &query, today));
        }
        Ok(BookingReport::new(range, lines))
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
                capacity_weekly: guard.capacity_weekly,
                availability_percentage: guard.availability_percentage,
                is_active: guard.is_active,
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_resource_info(&self, resource_id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(ResourceInfo {
            id: guard.id,
            name: guard.name.clone(),
            capacity_weekly: guard.capacity_weekly,
            availability_percentage: guard.availability_percentage,
            is_active: guard.is_active,
        })
    }

    /// All allocations of a resource, active and retired, in start order.
    pub async fn list_allocations(
        &self,
        resource_id: Ulid,
    ) -> Result<Vec<AllocationInfo>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard
            .allocations
            .iter()
            .map(|a| allocation_info(&guard, a))
            .collect())
    }

    pub async fn get_allocation(&self, allocation_id: Ulid) -> Result<AllocationInfo, EngineError> {
        let resource_id = self
            .get_resource_for_allocation(&allocation_id)
            .ok_or(EngineError::AllocationNotFound(allocation_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::AllocationNotFound(allocation_id))?;
        let guard = rs.read().await;
        let a = guard
            .get_allocation(&allocation_id)
            .ok_or(EngineError::AllocationNotFound(allocation_id))?;
        Ok(allocation_info(&guard, a))
    }

    pub async fn project_summary(
        &self,
        project_id: Ulid,
        today: NaiveDate,
    ) -> Result<ProjectSummary, EngineError> {
        if !self.projects.contains_key(&project_id) {
            return Err(EngineError::ProjectNotFound(project_id));
        }
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut summary = ProjectSummary {
            project_id,
            allocation_count: 0,
            active_on_day: 0,
            total_allocated_hours: Hours::ZERO,
        };
        for rs in shared {
            let guard = rs.read().await;
            for a in guard.allocations.iter().filter(|a| a.project_id == project_id) {
                summary.allocation_count += 1;
                if a.is_active && a.range.contains_day(today) {
                    summary.active_on_day += 1;
                }
                summary.total_allocated_hours += a.total_hours_allocated();
            }
        }
        Ok(summary)
    }
}

fn allocation_info(rs: &ResourceState, a: &Allocation) -> AllocationInfo {
    let query = OverlapQuery::active(a.range).excluding(Some(a.id));
    AllocationInfo {
        allocation: a.clone(),
        duration_weeks: a.duration_weeks(),
        total_hours_allocated: a.total_hours_allocated(),
        overlaps_with_count: overlapping(rs, &query).count(),
    }
}
