use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use std::sync::Arc;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::validator::{check_structure, validate_allocation, Candidate, Warning};
use super::{now_ms, Engine, EngineError, WalCommand};

#[derive(Debug, Clone, Default)]
pub struct NewResource {
    pub id: Option<Ulid>,
    pub name: Option<String>,
    /// Falls back to the engine's default weekly capacity.
    pub capacity_weekly: Option<Hours>,
    pub availability_percentage: Option<u8>,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ResourceChange {
    pub name: Option<String>,
    pub capacity_weekly: Option<Hours>,
    pub availability_percentage: Option<u8>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewAllocation {
    pub id: Option<Ulid>,
    pub resource_id: Ulid,
    pub project_id: Ulid,
    pub range: DateRange,
    pub hours_per_week: Hours,
    pub notes: String,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct AllocationChange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub hours_per_week: Option<Hours>,
    pub notes: Option<String>,
}

/// A committed allocation and the advisories raised while validating it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationOutcome {
    pub allocation: Allocation,
    pub warnings: Vec<Warning>,
}

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_resource_numbers(
    capacity_weekly: Hours,
    availability_percentage: u8,
) -> Result<(), EngineError> {
    if capacity_weekly < Hours::ZERO || capacity_weekly > MAX_HOURS_PER_WEEK {
        return Err(EngineError::LimitExceeded("capacity_weekly outside [0, 168]"));
    }
    if availability_percentage > 100 {
        return Err(EngineError::LimitExceeded("availability_percentage above 100"));
    }
    Ok(())
}

fn check_notes(notes: &str) -> Result<(), EngineError> {
    if notes.len() > MAX_NOTES_LEN {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

/// Count a rejected allocation write by reason.
fn record_rejection(err: &EngineError) {
    let reason = match err {
        EngineError::Validation(_) => "validation",
        EngineError::CapacityExceeded(_) => "capacity",
        _ => return,
    };
    metrics::counter!(observability::ALLOCATIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
}

fn record_warnings(warnings: &[Warning]) {
    let fragmentation = warnings
        .iter()
        .filter(|w| matches!(w, Warning::Fragmentation { .. }))
        .count();
    if fragmentation > 0 {
        metrics::counter!(observability::FRAGMENTATION_WARNINGS_TOTAL)
            .increment(fragmentation as u64);
    }
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, new: NewResource) -> Result<ResourceInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        check_name(&new.name)?;
        let capacity_weekly = self.policy.resolve_weekly(new.capacity_weekly);
        let availability_percentage = new.availability_percentage.unwrap_or(100);
        check_resource_numbers(capacity_weekly, availability_percentage)?;

        let id = new.id.unwrap_or_else(Ulid::new);
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            name: new.name.clone(),
            capacity_weekly,
            availability_percentage,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, new.name.clone(), capacity_weekly, availability_percentage);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        info!("resource {id} created with {capacity_weekly}h/week at {availability_percentage}%");
        Ok(ResourceInfo {
            id,
            name: new.name,
            capacity_weekly,
            availability_percentage,
            is_active: true,
        })
    }

    /// Lowering capacity never touches existing allocations; the resource
    /// simply reports as overloaded until they are adjusted.
    pub async fn update_resource(
        &self,
        id: Ulid,
        change: ResourceChange,
    ) -> Result<ResourceInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        check_name(&change.name)?;
        let mut guard = self.lock_resource(&id).await?;

        let name = change.name.or_else(|| guard.name.clone());
        let capacity_weekly = change.capacity_weekly.unwrap_or(guard.capacity_weekly);
        let availability_percentage = change
            .availability_percentage
            .unwrap_or(guard.availability_percentage);
        let is_active = change.is_active.unwrap_or(guard.is_active);
        check_resource_numbers(capacity_weekly, availability_percentage)?;

        let event = Event::ResourceUpdated {
            id,
            name: name.clone(),
            capacity_weekly,
            availability_percentage,
            is_active,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("resource {id} updated");
        Ok(ResourceInfo {
            id,
            name,
            capacity_weekly,
            availability_percentage,
            is_active,
        })
    }

    /// Deletes the resource together with all of its allocations.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        // Wait for in-flight writes on this resource.
        let guard = self.lock_resource(&id).await?;
        let cascaded = guard.allocations.len();

        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        self.drop_resource(&id);
        drop(guard);
        info!("resource {id} deleted ({cascaded} allocations removed)");
        Ok(())
    }

    // ── Projects ─────────────────────────────────────────────

    pub async fn create_project(
        &self,
        id: Option<Ulid>,
        name: Option<String>,
    ) -> Result<ProjectInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.projects.len() >= MAX_PROJECTS {
            return Err(EngineError::LimitExceeded("too many projects"));
        }
        check_name(&name)?;
        let id = id.unwrap_or_else(Ulid::new);
        if self.projects.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProjectCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        let project = ProjectInfo { id, name };
        self.projects.insert(id, project.clone());
        info!("project {id} created");
        Ok(project)
    }

    /// Deletes the project and every allocation referencing it. Returns the
    /// number of allocations removed.
    pub async fn delete_project(&self, id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        {
            let _registry = self.registry_lock.lock().await;
            if !self.projects.contains_key(&id) {
                return Err(EngineError::ProjectNotFound(id));
            }
            // Unregister first: allocation creates re-check the project under the
            // resource lock, so none can slip in behind the sweep below.
            self.wal_append(&Event::ProjectDeleted { id }).await?;
            self.projects.remove(&id);
        }

        let mut resource_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        resource_ids.sort();

        let mut removed = 0;
        for rid in resource_ids {
            // Deleted meanwhile: its allocations went with it.
            let Ok(mut guard) = self.lock_resource(&rid).await else {
                continue;
            };
            let doomed: Vec<Ulid> = guard
                .allocations
                .iter()
                .filter(|a| a.project_id == id)
                .map(|a| a.id)
                .collect();
            for aid in doomed {
                let event = Event::AllocationRemoved {
                    id: aid,
                    resource_id: rid,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                removed += 1;
            }
        }
        info!("project {id} deleted ({removed} allocations removed)");
        Ok(removed)
    }

    // ── Allocations ──────────────────────────────────────────

    /// Validate and commit a new allocation.
    ///
    /// Structural errors fail before any lock is taken; the capacity check
    /// and the write happen under the resource's write lock.
    pub async fn create_allocation(
        &self,
        new: NewAllocation,
    ) -> Result<AllocationOutcome, EngineError> {
        let result = self.create_allocation_inner(new).await;
        match &result {
            Ok(outcome) => {
                metrics::counter!(observability::ALLOCATIONS_ACCEPTED_TOTAL).increment(1);
                record_warnings(&outcome.warnings);
            }
            Err(e) => {
                record_rejection(e);
                warn!("allocation rejected: {e}");
            }
        }
        result
    }

    async fn create_allocation_inner(
        &self,
        new: NewAllocation,
    ) -> Result<AllocationOutcome, EngineError> {
        check_structure(&new.range, new.hours_per_week)?;
        check_notes(&new.notes)?;

        let _gate = self.write_gate.read().await;
        let mut guard = self.lock_resource(&new.resource_id).await?;
        if !self.projects.contains_key(&new.project_id) {
            return Err(EngineError::ProjectNotFound(new.project_id));
        }
        if guard.allocations.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many allocations on resource"));
        }
        let id = new.id.unwrap_or_else(Ulid::new);
        // Allocation ids are global, so claim this one in the index before
        // the first await. A create on another resource then sees it taken.
        match self.allocation_to_resource.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(new.resource_id);
            }
        }

        let capacity = self.policy.effective(&guard);
        let candidate = Candidate {
            range: new.range,
            hours_per_week: new.hours_per_week,
            exclude: None,
        };
        let event = Event::AllocationCreated {
            id,
            resource_id: new.resource_id,
            project_id: new.project_id,
            range: new.range,
            hours_per_week: new.hours_per_week,
            notes: new.notes,
            at: now_ms(),
        };
        let committed = match validate_allocation(&guard, capacity, &candidate) {
            Ok(validated) => self
                .persist_and_apply(&mut guard, &event)
                .await
                .map(|()| validated),
            Err(e) => Err(e),
        };
        let validated = match committed {
            Ok(validated) => validated,
            Err(e) => {
                self.allocation_to_resource.remove(&id);
                return Err(e);
            }
        };
        info!(
            "allocation {id} created on resource {}: {}h/week over {} ({}h already committed)",
            new.resource_id, new.hours_per_week, new.range, validated.overlap_sum
        );

        let allocation = guard
            .get_allocation(&id)
            .cloned()
            .ok_or(EngineError::AllocationNotFound(id))?;
        Ok(AllocationOutcome {
            allocation,
            warnings: validated.warnings,
        })
    }

    /// Change dates, hours or notes in place. Active allocations are
    /// re-validated against every *other* active allocation of the resource.
    pub async fn update_allocation(
        &self,
        id: Ulid,
        change: AllocationChange,
    ) -> Result<AllocationOutcome, EngineError> {
        let result = self.update_allocation_inner(id, change).await;
        match &result {
            Ok(outcome) => record_warnings(&outcome.warnings),
            Err(e) => {
                record_rejection(e);
                warn!("allocation {id} update rejected: {e}");
            }
        }
        result
    }

    async fn update_allocation_inner(
        &self,
        id: Ulid,
        change: AllocationChange,
    ) -> Result<AllocationOutcome, EngineError> {
        let _gate = self.write_gate.read().await;
        let (resource_id, mut guard) = self.resolve_allocation_write(&id).await?;
        let current = guard
            .get_allocation(&id)
            .cloned()
            .ok_or(EngineError::AllocationNotFound(id))?;

        let range = DateRange::new(
            change.start.unwrap_or(current.range.start),
            change.end.unwrap_or(current.range.end),
        );
        let hours_per_week = change.hours_per_week.unwrap_or(current.hours_per_week);
        let notes = change.notes.unwrap_or(current.notes);
        check_structure(&range, hours_per_week)?;
        check_notes(&notes)?;

        let warnings = if current.is_active {
            let capacity = self.policy.effective(&guard);
            validate_allocation(
                &guard,
                capacity,
                &Candidate {
                    range,
                    hours_per_week,
                    exclude: Some(id),
                },
            )?
            .warnings
        } else {
            Vec::new()
        };

        let event = Event::AllocationUpdated {
            id,
            resource_id,
            range,
            hours_per_week,
            notes,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("allocation {id} updated: {hours_per_week}h/week over {range}");

        let allocation = guard
            .get_allocation(&id)
            .cloned()
            .ok_or(EngineError::AllocationNotFound(id))?;
        Ok(AllocationOutcome { allocation, warnings })
    }

    /// Soft retirement: the allocation stays on record but stops counting.
    pub async fn retire_allocation(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let _gate = self.write_gate.read().await;
        let (resource_id, mut guard) = self.resolve_allocation_write(&id).await?;
        let is_active = guard.get_allocation(&id).is_some_and(|a| a.is_active);
        if is_active {
            let event = Event::AllocationActiveSet {
                id,
                resource_id,
                is_active: false,
                at: now_ms(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            info!("allocation {id} retired");
        }
        guard
            .get_allocation(&id)
            .cloned()
            .ok_or(EngineError::AllocationNotFound(id))
    }

    /// Bring a retired allocation back, subject to the full capacity check.
    pub async fn reinstate_allocation(&self, id: Ulid) -> Result<AllocationOutcome, EngineError> {
        let result = self.reinstate_allocation_inner(id).await;
        if let Err(e) = &result {
            record_rejection(e);
            warn!("allocation {id} reinstatement rejected: {e}");
        }
        result
    }

    async fn reinstate_allocation_inner(&self, id: Ulid) -> Result<AllocationOutcome, EngineError> {
        let _gate = self.write_gate.read().await;
        let (resource_id, mut guard) = self.resolve_allocation_write(&id).await?;
        let current = guard
            .get_allocation(&id)
            .cloned()
            .ok_or(EngineError::AllocationNotFound(id))?;
        if current.is_active {
            return Ok(AllocationOutcome {
                allocation: current,
                warnings: Vec::new(),
            });
        }

        let capacity = self.policy.effective(&guard);
        let validated = validate_allocation(
            &guard,
            capacity,
            &Candidate {
                range: current.range,
                hours_per_week: current.hours_per_week,
                exclude: Some(id),
            },
        )?;

        let event = Event::AllocationActiveSet {
            id,
            resource_id,
            is_active: true,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        record_warnings(&validated.warnings);
        info!("allocation {id} reinstated");

        let allocation = guard
            .get_allocation(&id)
            .cloned()
            .ok_or(EngineError::AllocationNotFound(id))?;
        Ok(AllocationOutcome {
            allocation,
            warnings: validated.warnings,
        })
    }

    /// Hard delete. Returns the owning resource id.
    pub async fn remove_allocation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.write_gate.read().await;
        let (resource_id, mut guard) = self.resolve_allocation_write(&id).await?;
        let event = Event::AllocationRemoved { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("allocation {id} removed from resource {resource_id}");
        Ok(resource_id)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        // Excludes every writer, so no append can land between snapshot and swap.
        let _gate = self.write_gate.write().await;

        let mut events = Vec::new();
        let mut projects: Vec<ProjectInfo> =
            self.projects.iter().map(|e| e.value().clone()).collect();
        projects.sort_by_key(|p| p.id);
        for p in projects {
            events.push(Event::ProjectCreated { id: p.id, name: p.name });
        }

        let mut resource_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        resource_ids.sort();
        for rid in resource_ids {
            let Some(rs) = self.get_resource(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                capacity_weekly: guard.capacity_weekly,
                availability_percentage: guard.availability_percentage,
            });
            if !guard.is_active {
                events.push(Event::ResourceUpdated {
                    id: guard.id,
                    name: guard.name.clone(),
                    capacity_weekly: guard.capacity_weekly,
                    availability_percentage: guard.availability_percentage,
                    is_active: false,
                });
            }
            for a in &guard.allocations {
                events.push(Event::AllocationCreated {
                    id: a.id,
                    resource_id: a.resource_id,
                    project_id: a.project_id,
                    range: a.range,
                    hours_per_week: a.hours_per_week,
                    notes: a.notes.clone(),
                    at: a.created_at,
                });
                if a.updated_at != a.created_at {
                    events.push(Event::AllocationUpdated {
                        id: a.id,
                        resource_id: a.resource_id,
                        range: a.range,
                        hours_per_week: a.hours_per_week,
                        notes: a.notes.clone(),
                        at: a.updated_at,
                    });
                }
                if !a.is_active {
                    events.push(Event::AllocationActiveSet {
                        id: a.id,
                        resource_id: a.resource_id,
                        is_active: false,
                        at: a.updated_at,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
