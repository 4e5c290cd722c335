mod availability;
mod capacity;
mod error;
mod index;
mod mutations;
mod peak;
mod queries;
mod recommend;
mod validator;
#[cfg(test)]
mod tests;

pub use availability::{
    calculate_availability, AvailabilityReport, AvailabilityStatus, FRAGMENTATION_THRESHOLD,
};
pub use capacity::{CapacityPolicy, DEFAULT_WEEKLY_CAPACITY};
pub use error::{CapacityOverflow, EngineError, ValidationError};
pub use index::{overlapping, OverlapQuery};
pub use mutations::{
    AllocationChange, AllocationOutcome, NewAllocation, NewResource, ResourceChange,
};
pub use peak::{
    book_resource, default_booking_window, peak_load, AllocationLoad, BookingReport,
    BookingStatus, ResourceBooking,
};
pub use recommend::{recommend, Recommendation, HIGH_LOAD_FROM};
pub use validator::{
    check_structure, validate_allocation, Candidate, Validated, Warning, FRAGMENTATION_WARN_AT,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is queued, then issues
/// a single fsync for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, &mut vec![(event, response)]),
    }
}

/// Allocation store and capacity engine.
///
/// Each resource's allocations sit behind their own `RwLock`: every write
/// holds the write lock from validation through WAL append to apply, so two
/// proposals for the same resource can never both pass against stale state.
/// Reports take the read lock and see a consistent snapshot.
pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub projects: DashMap<Ulid, ProjectInfo>,
    pub policy: CapacityPolicy,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: allocation id → resource id
    pub(super) allocation_to_resource: DashMap<Ulid, Ulid>,
    /// Shared by every mutation, exclusive for compaction. Taken before any
    /// resource lock.
    pub(super) write_gate: RwLock<()>,
    /// Serializes resource and project registration so an id is checked and
    /// logged as one step.
    pub(super) registry_lock: Mutex<()>,
}

/// Apply an allocation/resource event to a ResourceState (caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AllocationCreated {
            id,
            resource_id,
            project_id,
            range,
            hours_per_week,
            notes,
            at,
        } => {
            rs.insert_allocation(Allocation {
                id: *id,
                resource_id: *resource_id,
                project_id: *project_id,
                range: *range,
                hours_per_week: *hours_per_week,
                is_active: true,
                notes: notes.clone(),
                created_at: *at,
                updated_at: *at,
            });
            index.insert(*id, *resource_id);
        }
        Event::AllocationUpdated {
            id,
            range,
            hours_per_week,
            notes,
            at,
            ..
        } => {
            // Re-insert: the start date may have moved.
            if let Some(mut a) = rs.remove_allocation(*id) {
                a.range = *range;
                a.hours_per_week = *hours_per_week;
                a.notes = notes.clone();
                a.updated_at = *at;
                rs.insert_allocation(a);
            }
        }
        Event::AllocationActiveSet { id, is_active, at, .. } => {
            if let Some(a) = rs.get_allocation_mut(id) {
                a.is_active = *is_active;
                a.updated_at = *at;
            }
        }
        Event::AllocationRemoved { id, .. } => {
            rs.remove_allocation(*id);
            index.remove(id);
        }
        Event::ResourceUpdated {
            name,
            capacity_weekly,
            availability_percentage,
            is_active,
            ..
        } => {
            rs.name = name.clone();
            rs.capacity_weekly = *capacity_weekly;
            rs.availability_percentage = *availability_percentage;
            rs.is_active = *is_active;
        }
        // Registry-level events are handled by the engine, not here
        Event::ResourceCreated { .. }
        | Event::ResourceDeleted { .. }
        | Event::ProjectCreated { .. }
        | Event::ProjectDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: CapacityPolicy) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            projects: DashMap::new(),
            policy,
            wal_tx,
            allocation_to_resource: DashMap::new(),
            write_gate: RwLock::new(()),
            registry_lock: Mutex::new(()),
        };

        // Sole owner of these Arcs during replay: try_write never contends.
        // Never block_on here; this runs inside the runtime.
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            "replayed {} events: {} resources, {} projects, {} allocations",
            events.len(),
            engine.state.len(),
            engine.projects.len(),
            engine.allocation_to_resource.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ResourceCreated {
                id,
                name,
                capacity_weekly,
                availability_percentage,
            } => {
                let rs = ResourceState::new(
                    *id,
                    name.clone(),
                    *capacity_weekly,
                    *availability_percentage,
                );
                self.state.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::ResourceDeleted { id } => self.drop_resource(id),
            Event::ProjectCreated { id, name } => {
                self.projects.insert(*id, ProjectInfo { id: *id, name: name.clone() });
            }
            Event::ProjectDeleted { id } => {
                self.projects.remove(id);
            }
            other => {
                if let Some(resource_id) = event_resource_id(other)
                    && let Some(entry) = self.state.get(&resource_id)
                {
                    let rs = entry.clone();
                    match rs.try_write() {
                        Ok(mut guard) => {
                            apply_to_resource(&mut guard, other, &self.allocation_to_resource)
                        }
                        Err(_) => {
                            tracing::error!("replay: resource {resource_id} unexpectedly locked")
                        }
                    }
                }
            }
        }
    }

    /// Remove a resource and unindex its allocations.
    fn drop_resource(&self, id: &Ulid) {
        if self.state.remove(id).is_some() {
            self.allocation_to_resource.retain(|_, rid| rid != id);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_allocation(&self, allocation_id: &Ulid) -> Option<Ulid> {
        self.allocation_to_resource
            .get(allocation_id)
            .map(|e| *e.value())
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.allocation_to_resource);
        Ok(())
    }

    /// True while `rs` is still the registered state for `resource_id`.
    fn is_registered(&self, resource_id: &Ulid, rs: &SharedResourceState) -> bool {
        self.state
            .get(resource_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), rs))
    }

    /// Acquire a resource's write lock. Fails if the resource was deleted
    /// while we waited.
    pub(super) async fn lock_resource(
        &self,
        resource_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(resource_id)
            .ok_or(EngineError::ResourceNotFound(*resource_id))?;
        let guard = rs.clone().write_owned().await;
        if !self.is_registered(resource_id, &rs) {
            return Err(EngineError::ResourceNotFound(*resource_id));
        }
        Ok(guard)
    }

    /// Lookup allocation → resource, acquire the resource's write lock.
    pub(super) async fn resolve_allocation_write(
        &self,
        allocation_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_allocation(allocation_id)
            .ok_or(EngineError::AllocationNotFound(*allocation_id))?;
        let guard = self
            .lock_resource(&resource_id)
            .await
            .map_err(|_| EngineError::AllocationNotFound(*allocation_id))?;
        // A concurrent cascade may have removed it while we waited.
        if guard.get_allocation(allocation_id).is_none() {
            return Err(EngineError::AllocationNotFound(*allocation_id));
        }
        Ok((resource_id, guard))
    }
}

/// The resource an allocation-level event belongs to.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AllocationCreated { resource_id, .. }
        | Event::AllocationUpdated { resource_id, .. }
        | Event::AllocationActiveSet { resource_id, .. }
        | Event::AllocationRemoved { resource_id, .. } => Some(*resource_id),
        Event::ResourceUpdated { id, .. } => Some(*id),
        Event::ResourceCreated { .. }
        | Event::ResourceDeleted { .. }
        | Event::ProjectCreated { .. }
        | Event::ProjectDeleted { .. } => None,
    }
}
