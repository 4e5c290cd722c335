use super::*;
use crate::limits::*;

use chrono::NaiveDate;
use tokio_test::{assert_err, assert_ok};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn jan(day: u32) -> NaiveDate {
    d(2024, 1, day)
}

fn range(s: NaiveDate, e: NaiveDate) -> DateRange {
    DateRange::new(s, e)
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("caplevel_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), CapacityPolicy::default()).unwrap()
}

async fn resource(engine: &Engine) -> Ulid {
    engine
        .create_resource(NewResource::default())
        .await
        .unwrap()
        .id
}

async fn project(engine: &Engine) -> Ulid {
    engine.create_project(None, None).await.unwrap().id
}

fn proposal(rid: Ulid, pid: Ulid, s: NaiveDate, e: NaiveDate, hours: i64) -> NewAllocation {
    NewAllocation {
        id: None,
        resource_id: rid,
        project_id: pid,
        range: range(s, e),
        hours_per_week: Hours::whole(hours),
        notes: String::new(),
    }
}

// ── Resources and projects ───────────────────────────────

#[tokio::test]
async fn create_resource_uses_default_capacity() {
    let engine = new_engine("default_capacity.wal");
    let info = engine.create_resource(NewResource::default()).await.unwrap();
    assert_eq!(info.capacity_weekly, Hours::whole(40));
    assert_eq!(info.availability_percentage, 100);
    assert!(info.is_active);
}

#[tokio::test]
async fn injected_default_capacity_resolved_once() {
    let path = test_wal_path("injected_capacity.wal");
    let id = {
        let engine = Engine::new(path.clone(), CapacityPolicy::new(Hours::whole(32))).unwrap();
        engine.create_resource(NewResource::default()).await.unwrap().id
    };
    // A different default on restart does not rewrite existing resources.
    let engine = Engine::new(path, CapacityPolicy::new(Hours::whole(20))).unwrap();
    let info = engine.get_resource_info(id).await.unwrap();
    assert_eq!(info.capacity_weekly, Hours::whole(32));
}

#[tokio::test]
async fn duplicate_resource_id_rejected() {
    let engine = new_engine("dup_resource.wal");
    let id = Ulid::new();
    let new = NewResource {
        id: Some(id),
        ..Default::default()
    };
    assert_ok!(engine.create_resource(new.clone()).await);
    let err = assert_err!(engine.create_resource(new).await);
    assert!(matches!(err, EngineError::AlreadyExists(x) if x == id));
}

#[tokio::test]
async fn availability_percentage_above_100_rejected() {
    let engine = new_engine("pct_limit.wal");
    let err = engine
        .create_resource(NewResource {
            availability_percentage: Some(101),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn long_name_rejected() {
    let engine = new_engine("long_name.wal");
    let err = engine
        .create_project(None, Some("x".repeat(MAX_NAME_LEN + 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn update_resource_merges_fields() {
    let engine = new_engine("update_resource.wal");
    let rid = resource(&engine).await;
    let info = engine
        .update_resource(
            rid,
            ResourceChange {
                name: Some("Ana".into()),
                availability_percentage: Some(50),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(info.name.as_deref(), Some("Ana"));
    assert_eq!(info.capacity_weekly, Hours::whole(40));
    assert_eq!(info.availability_percentage, 50);
}

#[tokio::test]
async fn update_missing_resource_is_not_found() {
    let engine = new_engine("update_missing_resource.wal");
    let id = Ulid::new();
    let err = engine
        .update_resource(id, ResourceChange::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResourceNotFound(x) if x == id));
}

// ── Allocation writes ────────────────────────────────────

#[tokio::test]
async fn over_capacity_scenario_blocks_with_detail() {
    let engine = new_engine("scenario_overflow.wal");
    let rid = resource(&engine).await;
    let (p1, p2) = (project(&engine).await, project(&engine).await);

    assert_ok!(engine.create_allocation(proposal(rid, p1, jan(1), jan(31), 25)).await);

    let err = engine
        .create_allocation(proposal(rid, p2, jan(15), d(2024, 2, 15), 20))
        .await
        .unwrap_err();
    match err {
        EngineError::CapacityExceeded(o) => {
            assert_eq!(o.overlap_sum, Hours::whole(25));
            assert_eq!(o.requested, Hours::whole(20));
            assert_eq!(o.capacity, Hours::whole(40));
            assert_eq!(o.overflow, Hours::whole(5));
            assert_eq!(o.max_allocatable, Hours::whole(15));
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    // Nothing was written.
    assert_eq!(engine.list_allocations(rid).await.unwrap().len(), 1);
    let report = engine
        .availability(rid, range(jan(15), d(2024, 2, 15)))
        .await
        .unwrap();
    assert_eq!(report.can_allocate_hours, Hours::whole(15));
}

#[tokio::test]
async fn reduced_request_is_viable_with_high_load() {
    let engine = new_engine("scenario_high_load.wal");
    let rid = resource(&engine).await;
    let (p1, p2) = (project(&engine).await, project(&engine).await);
    engine
        .create_allocation(proposal(rid, p1, jan(1), jan(31), 25))
        .await
        .unwrap();

    let rec = engine
        .recommend(rid, Some(p2), range(jan(15), d(2024, 2, 15)), Hours::whole(10))
        .await
        .unwrap();
    assert!(rec.is_viable);
    assert_eq!(rec.projected_utilization, 87.5);
    assert!(matches!(rec.warnings.as_slice(), [Warning::HighLoad { .. }]));

    let outcome = engine
        .create_allocation(proposal(rid, p2, jan(15), d(2024, 2, 15), 10))
        .await
        .unwrap();
    assert!(outcome.warnings.is_empty());
}

#[tokio::test]
async fn third_project_warns_but_commits() {
    let engine = new_engine("scenario_fragmentation.wal");
    let rid = resource(&engine).await;
    let (p1, p2, p3) = (project(&engine).await, project(&engine).await, project(&engine).await);
    engine.create_allocation(proposal(rid, p1, jan(1), jan(31), 5)).await.unwrap();
    engine.create_allocation(proposal(rid, p2, jan(10), jan(20), 5)).await.unwrap();

    let mut new = proposal(rid, p3, jan(12), jan(18), 1);
    new.notes = "kickoff".into();
    let outcome = engine.create_allocation(new).await.unwrap();
    assert_eq!(
        outcome.warnings,
        vec![Warning::Fragmentation {
            resource_id: rid,
            concurrent_project_count: 2
        }]
    );
    // The warning is a value, never folded into the stored notes.
    assert_eq!(outcome.allocation.notes, "kickoff");
    let stored = engine.get_allocation(outcome.allocation.id).await.unwrap();
    assert_eq!(stored.allocation.notes, "kickoff");

    let report = engine.availability(rid, range(jan(12), jan(18))).await.unwrap();
    assert!(report.is_fragmented);
}

#[tokio::test]
async fn structural_errors_fail_first() {
    let engine = new_engine("structural.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;

    let err = engine
        .create_allocation(proposal(rid, pid, jan(10), jan(1), 5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::EndBeforeStart { .. })
    ));

    let err = engine
        .create_allocation(proposal(rid, pid, jan(1), jan(10), 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::HoursOutOfRange(_))
    ));

    // Structure is checked even before the resource lookup.
    let err = engine
        .create_allocation(proposal(Ulid::new(), pid, jan(1), jan(10), 200))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn unknown_resource_and_project() {
    let engine = new_engine("unknown_refs.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;

    let missing = Ulid::new();
    let err = assert_err!(
        engine
            .create_allocation(proposal(missing, pid, jan(1), jan(2), 5))
            .await
    );
    assert!(matches!(err, EngineError::ResourceNotFound(x) if x == missing));

    let err = assert_err!(
        engine
            .create_allocation(proposal(rid, missing, jan(1), jan(2), 5))
            .await
    );
    assert!(matches!(err, EngineError::ProjectNotFound(x) if x == missing));
}

#[tokio::test]
async fn inactive_resource_refuses_allocations() {
    let engine = new_engine("inactive_resource.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    engine
        .update_resource(
            rid,
            ResourceChange {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = engine
        .create_allocation(proposal(rid, pid, jan(1), jan(2), 5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::ResourceInactive(_))
    ));
}

#[tokio::test]
async fn availability_percentage_scales_capacity() {
    let engine = new_engine("scaled_capacity.wal");
    let rid = engine
        .create_resource(NewResource {
            availability_percentage: Some(50),
            ..Default::default()
        })
        .await
        .unwrap()
        .id;
    let pid = project(&engine).await;

    assert_ok!(engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 20)).await);
    let err = assert_err!(engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 1)).await);
    match err {
        EngineError::CapacityExceeded(o) => assert_eq!(o.capacity, Hours::whole(20)),
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn update_excludes_itself() {
    let engine = new_engine("update_self.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    let a = engine
        .create_allocation(proposal(rid, pid, jan(1), jan(31), 30))
        .await
        .unwrap()
        .allocation;

    // 35 alone fits; counting the stored 30 as well would not.
    let outcome = engine
        .update_allocation(
            a.id,
            AllocationChange {
                hours_per_week: Some(Hours::whole(35)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.allocation.hours_per_week, Hours::whole(35));
    assert_eq!(outcome.allocation.range, a.range);
    assert_eq!(outcome.allocation.created_at, a.created_at);
}

#[tokio::test]
async fn update_over_capacity_leaves_allocation_untouched() {
    let engine = new_engine("update_block.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 20)).await.unwrap();
    let b = engine
        .create_allocation(proposal(rid, pid, d(2024, 2, 1), d(2024, 2, 28), 20))
        .await
        .unwrap()
        .allocation;

    // Moving b into January collides with the other 20h.
    let err = engine
        .update_allocation(
            b.id,
            AllocationChange {
                start: Some(jan(20)),
                hours_per_week: Some(Hours::whole(25)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded(_)));
    let stored = engine.get_allocation(b.id).await.unwrap();
    assert_eq!(stored.allocation, b);
}

#[tokio::test]
async fn update_moves_start_and_keeps_order() {
    let engine = new_engine("update_order.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    let a = engine
        .create_allocation(proposal(rid, pid, jan(1), jan(31), 5))
        .await
        .unwrap()
        .allocation;
    let b = engine
        .create_allocation(proposal(rid, pid, jan(10), jan(31), 5))
        .await
        .unwrap()
        .allocation;
    engine
        .update_allocation(
            a.id,
            AllocationChange {
                start: Some(jan(20)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ids: Vec<Ulid> = engine
        .list_allocations(rid)
        .await
        .unwrap()
        .iter()
        .map(|i| i.allocation.id)
        .collect();
    assert_eq!(ids, vec![b.id, a.id]);
}

#[tokio::test]
async fn retire_frees_capacity_and_reinstate_revalidates() {
    let engine = new_engine("retire_reinstate.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    let a = engine
        .create_allocation(proposal(rid, pid, jan(1), jan(31), 30))
        .await
        .unwrap()
        .allocation;

    let retired = engine.retire_allocation(a.id).await.unwrap();
    assert!(!retired.is_active);
    // Retiring twice is a no-op.
    assert_ok!(engine.retire_allocation(a.id).await);

    engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 30)).await.unwrap();

    let err = engine.reinstate_allocation(a.id).await.unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded(_)));
    assert!(!engine.get_allocation(a.id).await.unwrap().allocation.is_active);
}

#[tokio::test]
async fn retired_allocation_can_be_edited_without_capacity_check() {
    let engine = new_engine("retired_edit.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    let a = engine
        .create_allocation(proposal(rid, pid, jan(1), jan(31), 30))
        .await
        .unwrap()
        .allocation;
    engine.retire_allocation(a.id).await.unwrap();
    engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 40)).await.unwrap();

    let outcome = engine
        .update_allocation(
            a.id,
            AllocationChange {
                notes: Some("parked".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.allocation.notes, "parked");
    assert!(!outcome.allocation.is_active);
}

#[tokio::test]
async fn remove_allocation_frees_capacity() {
    let engine = new_engine("remove_allocation.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    let a = engine
        .create_allocation(proposal(rid, pid, jan(1), jan(31), 40))
        .await
        .unwrap()
        .allocation;
    assert_eq!(engine.remove_allocation(a.id).await.unwrap(), rid);
    assert_ok!(engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 40)).await);

    let err = engine.remove_allocation(a.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AllocationNotFound(_)));
}

// ── Cascades ─────────────────────────────────────────────

#[tokio::test]
async fn delete_project_cascades_across_resources() {
    let engine = new_engine("project_cascade.wal");
    let (r1, r2) = (resource(&engine).await, resource(&engine).await);
    let (p1, p2) = (project(&engine).await, project(&engine).await);
    let a = engine.create_allocation(proposal(r1, p1, jan(1), jan(31), 10)).await.unwrap();
    engine.create_allocation(proposal(r2, p1, jan(1), jan(31), 10)).await.unwrap();
    let keep = engine.create_allocation(proposal(r1, p2, jan(1), jan(31), 10)).await.unwrap();

    assert_eq!(engine.delete_project(p1).await.unwrap(), 2);
    assert_eq!(engine.list_allocations(r1).await.unwrap().len(), 1);
    assert!(engine.list_allocations(r2).await.unwrap().is_empty());
    assert!(engine.get_resource_for_allocation(&a.allocation.id).is_none());
    assert!(engine.get_resource_for_allocation(&keep.allocation.id).is_some());

    let err = engine
        .create_allocation(proposal(r1, p1, jan(1), jan(31), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProjectNotFound(_)));
}

#[tokio::test]
async fn delete_resource_cascades() {
    let engine = new_engine("resource_cascade.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    let a = engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 10)).await.unwrap();

    engine.delete_resource(rid).await.unwrap();
    assert!(engine.get_resource(&rid).is_none());
    let err = engine.get_allocation(a.allocation.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AllocationNotFound(_)));
    let err = engine.availability(rid, range(jan(1), jan(2))).await.unwrap_err();
    assert!(matches!(err, EngineError::ResourceNotFound(_)));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn recommend_with_zero_hours_is_availability_only() {
    let engine = new_engine("recommend_zero.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 30)).await.unwrap();

    let rec = engine
        .recommend(rid, None, range(jan(1), jan(31)), Hours::ZERO)
        .await
        .unwrap();
    assert!(rec.is_viable);
    assert!(rec.warnings.is_empty());
    assert!(rec.recommendations.is_empty());
    assert_eq!(rec.availability.total_allocated_hours, Hours::whole(30));
}

#[tokio::test]
async fn recommend_never_writes() {
    let engine = new_engine("recommend_readonly.wal");
    let rid = resource(&engine).await;
    let before = engine.wal_appends_since_compact().await;
    engine
        .recommend(rid, None, range(jan(1), jan(31)), Hours::whole(10))
        .await
        .unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, before);
    assert!(engine.list_allocations(rid).await.unwrap().is_empty());
}

#[tokio::test]
async fn availability_for_missing_resource_is_typed() {
    let engine = new_engine("availability_missing.wal");
    let id = Ulid::new();
    let err = engine.availability(id, range(jan(1), jan(2))).await.unwrap_err();
    assert!(matches!(err, EngineError::ResourceNotFound(x) if x == id));
}

#[tokio::test]
async fn oversized_window_rejected() {
    let engine = new_engine("wide_window.wal");
    let rid = resource(&engine).await;
    let err = engine
        .availability(rid, range(d(2000, 1, 1), d(2030, 1, 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn peak_load_counts_sequential_work_once() {
    let engine = new_engine("peak_sequential.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    engine.create_allocation(proposal(rid, pid, jan(1), jan(15), 30)).await.unwrap();
    engine.create_allocation(proposal(rid, pid, jan(16), jan(31), 30)).await.unwrap();

    let window = range(jan(1), jan(31));
    let report = engine.availability(rid, window).await.unwrap();
    assert_eq!(report.total_allocated_hours, Hours::whole(60));
    assert_eq!(engine.peak_load(rid, window, false).await.unwrap(), Hours::whole(30));
}

#[tokio::test]
async fn booking_report_skips_inactive_resources() {
    let engine = new_engine("booking_report.wal");
    let busy = resource(&engine).await;
    let idle = resource(&engine).await;
    let gone = resource(&engine).await;
    let pid = project(&engine).await;
    engine.create_allocation(proposal(busy, pid, jan(1), jan(31), 36)).await.unwrap();
    engine
        .update_resource(
            gone,
            ResourceChange {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let report = engine
        .booking_report(range(jan(1), jan(31)), None, false, jan(11))
        .await
        .unwrap();
    assert_eq!(report.total_resources, 2);
    assert_eq!(report.resources[0].resource_id, busy);
    assert_eq!(report.resources[0].occupancy_percentage, 90.0);
    assert_eq!(report.resources[0].status, BookingStatus::Optimal);
    assert_eq!(report.resources[0].allocations[0].days_remaining, 20);
    assert_eq!(report.resources[1].resource_id, idle);
    assert_eq!(report.fully_assigned, 1);
    assert_eq!(report.available, 1);
}

#[tokio::test]
async fn booking_report_include_inactive_allocations() {
    let engine = new_engine("booking_inactive.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    let a = engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 20)).await.unwrap();
    engine.retire_allocation(a.allocation.id).await.unwrap();

    let window = range(jan(1), jan(31));
    let without = engine.booking_report(window, Some(rid), false, jan(1)).await.unwrap();
    assert!(without.resources[0].allocations.is_empty());
    let with = engine.booking_report(window, Some(rid), true, jan(1)).await.unwrap();
    assert_eq!(with.resources[0].peak_hours, Hours::whole(20));
}

#[tokio::test]
async fn list_allocations_derives_values() {
    let engine = new_engine("derived_values.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    engine.create_allocation(proposal(rid, pid, jan(1), jan(29), 10)).await.unwrap();
    engine.create_allocation(proposal(rid, pid, jan(20), d(2024, 2, 10), 10)).await.unwrap();
    engine.create_allocation(proposal(rid, pid, d(2024, 3, 1), d(2024, 3, 3), 5)).await.unwrap();

    let list = engine.list_allocations(rid).await.unwrap();
    assert_eq!(list[0].duration_weeks, 4);
    assert_eq!(list[0].total_hours_allocated, Hours::whole(40));
    assert_eq!(list[0].overlaps_with_count, 1);
    assert_eq!(list[1].overlaps_with_count, 1);
    // Short allocations still count as one week.
    assert_eq!(list[2].duration_weeks, 1);
    assert_eq!(list[2].overlaps_with_count, 0);
}

#[tokio::test]
async fn project_summary_counts_across_resources() {
    let engine = new_engine("project_summary.wal");
    let (r1, r2) = (resource(&engine).await, resource(&engine).await);
    let pid = project(&engine).await;
    engine.create_allocation(proposal(r1, pid, jan(1), jan(29), 10)).await.unwrap();
    engine.create_allocation(proposal(r2, pid, d(2024, 2, 1), d(2024, 2, 14), 5)).await.unwrap();

    let summary = engine.project_summary(pid, jan(15)).await.unwrap();
    assert_eq!(summary.allocation_count, 2);
    assert_eq!(summary.active_on_day, 1);
    assert_eq!(summary.total_allocated_hours, Hours::whole(50));

    let err = engine.project_summary(Ulid::new(), jan(15)).await.unwrap_err();
    assert!(matches!(err, EngineError::ProjectNotFound(_)));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_proposals_never_overcommit() {
    let engine = Arc::new(new_engine("race.wal"));
    let rid = resource(&engine).await;
    let pid = project(&engine).await;

    // 16 × 5h against 40h: exactly 8 can win.
    let mut handles = Vec::new();
    for _ in 0..16 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_allocation(proposal(rid, pid, jan(1), jan(31), 5)).await
        }));
    }
    let mut accepted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::CapacityExceeded(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted, 8);
    let report = engine.availability(rid, range(jan(1), jan(31))).await.unwrap();
    assert_eq!(report.total_allocated_hours, Hours::whole(40));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn project_delete_races_with_creates() {
    let engine = Arc::new(new_engine("race_project_delete.wal"));
    let rid = resource(&engine).await;
    let pid = project(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let _ = eng.create_allocation(proposal(rid, pid, jan(1), jan(31), 1)).await;
        }));
    }
    let eng = engine.clone();
    let deleter = tokio::spawn(async move { eng.delete_project(pid).await });
    for h in handles {
        h.await.unwrap();
    }
    deleter.await.unwrap().unwrap();

    // No allocation may outlive its project.
    let list = engine.list_allocations(rid).await.unwrap();
    assert!(list.iter().all(|i| i.allocation.project_id != pid));
}

/// Let every spawned task run until it parks on a lock.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn create_queued_behind_resource_delete_fails() {
    let engine = Arc::new(new_engine("race_resource_delete.wal"));
    let rid = resource(&engine).await;
    let pid = project(&engine).await;

    let rs = engine.get_resource(&rid).unwrap();
    let held = rs.write().await;

    let eng = engine.clone();
    let deleter = tokio::spawn(async move { eng.delete_resource(rid).await });
    settle().await;
    let eng = engine.clone();
    let creator = tokio::spawn(async move {
        eng.create_allocation(proposal(rid, pid, jan(1), jan(31), 8))
            .await
    });
    settle().await;
    drop(held);

    deleter.await.unwrap().unwrap();
    let err = creator.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::ResourceNotFound(id) if id == rid));
    assert!(engine.get_resource(&rid).is_none());
    assert!(engine.allocation_to_resource.is_empty());
}

#[tokio::test]
async fn update_queued_behind_resource_delete_fails() {
    let engine = Arc::new(new_engine("race_resource_delete_update.wal"));
    let rid = resource(&engine).await;

    let rs = engine.get_resource(&rid).unwrap();
    let held = rs.write().await;

    let eng = engine.clone();
    let deleter = tokio::spawn(async move { eng.delete_resource(rid).await });
    settle().await;
    let eng = engine.clone();
    let updater = tokio::spawn(async move {
        eng.update_resource(
            rid,
            ResourceChange {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
    });
    settle().await;
    drop(held);

    deleter.await.unwrap().unwrap();
    assert_err!(updater.await.unwrap());
    assert!(engine.get_resource(&rid).is_none());
}

#[tokio::test]
async fn allocation_id_unique_across_resources() {
    let engine = Arc::new(new_engine("race_duplicate_allocation_id.wal"));
    let r1 = resource(&engine).await;
    let r2 = resource(&engine).await;
    let pid = project(&engine).await;
    let id = Ulid::new();

    let rs1 = engine.get_resource(&r1).unwrap();
    let rs2 = engine.get_resource(&r2).unwrap();
    let g1 = rs1.write().await;
    let g2 = rs2.write().await;

    let mut handles = Vec::new();
    for rid in [r1, r2] {
        let eng = engine.clone();
        let mut p = proposal(rid, pid, jan(1), jan(31), 8);
        p.id = Some(id);
        handles.push(tokio::spawn(async move { eng.create_allocation(p).await }));
    }
    settle().await;
    drop(g1);
    drop(g2);

    let mut accepted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 1);

    let stored = engine.list_allocations(r1).await.unwrap().len()
        + engine.list_allocations(r2).await.unwrap().len();
    assert_eq!(stored, 1);
    // The one that landed is reachable through the index.
    assert_ok!(engine.retire_allocation(id).await);
}

#[tokio::test]
async fn rejected_create_releases_its_id() {
    let engine = new_engine("rejected_create_id.wal");
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    let id = Ulid::new();

    let mut too_big = proposal(rid, pid, jan(1), jan(31), 50);
    too_big.id = Some(id);
    assert_err!(engine.create_allocation(too_big).await);
    assert!(engine.get_resource_for_allocation(&id).is_none());

    let mut fits = proposal(rid, pid, jan(1), jan(31), 30);
    fits.id = Some(id);
    let created = assert_ok!(engine.create_allocation(fits).await);
    assert_eq!(created.allocation.id, id);
}

#[tokio::test]
async fn concurrent_registration_of_one_id() {
    let engine = new_engine("race_registration.wal");

    let pid = Ulid::new();
    let (a, b) = tokio::join!(
        engine.create_project(Some(pid), None),
        engine.create_project(Some(pid), None)
    );
    assert_eq!(u8::from(a.is_ok()) + u8::from(b.is_ok()), 1);

    let rid = Ulid::new();
    let new = || NewResource {
        id: Some(rid),
        ..Default::default()
    };
    let (a, b) = tokio::join!(engine.create_resource(new()), engine.create_resource(new()));
    assert_eq!(u8::from(a.is_ok()) + u8::from(b.is_ok()), 1);
    assert!(matches!(a.err().or(b.err()), Some(EngineError::AlreadyExists(id)) if id == rid));
}

// ── WAL ──────────────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (rid, pid, kept, retired) = {
        let engine = Engine::new(path.clone(), CapacityPolicy::default()).unwrap();
        let rid = resource(&engine).await;
        let pid = project(&engine).await;
        let kept = engine
            .create_allocation(proposal(rid, pid, jan(1), jan(31), 20))
            .await
            .unwrap()
            .allocation;
        let retired = engine
            .create_allocation(proposal(rid, pid, jan(1), jan(31), 10))
            .await
            .unwrap()
            .allocation;
        engine.retire_allocation(retired.id).await.unwrap();
        let gone = engine
            .create_allocation(proposal(rid, pid, jan(1), jan(31), 5))
            .await
            .unwrap()
            .allocation;
        engine.remove_allocation(gone.id).await.unwrap();
        (rid, pid, kept.id, retired.id)
    };

    let engine = Engine::new(path, CapacityPolicy::default()).unwrap();
    assert!(engine.projects.contains_key(&pid));
    let list = engine.list_allocations(rid).await.unwrap();
    assert_eq!(list.len(), 2);
    assert!(engine.get_allocation(kept).await.unwrap().allocation.is_active);
    assert!(!engine.get_allocation(retired).await.unwrap().allocation.is_active);
    let report = engine.availability(rid, range(jan(1), jan(31))).await.unwrap();
    assert_eq!(report.total_allocated_hours, Hours::whole(20));
}

#[tokio::test]
async fn wal_replay_applies_cascades() {
    let path = test_wal_path("replay_cascade.wal");
    let (r1, r2) = {
        let engine = Engine::new(path.clone(), CapacityPolicy::default()).unwrap();
        let (r1, r2) = (resource(&engine).await, resource(&engine).await);
        let (p1, p2) = (project(&engine).await, project(&engine).await);
        engine.create_allocation(proposal(r1, p1, jan(1), jan(31), 10)).await.unwrap();
        engine.create_allocation(proposal(r1, p2, jan(1), jan(31), 10)).await.unwrap();
        engine.create_allocation(proposal(r2, p2, jan(1), jan(31), 10)).await.unwrap();
        engine.delete_project(p1).await.unwrap();
        engine.delete_resource(r2).await.unwrap();
        (r1, r2)
    };

    let engine = Engine::new(path, CapacityPolicy::default()).unwrap();
    assert_eq!(engine.list_allocations(r1).await.unwrap().len(), 1);
    assert!(engine.get_resource(&r2).is_none());
    assert_eq!(engine.allocation_to_resource.len(), 1);
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let engine = Engine::new(path.clone(), CapacityPolicy::default()).unwrap();
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    let a = engine
        .create_allocation(proposal(rid, pid, jan(1), jan(31), 10))
        .await
        .unwrap()
        .allocation;
    for h in 11..20 {
        engine
            .update_allocation(
                a.id,
                AllocationChange {
                    hours_per_week: Some(Hours::whole(h)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
    engine.retire_allocation(a.id).await.unwrap();
    let before = engine.list_allocations(rid).await.unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before);

    drop(engine);
    let engine = Engine::new(path, CapacityPolicy::default()).unwrap();
    assert_eq!(engine.list_allocations(rid).await.unwrap(), before);
}

#[tokio::test]
async fn writes_after_compaction_survive_restart() {
    let path = test_wal_path("compact_restart.wal");
    let rid = {
        let engine = Engine::new(path.clone(), CapacityPolicy::default()).unwrap();
        let rid = resource(&engine).await;
        let pid = project(&engine).await;
        engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 10)).await.unwrap();
        engine.compact_wal().await.unwrap();
        engine.create_allocation(proposal(rid, pid, jan(1), jan(31), 10)).await.unwrap();
        rid
    };
    let engine = Engine::new(path, CapacityPolicy::default()).unwrap();
    assert_eq!(engine.list_allocations(rid).await.unwrap().len(), 2);
}

#[tokio::test]
async fn appends_counted_through_channel() {
    let engine = new_engine("appends_counter.wal");
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    let rid = resource(&engine).await;
    let pid = project(&engine).await;
    engine.create_allocation(proposal(rid, pid, jan(1), jan(2), 1)).await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 3);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit.wal");
    let engine = Arc::new(Engine::new(path.clone(), CapacityPolicy::default()).unwrap());
    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_resource(NewResource {
                name: Some(format!("R{i}")),
                ..Default::default()
            })
            .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_resources().await.len(), n);

    let engine2 = Engine::new(path, CapacityPolicy::default()).unwrap();
    assert_eq!(engine2.list_resources().await.len(), n);
}
