//! Run lifecycle scenarios against both storage backends.
//!
//! Every scenario is written once over `RunStore` and run against the
//! in-memory backend and an on-disk SQLite database in a temp directory.
//!
//! Run with: `cargo test --test lifecycle_scenarios`

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use time_attack::{
    compare, get_personal_best, AlignmentPolicy, Entity, ManualClock, MemoryStore, RouteId,
    RunController, RunHistoryStats, RunStore, SqliteStore, TrackerConfig, TrackerError, Verdict,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 7, 45, 0).unwrap()
}

/// Helper: create a SQLite store in a temp directory, return store + temp dir.
fn sqlite_store() -> (SqliteStore, TempDir) {
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let store = SqliteStore::new(tmp_dir.path().join("time_attack.db")).expect("failed to open db");
    (store, tmp_dir)
}

/// Helper: drive one full run through the controller with the given segments.
fn drive_run<S: RunStore>(
    controller: &mut RunController<S, ManualClock>,
    clock: &ManualClock,
    route_id: RouteId,
    segments: &[f64],
) -> i64 {
    let run_id = controller.start(route_id, "").expect("start failed");
    for &segment in segments {
        clock.advance(segment);
        controller.record_checkpoint().expect("record failed");
    }
    run_id
}

// ============================================================================
// Scenario: A -> B with three checkpoints
// ============================================================================

fn scenario_three_checkpoints<S: RunStore>(mut store: S) {
    let route_id = store
        .create_route_with_checkpoints("A→B", "", &["start", "mid", "end"])
        .unwrap();
    let clock = ManualClock::new(t0());
    let mut controller = RunController::with_clock(store, clock.clone());

    let run_id = controller.start(route_id, "").unwrap();
    let mut outcomes = Vec::new();
    for seconds in [5.0, 5.0, 15.0] {
        clock.advance(seconds);
        outcomes.push(controller.record_checkpoint().unwrap());
    }

    let segments: Vec<f64> = outcomes.iter().map(|o| o.segment_seconds).collect();
    let cumulative: Vec<f64> = outcomes.iter().map(|o| o.cumulative_seconds).collect();
    assert_eq!(segments, vec![5.0, 5.0, 15.0]);
    assert_eq!(cumulative, vec![5.0, 10.0, 25.0]);
    assert!(outcomes[2].completed);
    assert_eq!(outcomes[2].total_seconds, Some(25.0));

    let store = controller.store();
    let details = store.get_run_details(run_id).unwrap().unwrap();
    assert_eq!(details.route_name, "A→B");
    assert_eq!(details.run.total_seconds, Some(25.0));

    let splits = store.get_run_checkpoint_times(run_id).unwrap();
    let names: Vec<&str> = splits.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["start", "mid", "end"]);
    assert_eq!(splits[2].cumulative_seconds, 25.0);

    let best = get_personal_best(store, route_id).unwrap().unwrap();
    assert_eq!(best.run_id, run_id);
    assert_eq!(best.date, t0());

    // One past the last checkpoint
    assert!(matches!(
        controller.record_checkpoint(),
        Err(TrackerError::InvalidState { .. })
    ));
}

#[test]
fn test_three_checkpoints_memory() {
    init_logging();
    scenario_three_checkpoints(MemoryStore::new());
}

#[test]
fn test_three_checkpoints_sqlite() {
    init_logging();
    let (store, _tmp) = sqlite_store();
    scenario_three_checkpoints(store);
}

// ============================================================================
// Scenario: beating the personal best
// ============================================================================

fn scenario_personal_best_comparison<S: RunStore>(mut store: S) {
    let route_id = store
        .create_route_with_checkpoints("X", "", &["one", "two", "three"])
        .unwrap();
    let clock = ManualClock::new(t0());
    let mut controller = RunController::with_clock(store, clock.clone());

    let first = drive_run(&mut controller, &clock, route_id, &[30.0, 40.0, 30.0]);
    clock.advance(86_400.0);
    let second = drive_run(&mut controller, &clock, route_id, &[28.0, 42.0, 29.0]);

    let comparison = controller.compare_personal_best(first).unwrap().unwrap();
    assert_eq!(comparison.ghost_run_id, second);

    // Second run is the new best and has nothing to compare against
    assert!(controller.compare_personal_best(second).unwrap().is_none());

    let comparison = compare(controller.store(), second, first, AlignmentPolicy::Strict).unwrap();
    let segment: Vec<f64> = comparison.entries.iter().map(|e| e.segment_delta).collect();
    let cumulative: Vec<f64> = comparison.entries.iter().map(|e| e.cumulative_delta).collect();
    assert_eq!(segment, vec![-2.0, 2.0, -1.0]);
    assert_eq!(cumulative, vec![-2.0, 0.0, -1.0]);

    let insights = comparison.insights().unwrap();
    assert_eq!(insights.verdict, Verdict::Faster);
    assert_eq!(insights.best_segment.checkpoint_name, "one");
    assert_eq!(insights.worst_segment.checkpoint_name, "two");
    assert_eq!(insights.to_string(), "finished 1.000s faster than personal best");

    let history = controller.store().get_run_history(route_id).unwrap();
    assert_eq!(history.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second, first]);
    let stats = RunHistoryStats::from_runs(&history);
    assert_eq!(stats.fastest_seconds, Some(99.0));
    assert_eq!(stats.slowest_seconds, Some(100.0));

    let analysis = controller.store().get_checkpoint_analysis(route_id).unwrap();
    assert_eq!(analysis[1].best_seconds, Some(40.0));
    assert_eq!(analysis[1].worst_seconds, Some(42.0));
}

#[test]
fn test_personal_best_comparison_memory() {
    init_logging();
    scenario_personal_best_comparison(MemoryStore::new());
}

#[test]
fn test_personal_best_comparison_sqlite() {
    init_logging();
    let (store, _tmp) = sqlite_store();
    scenario_personal_best_comparison(store);
}

// ============================================================================
// Scenario: cancel keeps history, does not resurrect
// ============================================================================

fn scenario_cancel<S: RunStore>(mut store: S) {
    let route_id = store
        .create_route_with_checkpoints("Canal path", "", &["lock", "bridge", "gate"])
        .unwrap();
    let clock = ManualClock::new(t0());
    let mut controller = RunController::with_clock(store, clock.clone());

    let run_id = controller.start(route_id, "headwind").unwrap();
    clock.advance(40.0);
    controller.record_checkpoint().unwrap();
    assert_eq!(controller.cancel(), Some(run_id));

    let store = controller.store();
    assert!(store.get_latest_active_run().unwrap().is_none());
    assert_eq!(store.get_run_checkpoint_times(run_id).unwrap().len(), 1);
    let run = store.get_run_details(run_id).unwrap().unwrap().run;
    assert!(!run.is_completed);
    assert_eq!(run.notes, "headwind");
    assert!(get_personal_best(store, route_id).unwrap().is_none());

    // The route is free for a new run
    let next = controller.start(route_id, "").unwrap();
    assert_ne!(next, run_id);

    // Explicit delete removes the abandoned run and its times
    controller.store_mut().delete_run(run_id).unwrap();
    controller.store_mut().delete_run(run_id).unwrap();
    assert!(controller.store().get_run_details(run_id).unwrap().is_none());
    assert!(controller
        .store()
        .get_run_checkpoint_times(run_id)
        .unwrap()
        .is_empty());
}

#[test]
fn test_cancel_memory() {
    init_logging();
    scenario_cancel(MemoryStore::new());
}

#[test]
fn test_cancel_sqlite() {
    init_logging();
    let (store, _tmp) = sqlite_store();
    scenario_cancel(store);
}

// ============================================================================
// Scenario: validation leaves no trace
// ============================================================================

fn scenario_validation<S: RunStore>(mut store: S) {
    assert!(matches!(
        store.create_route("  ", ""),
        Err(TrackerError::Validation { .. })
    ));
    assert!(matches!(
        store.create_route_with_checkpoints("Ring road", "", &["a", " "]),
        Err(TrackerError::Validation { .. })
    ));
    assert!(store.list_routes().unwrap().is_empty());

    let route_id = store.create_route("Ring road", "").unwrap();
    assert!(matches!(
        store.create_route("Ring road", "again"),
        Err(TrackerError::Validation { .. })
    ));
    assert!(matches!(
        store.add_checkpoint(999, "a", 1),
        Err(TrackerError::NotFound {
            entity: Entity::Route,
            id: 999
        })
    ));

    let mut controller = RunController::with_clock(store, ManualClock::new(t0()));
    assert!(matches!(
        controller.start(route_id, ""),
        Err(TrackerError::Validation { .. })
    ));
    assert!(controller.store().get_latest_active_run().unwrap().is_none());
    assert!(controller.store().get_run_history(route_id).unwrap().is_empty());
}

#[test]
fn test_validation_memory() {
    init_logging();
    scenario_validation(MemoryStore::new());
}

#[test]
fn test_validation_sqlite() {
    init_logging();
    let (store, _tmp) = sqlite_store();
    scenario_validation(store);
}

// ============================================================================
// Scenario: delete cascades
// ============================================================================

fn scenario_delete_route<S: RunStore>(mut store: S) {
    let keep = store
        .create_route_with_checkpoints("Keep", "", &["k1", "k2"])
        .unwrap();
    let dropped = store
        .create_route_with_checkpoints("Drop", "", &["d1", "d2"])
        .unwrap();
    let clock = ManualClock::new(t0());
    let mut controller = RunController::with_clock(store, clock.clone());
    let kept_run = drive_run(&mut controller, &clock, keep, &[10.0, 10.0]);
    let dropped_run = drive_run(&mut controller, &clock, dropped, &[10.0, 10.0]);

    let mut store = controller.into_store();
    store.delete_route(dropped).unwrap();
    store.delete_route(dropped).unwrap();

    assert!(store.get_route(dropped).unwrap().is_none());
    assert!(store.list_checkpoints(dropped).unwrap().is_empty());
    assert!(store.get_run_details(dropped_run).unwrap().is_none());
    assert!(store.get_run_checkpoint_times(dropped_run).unwrap().is_empty());

    assert_eq!(store.list_routes().unwrap().len(), 1);
    assert_eq!(store.get_run_checkpoint_times(kept_run).unwrap().len(), 2);
}

#[test]
fn test_delete_route_memory() {
    init_logging();
    scenario_delete_route(MemoryStore::new());
}

#[test]
fn test_delete_route_sqlite() {
    init_logging();
    let (store, _tmp) = sqlite_store();
    scenario_delete_route(store);
}

// ============================================================================
// Scenario: checkpoints are recorded in route order
// ============================================================================

fn scenario_recording_order<S: RunStore>(mut store: S) {
    let route_id = store
        .create_route_with_checkpoints("Canal", "", &["lock", "bridge", "station"])
        .unwrap();
    let checkpoints = store.list_checkpoints(route_id).unwrap();
    let run_id = store.start_run(route_id, "", t0()).unwrap();
    let at = |seconds: i64| t0() + chrono::Duration::seconds(seconds);

    // Skipping ahead leaves no trace
    assert!(matches!(
        store.record_checkpoint_time(run_id, checkpoints[2].id, 9.0, at(9)),
        Err(TrackerError::Validation { .. })
    ));
    assert!(store.get_run_checkpoint_times(run_id).unwrap().is_empty());

    store
        .record_checkpoint_time(run_id, checkpoints[0].id, 4.0, at(4))
        .unwrap();
    assert!(matches!(
        store.record_checkpoint_time(run_id, checkpoints[2].id, 5.0, at(9)),
        Err(TrackerError::Validation { .. })
    ));
    store
        .record_checkpoint_time(run_id, checkpoints[1].id, 5.0, at(9))
        .unwrap();
    assert!(matches!(
        store.record_checkpoint_time(run_id, checkpoints[0].id, 1.0, at(10)),
        Err(TrackerError::Validation { .. })
    ));
    store
        .record_checkpoint_time(run_id, checkpoints[2].id, 6.0, at(15))
        .unwrap();

    let splits = store.get_run_checkpoint_times(run_id).unwrap();
    let cumulative: Vec<f64> = splits.iter().map(|s| s.cumulative_seconds).collect();
    assert_eq!(cumulative, vec![4.0, 9.0, 15.0]);
}

#[test]
fn test_recording_order_memory() {
    init_logging();
    scenario_recording_order(MemoryStore::new());
}

#[test]
fn test_recording_order_sqlite() {
    init_logging();
    let (store, _tmp) = sqlite_store();
    scenario_recording_order(store);
}

// ============================================================================
// SQLite only: reopen the database mid-run
// ============================================================================

#[test]
fn test_resume_after_reopening_database() {
    init_logging();
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let config = TrackerConfig {
        db_path: tmp_dir.path().join("commute.db"),
        ..TrackerConfig::default()
    };
    let clock = ManualClock::new(t0());

    let (route_id, run_id) = {
        let mut store = SqliteStore::open(&config).unwrap();
        let route_id = store
            .create_route_with_checkpoints("Home to Office", "", &["Bridge", "Station", "Office"])
            .unwrap();
        let mut controller = RunController::with_clock(store, clock.clone());
        let run_id = controller.start(route_id, "").unwrap();
        clock.advance(61.5);
        controller.record_checkpoint().unwrap();
        (route_id, run_id)
    };

    // Process restart
    clock.advance(30.25);
    let store = SqliteStore::open(&config).unwrap();
    let mut controller = RunController::with_clock(store, clock.clone()).with_config(config);
    assert_eq!(controller.resume().unwrap(), Some(run_id));

    let status = controller.live_status().unwrap();
    assert_eq!(status.recorded, 1);
    assert_eq!(status.next_checkpoint.as_deref(), Some("Station"));
    assert!((status.elapsed_seconds - 91.75).abs() < 1e-9);
    assert!((status.segment_elapsed_seconds - 30.25).abs() < 1e-9);

    let outcome = controller.record_checkpoint().unwrap();
    assert!((outcome.segment_seconds - 30.25).abs() < 1e-9);
    clock.advance(10.0);
    let outcome = controller.record_checkpoint().unwrap();
    assert!(outcome.completed);
    assert!((outcome.total_seconds.unwrap() - 101.75).abs() < 1e-9);

    let best = get_personal_best(controller.store(), route_id).unwrap().unwrap();
    assert_eq!(best.run_id, run_id);
}

#[test]
fn test_second_active_run_rejected_by_storage() {
    init_logging();
    let (mut store, _tmp) = sqlite_store();
    let route_id = store
        .create_route_with_checkpoints("Hill", "", &["top"])
        .unwrap();
    let run_id = store.start_run(route_id, "", t0()).unwrap();

    assert!(matches!(
        store.start_run(route_id, "", t0()),
        Err(TrackerError::InvalidState { .. })
    ));

    store.complete_run(run_id, 12.0, t0()).unwrap();
    assert!(matches!(
        store.complete_run(run_id, 11.0, t0()),
        Err(TrackerError::InvalidState { .. })
    ));
    assert!(store.start_run(route_id, "", t0()).is_ok());
}

#[test]
fn test_personal_best_unknown_route() {
    init_logging();
    let store = MemoryStore::new();
    assert!(matches!(
        get_personal_best(&store, 12),
        Err(TrackerError::NotFound {
            entity: Entity::Route,
            id: 12
        })
    ));
}
