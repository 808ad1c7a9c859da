use std::thread;
use std::time::{Duration, Instant};

use schemaflow_core::query::{AuditFilter, HistoryFilter};
use schemaflow_core::{
    now_utc, Actor, AuditAction, DependencyInput, EngineError, ExecutionKind, ExecutionOutcome,
    Migration, MigrationInput, MigrationType, RunId, SeedInput, SeedRow, StateStore, UnitRef,
    UnitStatus,
};
use schemaflow_engine::{
    EngineConfig, MemoryStateStore, MigrationService, RollbackPolicy, RunPolicy, RunStatus,
    ScriptedExecutor,
};
use serde_json::json;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn actor() -> Actor {
    Actor::new("release-bot").with_source("ci")
}

fn migration(name: &str, depends_on: &[&Migration]) -> MigrationInput {
    MigrationInput {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        migration_type: MigrationType::Schema,
        description: None,
        forward_script: format!("CREATE TABLE {name} (id INTEGER PRIMARY KEY);"),
        reverse_script: Some(format!("DROP TABLE {name};")),
        is_reversible: true,
        batch_size: None,
        depends_on: depends_on.iter().map(|found| found.unit_ref()).collect(),
    }
}

struct Fixture {
    store: MemoryStateStore,
    executor: ScriptedExecutor,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: MemoryStateStore::new(),
            executor: ScriptedExecutor::new(),
        }
    }

    fn service(&self) -> MigrationService<'_> {
        must(MigrationService::new(&self.store, &self.executor, EngineConfig::default()))
    }

    fn status(&self, unit: UnitRef) -> UnitStatus {
        match must(self.store.get_unit(unit)) {
            Some(found) => found.status(),
            None => panic!("unit {unit} missing"),
        }
    }
}

#[test]
fn rerunning_a_completed_unit_appends_a_skipped_record() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let a = must(service.create_migration(migration("accounts", &[]), &actor()));

    must(service.run_migration(a.id, &RunPolicy::default(), &actor()));
    let second = must(service.run_migration(a.id, &RunPolicy::default(), &actor()));

    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.outcome_of(a.unit_ref()), Some(ExecutionOutcome::Skipped));
    assert_eq!(fixture.status(a.unit_ref()), UnitStatus::Completed);
    assert_eq!(fixture.executor.applied().len(), 1);

    let history = must(service.get_history(&HistoryFilter::for_unit(a.unit_ref())));
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].outcome, ExecutionOutcome::Skipped);
}

#[test]
fn dry_run_never_changes_status() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let a = must(service.create_migration(migration("accounts", &[]), &actor()));
    let mut broken = migration("ledger", &[&a]);
    broken.forward_script = "CREATE TABLE ledger (id INTEGER".to_string();
    let b = must(service.create_migration(broken, &actor()));

    let policy = RunPolicy {
        dry_run: true,
        ..RunPolicy::default()
    };
    let report = must(service.run_migration(b.id, &policy, &actor()));

    assert!(report.dry_run);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.outcome_of(a.unit_ref()), Some(ExecutionOutcome::Passed));
    assert_eq!(report.outcome_of(b.unit_ref()), Some(ExecutionOutcome::Failed));
    assert_eq!(fixture.status(a.unit_ref()), UnitStatus::Pending);
    assert_eq!(fixture.status(b.unit_ref()), UnitStatus::Pending);
    assert!(fixture.executor.applied().is_empty());

    let records = must(service.get_history(&HistoryFilter::default()));
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|record| record.dry_run));
    assert!(matches!(report.into_result(), Err(EngineError::Validation(_))));
}

#[test]
fn rollback_on_failure_reverts_only_units_completed_in_this_run() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let base = must(service.create_migration(migration("base", &[]), &actor()));
    must(service.run_migration(base.id, &RunPolicy::default(), &actor()));

    let a = must(service.create_migration(migration("alpha", &[&base]), &actor()));
    let b = must(service.create_migration(migration("beta", &[&a]), &actor()));
    let mut failing = migration("gamma", &[&b]);
    failing.forward_script = "CREATE TABLE gamma (id INTEGER); -- EXPLODE".to_string();
    let c = must(service.create_migration(failing, &actor()));
    fixture.executor.fail_when_contains("EXPLODE");

    let policy = RunPolicy {
        rollback_on_failure: true,
        ..RunPolicy::default()
    };
    let report = must(service.run_migration(c.id, &policy, &actor()));

    assert_eq!(report.status, RunStatus::RolledBack);
    assert_eq!(report.order, vec![a.unit_ref(), b.unit_ref(), c.unit_ref()]);
    assert_eq!(fixture.status(base.unit_ref()), UnitStatus::Completed);
    assert_eq!(fixture.status(a.unit_ref()), UnitStatus::RolledBack);
    assert_eq!(fixture.status(b.unit_ref()), UnitStatus::RolledBack);
    assert_eq!(fixture.status(c.unit_ref()), UnitStatus::Failed);
    assert_eq!(
        fixture.executor.applied(),
        vec![
            "CREATE TABLE base (id INTEGER PRIMARY KEY);".to_string(),
            "CREATE TABLE alpha (id INTEGER PRIMARY KEY);".to_string(),
            "CREATE TABLE beta (id INTEGER PRIMARY KEY);".to_string(),
            "DROP TABLE beta;".to_string(),
            "DROP TABLE alpha;".to_string(),
        ]
    );

    let outcomes: Vec<(ExecutionKind, ExecutionOutcome)> = report
        .steps
        .iter()
        .map(|step| (step.kind, step.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (ExecutionKind::Apply, ExecutionOutcome::Completed),
            (ExecutionKind::Apply, ExecutionOutcome::Completed),
            (ExecutionKind::Apply, ExecutionOutcome::Failed),
            (ExecutionKind::Rollback, ExecutionOutcome::RolledBack),
            (ExecutionKind::Rollback, ExecutionOutcome::RolledBack),
        ]
    );

    let runs = must(service.get_audit_log(&AuditFilter {
        action: Some(AuditAction::Run),
        ..AuditFilter::default()
    }));
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|entry| entry.succeeded));
}

#[test]
fn failure_without_rollback_policy_leaves_completed_units_alone() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let a = must(service.create_migration(migration("alpha", &[]), &actor()));
    let mut failing = migration("beta", &[&a]);
    failing.forward_script = "CREATE TABLE beta (id INTEGER); -- EXPLODE".to_string();
    let b = must(service.create_migration(failing, &actor()));
    let c = must(service.create_migration(migration("gamma", &[&b]), &actor()));
    fixture.executor.fail_when_contains("EXPLODE");

    let report = must(service.run_migration(c.id, &RunPolicy::default(), &actor()));
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.not_attempted, vec![c.unit_ref()]);
    assert_eq!(fixture.status(a.unit_ref()), UnitStatus::Completed);
    assert_eq!(fixture.status(b.unit_ref()), UnitStatus::Failed);
    assert_eq!(fixture.status(c.unit_ref()), UnitStatus::Pending);
    assert!(matches!(report.into_result(), Err(EngineError::Executor(_))));
}

#[test]
fn rollback_batch_with_an_irreversible_member_runs_no_reverse_script() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let a = must(service.create_migration(migration("alpha", &[]), &actor()));
    let mut one_way = migration("beta", &[&a]);
    one_way.is_reversible = false;
    one_way.reverse_script = None;
    let b = must(service.create_migration(one_way, &actor()));
    must(service.run_migration(b.id, &RunPolicy::default(), &actor()));
    let applied_before = fixture.executor.applied();

    assert!(matches!(
        service.rollback_migration(a.id, &RollbackPolicy::default(), &actor()),
        Err(EngineError::NonReversibleUnit { .. })
    ));
    assert!(matches!(
        service.rollback_migration(b.id, &RollbackPolicy::default(), &actor()),
        Err(EngineError::NonReversibleUnit { .. })
    ));
    assert_eq!(fixture.executor.applied(), applied_before);
    assert_eq!(fixture.status(a.unit_ref()), UnitStatus::Completed);
    assert_eq!(fixture.status(b.unit_ref()), UnitStatus::Completed);

    let mut pending_one_way = migration("gamma", &[]);
    pending_one_way.is_reversible = false;
    pending_one_way.reverse_script = None;
    let c = must(service.create_migration(pending_one_way, &actor()));
    assert!(matches!(
        service.rollback_migration(c.id, &RollbackPolicy::default(), &actor()),
        Err(EngineError::NonReversibleUnit { .. })
    ));
    assert_eq!(fixture.status(c.unit_ref()), UnitStatus::Pending);
    assert_eq!(fixture.executor.applied(), applied_before);

    let rollbacks = must(service.get_audit_log(&AuditFilter {
        action: Some(AuditAction::Rollback),
        ..AuditFilter::default()
    }));
    assert_eq!(rollbacks.len(), 3);
    assert!(rollbacks.iter().all(|entry| !entry.succeeded));
}

#[test]
fn rollback_reverts_dependents_first() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let a = must(service.create_migration(migration("alpha", &[]), &actor()));
    let b = must(service.create_migration(migration("beta", &[&a]), &actor()));
    let unrelated = must(service.create_migration(migration("gamma", &[]), &actor()));
    must(service.run_units(
        &[b.unit_ref(), unrelated.unit_ref()],
        &RunPolicy::default(),
        &actor(),
    ));

    let report = must(service.rollback_migration(a.id, &RollbackPolicy::default(), &actor()));
    assert_eq!(report.order, vec![b.unit_ref(), a.unit_ref()]);
    assert_eq!(fixture.status(a.unit_ref()), UnitStatus::RolledBack);
    assert_eq!(fixture.status(b.unit_ref()), UnitStatus::RolledBack);
    assert_eq!(fixture.status(unrelated.unit_ref()), UnitStatus::Completed);

    assert!(matches!(
        service.rollback_migration(a.id, &RollbackPolicy::default(), &actor()),
        Err(EngineError::Validation(_))
    ));

    let rerun = must(service.run_migration(b.id, &RunPolicy::default(), &actor()));
    assert_eq!(rerun.status, RunStatus::Succeeded);
    assert_eq!(fixture.status(a.unit_ref()), UnitStatus::Completed);
}

#[test]
fn concurrent_run_is_rejected_while_the_lock_is_held() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let mut slow = migration("slow", &[]);
    slow.forward_script = "CREATE TABLE slow (id INTEGER); -- HOLD".to_string();
    let slow = must(service.create_migration(slow, &actor()));
    let other = must(service.create_migration(migration("other", &[]), &actor()));
    fixture.executor.hold_when_contains("HOLD");

    thread::scope(|scope| {
        let first = scope.spawn(|| {
            fixture
                .service()
                .run_migration(slow.id, &RunPolicy::default(), &actor())
        });

        let waited = Instant::now();
        while !fixture.executor.is_holding() {
            assert!(waited.elapsed() < Duration::from_secs(10), "first run never started");
            thread::sleep(Duration::from_millis(5));
        }
        let second = service.run_migration(other.id, &RunPolicy::default(), &actor());
        assert!(matches!(second, Err(EngineError::RunInProgress { .. })));

        fixture.executor.release();
        let first = match first.join() {
            Ok(result) => must(result),
            Err(_) => panic!("first run panicked"),
        };
        assert_eq!(first.status, RunStatus::Succeeded);
    });

    assert_eq!(fixture.status(slow.unit_ref()), UnitStatus::Completed);
    assert_eq!(fixture.status(other.unit_ref()), UnitStatus::Pending);
    assert!(must(service.current_run_lock()).is_none());
    must(service.run_migration(other.id, &RunPolicy::default(), &actor()));
}

#[test]
fn conflicting_units_cannot_share_a_run() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let a = must(service.create_migration(migration("alpha", &[]), &actor()));
    let b = must(service.create_migration(migration("beta", &[&a]), &actor()));
    let c = must(service.create_migration(migration("gamma", &[&a]), &actor()));
    must(service.add_dependency(DependencyInput::conflicts(c.unit_ref(), b.unit_ref()), &actor()));

    let all = service.run_units(
        &[a.unit_ref(), b.unit_ref(), c.unit_ref()],
        &RunPolicy::default(),
        &actor(),
    );
    assert!(matches!(all, Err(EngineError::Conflict { .. })));
    assert!(fixture.executor.applied().is_empty());
    assert!(must(service.get_history(&HistoryFilter::default())).is_empty());

    let both = [a.unit_ref(), b.unit_ref()];
    let report = must(service.run_units(&both, &RunPolicy::default(), &actor()));
    assert_eq!(report.order, vec![a.unit_ref(), b.unit_ref()]);
    assert_eq!(report.status, RunStatus::Succeeded);
}

#[test]
fn upserting_seed_twice_keeps_one_row() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let mut row = SeedRow::new();
    row.insert("id".to_string(), json!(1));
    row.insert("name".to_string(), json!("x"));
    let seed = must(service.create_seed(
        SeedInput {
            name: "currencies".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            target_table: "currencies".to_string(),
            data: vec![row],
            match_conditions: vec!["id".to_string()],
            update_existing: true,
            is_reversible: true,
            batch_size: None,
            depends_on: Vec::new(),
        },
        &actor(),
    ));

    let forced = RunPolicy {
        force: true,
        ..RunPolicy::default()
    };
    let first = must(service.run_seed(seed.id, &RunPolicy::default(), &actor()));
    let second = must(service.run_seed(seed.id, &forced, &actor()));

    assert_eq!(first.steps[0].rows_committed, Some(1));
    assert_eq!(second.outcome_of(seed.unit_ref()), Some(ExecutionOutcome::Completed));
    assert_eq!(fixture.executor.rows("currencies").len(), 1);
}

#[test]
fn seed_without_match_columns_is_keyed_by_the_whole_row() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let mut row = SeedRow::new();
    row.insert("id".to_string(), json!(1));
    row.insert("name".to_string(), json!("x"));
    let seed = must(service.create_seed(
        SeedInput {
            name: "regions".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            target_table: "regions".to_string(),
            data: vec![row],
            match_conditions: Vec::new(),
            update_existing: true,
            is_reversible: true,
            batch_size: None,
            depends_on: Vec::new(),
        },
        &actor(),
    ));

    let forced = RunPolicy {
        force: true,
        ..RunPolicy::default()
    };
    must(service.run_seed(seed.id, &RunPolicy::default(), &actor()));
    let second = must(service.run_seed(seed.id, &forced, &actor()));

    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(fixture.executor.rows("regions").len(), 1);

    must(service.rollback_seed(seed.id, &RollbackPolicy::default(), &actor()));
    assert!(fixture.executor.rows("regions").is_empty());
}

#[test]
fn seed_rows_are_committed_in_chunks() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let data: Vec<SeedRow> = (1..=5)
        .map(|id| {
            let mut row = SeedRow::new();
            row.insert("id".to_string(), json!(id));
            row
        })
        .collect();
    let seed = must(service.create_seed(
        SeedInput {
            name: "numbers".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            target_table: "numbers".to_string(),
            data,
            match_conditions: vec!["id".to_string()],
            update_existing: false,
            is_reversible: true,
            batch_size: Some(2),
            depends_on: Vec::new(),
        },
        &actor(),
    ));

    let report = must(service.run_seed(seed.id, &RunPolicy::default(), &actor()));
    assert_eq!(report.steps[0].rows_committed, Some(5));
    assert_eq!(fixture.executor.rows("numbers").len(), 5);

    let rollback = must(service.rollback_seed(seed.id, &RollbackPolicy::default(), &actor()));
    assert_eq!(rollback.steps[0].rows_committed, Some(5));
    assert!(fixture.executor.rows("numbers").is_empty());
}

#[test]
fn unit_exceeding_its_timeout_fails_with_timed_out_record() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let mut stuck = migration("stuck", &[]);
    stuck.forward_script = "CREATE TABLE stuck (id INTEGER); -- HOLD".to_string();
    let stuck = must(service.create_migration(stuck, &actor()));
    fixture.executor.hold_when_contains("HOLD");

    let policy = RunPolicy {
        timeout_seconds: Some(1),
        ..RunPolicy::default()
    };
    let report = must(service.run_migration(stuck.id, &policy, &actor()));

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.outcome_of(stuck.unit_ref()), Some(ExecutionOutcome::TimedOut));
    assert_eq!(fixture.status(stuck.unit_ref()), UnitStatus::Failed);
    assert!(matches!(
        report.into_result(),
        Err(EngineError::ExecutionTimeout { timeout_seconds: 1, .. })
    ));
}

#[test]
fn run_recovers_units_left_running_by_a_crashed_run() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let crashed = must(service.create_migration(migration("crashed", &[]), &actor()));
    let next = must(service.create_migration(migration("next", &[]), &actor()));
    must(fixture.store.set_unit_status(crashed.unit_ref(), UnitStatus::Running, now_utc()));

    let report = must(service.run_migration(next.id, &RunPolicy::default(), &actor()));
    assert_eq!(report.recovered, vec![crashed.unit_ref()]);
    assert_eq!(fixture.status(crashed.unit_ref()), UnitStatus::Failed);

    let history = must(service.get_history(&HistoryFilter::for_unit(crashed.unit_ref())));
    assert_eq!(history[0].outcome, ExecutionOutcome::Interrupted);
}

#[test]
fn stale_lock_needs_forced_release() {
    let fixture = Fixture::new();
    let service = fixture.service();
    let a = must(service.create_migration(migration("alpha", &[]), &actor()));
    must(fixture.store.try_acquire_run_lock(
        &service.config().schema_scope,
        RunId::new(),
        "crashed-host",
        now_utc(),
    ));

    assert!(matches!(
        service.run_migration(a.id, &RunPolicy::default(), &actor()),
        Err(EngineError::RunInProgress { .. })
    ));
    assert!(matches!(
        service.release_run_lock(false, &actor()),
        Err(EngineError::Validation(_))
    ));
    let released = must(service.release_run_lock(true, &actor()));
    assert_eq!(released.map(|lock| lock.holder), Some("crashed-host".to_string()));
    must(service.run_migration(a.id, &RunPolicy::default(), &actor()));
    assert_eq!(fixture.status(a.unit_ref()), UnitStatus::Completed);
}
