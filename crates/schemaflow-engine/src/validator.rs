//! Pre-execution checks and sandboxed test runs.
//!
//! Validation never touches the target database. A test run applies the unit
//! for real between a backup and an optional restore, and never changes the
//! unit's status.

use std::collections::BTreeSet;

use schemaflow_core::script::analyze;
use schemaflow_core::{
    now_utc, Actor, AuditAction, BackupHandle, CancelSignal, EngineError, ExecutionKind,
    ExecutionOutcome, NodeRef, RunId, SeedInput, Unit, UnitId, UnitRef, UnitStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::AuditScope;
use crate::runner::{StepContext, StepRecord, StepReport};
use crate::{Catalog, MigrationService};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ValidateOptions {
    pub check_syntax: bool,
    pub check_dependencies: bool,
    pub check_conflicts: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            check_syntax: true,
            check_dependencies: true,
            check_conflicts: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Syntax,
    Dependencies,
    Conflicts,
    Reversibility,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckResult {
    pub check: CheckKind,
    pub passed: bool,
    pub messages: Vec<String>,
}

impl CheckResult {
    fn from_messages(check: CheckKind, messages: Vec<String>) -> Self {
        Self {
            check,
            passed: messages.is_empty(),
            messages,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationReport {
    pub unit: UnitRef,
    pub name: String,
    pub valid: bool,
    pub checks: Vec<CheckResult>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TestOptions {
    pub backup_before_test: bool,
    pub restore_after_test: bool,
    /// Also apply the reverse script after a successful forward pass.
    pub verify_reverse: bool,
    pub timeout_seconds: Option<u64>,
    pub batch_size: Option<u32>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            backup_before_test: true,
            restore_after_test: true,
            verify_reverse: true,
            timeout_seconds: None,
            batch_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestReport {
    pub run_id: RunId,
    pub step: StepReport,
    pub reverse_verified: Option<bool>,
    pub restored: bool,
    /// Kept when the target was not restored, so it can be restored by hand.
    pub backup: Option<BackupHandle>,
}

impl TestReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.step.outcome == ExecutionOutcome::Passed
    }
}

impl MigrationService<'_> {
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown migration.
    pub fn validate_migration(
        &self,
        id: UnitId,
        options: &ValidateOptions,
        actor: &Actor,
    ) -> Result<ValidationReport, EngineError> {
        self.validate_unit(UnitRef::migration(id), options, actor)
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown seed.
    pub fn validate_seed(
        &self,
        id: UnitId,
        options: &ValidateOptions,
        actor: &Actor,
    ) -> Result<ValidationReport, EngineError> {
        self.validate_unit(UnitRef::seed(id), options, actor)
    }

    /// Runs the requested checks; failed checks are reported, not returned as errors.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown unit.
    pub fn validate_unit(
        &self,
        unit: UnitRef,
        options: &ValidateOptions,
        actor: &Actor,
    ) -> Result<ValidationReport, EngineError> {
        let entry = AuditScope::on(AuditAction::Validate, unit.kind, unit.id);
        self.audited(actor, entry, |audit| {
            let catalog = self.load_catalog()?;
            let found = catalog.unit(unit)?;
            let node = NodeRef::from(unit);
            let mut planned = catalog.graph.requires_closure([node]);
            planned.remove(&node);

            let checks = self.check_unit(&catalog, found, options, &planned);
            let valid = checks.iter().all(|check| check.passed);
            audit.note("valid", valid);
            audit.note("checks", &checks);
            tracing::debug!(unit = %unit, valid, "unit validated");
            Ok(ValidationReport {
                unit,
                name: found.name().to_string(),
                valid,
                checks,
            })
        })
    }

    /// `planned` holds the nodes that will have run before `unit`.
    pub(crate) fn check_unit(
        &self,
        catalog: &Catalog,
        unit: &Unit,
        options: &ValidateOptions,
        planned: &BTreeSet<NodeRef>,
    ) -> Vec<CheckResult> {
        let mut checks = Vec::new();
        if options.check_syntax {
            checks.push(check_syntax(unit));
        }
        if options.check_dependencies {
            checks.push(check_dependencies(catalog, unit, planned));
        }
        if options.check_conflicts {
            checks.push(check_conflicts(catalog, unit, planned));
        }
        checks
    }

    pub(crate) fn check_reverse(&self, unit: &Unit) -> CheckResult {
        let mut messages = Vec::new();
        match unit {
            Unit::Migration(migration) => match migration.revert_script() {
                Some(script) => messages.extend(script_messages("reverse script", script)),
                None => messages.push(format!("{} is not reversible", unit.unit_ref())),
            },
            Unit::Seed(seed) if !seed.is_reversible => {
                messages.push(format!("{} is not reversible", unit.unit_ref()));
            }
            Unit::Seed(_) => {}
        }
        CheckResult::from_messages(CheckKind::Reversibility, messages)
    }

    /// # Errors
    /// See [`MigrationService::test_unit`].
    pub fn test_migration(
        &self,
        id: UnitId,
        options: &TestOptions,
        actor: &Actor,
    ) -> Result<TestReport, EngineError> {
        self.test_unit(UnitRef::migration(id), options, actor)
    }

    /// # Errors
    /// See [`MigrationService::test_unit`].
    pub fn test_seed(
        &self,
        id: UnitId,
        options: &TestOptions,
        actor: &Actor,
    ) -> Result<TestReport, EngineError> {
        self.test_unit(UnitRef::seed(id), options, actor)
    }

    /// Applies `unit` against the target between a backup and a restore.
    ///
    /// # Errors
    /// Returns [`EngineError::RunInProgress`] while another run holds the lock,
    /// [`EngineError::Validation`] for a retired unit or inconsistent options,
    /// and [`EngineError::Executor`] when the backup or restore itself fails.
    pub fn test_unit(
        &self,
        unit: UnitRef,
        options: &TestOptions,
        actor: &Actor,
    ) -> Result<TestReport, EngineError> {
        let run_id = RunId::new();
        let _span = tracing::info_span!("test", run_id = %run_id, unit = %unit).entered();

        let entry = AuditScope::on(AuditAction::Test, unit.kind, unit.id);

        self.audited(actor, entry, |audit| {
            if options.restore_after_test && !options.backup_before_test {
                return Err(EngineError::Validation(
                    "restore_after_test requires backup_before_test".to_string(),
                ));
            }
            let _lock = self.acquire_run_lock(run_id, actor)?;
            self.recover_interrupted(run_id, actor)?;

            let found = self.load_unit(unit)?;
            if found.is_retired() {
                return Err(EngineError::Validation(format!("{unit} is retired")));
            }

            let backup = if options.backup_before_test {
                Some(self.executor.backup()?)
            } else {
                None
            };
            audit.note("run_id", run_id.to_string());
            audit.note("backup", backup.as_ref().map(|handle| handle.location.clone()));

            let started_at = now_utc();
            let timeout_seconds = options.timeout_seconds.or(self.config.default_timeout_seconds);
            let signal = CancelSignal::new(timeout_seconds);
            let forward = self.apply_forward(&found, &signal, options.batch_size);
            let rows_committed = forward.rows_committed;

            let mut reverse_verified = None;
            let mut failure = forward.result.err();
            if failure.is_none() && options.verify_reverse && found.is_reversible() {
                let signal = CancelSignal::new(timeout_seconds);
                let reverse = self.apply_reverse(&found, &signal, options.batch_size);
                reverse_verified = Some(reverse.result.is_ok());
                failure = reverse.result.err();
            }

            let mut restored = false;
            let mut restore_error = None;
            if let (true, Some(handle)) = (options.restore_after_test, &backup) {
                match self.executor.restore(handle) {
                    Ok(()) => {
                        restored = true;
                        if let Err(err) = self.executor.discard_backup(handle) {
                            tracing::warn!(
                                backup = %handle.location,
                                error = %err,
                                "failed to discard test backup"
                            );
                        }
                    }
                    Err(err) => restore_error = Some(err),
                }
            }

            let outcome = match &failure {
                None if restore_error.is_none() => ExecutionOutcome::Passed,
                Some(err) if err.is_timeout() => ExecutionOutcome::TimedOut,
                _ => ExecutionOutcome::Failed,
            };
            let error = failure
                .as_ref()
                .map(ToString::to_string)
                .or_else(|| restore_error.as_ref().map(|err| format!("restore failed: {err}")));

            let context = StepContext {
                run_id,
                actor,
                dry_run: false,
                timeout_seconds,
            };
            let detail = json!({
                "reverse_verified": reverse_verified,
                "restored": restored,
                "backup": backup.as_ref().map(|handle| handle.location.clone()),
            });
            let record = StepRecord::new(&found, ExecutionKind::Test, outcome, started_at)
                .error(error)
                .rows(rows_committed)
                .detail(detail);
            let step = self.record(&context, record)?;
            audit.note("outcome", step.outcome);
            tracing::info!(outcome = step.outcome.as_str(), restored, "test finished");

            if let Some(err) = restore_error {
                tracing::error!(error = %err, "restoring the target after a test failed");
                return Err(err.into());
            }
            Ok(TestReport {
                run_id,
                step,
                reverse_verified,
                restored,
                backup: if restored { None } else { backup },
            })
        })
    }
}

fn script_messages(label: &str, script: &str) -> Vec<String> {
    analyze(script)
        .issues
        .into_iter()
        .map(|issue| format!("{label} line {}: {}", issue.line, issue.message))
        .collect()
}

fn check_syntax(unit: &Unit) -> CheckResult {
    let mut messages = Vec::new();
    match unit {
        Unit::Migration(migration) => {
            messages.extend(script_messages("forward script", &migration.forward_script));
            if let Some(script) = migration.revert_script() {
                messages.extend(script_messages("reverse script", script));
            }
        }
        Unit::Seed(seed) => {
            if let Err(err) = SeedInput::from(seed).validate() {
                messages.push(err.to_string());
            }
        }
    }
    CheckResult::from_messages(CheckKind::Syntax, messages)
}

fn check_dependencies(catalog: &Catalog, unit: &Unit, planned: &BTreeSet<NodeRef>) -> CheckResult {
    let node = NodeRef::from(unit.unit_ref());
    let mut messages = Vec::new();
    for prerequisite in catalog.graph.prerequisites(node) {
        let Some(found) = prerequisite
            .as_unit()
            .and_then(|unit_ref| catalog.units.get(&unit_ref))
        else {
            messages.push(format!("prerequisite {prerequisite} does not exist"));
            continue;
        };
        let completed = found.status() == UnitStatus::Completed;
        if found.is_retired() && !completed {
            messages.push(format!(
                "prerequisite {prerequisite} is retired and was never completed"
            ));
        } else if !completed && !planned.contains(&prerequisite) {
            messages.push(format!(
                "prerequisite {prerequisite} is {} and is not scheduled to run first",
                found.status().as_str()
            ));
        }
    }
    let closure = catalog.graph.requires_closure([node]);
    if let Err(err) = catalog.graph.resolve_order(&closure) {
        messages.push(err.to_string());
    }
    CheckResult::from_messages(CheckKind::Dependencies, messages)
}

fn check_conflicts(catalog: &Catalog, unit: &Unit, planned: &BTreeSet<NodeRef>) -> CheckResult {
    let node = NodeRef::from(unit.unit_ref());
    let mut candidates = catalog.graph.requires_closure([node]);
    candidates.extend(planned.iter().copied());
    let messages = match catalog.graph.validate_no_conflicts(&candidates) {
        Ok(()) => Vec::new(),
        Err(err) => vec![err.to_string()],
    };
    CheckResult::from_messages(CheckKind::Conflicts, messages)
}

#[cfg(test)]
mod tests {
    use schemaflow_core::query::HistoryFilter;
    use schemaflow_core::DependencyInput;

    use crate::testkit::{actor, migration_input, must, seed_input, Harness};

    use super::*;

    #[test]
    fn broken_script_fails_syntax_check_only() {
        let harness = Harness::new();
        let service = harness.service();
        let mut input = migration_input("broken", "1.0.0");
        input.forward_script = "CREATE TABLE broken (id INTEGER;".to_string();
        let migration = must(service.create_migration(input, &actor()));

        let options = ValidateOptions::default();
        let report = must(service.validate_migration(migration.id, &options, &actor()));
        assert!(!report.valid);
        let syntax = &report.checks[0];
        assert_eq!(syntax.check, CheckKind::Syntax);
        assert!(!syntax.passed);
        assert!(report.checks[1..].iter().all(|check| check.passed));
    }

    #[test]
    fn conflicting_prerequisites_fail_conflict_check() {
        let harness = Harness::new();
        let service = harness.service();
        let a = must(service.create_migration(migration_input("a", "1.0.0"), &actor()));
        let b = must(service.create_migration(migration_input("b", "1.0.0"), &actor()));
        let conflict = DependencyInput::conflicts(a.unit_ref(), b.unit_ref());
        must(service.add_dependency(conflict, &actor()));
        let mut c_input = migration_input("c", "1.0.0");
        c_input.depends_on = vec![a.unit_ref()];
        let c = must(service.create_migration(c_input, &actor()));

        let report = must(service.validate_migration(c.id, &ValidateOptions::default(), &actor()));
        assert!(report.valid);

        let only_conflicts = ValidateOptions {
            check_syntax: false,
            check_dependencies: false,
            check_conflicts: true,
        };
        let report = must(service.validate_migration(a.id, &only_conflicts, &actor()));
        assert_eq!(report.checks.len(), 1);
        assert!(report.valid);
    }

    #[test]
    fn validation_of_unknown_unit_is_an_error() {
        let harness = Harness::new();
        let service = harness.service();
        assert!(matches!(
            service.validate_seed(UnitId::new(), &ValidateOptions::default(), &actor()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_run_restores_target_and_keeps_status() {
        let harness = Harness::new();
        let service = harness.service();
        let seed = must(service.create_seed(seed_input("regions", "regions"), &actor()));

        let report = must(service.test_seed(seed.id, &TestOptions::default(), &actor()));
        assert!(report.passed());
        assert!(report.restored);
        assert_eq!(report.reverse_verified, Some(true));
        assert!(report.backup.is_none());
        assert_eq!(harness.executor.restores(), 1);
        assert!(harness.executor.rows("regions").is_empty());
        assert_eq!(must(service.get_seed(seed.id)).status, UnitStatus::Pending);

        let history = must(service.get_history(&HistoryFilter::for_unit(seed.unit_ref())));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, ExecutionKind::Test);
        assert_eq!(history[0].rows_committed, Some(2));
    }

    #[test]
    fn failing_test_is_recorded_and_target_restored() {
        let harness = Harness::new();
        let service = harness.service();
        let mut input = migration_input("explode", "1.0.0");
        input.forward_script = "CREATE TABLE explode (id INTEGER); -- FAIL".to_string();
        let migration = must(service.create_migration(input, &actor()));
        harness.executor.fail_when_contains("FAIL");

        let report = must(service.test_migration(migration.id, &TestOptions::default(), &actor()));
        assert!(!report.passed());
        assert_eq!(report.step.outcome, ExecutionOutcome::Failed);
        assert!(report.restored);
        assert_eq!(report.reverse_verified, None);
        assert_eq!(must(service.get_migration(migration.id)).status, UnitStatus::Pending);
    }

    #[test]
    fn restore_without_backup_is_rejected() {
        let harness = Harness::new();
        let service = harness.service();
        let migration = must(service.create_migration(migration_input("a", "1.0.0"), &actor()));
        let options = TestOptions {
            backup_before_test: false,
            ..TestOptions::default()
        };
        assert!(matches!(
            service.test_migration(migration.id, &options, &actor()),
            Err(EngineError::Validation(_))
        ));
    }
}
