use std::collections::BTreeSet;

use schemaflow_core::lifecycle::ensure_transition;
use schemaflow_core::{
    now_utc, Actor, AuditAction, CancelSignal, EngineError, ExecutionKind, ExecutionOutcome,
    ExecutionRecordInput, ExecutorError, NodeRef, ResourceType, RunId, SeedChunk, Unit, UnitId,
    UnitQuery, UnitRef, UnitStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::audit::AuditScope;
use crate::validator::ValidateOptions;
use crate::{Catalog, MigrationService};

/// Caller-supplied knobs for a forward run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RunPolicy {
    /// Re-execute completed units that were requested, and skip pulling in prerequisites.
    pub force: bool,
    pub dry_run: bool,
    pub rollback_on_failure: bool,
    pub timeout_seconds: Option<u64>,
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RollbackPolicy {
    pub dry_run: bool,
    pub timeout_seconds: Option<u64>,
    pub batch_size: Option<u32>,
}

/// What a run or rollback request applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    Units(Vec<UnitRef>),
    Migrations(UnitQuery),
    Seeds(UnitQuery),
    Version(String),
}

impl RunTarget {
    fn describe(&self) -> Value {
        match self {
            Self::Units(units) => json!({
                "units": units.iter().map(ToString::to_string).collect::<Vec<_>>()
            }),
            Self::Migrations(query) => json!({ "migrations": query }),
            Self::Seeds(query) => json!({ "seeds": query }),
            Self::Version(label) => json!({ "version": label }),
        }
    }

    fn is_explicit(&self) -> bool {
        matches!(self, Self::Units(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    RolledBack,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepReport {
    pub unit: UnitRef,
    pub name: String,
    pub kind: ExecutionKind,
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
    pub rows_committed: Option<u64>,
    pub error: Option<String>,
    pub record_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: RunId,
    pub scope: String,
    pub dry_run: bool,
    pub status: RunStatus,
    pub requested: Vec<UnitRef>,
    pub order: Vec<UnitRef>,
    pub steps: Vec<StepReport>,
    pub not_attempted: Vec<UnitRef>,
    pub recovered: Vec<UnitRef>,
    pub timeout_seconds: Option<u64>,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
}

impl RunReport {
    #[must_use]
    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps.iter().find(|step| step.outcome.is_failure())
    }

    #[must_use]
    pub fn outcome_of(&self, unit: UnitRef) -> Option<ExecutionOutcome> {
        self.steps
            .iter()
            .rev()
            .find(|step| step.unit == unit)
            .map(|step| step.outcome)
    }

    /// Converts a failed report into the error that caused it.
    ///
    /// # Errors
    /// Returns [`EngineError::ExecutionTimeout`] for a timed-out unit,
    /// [`EngineError::Validation`] for a failed dry-run check and
    /// [`EngineError::Executor`] for any other unit failure.
    pub fn into_result(self) -> Result<Self, EngineError> {
        if self.status == RunStatus::Succeeded {
            return Ok(self);
        }
        let Some(step) = self.failed_step() else {
            return Err(EngineError::Validation(format!(
                "run {} finished as {}",
                self.run_id,
                self.status.as_str()
            )));
        };
        let message = step.error.clone().unwrap_or_default();
        Err(match step.outcome {
            ExecutionOutcome::TimedOut => EngineError::ExecutionTimeout {
                unit: step.unit.to_string(),
                timeout_seconds: self.timeout_seconds.unwrap_or(0),
            },
            _ if self.dry_run => EngineError::Validation(format!("{}: {message}", step.unit)),
            _ => EngineError::Executor(ExecutorError::Script(format!("{}: {message}", step.unit))),
        })
    }
}

pub(crate) struct Attempt {
    pub(crate) result: Result<(), ExecutorError>,
    pub(crate) rows_committed: Option<u64>,
}

pub(crate) struct StepContext<'c> {
    pub(crate) run_id: RunId,
    pub(crate) actor: &'c Actor,
    pub(crate) dry_run: bool,
    pub(crate) timeout_seconds: Option<u64>,
}

/// One execution record, written by [`MigrationService::record`].
pub(crate) struct StepRecord<'u> {
    unit: &'u Unit,
    kind: ExecutionKind,
    outcome: ExecutionOutcome,
    started_at: OffsetDateTime,
    error: Option<String>,
    rows_committed: Option<u64>,
    status: Option<UnitStatus>,
    detail: Value,
}

impl<'u> StepRecord<'u> {
    pub(crate) fn new(
        unit: &'u Unit,
        kind: ExecutionKind,
        outcome: ExecutionOutcome,
        started_at: OffsetDateTime,
    ) -> Self {
        Self {
            unit,
            kind,
            outcome,
            started_at,
            error: None,
            rows_committed: None,
            status: None,
            detail: Value::Null,
        }
    }

    fn skipped(unit: &'u Unit, started_at: OffsetDateTime) -> Self {
        Self::new(unit, ExecutionKind::Apply, ExecutionOutcome::Skipped, started_at)
            .detail(json!({ "reason": "already completed" }))
    }

    pub(crate) fn error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub(crate) fn rows(mut self, rows_committed: Option<u64>) -> Self {
        self.rows_committed = rows_committed;
        self
    }

    /// Moves the unit to `status` in the same transaction as the record.
    pub(crate) fn status(mut self, status: UnitStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

impl MigrationService<'_> {
    /// Runs one migration, preceded by any prerequisites that are not yet completed.
    ///
    /// # Errors
    /// See [`MigrationService::run`].
    pub fn run_migration(
        &self,
        id: UnitId,
        policy: &RunPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        self.run(&RunTarget::Units(vec![UnitRef::migration(id)]), policy, actor)
    }

    /// # Errors
    /// See [`MigrationService::run`].
    pub fn run_migrations(
        &self,
        query: &UnitQuery,
        policy: &RunPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        self.run(&RunTarget::Migrations(query.clone()), policy, actor)
    }

    /// # Errors
    /// See [`MigrationService::run`].
    pub fn run_seed(
        &self,
        id: UnitId,
        policy: &RunPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        self.run(&RunTarget::Units(vec![UnitRef::seed(id)]), policy, actor)
    }

    /// # Errors
    /// See [`MigrationService::run`].
    pub fn run_seeds(
        &self,
        query: &UnitQuery,
        policy: &RunPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        self.run(&RunTarget::Seeds(query.clone()), policy, actor)
    }

    /// # Errors
    /// See [`MigrationService::run`].
    pub fn run_units(
        &self,
        units: &[UnitRef],
        policy: &RunPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        self.run(&RunTarget::Units(units.to_vec()), policy, actor)
    }

    /// Runs every member of a version.
    ///
    /// # Errors
    /// See [`MigrationService::run`].
    pub fn run_version(
        &self,
        label: &str,
        policy: &RunPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        self.run(&RunTarget::Version(label.to_string()), policy, actor)
    }

    /// Executes the target units in dependency order under the run lock.
    ///
    /// A unit failure is reported through [`RunReport::status`]; use
    /// [`RunReport::into_result`] to turn it into an error.
    ///
    /// # Errors
    /// Structural problems fail before any script runs:
    /// [`EngineError::RunInProgress`], [`EngineError::NotFound`],
    /// [`EngineError::Validation`], [`EngineError::CyclicDependency`] and
    /// [`EngineError::Conflict`]. A reverse script failing during
    /// rollback-on-failure yields [`EngineError::RollbackFailure`].
    pub fn run(
        &self,
        target: &RunTarget,
        policy: &RunPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        let run_id = RunId::new();
        let scope = &self.config.schema_scope;
        let _span = tracing::info_span!("run", run_id = %run_id, scope = %scope).entered();

        let entry = AuditScope::on(AuditAction::Run, ResourceType::Batch, run_id);

        self.audited(actor, entry, |audit| {
            audit.note("target", target.describe());
            audit.note("policy", policy);
            let mut steps = Vec::new();
            let result = self.run_locked(run_id, target, policy, actor, &mut steps, audit);
            audit.note("steps", &steps);
            if let Ok(report) = &result {
                audit.note("status", report.status);
            }
            result
        })
    }

    fn run_locked(
        &self,
        run_id: RunId,
        target: &RunTarget,
        policy: &RunPolicy,
        actor: &Actor,
        steps: &mut Vec<StepReport>,
        audit: &mut AuditScope,
    ) -> Result<RunReport, EngineError> {
        let started_at = now_utc();
        let _lock = self.acquire_run_lock(run_id, actor)?;
        let recovered = self.recover_interrupted(run_id, actor)?;
        let catalog = self.load_catalog()?;

        let requested = resolve_target(self, &catalog, target)?;
        let requested_set: BTreeSet<UnitRef> = requested.iter().copied().collect();
        let roots = requested.iter().copied().map(NodeRef::from);
        let candidates: BTreeSet<NodeRef> = if policy.force {
            roots.collect()
        } else {
            catalog.graph.requires_closure(roots)
        };

        for node in &candidates {
            let unit_ref = node
                .as_unit()
                .ok_or_else(|| EngineError::Validation(format!("{node} is not a unit")))?;
            let unit = catalog.unit(unit_ref)?;
            if unit.is_retired() && unit.status() != UnitStatus::Completed {
                return Err(EngineError::Validation(format!(
                    "{unit_ref} is retired and was never completed"
                )));
            }
        }
        catalog.graph.validate_no_conflicts(&candidates)?;
        let ordered = catalog.graph.resolve_order(&candidates)?;

        // Completed prerequisites that nobody asked for are already satisfied.
        let order: Vec<UnitRef> = ordered
            .into_iter()
            .filter_map(NodeRef::as_unit)
            .filter(|unit| {
                requested_set.contains(unit)
                    || catalog
                        .unit(*unit)
                        .is_ok_and(|found| found.status() != UnitStatus::Completed)
            })
            .collect();
        audit.note("order", order.iter().map(ToString::to_string).collect::<Vec<_>>());
        tracing::info!(
            units = order.len(),
            dry_run = policy.dry_run,
            force = policy.force,
            "run started"
        );

        let timeout_seconds = policy.timeout_seconds.or(self.config.default_timeout_seconds);
        let context = StepContext {
            run_id,
            actor,
            dry_run: policy.dry_run,
            timeout_seconds,
        };
        let mut report = RunReport {
            run_id,
            scope: self.config.schema_scope.clone(),
            dry_run: policy.dry_run,
            status: RunStatus::Succeeded,
            requested,
            order: order.clone(),
            steps: Vec::new(),
            not_attempted: Vec::new(),
            recovered,
            timeout_seconds,
            started_at,
            finished_at: started_at,
        };

        if policy.dry_run {
            self.rehearse(&catalog, &order, &requested_set, policy, &context, steps)?;
            if steps.iter().any(|step| step.outcome == ExecutionOutcome::Failed) {
                report.status = RunStatus::Failed;
            }
        } else {
            let pending = &mut report.not_attempted;
            report.status = self.execute(&order, &requested_set, policy, &context, steps, pending)?;
        }

        report.steps.clone_from(steps);
        report.finished_at = now_utc();
        tracing::info!(
            status = report.status.as_str(),
            steps = report.steps.len(),
            "run finished"
        );
        Ok(report)
    }

    fn rehearse(
        &self,
        catalog: &Catalog,
        order: &[UnitRef],
        requested: &BTreeSet<UnitRef>,
        policy: &RunPolicy,
        context: &StepContext<'_>,
        steps: &mut Vec<StepReport>,
    ) -> Result<(), EngineError> {
        let mut planned = BTreeSet::new();
        for unit_ref in order {
            let unit = catalog.unit(*unit_ref)?;
            let started_at = now_utc();
            if skip_completed(unit, requested, policy) {
                steps.push(self.record(context, StepRecord::skipped(unit, started_at))?);
                continue;
            }

            let checks = self.check_unit(catalog, unit, &ValidateOptions::default(), &planned);
            let failures: Vec<String> = checks
                .iter()
                .filter(|check| !check.passed)
                .flat_map(|check| check.messages.iter().cloned())
                .collect();
            let (outcome, error) = if failures.is_empty() {
                (ExecutionOutcome::Passed, None)
            } else {
                (ExecutionOutcome::Failed, Some(failures.join("; ")))
            };
            let step = StepRecord::new(unit, ExecutionKind::Apply, outcome, started_at)
                .error(error)
                .detail(json!({ "checks": checks }));
            steps.push(self.record(context, step)?);
            planned.insert(NodeRef::from(*unit_ref));
        }
        Ok(())
    }

    fn execute(
        &self,
        order: &[UnitRef],
        requested: &BTreeSet<UnitRef>,
        policy: &RunPolicy,
        context: &StepContext<'_>,
        steps: &mut Vec<StepReport>,
        not_attempted: &mut Vec<UnitRef>,
    ) -> Result<RunStatus, EngineError> {
        let mut completed_now: Vec<UnitRef> = Vec::new();

        for (position, unit_ref) in order.iter().enumerate() {
            let unit = self.load_unit(*unit_ref)?;
            let started_at = now_utc();
            if skip_completed(&unit, requested, policy) {
                tracing::debug!(unit = %unit_ref, "skipping completed unit");
                steps.push(self.record(context, StepRecord::skipped(&unit, started_at))?);
                continue;
            }

            ensure_transition(*unit_ref, unit.status(), UnitStatus::Running)?;
            self.store.set_unit_status(*unit_ref, UnitStatus::Running, started_at)?;
            tracing::info!(unit = %unit_ref, name = unit.name(), "applying unit");

            let signal = CancelSignal::new(context.timeout_seconds);
            let attempt = self.apply_forward(&unit, &signal, policy.batch_size);
            let (outcome, status) = match &attempt.result {
                Ok(()) => (ExecutionOutcome::Completed, UnitStatus::Completed),
                Err(err) => {
                    tracing::warn!(unit = %unit_ref, error = %err, "unit failed");
                    (failure_outcome(err), UnitStatus::Failed)
                }
            };
            let step = StepRecord::new(&unit, ExecutionKind::Apply, outcome, started_at)
                .error(attempt.result.as_ref().err().map(ToString::to_string))
                .rows(attempt.rows_committed)
                .status(status);
            steps.push(self.record(context, step)?);

            if attempt.result.is_ok() {
                completed_now.push(*unit_ref);
                continue;
            }
            not_attempted.extend(order.iter().skip(position + 1).copied());
            if !policy.rollback_on_failure || completed_now.is_empty() {
                return Ok(RunStatus::Failed);
            }
            self.revert_completed(&completed_now, policy.batch_size, context, steps)?;
            return Ok(RunStatus::RolledBack);
        }
        Ok(RunStatus::Succeeded)
    }

    /// Reverts `completed_now` in reverse completion order.
    fn revert_completed(
        &self,
        completed_now: &[UnitRef],
        batch_size: Option<u32>,
        context: &StepContext<'_>,
        steps: &mut Vec<StepReport>,
    ) -> Result<(), EngineError> {
        for unit_ref in completed_now.iter().rev() {
            let unit = self.load_unit(*unit_ref)?;
            self.revert_one(&unit, batch_size, context, steps)?;
        }
        Ok(())
    }

    fn revert_one(
        &self,
        unit: &Unit,
        batch_size: Option<u32>,
        context: &StepContext<'_>,
        steps: &mut Vec<StepReport>,
    ) -> Result<(), EngineError> {
        let unit_ref = unit.unit_ref();
        ensure_transition(unit_ref, unit.status(), UnitStatus::RolledBack)?;
        tracing::info!(unit = %unit_ref, "reverting unit");

        let started_at = now_utc();
        let signal = CancelSignal::new(context.timeout_seconds);
        let attempt = self.apply_reverse(unit, &signal, batch_size);
        let outcome = if attempt.result.is_ok() {
            ExecutionOutcome::RolledBack
        } else {
            ExecutionOutcome::RollbackFailed
        };
        let step = StepRecord::new(unit, ExecutionKind::Rollback, outcome, started_at)
            .error(attempt.result.as_ref().err().map(ToString::to_string))
            .rows(attempt.rows_committed);
        match attempt.result {
            Ok(()) => {
                steps.push(self.record(context, step.status(UnitStatus::RolledBack))?);
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    unit = %unit_ref,
                    error = %err,
                    "rollback failed; manual intervention required"
                );
                steps.push(self.record(context, step)?);
                Err(EngineError::RollbackFailure {
                    run_id: context.run_id.to_string(),
                    unit: unit_ref.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Rolls back one completed migration and every completed unit that depends on it.
    ///
    /// # Errors
    /// See [`MigrationService::rollback`].
    pub fn rollback_migration(
        &self,
        id: UnitId,
        policy: &RollbackPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        self.rollback(&RunTarget::Units(vec![UnitRef::migration(id)]), policy, actor)
    }

    /// # Errors
    /// See [`MigrationService::rollback`].
    pub fn rollback_migrations(
        &self,
        query: &UnitQuery,
        policy: &RollbackPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        self.rollback(&RunTarget::Migrations(query.clone()), policy, actor)
    }

    /// # Errors
    /// See [`MigrationService::rollback`].
    pub fn rollback_seed(
        &self,
        id: UnitId,
        policy: &RollbackPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        self.rollback(&RunTarget::Units(vec![UnitRef::seed(id)]), policy, actor)
    }

    /// Reverts completed target units, dependents first.
    ///
    /// # Errors
    /// Returns [`EngineError::NonReversibleUnit`] before any reverse script runs
    /// when a unit in the batch cannot be reverted, [`EngineError::Validation`]
    /// when an explicitly named unit is not completed, and
    /// [`EngineError::RollbackFailure`] when a reverse script fails.
    pub fn rollback(
        &self,
        target: &RunTarget,
        policy: &RollbackPolicy,
        actor: &Actor,
    ) -> Result<RunReport, EngineError> {
        let run_id = RunId::new();
        let scope = &self.config.schema_scope;
        let _span = tracing::info_span!("rollback", run_id = %run_id, scope = %scope).entered();

        let entry = AuditScope::on(AuditAction::Rollback, ResourceType::Batch, run_id);

        self.audited(actor, entry, |audit| {
            audit.note("target", target.describe());
            audit.note("policy", policy);
            let mut steps = Vec::new();
            let result = self.rollback_locked(run_id, target, policy, actor, &mut steps, audit);
            audit.note("steps", &steps);
            result
        })
    }

    fn rollback_locked(
        &self,
        run_id: RunId,
        target: &RunTarget,
        policy: &RollbackPolicy,
        actor: &Actor,
        steps: &mut Vec<StepReport>,
        audit: &mut AuditScope,
    ) -> Result<RunReport, EngineError> {
        let started_at = now_utc();
        let _lock = self.acquire_run_lock(run_id, actor)?;
        let recovered = self.recover_interrupted(run_id, actor)?;
        let catalog = self.load_catalog()?;

        let mut requested = resolve_target(self, &catalog, target)?;
        if target.is_explicit() {
            for unit_ref in &requested {
                let unit = catalog.unit(*unit_ref)?;
                if !unit.is_reversible() {
                    return Err(EngineError::NonReversibleUnit {
                        unit: unit_ref.to_string(),
                    });
                }
                let status = unit.status();
                if status != UnitStatus::Completed {
                    return Err(EngineError::Validation(format!(
                        "{unit_ref} is {}; only completed units can be rolled back",
                        status.as_str()
                    )));
                }
            }
        } else {
            requested.retain(|unit_ref| {
                catalog
                    .unit(*unit_ref)
                    .is_ok_and(|unit| unit.status() == UnitStatus::Completed)
            });
        }

        let batch: BTreeSet<NodeRef> = catalog
            .graph
            .dependents_closure(requested.iter().copied().map(NodeRef::from))
            .into_iter()
            .filter(|node| {
                node.as_unit()
                    .and_then(|unit_ref| catalog.unit(unit_ref).ok())
                    .is_some_and(|unit| unit.status() == UnitStatus::Completed)
            })
            .collect();

        for node in &batch {
            let Some(unit_ref) = node.as_unit() else {
                continue;
            };
            if !catalog.unit(unit_ref)?.is_reversible() {
                return Err(EngineError::NonReversibleUnit {
                    unit: unit_ref.to_string(),
                });
            }
        }

        let mut order: Vec<UnitRef> = catalog
            .graph
            .resolve_order(&batch)?
            .into_iter()
            .filter_map(NodeRef::as_unit)
            .collect();
        order.reverse();
        audit.note("order", order.iter().map(ToString::to_string).collect::<Vec<_>>());
        tracing::info!(units = order.len(), dry_run = policy.dry_run, "rollback started");

        let timeout_seconds = policy.timeout_seconds.or(self.config.default_timeout_seconds);
        let context = StepContext {
            run_id,
            actor,
            dry_run: policy.dry_run,
            timeout_seconds,
        };
        let mut status = RunStatus::Succeeded;
        for unit_ref in &order {
            let unit = catalog.unit(*unit_ref)?;
            if policy.dry_run {
                let check = self.check_reverse(unit);
                let outcome = if check.passed {
                    ExecutionOutcome::Passed
                } else {
                    status = RunStatus::Failed;
                    ExecutionOutcome::Failed
                };
                let error = (!check.passed).then(|| check.messages.join("; "));
                let step = StepRecord::new(unit, ExecutionKind::Rollback, outcome, now_utc())
                    .error(error)
                    .detail(json!({ "checks": [check] }));
                steps.push(self.record(&context, step)?);
            } else {
                self.revert_one(unit, policy.batch_size, &context, steps)?;
            }
        }

        let finished_at = now_utc();
        tracing::info!(status = status.as_str(), "rollback finished");
        Ok(RunReport {
            run_id,
            scope: self.config.schema_scope.clone(),
            dry_run: policy.dry_run,
            status,
            requested,
            order,
            steps: steps.clone(),
            not_attempted: Vec::new(),
            recovered,
            timeout_seconds,
            started_at,
            finished_at,
        })
    }

    pub(crate) fn apply_forward(
        &self,
        unit: &Unit,
        signal: &CancelSignal,
        batch_size: Option<u32>,
    ) -> Attempt {
        match unit {
            Unit::Migration(migration) => Attempt {
                result: self.executor.apply_script(&migration.forward_script, signal),
                rows_committed: None,
            },
            Unit::Seed(seed) => {
                let size = self.config.effective_batch_size(batch_size.or(seed.batch_size));
                let mut committed = 0_u64;
                for rows in seed.data.chunks(size) {
                    let chunk = SeedChunk {
                        target_table: &seed.target_table,
                        rows,
                        match_conditions: &seed.match_conditions,
                        update_existing: seed.update_existing,
                    };
                    let applied = signal
                        .check()
                        .and_then(|()| self.executor.apply_seed_rows(&chunk, signal));
                    if let Err(err) = applied {
                        return Attempt {
                            result: Err(err),
                            rows_committed: Some(committed),
                        };
                    }
                    committed += u64::try_from(rows.len()).unwrap_or(u64::MAX);
                }
                Attempt {
                    result: Ok(()),
                    rows_committed: Some(committed),
                }
            }
        }
    }

    pub(crate) fn apply_reverse(
        &self,
        unit: &Unit,
        signal: &CancelSignal,
        batch_size: Option<u32>,
    ) -> Attempt {
        let not_reversible = || Attempt {
            result: Err(ExecutorError::Unsupported(format!(
                "{} is not reversible",
                unit.unit_ref()
            ))),
            rows_committed: None,
        };
        match unit {
            Unit::Migration(migration) => match migration.revert_script() {
                Some(script) => Attempt {
                    result: self.executor.apply_script(script, signal),
                    rows_committed: None,
                },
                None => not_reversible(),
            },
            Unit::Seed(seed) if seed.is_reversible => {
                let size = self.config.effective_batch_size(batch_size.or(seed.batch_size));
                let mut removed = 0_u64;
                for rows in seed.data.chunks(size).rev() {
                    let chunk = SeedChunk {
                        target_table: &seed.target_table,
                        rows,
                        match_conditions: &seed.match_conditions,
                        update_existing: seed.update_existing,
                    };
                    match signal
                        .check()
                        .and_then(|()| self.executor.remove_seed_rows(&chunk, signal))
                    {
                        Ok(count) => removed += count,
                        Err(err) => {
                            return Attempt {
                                result: Err(err),
                                rows_committed: Some(removed),
                            }
                        }
                    }
                }
                Attempt {
                    result: Ok(()),
                    rows_committed: Some(removed),
                }
            }
            Unit::Seed(_) => not_reversible(),
        }
    }

    pub(crate) fn record(
        &self,
        context: &StepContext<'_>,
        step: StepRecord<'_>,
    ) -> Result<StepReport, EngineError> {
        let input = ExecutionRecordInput {
            run_id: context.run_id,
            unit: step.unit.unit_ref(),
            kind: step.kind,
            outcome: step.outcome,
            dry_run: context.dry_run,
            started_at: step.started_at,
            completed_at: now_utc(),
            error: step.error,
            rows_committed: step.rows_committed,
            executed_by: context.actor.name.clone(),
            detail: step.detail,
        };
        let record = self.store.record_execution(&input, step.status)?;
        Ok(StepReport {
            unit: record.unit,
            name: step.unit.name().to_string(),
            kind: record.kind,
            outcome: record.outcome,
            duration_ms: record.duration_ms,
            rows_committed: record.rows_committed,
            error: record.error,
            record_seq: record.seq,
        })
    }
}

fn skip_completed(unit: &Unit, requested: &BTreeSet<UnitRef>, policy: &RunPolicy) -> bool {
    unit.status() == UnitStatus::Completed
        && !(policy.force && requested.contains(&unit.unit_ref()))
}

fn failure_outcome(err: &ExecutorError) -> ExecutionOutcome {
    if err.is_timeout() {
        ExecutionOutcome::TimedOut
    } else {
        ExecutionOutcome::Failed
    }
}

fn resolve_target(
    service: &MigrationService<'_>,
    catalog: &Catalog,
    target: &RunTarget,
) -> Result<Vec<UnitRef>, EngineError> {
    let mut seen = BTreeSet::new();
    let mut units = Vec::new();
    match target {
        RunTarget::Units(requested) => {
            if requested.is_empty() {
                return Err(EngineError::Validation(
                    "run target MUST name at least one unit".to_string(),
                ));
            }
            for unit_ref in requested {
                let unit = catalog.unit(*unit_ref)?;
                if unit.is_retired() {
                    return Err(EngineError::Validation(format!("{unit_ref} is retired")));
                }
                if seen.insert(*unit_ref) {
                    units.push(*unit_ref);
                }
            }
        }
        RunTarget::Migrations(query) => {
            units.extend(
                service
                    .store
                    .list_migrations(query)?
                    .iter()
                    .map(schemaflow_core::Migration::unit_ref),
            );
        }
        RunTarget::Seeds(query) => {
            units.extend(
                service
                    .store
                    .list_seeds(query)?
                    .iter()
                    .map(schemaflow_core::Seed::unit_ref),
            );
        }
        RunTarget::Version(label) => {
            let version = service
                .store
                .find_version(label)?
                .ok_or_else(|| EngineError::NotFound(format!("version {label}")))?;
            if version.retired_at.is_some() {
                return Err(EngineError::Validation(format!("version {label} is retired")));
            }
            for unit_ref in version.members() {
                let unit = catalog.unit(unit_ref)?;
                if !unit.is_retired() && seen.insert(unit_ref) {
                    units.push(unit_ref);
                }
            }
        }
    }
    Ok(units)
}
