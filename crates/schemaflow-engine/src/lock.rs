use schemaflow_core::{
    now_utc, Actor, AuditAction, EngineError, ExecutionKind, ExecutionOutcome,
    ExecutionRecordInput, LockAttempt, ResourceType, RunId, RunLock, StateStore, UnitQuery,
    UnitRef, UnitStatus,
};
use serde_json::json;

use crate::audit::AuditScope;
use crate::MigrationService;

/// Holds the scope's run lock until dropped.
pub(crate) struct RunLockGuard<'s> {
    store: &'s dyn StateStore,
    scope: String,
    run_id: RunId,
}

impl Drop for RunLockGuard<'_> {
    fn drop(&mut self) {
        match self.store.release_run_lock(&self.scope, self.run_id) {
            Ok(true) => {
                tracing::debug!(scope = %self.scope, run_id = %self.run_id, "run lock released");
            }
            Ok(false) => tracing::warn!(
                scope = %self.scope,
                run_id = %self.run_id,
                "run lock was already released"
            ),
            Err(err) => tracing::error!(
                scope = %self.scope,
                run_id = %self.run_id,
                error = %format!("{err:#}"),
                "failed to release run lock"
            ),
        }
    }
}

impl<'a> MigrationService<'a> {
    pub(crate) fn acquire_run_lock(
        &self,
        run_id: RunId,
        actor: &Actor,
    ) -> Result<RunLockGuard<'a>, EngineError> {
        let scope = self.config.schema_scope.clone();
        match self
            .store
            .try_acquire_run_lock(&scope, run_id, &actor.name, now_utc())?
        {
            LockAttempt::Acquired => {
                tracing::debug!(scope = %scope, run_id = %run_id, "run lock acquired");
                Ok(RunLockGuard {
                    store: self.store,
                    scope,
                    run_id,
                })
            }
            LockAttempt::Held(lock) => {
                tracing::warn!(scope = %scope, holder = %lock.run_id, "run lock contended");
                Err(EngineError::RunInProgress {
                    scope,
                    holder: lock.run_id.to_string(),
                })
            }
        }
    }

    /// Units left `running` can only come from a run that died while holding
    /// the lock, so the caller must already hold it.
    pub(crate) fn recover_interrupted(
        &self,
        run_id: RunId,
        actor: &Actor,
    ) -> Result<Vec<UnitRef>, EngineError> {
        let running = UnitQuery {
            status: Some(UnitStatus::Running),
            include_retired: true,
            ..UnitQuery::default()
        };
        let stale: Vec<UnitRef> = self
            .store
            .list_migrations(&running)?
            .iter()
            .map(schemaflow_core::Migration::unit_ref)
            .chain(
                self.store
                    .list_seeds(&running)?
                    .iter()
                    .map(schemaflow_core::Seed::unit_ref),
            )
            .collect();

        for unit in &stale {
            let now = now_utc();
            tracing::warn!(unit = %unit, "marking unit left running by an earlier run as failed");
            self.store.record_execution(
                &ExecutionRecordInput {
                    run_id,
                    unit: *unit,
                    kind: ExecutionKind::Apply,
                    outcome: ExecutionOutcome::Interrupted,
                    dry_run: false,
                    started_at: now,
                    completed_at: now,
                    error: Some("interrupted: unit was left running by an earlier run".to_string()),
                    rows_committed: None,
                    executed_by: actor.name.clone(),
                    detail: json!({ "recovered_by_run": run_id.to_string() }),
                },
                Some(UnitStatus::Failed),
            )?;
        }
        Ok(stale)
    }

    /// # Errors
    /// Returns [`EngineError::Store`] when the lock table cannot be read.
    pub fn current_run_lock(&self) -> Result<Option<RunLock>, EngineError> {
        Ok(self.store.current_run_lock(&self.config.schema_scope)?)
    }

    /// Clears a run lock left behind by a crashed process.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] without `force`, since the lock may
    /// belong to a live run.
    pub fn release_run_lock(
        &self,
        force: bool,
        actor: &Actor,
    ) -> Result<Option<RunLock>, EngineError> {
        let scope = self.config.schema_scope.clone();
        let entry = AuditScope::on(AuditAction::ReleaseLock, ResourceType::Lock, &scope);
        self.audited(actor, entry, |audit| {
            if !force {
                return Err(EngineError::Validation(
                    "releasing a run lock held by another run requires force".to_string(),
                ));
            }
            let released = self.store.force_release_run_lock(&scope)?;
            if let Some(lock) = &released {
                tracing::warn!(scope = %scope, run_id = %lock.run_id, "run lock force-released");
                audit.note("released_run_id", lock.run_id.to_string());
                audit.note("holder", &lock.holder);
            }
            Ok(released)
        })
    }
}
