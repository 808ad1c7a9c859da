//! Collaborators injected into the engine.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::query::{AuditFilter, DependencyFilter, HistoryFilter, UnitQuery};
use crate::{
    AuditEntry, AuditEntryInput, Dependency, DependencyId, ExecutionRecord, ExecutionRecordInput,
    ExecutorError, Migration, NodeRef, RunId, Seed, SeedRow, Unit, UnitId, UnitKind, UnitRef,
    UnitStatus, Version, VersionId,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunLock {
    pub scope: String,
    pub run_id: RunId,
    pub holder: String,
    pub acquired_at: OffsetDateTime,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LockAttempt {
    Acquired,
    Held(RunLock),
}

/// Durable storage of definitions, edges, history, audit entries and run locks.
pub trait StateStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_migration(&self, migration: &Migration) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_migration(&self, migration: &Migration) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_migration(&self, id: UnitId) -> Result<Option<Migration>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_migrations(&self, query: &UnitQuery) -> Result<Vec<Migration>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_seed(&self, seed: &Seed) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_seed(&self, seed: &Seed) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_seed(&self, id: UnitId) -> Result<Option<Seed>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_seeds(&self, query: &UnitQuery) -> Result<Vec<Seed>>;

    /// Status change outside of an execution record (stale-run recovery, run start).
    #[allow(clippy::missing_errors_doc)]
    fn set_unit_status(&self, unit: UnitRef, status: UnitStatus, at: OffsetDateTime) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_version(&self, version: &Version) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_version(&self, version: &Version) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_version(&self, id: VersionId) -> Result<Option<Version>>;

    /// Version labelled `label`, preferring a live one over retired ones.
    #[allow(clippy::missing_errors_doc)]
    fn find_version(&self, label: &str) -> Result<Option<Version>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_versions(&self, include_retired: bool) -> Result<Vec<Version>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_dependency(&self, dependency: &Dependency) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_dependency(&self, id: DependencyId) -> Result<Option<Dependency>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_dependencies(&self, filter: &DependencyFilter) -> Result<Vec<Dependency>>;

    #[allow(clippy::missing_errors_doc)]
    fn delete_dependency(&self, id: DependencyId) -> Result<bool>;

    /// Hard-deletes `node` together with every edge touching it and, for a
    /// unit, its version memberships (stamping those versions with `at`).
    /// All of it commits or none of it does. Returns the number of edges
    /// removed, or `None` when the node does not exist.
    #[allow(clippy::missing_errors_doc)]
    fn purge_node(&self, node: NodeRef, at: OffsetDateTime) -> Result<Option<usize>>;

    /// Appends an execution record and, when `status` is set, moves the unit to
    /// that status in the same transaction.
    #[allow(clippy::missing_errors_doc)]
    fn record_execution(
        &self,
        input: &ExecutionRecordInput,
        status: Option<UnitStatus>,
    ) -> Result<ExecutionRecord>;

    #[allow(clippy::missing_errors_doc)]
    fn list_executions(&self, filter: &HistoryFilter) -> Result<Vec<ExecutionRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn count_executions(&self, unit: UnitRef) -> Result<usize>;

    #[allow(clippy::missing_errors_doc)]
    fn append_audit(&self, input: &AuditEntryInput) -> Result<AuditEntry>;

    #[allow(clippy::missing_errors_doc)]
    fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn try_acquire_run_lock(
        &self,
        scope: &str,
        run_id: RunId,
        holder: &str,
        at: OffsetDateTime,
    ) -> Result<LockAttempt>;

    /// Releases the lock only if `run_id` still holds it.
    #[allow(clippy::missing_errors_doc)]
    fn release_run_lock(&self, scope: &str, run_id: RunId) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn current_run_lock(&self, scope: &str) -> Result<Option<RunLock>>;

    #[allow(clippy::missing_errors_doc)]
    fn force_release_run_lock(&self, scope: &str) -> Result<Option<RunLock>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_unit(&self, unit: UnitRef) -> Result<Option<Unit>> {
        Ok(match unit.kind {
            UnitKind::Migration => self.get_migration(unit.id)?.map(Unit::Migration),
            UnitKind::Seed => self.get_seed(unit.id)?.map(Unit::Seed),
        })
    }
}

/// Cooperative deadline handed to executors for the unit being applied.
#[derive(Debug, Clone, Copy)]
pub struct CancelSignal {
    started: Instant,
    limit: Option<Duration>,
}

impl CancelSignal {
    #[must_use]
    pub fn new(timeout_seconds: Option<u64>) -> Self {
        Self {
            started: Instant::now(),
            limit: timeout_seconds.map(Duration::from_secs),
        }
    }

    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    #[must_use]
    pub fn with_limit(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.limit.map(|limit| self.started + limit)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }

    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|limit| limit.saturating_sub(self.started.elapsed()))
    }

    #[must_use]
    pub fn timeout_seconds(&self) -> u64 {
        self.limit.map_or(0, |limit| limit.as_secs())
    }

    /// # Errors
    /// Returns [`ExecutorError::TimedOut`] once the deadline has passed.
    pub fn check(&self) -> Result<(), ExecutorError> {
        if self.is_expired() {
            Err(self.timed_out())
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn timed_out(&self) -> ExecutorError {
        ExecutorError::TimedOut {
            timeout_seconds: self.timeout_seconds(),
        }
    }
}

/// One batch of seed rows for the executor.
#[derive(Debug, Clone, Copy)]
pub struct SeedChunk<'a> {
    pub target_table: &'a str,
    pub rows: &'a [SeedRow],
    pub match_conditions: &'a [String],
    pub update_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BackupHandle {
    pub id: String,
    pub location: String,
    pub created_at: OffsetDateTime,
}

/// Applies change scripts and seed rows to the target schema.
///
/// Implementations must check the [`CancelSignal`] between statements or rows
/// and leave a failed script or chunk without partial effects.
pub trait SchemaExecutor: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn apply_script(&self, script: &str, signal: &CancelSignal) -> Result<(), ExecutorError>;

    /// Upserts one chunk atomically and returns the number of rows written.
    #[allow(clippy::missing_errors_doc)]
    fn apply_seed_rows(&self, chunk: &SeedChunk<'_>, signal: &CancelSignal)
        -> Result<u64, ExecutorError>;

    /// Deletes rows identified by the chunk's match columns.
    #[allow(clippy::missing_errors_doc)]
    fn remove_seed_rows(&self, chunk: &SeedChunk<'_>, signal: &CancelSignal)
        -> Result<u64, ExecutorError>;

    #[allow(clippy::missing_errors_doc)]
    fn backup(&self) -> Result<BackupHandle, ExecutorError>;

    #[allow(clippy::missing_errors_doc)]
    fn restore(&self, backup: &BackupHandle) -> Result<(), ExecutorError>;

    #[allow(clippy::missing_errors_doc)]
    fn discard_backup(&self, _backup: &BackupHandle) -> Result<(), ExecutorError> {
        Ok(())
    }
}
