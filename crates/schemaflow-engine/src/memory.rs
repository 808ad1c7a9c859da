//! In-process [`StateStore`] for tests and embedding.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use schemaflow_core::query::{AuditFilter, DependencyFilter, HistoryFilter, UnitQuery};
use schemaflow_core::{
    AuditEntry, AuditEntryInput, Dependency, DependencyId, ExecutionRecord, ExecutionRecordInput,
    LockAttempt, Migration, NodeRef, RunId, RunLock, Seed, StateStore, UnitId, UnitKind, UnitRef,
    UnitStatus, Version, VersionId,
};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Default)]
struct MemoryState {
    migrations: BTreeMap<UnitId, Migration>,
    seeds: BTreeMap<UnitId, Seed>,
    versions: BTreeMap<VersionId, Version>,
    dependencies: BTreeMap<DependencyId, Dependency>,
    executions: Vec<ExecutionRecord>,
    audit: Vec<AuditEntry>,
    locks: BTreeMap<String, RunLock>,
}

impl MemoryState {
    fn set_status(&mut self, unit: UnitRef, status: UnitStatus, at: OffsetDateTime) -> Result<()> {
        match unit.kind {
            UnitKind::Migration => {
                let migration = self
                    .migrations
                    .get_mut(&unit.id)
                    .ok_or_else(|| anyhow!("unknown unit {unit}"))?;
                migration.status = status;
                migration.updated_at = at;
            }
            UnitKind::Seed => {
                let seed = self
                    .seeds
                    .get_mut(&unit.id)
                    .ok_or_else(|| anyhow!("unknown unit {unit}"))?;
                seed.status = status;
                seed.updated_at = at;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory state store mutex poisoned"))
    }
}

fn newest_first<T: Clone>(rows: &[T], keep: impl Fn(&T) -> bool, limit: Option<usize>) -> Vec<T> {
    rows.iter()
        .rev()
        .filter(|row| keep(row))
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

impl StateStore for MemoryStateStore {
    fn migrate(&self) -> Result<()> {
        Ok(())
    }

    fn insert_migration(&self, migration: &Migration) -> Result<()> {
        let mut state = self.state()?;
        if state.migrations.contains_key(&migration.id) {
            return Err(anyhow!("migration {} already exists", migration.id));
        }
        state.migrations.insert(migration.id, migration.clone());
        Ok(())
    }

    fn update_migration(&self, migration: &Migration) -> Result<()> {
        let mut state = self.state()?;
        let slot = state
            .migrations
            .get_mut(&migration.id)
            .ok_or_else(|| anyhow!("migration {} does not exist", migration.id))?;
        *slot = migration.clone();
        Ok(())
    }

    fn get_migration(&self, id: UnitId) -> Result<Option<Migration>> {
        Ok(self.state()?.migrations.get(&id).cloned())
    }

    fn list_migrations(&self, query: &UnitQuery) -> Result<Vec<Migration>> {
        let rows = self
            .state()?
            .migrations
            .values()
            .filter(|migration| query.matches_migration(migration))
            .cloned()
            .collect();
        Ok(query.sort_and_page(rows))
    }

    fn insert_seed(&self, seed: &Seed) -> Result<()> {
        let mut state = self.state()?;
        if state.seeds.contains_key(&seed.id) {
            return Err(anyhow!("seed {} already exists", seed.id));
        }
        state.seeds.insert(seed.id, seed.clone());
        Ok(())
    }

    fn update_seed(&self, seed: &Seed) -> Result<()> {
        let mut state = self.state()?;
        let slot = state
            .seeds
            .get_mut(&seed.id)
            .ok_or_else(|| anyhow!("seed {} does not exist", seed.id))?;
        *slot = seed.clone();
        Ok(())
    }

    fn get_seed(&self, id: UnitId) -> Result<Option<Seed>> {
        Ok(self.state()?.seeds.get(&id).cloned())
    }

    fn list_seeds(&self, query: &UnitQuery) -> Result<Vec<Seed>> {
        let rows = self
            .state()?
            .seeds
            .values()
            .filter(|seed| query.matches_seed(seed))
            .cloned()
            .collect();
        Ok(query.sort_and_page(rows))
    }

    fn set_unit_status(&self, unit: UnitRef, status: UnitStatus, at: OffsetDateTime) -> Result<()> {
        self.state()?.set_status(unit, status, at)
    }

    fn insert_version(&self, version: &Version) -> Result<()> {
        let mut state = self.state()?;
        if state.versions.contains_key(&version.id) {
            return Err(anyhow!("version {} already exists", version.id));
        }
        state.versions.insert(version.id, version.clone());
        Ok(())
    }

    fn update_version(&self, version: &Version) -> Result<()> {
        let mut state = self.state()?;
        let slot = state
            .versions
            .get_mut(&version.id)
            .ok_or_else(|| anyhow!("version {} does not exist", version.id))?;
        *slot = version.clone();
        Ok(())
    }

    fn get_version(&self, id: VersionId) -> Result<Option<Version>> {
        Ok(self.state()?.versions.get(&id).cloned())
    }

    fn find_version(&self, label: &str) -> Result<Option<Version>> {
        let state = self.state()?;
        let mut matching = state
            .versions
            .values()
            .filter(|version| version.version == label);
        let live = matching.clone().find(|version| version.retired_at.is_none());
        Ok(live.or_else(|| matching.next()).cloned())
    }

    fn list_versions(&self, include_retired: bool) -> Result<Vec<Version>> {
        Ok(self
            .state()?
            .versions
            .values()
            .filter(|version| include_retired || version.retired_at.is_none())
            .cloned()
            .collect())
    }

    fn insert_dependency(&self, dependency: &Dependency) -> Result<()> {
        let mut state = self.state()?;
        let duplicate = state.dependencies.values().any(|existing| {
            existing.source == dependency.source
                && existing.target == dependency.target
                && existing.dependency_type == dependency.dependency_type
        });
        if duplicate {
            return Err(anyhow!(
                "dependency {} -> {} already exists",
                dependency.source,
                dependency.target
            ));
        }
        state.dependencies.insert(dependency.id, dependency.clone());
        Ok(())
    }

    fn get_dependency(&self, id: DependencyId) -> Result<Option<Dependency>> {
        Ok(self.state()?.dependencies.get(&id).cloned())
    }

    fn list_dependencies(&self, filter: &DependencyFilter) -> Result<Vec<Dependency>> {
        Ok(self
            .state()?
            .dependencies
            .values()
            .filter(|dependency| filter.matches(dependency))
            .cloned()
            .collect())
    }

    fn delete_dependency(&self, id: DependencyId) -> Result<bool> {
        Ok(self.state()?.dependencies.remove(&id).is_some())
    }

    fn purge_node(&self, node: NodeRef, at: OffsetDateTime) -> Result<Option<usize>> {
        let mut state = self.state()?;
        let removed = if let Some(unit) = node.as_unit() {
            let removed = match unit.kind {
                UnitKind::Migration => state.migrations.remove(&unit.id).is_some(),
                UnitKind::Seed => state.seeds.remove(&unit.id).is_some(),
            };
            if removed {
                for version in state.versions.values_mut() {
                    if version.remove_member(unit) {
                        version.updated_at = at;
                    }
                }
            }
            removed
        } else if let Some(id) = node.as_version() {
            state.versions.remove(&id).is_some()
        } else {
            false
        };
        if !removed {
            return Ok(None);
        }

        let touching = DependencyFilter::touching(node);
        let before = state.dependencies.len();
        state
            .dependencies
            .retain(|_, dependency| !touching.matches(dependency));
        Ok(Some(before - state.dependencies.len()))
    }

    fn record_execution(
        &self,
        input: &ExecutionRecordInput,
        status: Option<UnitStatus>,
    ) -> Result<ExecutionRecord> {
        let mut state = self.state()?;
        if let Some(status) = status {
            state.set_status(input.unit, status, input.completed_at)?;
        }
        let seq = i64::try_from(state.executions.len())? + 1;
        let record = input.clone().into_record(seq, Ulid::new());
        state.executions.push(record.clone());
        Ok(record)
    }

    fn list_executions(&self, filter: &HistoryFilter) -> Result<Vec<ExecutionRecord>> {
        let state = self.state()?;
        Ok(newest_first(
            &state.executions,
            |record| filter.matches(record),
            filter.limit,
        ))
    }

    fn count_executions(&self, unit: UnitRef) -> Result<usize> {
        Ok(self
            .state()?
            .executions
            .iter()
            .filter(|record| record.unit == unit)
            .count())
    }

    fn append_audit(&self, input: &AuditEntryInput) -> Result<AuditEntry> {
        let mut state = self.state()?;
        let seq = i64::try_from(state.audit.len())? + 1;
        let entry = input.clone().into_entry(seq, Ulid::new());
        state.audit.push(entry.clone());
        Ok(entry)
    }

    fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let state = self.state()?;
        Ok(newest_first(&state.audit, |entry| filter.matches(entry), filter.limit))
    }

    fn try_acquire_run_lock(
        &self,
        scope: &str,
        run_id: RunId,
        holder: &str,
        at: OffsetDateTime,
    ) -> Result<LockAttempt> {
        let mut state = self.state()?;
        if let Some(existing) = state.locks.get(scope) {
            return Ok(LockAttempt::Held(existing.clone()));
        }
        state.locks.insert(
            scope.to_string(),
            RunLock {
                scope: scope.to_string(),
                run_id,
                holder: holder.to_string(),
                acquired_at: at,
            },
        );
        Ok(LockAttempt::Acquired)
    }

    fn release_run_lock(&self, scope: &str, run_id: RunId) -> Result<bool> {
        let mut state = self.state()?;
        if state.locks.get(scope).is_some_and(|lock| lock.run_id == run_id) {
            state.locks.remove(scope);
            return Ok(true);
        }
        Ok(false)
    }

    fn current_run_lock(&self, scope: &str) -> Result<Option<RunLock>> {
        Ok(self.state()?.locks.get(scope).cloned())
    }

    fn force_release_run_lock(&self, scope: &str) -> Result<Option<RunLock>> {
        Ok(self.state()?.locks.remove(scope))
    }
}
