//! Scriptable in-process [`SchemaExecutor`] for tests and rehearsals.
//!
//! Scripts are recorded rather than executed. Markers registered with
//! [`ScriptedExecutor::fail_when_contains`] make a script fail, and markers
//! registered with [`ScriptedExecutor::hold_when_contains`] block it until
//! [`ScriptedExecutor::release`] is called or the unit's deadline passes.
//! Seed rows are kept per table with the same upsert rules as the SQLite executor.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use schemaflow_core::{
    now_utc, BackupHandle, CancelSignal, ExecutorError, SchemaExecutor, SeedChunk, SeedRow,
};
use ulid::Ulid;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    applied: Vec<String>,
    tables: BTreeMap<String, Vec<SeedRow>>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    current: Snapshot,
    fail_markers: Vec<String>,
    fail_tables: Vec<String>,
    hold_markers: Vec<String>,
    holding: bool,
    released: bool,
    backups: BTreeMap<String, Snapshot>,
    restores: usize,
}

#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    state: Mutex<ScriptedState>,
    wake: Condvar,
}

impl ScriptedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_when_contains(&self, marker: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_markers.push(marker.to_string());
        }
    }

    pub fn fail_table(&self, table: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_tables.push(table.to_string());
        }
    }

    pub fn hold_when_contains(&self, marker: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.hold_markers.push(marker.to_string());
        }
    }

    /// Lets every held script continue.
    pub fn release(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.released = true;
        }
        self.wake.notify_all();
    }

    #[must_use]
    pub fn is_holding(&self) -> bool {
        self.state.lock().map(|state| state.holding).unwrap_or(false)
    }

    /// Scripts applied so far, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.current.applied.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<SeedRow> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.current.tables.get(table).cloned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn restores(&self) -> usize {
        self.state.lock().map(|state| state.restores).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ScriptedState>, ExecutorError> {
        self.state
            .lock()
            .map_err(|_| ExecutorError::Io("scripted executor mutex poisoned".to_string()))
    }

    fn wait_for_release<'g>(
        &self,
        mut state: MutexGuard<'g, ScriptedState>,
        signal: &CancelSignal,
    ) -> Result<MutexGuard<'g, ScriptedState>, ExecutorError> {
        state.holding = true;
        while !state.released {
            if signal.is_expired() {
                state.holding = false;
                return Err(signal.timed_out());
            }
            let step = signal
                .remaining()
                .unwrap_or(Duration::from_millis(20))
                .min(Duration::from_millis(20));
            let (guard, _) = self
                .wake
                .wait_timeout(state, step)
                .map_err(|_| ExecutorError::Io("scripted executor mutex poisoned".to_string()))?;
            state = guard;
        }
        state.holding = false;
        Ok(state)
    }
}

fn row_matches(row: &SeedRow, candidate: &SeedRow, columns: &[String]) -> bool {
    if columns.is_empty() {
        return row
            .iter()
            .all(|(column, value)| candidate.get(column) == Some(value));
    }
    columns
        .iter()
        .all(|column| row.get(column) == candidate.get(column))
}

impl SchemaExecutor for ScriptedExecutor {
    fn apply_script(&self, script: &str, signal: &CancelSignal) -> Result<(), ExecutorError> {
        let mut state = self.lock()?;
        signal.check()?;
        if state
            .hold_markers
            .iter()
            .any(|marker| script.contains(marker.as_str()))
        {
            state = self.wait_for_release(state, signal)?;
        }
        if let Some(marker) = state
            .fail_markers
            .iter()
            .find(|marker| script.contains(marker.as_str()))
        {
            return Err(ExecutorError::Script(format!(
                "script rejected by marker `{marker}`"
            )));
        }
        state.current.applied.push(script.to_string());
        Ok(())
    }

    fn apply_seed_rows(
        &self,
        chunk: &SeedChunk<'_>,
        signal: &CancelSignal,
    ) -> Result<u64, ExecutorError> {
        let mut state = self.lock()?;
        signal.check()?;
        if state.fail_tables.iter().any(|table| table == chunk.target_table) {
            return Err(ExecutorError::Script(format!(
                "table `{}` rejected the chunk",
                chunk.target_table
            )));
        }

        let mut staged = state
            .current
            .tables
            .get(chunk.target_table)
            .cloned()
            .unwrap_or_default();
        let mut written = 0_u64;
        for row in chunk.rows {
            let existing = staged
                .iter()
                .position(|candidate| row_matches(row, candidate, chunk.match_conditions));
            match existing {
                Some(index) if chunk.update_existing => {
                    for (column, value) in row {
                        staged[index].insert(column.clone(), value.clone());
                    }
                    written += 1;
                }
                Some(_) => {}
                None => {
                    staged.push(row.clone());
                    written += 1;
                }
            }
        }
        state
            .current
            .tables
            .insert(chunk.target_table.to_string(), staged);
        Ok(written)
    }

    fn remove_seed_rows(
        &self,
        chunk: &SeedChunk<'_>,
        signal: &CancelSignal,
    ) -> Result<u64, ExecutorError> {
        let mut state = self.lock()?;
        signal.check()?;
        let Some(rows) = state.current.tables.get_mut(chunk.target_table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|candidate| {
            !chunk
                .rows
                .iter()
                .any(|row| row_matches(row, candidate, chunk.match_conditions))
        });
        Ok(u64::try_from(before - rows.len()).unwrap_or(u64::MAX))
    }

    fn backup(&self) -> Result<BackupHandle, ExecutorError> {
        let mut state = self.lock()?;
        let id = Ulid::new().to_string();
        let snapshot = state.current.clone();
        state.backups.insert(id.clone(), snapshot);
        Ok(BackupHandle {
            location: format!("memory://{id}"),
            id,
            created_at: now_utc(),
        })
    }

    fn restore(&self, backup: &BackupHandle) -> Result<(), ExecutorError> {
        let mut state = self.lock()?;
        let snapshot = state
            .backups
            .get(&backup.id)
            .cloned()
            .ok_or_else(|| ExecutorError::Io(format!("unknown backup {}", backup.id)))?;
        state.current = snapshot;
        state.restores += 1;
        Ok(())
    }

    fn discard_backup(&self, backup: &BackupHandle) -> Result<(), ExecutorError> {
        self.lock()?.backups.remove(&backup.id);
        Ok(())
    }
}
