//! [`SchemaExecutor`] that applies scripts and seed rows to a target `SQLite` database.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context as _;
use rusqlite::backup::Progress;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, DatabaseName, Transaction};
use schemaflow_core::{
    now_utc, BackupHandle, CancelSignal, ExecutorError, SchemaExecutor, SeedChunk, SeedRow,
};
use serde_json::Value;
use ulid::Ulid;

/// Virtual machine instructions between deadline checks.
const PROGRESS_OPS: i32 = 1_000;

pub struct SqliteSchemaExecutor {
    conn: Mutex<Connection>,
    backup_dir: PathBuf,
}

impl SqliteSchemaExecutor {
    /// Open or create the target database. Backups go to a `schemaflow-backups`
    /// directory under the system temp dir unless [`Self::with_backup_dir`] is used.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open target database at {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure target pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
            backup_dir: std::env::temp_dir().join("schemaflow-backups"),
        })
    }

    /// # Errors
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory target database")?;
        Ok(Self {
            conn: Mutex::new(conn),
            backup_dir: std::env::temp_dir().join("schemaflow-backups"),
        })
    }

    #[must_use]
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ExecutorError> {
        self.conn
            .lock()
            .map_err(|_| ExecutorError::Io("target connection mutex poisoned".to_string()))
    }

    /// Runs `work` in one transaction with the signal's deadline armed as a
    /// progress handler; the transaction rolls back on any error.
    fn interruptible<T>(
        &self,
        signal: &CancelSignal,
        work: impl FnOnce(&Transaction<'_>) -> Result<T, ExecutorError>,
    ) -> Result<T, ExecutorError> {
        signal.check()?;
        let mut conn = self.conn()?;
        if signal.deadline().is_some() {
            let deadline = *signal;
            conn.progress_handler(PROGRESS_OPS, Some(move || deadline.is_expired()));
        }

        let result = in_transaction(&mut conn, signal, work);
        conn.progress_handler(0, None::<fn() -> bool>);
        result
    }
}

fn in_transaction<T>(
    conn: &mut Connection,
    signal: &CancelSignal,
    work: impl FnOnce(&Transaction<'_>) -> Result<T, ExecutorError>,
) -> Result<T, ExecutorError> {
    let tx = conn
        .transaction()
        .map_err(|err| failure(signal, &err))?;
    let value = work(&tx)?;
    tx.commit().map_err(|err| failure(signal, &err))?;
    Ok(value)
}

fn failure(signal: &CancelSignal, err: &rusqlite::Error) -> ExecutorError {
    if signal.is_expired() {
        signal.timed_out()
    } else {
        ExecutorError::Script(err.to_string())
    }
}

impl SchemaExecutor for SqliteSchemaExecutor {
    fn apply_script(&self, script: &str, signal: &CancelSignal) -> Result<(), ExecutorError> {
        self.interruptible(signal, |tx| {
            tx.execute_batch(script).map_err(|err| failure(signal, &err))
        })
    }

    fn apply_seed_rows(
        &self,
        chunk: &SeedChunk<'_>,
        signal: &CancelSignal,
    ) -> Result<u64, ExecutorError> {
        self.interruptible(signal, |tx| {
            let mut written = 0_u64;
            for row in chunk.rows {
                signal.check()?;
                written += upsert_row(tx, chunk, row).map_err(|err| failure(signal, &err))?;
            }
            Ok(written)
        })
    }

    fn remove_seed_rows(
        &self,
        chunk: &SeedChunk<'_>,
        signal: &CancelSignal,
    ) -> Result<u64, ExecutorError> {
        let table = quote_identifier(chunk.target_table);
        self.interruptible(signal, |tx| {
            let mut removed = 0_u64;
            for row in chunk.rows {
                signal.check()?;
                let columns = key_columns(chunk, row);
                let (predicate, keys) = match_predicate(&columns, row);
                let changed = tx
                    .execute(
                        &format!("DELETE FROM {table} WHERE {predicate}"),
                        params_from_iter(keys.iter()),
                    )
                    .map_err(|err| failure(signal, &err))?;
                removed += u64::try_from(changed).unwrap_or(u64::MAX);
            }
            Ok(removed)
        })
    }

    fn backup(&self) -> Result<BackupHandle, ExecutorError> {
        std::fs::create_dir_all(&self.backup_dir).map_err(|err| {
            ExecutorError::Io(format!(
                "failed to create backup directory {}: {err}",
                self.backup_dir.display()
            ))
        })?;
        let id = Ulid::new().to_string();
        let location = self.backup_dir.join(format!("{id}.sqlite"));

        self.conn()?
            .backup(DatabaseName::Main, &location, None)
            .map_err(|err| {
                ExecutorError::Io(format!("failed to back up to {}: {err}", location.display()))
            })?;
        tracing::debug!(backup = %id, location = %location.display(), "target database backed up");

        Ok(BackupHandle {
            id,
            location: location.display().to_string(),
            created_at: now_utc(),
        })
    }

    fn restore(&self, backup: &BackupHandle) -> Result<(), ExecutorError> {
        let location = Path::new(&backup.location);
        if !location.is_file() {
            return Err(ExecutorError::Io(format!(
                "backup {} is missing at {}",
                backup.id, backup.location
            )));
        }

        self.conn()?
            .restore(DatabaseName::Main, location, None::<fn(Progress)>)
            .map_err(|err| {
                ExecutorError::Io(format!("failed to restore backup {}: {err}", backup.id))
            })?;
        tracing::debug!(backup = %backup.id, "target database restored");
        Ok(())
    }

    fn discard_backup(&self, backup: &BackupHandle) -> Result<(), ExecutorError> {
        match std::fs::remove_file(&backup.location) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ExecutorError::Io(format!(
                "failed to discard backup {}: {err}",
                backup.id
            ))),
        }
    }
}

/// Inserts `row`, or updates the row sharing its match columns when
/// `update_existing` is set. Without match columns the whole row is the key.
/// Returns the number of rows written.
fn upsert_row(tx: &Transaction<'_>, chunk: &SeedChunk<'_>, row: &SeedRow) -> rusqlite::Result<u64> {
    let table = quote_identifier(chunk.target_table);
    let columns = key_columns(chunk, row);
    let (predicate, keys) = match_predicate(&columns, row);
    let exists: bool = tx.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {predicate})"),
        params_from_iter(keys.iter()),
        |found| found.get(0),
    )?;

    if exists {
        if !chunk.update_existing {
            return Ok(0);
        }
        let updates: Vec<(&String, &Value)> = row
            .iter()
            .filter(|(column, _)| !columns.contains(&column.as_str()))
            .collect();
        if !updates.is_empty() {
            let assignments: Vec<String> = updates
                .iter()
                .map(|(column, _)| format!("{} = ?", quote_identifier(column)))
                .collect();
            let mut values: Vec<SqlValue> =
                updates.iter().map(|(_, value)| sql_value(value)).collect();
            values.extend(keys);
            tx.execute(
                &format!(
                    "UPDATE {table} SET {} WHERE {predicate}",
                    assignments.join(", ")
                ),
                params_from_iter(values.iter()),
            )?;
        }
        return Ok(1);
    }

    let inserted: Vec<String> = row.keys().map(|column| quote_identifier(column)).collect();
    let placeholders = vec!["?"; inserted.len()].join(", ");
    let values: Vec<SqlValue> = row.values().map(sql_value).collect();
    tx.execute(
        &format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            inserted.join(", ")
        ),
        params_from_iter(values.iter()),
    )?;
    Ok(1)
}

/// Match columns of the chunk, or every column of `row` when none are named.
fn key_columns<'r>(chunk: &'r SeedChunk<'_>, row: &'r SeedRow) -> Vec<&'r str> {
    if chunk.match_conditions.is_empty() {
        row.keys().map(String::as_str).collect()
    } else {
        chunk.match_conditions.iter().map(String::as_str).collect()
    }
}

/// `"a" IS ? AND "b" IS ?` with the row's values for those columns; `IS`
/// keeps NULL match values comparable.
fn match_predicate(columns: &[&str], row: &SeedRow) -> (String, Vec<SqlValue>) {
    let predicate = columns
        .iter()
        .map(|column| format!("{} IS ?", quote_identifier(column)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let values = columns
        .iter()
        .map(|column| row.get(*column).map_or(SqlValue::Null, sql_value))
        .collect();
    (predicate, values)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        nested => SqlValue::Text(nested.to_string()),
    }
}
