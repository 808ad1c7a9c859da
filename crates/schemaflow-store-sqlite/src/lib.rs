#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use schemaflow_core::query::{AuditFilter, DependencyFilter, HistoryFilter, UnitQuery};
use schemaflow_core::{
    now_utc, AuditAction, AuditEntry, AuditEntryInput, Dependency, DependencyId, DependencyType,
    ExecutionKind, ExecutionOutcome, ExecutionRecord, ExecutionRecordInput, LockAttempt,
    Migration, MigrationType, NodeKind, NodeRef, ResourceType, RunId, RunLock, Seed, SeedRow,
    StateStore, UnitId, UnitKind, UnitRef, UnitStatus, Version, VersionId,
};
use time::OffsetDateTime;
use ulid::Ulid;

mod executor;

pub use executor::SqliteSchemaExecutor;

const STATE_SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS migrations (
  migration_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  version TEXT NOT NULL,
  migration_type TEXT NOT NULL CHECK (migration_type IN ('schema','data','index','constraint','view','function','trigger','other')),
  description TEXT,
  forward_script TEXT NOT NULL,
  reverse_script TEXT,
  is_reversible INTEGER NOT NULL CHECK (is_reversible IN (0,1)),
  batch_size INTEGER,
  checksum TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','running','completed','failed','rolled_back')),
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  retired_at TEXT
);

CREATE TABLE IF NOT EXISTS seeds (
  seed_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  version TEXT NOT NULL,
  description TEXT,
  target_table TEXT NOT NULL,
  data_json TEXT NOT NULL,
  match_conditions_json TEXT NOT NULL,
  update_existing INTEGER NOT NULL CHECK (update_existing IN (0,1)),
  is_reversible INTEGER NOT NULL CHECK (is_reversible IN (0,1)),
  batch_size INTEGER,
  checksum TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','running','completed','failed','rolled_back')),
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  retired_at TEXT
);

CREATE TABLE IF NOT EXISTS versions (
  version_id TEXT PRIMARY KEY,
  version TEXT NOT NULL,
  description TEXT,
  is_major INTEGER NOT NULL CHECK (is_major IN (0,1)),
  is_breaking INTEGER NOT NULL CHECK (is_breaking IN (0,1)),
  migrations_json TEXT NOT NULL,
  seeds_json TEXT NOT NULL,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  retired_at TEXT
);

CREATE TABLE IF NOT EXISTS dependencies (
  dependency_id TEXT PRIMARY KEY,
  source_kind TEXT NOT NULL CHECK (source_kind IN ('migration','seed','version')),
  source_id TEXT NOT NULL,
  target_kind TEXT NOT NULL CHECK (target_kind IN ('migration','seed','version')),
  target_id TEXT NOT NULL,
  dependency_type TEXT NOT NULL CHECK (dependency_type IN ('requires','conflicts_with')),
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(source_kind, source_id, target_kind, target_id, dependency_type)
);

CREATE TABLE IF NOT EXISTS execution_history (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  execution_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  unit_kind TEXT NOT NULL CHECK (unit_kind IN ('migration','seed')),
  unit_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('apply','rollback','test')),
  outcome TEXT NOT NULL,
  dry_run INTEGER NOT NULL CHECK (dry_run IN (0,1)),
  started_at TEXT NOT NULL,
  completed_at TEXT NOT NULL,
  duration_ms INTEGER NOT NULL,
  error TEXT,
  rows_committed INTEGER,
  executed_by TEXT NOT NULL,
  detail_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  actor TEXT NOT NULL,
  source TEXT,
  action TEXT NOT NULL,
  resource_type TEXT NOT NULL,
  resource_id TEXT,
  succeeded INTEGER NOT NULL CHECK (succeeded IN (0,1)),
  error TEXT,
  detail_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_locks (
  scope TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  holder TEXT NOT NULL,
  acquired_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_migrations_version ON migrations(version, created_at);
CREATE INDEX IF NOT EXISTS idx_seeds_version ON seeds(version, created_at);
CREATE INDEX IF NOT EXISTS idx_versions_label ON versions(version);
CREATE INDEX IF NOT EXISTS idx_dependencies_source ON dependencies(source_kind, source_id);
CREATE INDEX IF NOT EXISTS idx_dependencies_target ON dependencies(target_kind, target_id);
CREATE INDEX IF NOT EXISTS idx_execution_unit ON execution_history(unit_kind, unit_id, seq);
CREATE INDEX IF NOT EXISTS idx_execution_run ON execution_history(run_id, seq);
CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_log(resource_type, resource_id, seq);

CREATE TRIGGER IF NOT EXISTS trg_execution_history_no_update
BEFORE UPDATE ON execution_history
BEGIN
  SELECT RAISE(FAIL, 'execution_history is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_execution_history_no_delete
BEFORE DELETE ON execution_history
BEGIN
  SELECT RAISE(FAIL, 'execution_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;
";

const MIGRATION_COLUMNS: &str = "migration_id, name, version, migration_type, description,
    forward_script, reverse_script, is_reversible, batch_size, checksum, status,
    created_by, created_at, updated_at, retired_at";

const SEED_COLUMNS: &str = "seed_id, name, version, description, target_table, data_json,
    match_conditions_json, update_existing, is_reversible, batch_size, checksum, status,
    created_by, created_at, updated_at, retired_at";

const VERSION_COLUMNS: &str = "version_id, version, description, is_major, is_breaking,
    migrations_json, seeds_json, created_by, created_at, updated_at, retired_at";

const DEPENDENCY_COLUMNS: &str = "dependency_id, source_kind, source_id, target_kind, target_id,
    dependency_type, created_by, created_at";

const EXECUTION_COLUMNS: &str = "seq, execution_id, run_id, unit_kind, unit_id, kind, outcome,
    dry_run, started_at, completed_at, duration_ms, error, rows_committed, executed_by,
    detail_json";

const AUDIT_COLUMNS: &str = "seq, entry_id, actor, source, action, resource_type, resource_id,
    succeeded, error, detail_json, recorded_at";

/// Durable [`StateStore`] over a single `SQLite` database.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` state database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// # Errors
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite state store mutex poisoned"))
    }
}

impl StateStore for SqliteStateStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply state schema")?;

        ensure_column(&conn, "execution_history", "rows_committed", "INTEGER")?;

        let now = rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![STATE_SCHEMA_VERSION, now],
        )
        .context("failed to record state migration")?;

        Ok(())
    }

    fn insert_migration(&self, migration: &Migration) -> Result<()> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO migrations({MIGRATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    migration.id.to_string(),
                    migration.name,
                    migration.version,
                    migration.migration_type.as_str(),
                    migration.description,
                    migration.forward_script,
                    migration.reverse_script,
                    bool_to_sql(migration.is_reversible),
                    migration.batch_size.map(i64::from),
                    migration.checksum,
                    migration.status.as_str(),
                    migration.created_by,
                    rfc3339(migration.created_at)?,
                    rfc3339(migration.updated_at)?,
                    migration.retired_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to insert migration")?;
        Ok(())
    }

    fn update_migration(&self, migration: &Migration) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE migrations SET
                    name = ?2, version = ?3, migration_type = ?4, description = ?5,
                    forward_script = ?6, reverse_script = ?7, is_reversible = ?8,
                    batch_size = ?9, checksum = ?10, status = ?11, updated_at = ?12,
                    retired_at = ?13
                 WHERE migration_id = ?1",
                params![
                    migration.id.to_string(),
                    migration.name,
                    migration.version,
                    migration.migration_type.as_str(),
                    migration.description,
                    migration.forward_script,
                    migration.reverse_script,
                    bool_to_sql(migration.is_reversible),
                    migration.batch_size.map(i64::from),
                    migration.checksum,
                    migration.status.as_str(),
                    rfc3339(migration.updated_at)?,
                    migration.retired_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to update migration")?;
        if changed == 0 {
            return Err(anyhow!("migration {} does not exist", migration.id));
        }
        Ok(())
    }

    fn get_migration(&self, id: UnitId) -> Result<Option<Migration>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM migrations WHERE migration_id = ?1"
        ))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        let found = rows.next()?.map(migration_from_row).transpose()?;
        Ok(found)
    }

    fn list_migrations(&self, query: &UnitQuery) -> Result<Vec<Migration>> {
        if query.target_table.is_some() {
            return Ok(Vec::new());
        }
        let mut filter = unit_filter(query);
        if let Some(migration_type) = query.migration_type {
            filter.push_eq(
                "migration_type",
                SqlValue::Text(migration_type.as_str().to_string()),
            );
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM migrations{}",
            filter.where_sql()
        ))?;
        let mut rows = stmt.query(params_from_iter(filter.values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let migration = migration_from_row(row)?;
            if query.matches_migration(&migration) {
                out.push(migration);
            }
        }
        Ok(query.sort_and_page(out))
    }

    fn insert_seed(&self, seed: &Seed) -> Result<()> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO seeds({SEED_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    seed.id.to_string(),
                    seed.name,
                    seed.version,
                    seed.description,
                    seed.target_table,
                    serde_json::to_string(&seed.data)?,
                    serde_json::to_string(&seed.match_conditions)?,
                    bool_to_sql(seed.update_existing),
                    bool_to_sql(seed.is_reversible),
                    seed.batch_size.map(i64::from),
                    seed.checksum,
                    seed.status.as_str(),
                    seed.created_by,
                    rfc3339(seed.created_at)?,
                    rfc3339(seed.updated_at)?,
                    seed.retired_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to insert seed")?;
        Ok(())
    }

    fn update_seed(&self, seed: &Seed) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE seeds SET
                    name = ?2, version = ?3, description = ?4, target_table = ?5,
                    data_json = ?6, match_conditions_json = ?7, update_existing = ?8,
                    is_reversible = ?9, batch_size = ?10, checksum = ?11, status = ?12,
                    updated_at = ?13, retired_at = ?14
                 WHERE seed_id = ?1",
                params![
                    seed.id.to_string(),
                    seed.name,
                    seed.version,
                    seed.description,
                    seed.target_table,
                    serde_json::to_string(&seed.data)?,
                    serde_json::to_string(&seed.match_conditions)?,
                    bool_to_sql(seed.update_existing),
                    bool_to_sql(seed.is_reversible),
                    seed.batch_size.map(i64::from),
                    seed.checksum,
                    seed.status.as_str(),
                    rfc3339(seed.updated_at)?,
                    seed.retired_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to update seed")?;
        if changed == 0 {
            return Err(anyhow!("seed {} does not exist", seed.id));
        }
        Ok(())
    }

    fn get_seed(&self, id: UnitId) -> Result<Option<Seed>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEED_COLUMNS} FROM seeds WHERE seed_id = ?1"
        ))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        let found = rows.next()?.map(seed_from_row).transpose()?;
        Ok(found)
    }

    fn list_seeds(&self, query: &UnitQuery) -> Result<Vec<Seed>> {
        if query.migration_type.is_some() {
            return Ok(Vec::new());
        }
        let mut filter = unit_filter(query);
        if let Some(table) = &query.target_table {
            filter.push_eq("target_table", SqlValue::Text(table.clone()));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEED_COLUMNS} FROM seeds{}",
            filter.where_sql()
        ))?;
        let mut rows = stmt.query(params_from_iter(filter.values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let seed = seed_from_row(row)?;
            if query.matches_seed(&seed) {
                out.push(seed);
            }
        }
        Ok(query.sort_and_page(out))
    }

    fn set_unit_status(&self, unit: UnitRef, status: UnitStatus, at: OffsetDateTime) -> Result<()> {
        update_unit_status(&*self.conn()?, unit, status, at)
    }

    fn insert_version(&self, version: &Version) -> Result<()> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO versions({VERSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    version.id.to_string(),
                    version.version,
                    version.description,
                    bool_to_sql(version.is_major),
                    bool_to_sql(version.is_breaking),
                    serde_json::to_string(&version.migrations)?,
                    serde_json::to_string(&version.seeds)?,
                    version.created_by,
                    rfc3339(version.created_at)?,
                    rfc3339(version.updated_at)?,
                    version.retired_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to insert version")?;
        Ok(())
    }

    fn update_version(&self, version: &Version) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE versions SET
                    version = ?2, description = ?3, is_major = ?4, is_breaking = ?5,
                    migrations_json = ?6, seeds_json = ?7, updated_at = ?8, retired_at = ?9
                 WHERE version_id = ?1",
                params![
                    version.id.to_string(),
                    version.version,
                    version.description,
                    bool_to_sql(version.is_major),
                    bool_to_sql(version.is_breaking),
                    serde_json::to_string(&version.migrations)?,
                    serde_json::to_string(&version.seeds)?,
                    rfc3339(version.updated_at)?,
                    version.retired_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to update version")?;
        if changed == 0 {
            return Err(anyhow!("version {} does not exist", version.id));
        }
        Ok(())
    }

    fn get_version(&self, id: VersionId) -> Result<Option<Version>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE version_id = ?1"
        ))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        let found = rows.next()?.map(version_from_row).transpose()?;
        Ok(found)
    }

    fn find_version(&self, label: &str) -> Result<Option<Version>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions
             WHERE version = ?1
             ORDER BY retired_at IS NOT NULL, version_id ASC
             LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![label])?;
        let found = rows.next()?.map(version_from_row).transpose()?;
        Ok(found)
    }

    fn list_versions(&self, include_retired: bool) -> Result<Vec<Version>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions
             WHERE ?1 = 1 OR retired_at IS NULL
             ORDER BY version_id ASC"
        ))?;
        let mut rows = stmt.query(params![bool_to_sql(include_retired)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(version_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_dependency(&self, dependency: &Dependency) -> Result<()> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO dependencies({DEPENDENCY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    dependency.id.to_string(),
                    dependency.source.kind.as_str(),
                    dependency.source.id.to_string(),
                    dependency.target.kind.as_str(),
                    dependency.target.id.to_string(),
                    dependency.dependency_type.as_str(),
                    dependency.created_by,
                    rfc3339(dependency.created_at)?,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert dependency {} -> {}",
                    dependency.source, dependency.target
                )
            })?;
        Ok(())
    }

    fn get_dependency(&self, id: DependencyId) -> Result<Option<Dependency>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEPENDENCY_COLUMNS} FROM dependencies WHERE dependency_id = ?1"
        ))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        let found = rows.next()?.map(dependency_from_row).transpose()?;
        Ok(found)
    }

    fn list_dependencies(&self, filter: &DependencyFilter) -> Result<Vec<Dependency>> {
        let mut clauses = Clauses::default();
        if let Some(source) = filter.source {
            clauses.push_eq("source_kind", SqlValue::Text(source.kind.as_str().to_string()));
            clauses.push_eq("source_id", SqlValue::Text(source.id.to_string()));
        }
        if let Some(target) = filter.target {
            clauses.push_eq("target_kind", SqlValue::Text(target.kind.as_str().to_string()));
            clauses.push_eq("target_id", SqlValue::Text(target.id.to_string()));
        }
        if let Some(dependency_type) = filter.dependency_type {
            clauses.push_eq(
                "dependency_type",
                SqlValue::Text(dependency_type.as_str().to_string()),
            );
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEPENDENCY_COLUMNS} FROM dependencies{} ORDER BY dependency_id ASC",
            clauses.where_sql()
        ))?;
        let mut rows = stmt.query(params_from_iter(clauses.values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(dependency_from_row(row)?);
        }
        Ok(out)
    }

    fn delete_dependency(&self, id: DependencyId) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM dependencies WHERE dependency_id = ?1",
                params![id.to_string()],
            )
            .context("failed to delete dependency")?;
        Ok(changed > 0)
    }

    fn purge_node(&self, node: NodeRef, at: OffsetDateTime) -> Result<Option<usize>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start purge transaction")?;

        let (table, key) = node_table(node.kind);
        let removed = tx
            .execute(
                &format!("DELETE FROM {table} WHERE {key} = ?1"),
                params![node.id.to_string()],
            )
            .with_context(|| format!("failed to delete {node}"))?;
        if removed == 0 {
            return Ok(None);
        }

        if let Some(unit) = node.as_unit() {
            strip_memberships(&tx, unit, at)?;
        }
        let edges = tx
            .execute(
                "DELETE FROM dependencies
                 WHERE (source_kind = ?1 AND source_id = ?2)
                    OR (target_kind = ?1 AND target_id = ?2)",
                params![node.kind.as_str(), node.id.to_string()],
            )
            .with_context(|| format!("failed to delete dependencies touching {node}"))?;

        tx.commit().context("failed to commit purge transaction")?;
        Ok(Some(edges))
    }

    fn record_execution(
        &self,
        input: &ExecutionRecordInput,
        status: Option<UnitStatus>,
    ) -> Result<ExecutionRecord> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start execution record transaction")?;

        if let Some(status) = status {
            update_unit_status(&tx, input.unit, status, input.completed_at)?;
        }

        let execution_id = Ulid::new();
        let duration_ms = input.duration_ms();
        tx.execute(
            "INSERT INTO execution_history(
                execution_id, run_id, unit_kind, unit_id, kind, outcome, dry_run,
                started_at, completed_at, duration_ms, error, rows_committed,
                executed_by, detail_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                execution_id.to_string(),
                input.run_id.to_string(),
                input.unit.kind.as_str(),
                input.unit.id.to_string(),
                input.kind.as_str(),
                input.outcome.as_str(),
                bool_to_sql(input.dry_run),
                rfc3339(input.started_at)?,
                rfc3339(input.completed_at)?,
                i64::try_from(duration_ms)?,
                input.error,
                input.rows_committed.map(i64::try_from).transpose()?,
                input.executed_by,
                serde_json::to_string(&input.detail)?,
            ],
        )
        .context("failed to insert execution record")?;
        let seq = tx.last_insert_rowid();

        tx.commit()
            .context("failed to commit execution record transaction")?;
        Ok(input.clone().into_record(seq, execution_id))
    }

    fn list_executions(&self, filter: &HistoryFilter) -> Result<Vec<ExecutionRecord>> {
        let mut clauses = Clauses::default();
        if let Some(unit) = filter.unit {
            clauses.push_eq("unit_kind", SqlValue::Text(unit.kind.as_str().to_string()));
            clauses.push_eq("unit_id", SqlValue::Text(unit.id.to_string()));
        }
        if let Some(run_id) = filter.run_id {
            clauses.push_eq("run_id", SqlValue::Text(run_id.to_string()));
        }
        if let Some(kind) = filter.kind {
            clauses.push_eq("kind", SqlValue::Text(kind.as_str().to_string()));
        }
        if let Some(outcome) = filter.outcome {
            clauses.push_eq("outcome", SqlValue::Text(outcome.as_str().to_string()));
        }
        if let Some(dry_run) = filter.dry_run {
            clauses.push_eq("dry_run", SqlValue::Integer(bool_to_sql(dry_run)));
        }
        clauses.values.push(SqlValue::Integer(sql_limit(filter.limit)?));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution_history{} ORDER BY seq DESC LIMIT ?",
            clauses.where_sql()
        ))?;
        let mut rows = stmt.query(params_from_iter(clauses.values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(execution_from_row(row)?);
        }
        Ok(out)
    }

    fn count_executions(&self, unit: UnitRef) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM execution_history WHERE unit_kind = ?1 AND unit_id = ?2",
                params![unit.kind.as_str(), unit.id.to_string()],
                |row| row.get(0),
            )
            .context("failed to count execution records")?;
        Ok(usize::try_from(count)?)
    }

    fn append_audit(&self, input: &AuditEntryInput) -> Result<AuditEntry> {
        let conn = self.conn()?;
        let entry_id = Ulid::new();
        conn.execute(
            "INSERT INTO audit_log(
                entry_id, actor, source, action, resource_type, resource_id,
                succeeded, error, detail_json, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry_id.to_string(),
                input.actor,
                input.source,
                input.action.as_str(),
                input.resource_type.as_str(),
                input.resource_id,
                bool_to_sql(input.succeeded),
                input.error,
                serde_json::to_string(&input.detail)?,
                rfc3339(input.recorded_at)?,
            ],
        )
        .context("failed to append audit entry")?;
        Ok(input.clone().into_entry(conn.last_insert_rowid(), entry_id))
    }

    fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut clauses = Clauses::default();
        if let Some(actor) = &filter.actor {
            clauses.push_eq("actor", SqlValue::Text(actor.clone()));
        }
        if let Some(action) = filter.action {
            clauses.push_eq("action", SqlValue::Text(action.as_str().to_string()));
        }
        if let Some(resource_type) = filter.resource_type {
            clauses.push_eq(
                "resource_type",
                SqlValue::Text(resource_type.as_str().to_string()),
            );
        }
        if let Some(resource_id) = &filter.resource_id {
            clauses.push_eq("resource_id", SqlValue::Text(resource_id.clone()));
        }
        if let Some(succeeded) = filter.succeeded {
            clauses.push_eq("succeeded", SqlValue::Integer(bool_to_sql(succeeded)));
        }
        clauses.values.push(SqlValue::Integer(sql_limit(filter.limit)?));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log{} ORDER BY seq DESC LIMIT ?",
            clauses.where_sql()
        ))?;
        let mut rows = stmt.query(params_from_iter(clauses.values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(audit_from_row(row)?);
        }
        Ok(out)
    }

    fn try_acquire_run_lock(
        &self,
        scope: &str,
        run_id: RunId,
        holder: &str,
        at: OffsetDateTime,
    ) -> Result<LockAttempt> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start run lock transaction")?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO run_locks(scope, run_id, holder, acquired_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![scope, run_id.to_string(), holder, rfc3339(at)?],
            )
            .context("failed to insert run lock")?;
        let attempt = if inserted == 1 {
            LockAttempt::Acquired
        } else {
            let existing = select_run_lock(&tx, scope)?
                .ok_or_else(|| anyhow!("run lock for scope {scope} vanished mid-transaction"))?;
            LockAttempt::Held(existing)
        };

        tx.commit().context("failed to commit run lock transaction")?;
        Ok(attempt)
    }

    fn release_run_lock(&self, scope: &str, run_id: RunId) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM run_locks WHERE scope = ?1 AND run_id = ?2",
                params![scope, run_id.to_string()],
            )
            .context("failed to release run lock")?;
        Ok(changed > 0)
    }

    fn current_run_lock(&self, scope: &str) -> Result<Option<RunLock>> {
        select_run_lock(&*self.conn()?, scope)
    }

    fn force_release_run_lock(&self, scope: &str) -> Result<Option<RunLock>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start run lock transaction")?;
        let existing = select_run_lock(&tx, scope)?;
        tx.execute("DELETE FROM run_locks WHERE scope = ?1", params![scope])
            .context("failed to force-release run lock")?;
        tx.commit().context("failed to commit run lock transaction")?;
        Ok(existing)
    }
}

/// Equality clauses joined with AND, bound positionally.
#[derive(Default)]
struct Clauses {
    sql: Vec<String>,
    values: Vec<SqlValue>,
}

impl Clauses {
    /// `column` is always a literal from this module, never caller input.
    fn push_eq(&mut self, column: &'static str, value: SqlValue) {
        self.sql.push(format!("{column} = ?"));
        self.values.push(value);
    }

    fn raw(&mut self, clause: &'static str) {
        self.sql.push(clause.to_string());
    }

    fn where_sql(&self) -> String {
        if self.sql.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.sql.join(" AND "))
        }
    }
}

fn unit_filter(query: &UnitQuery) -> Clauses {
    let mut clauses = Clauses::default();
    if !query.include_retired {
        clauses.raw("retired_at IS NULL");
    }
    if let Some(version) = &query.version {
        clauses.push_eq("version", SqlValue::Text(version.clone()));
    }
    if let Some(status) = query.status {
        clauses.push_eq("status", SqlValue::Text(status.as_str().to_string()));
    }
    clauses
}

fn sql_limit(limit: Option<usize>) -> Result<i64> {
    match limit {
        Some(limit) => Ok(i64::try_from(limit)?),
        None => Ok(-1),
    }
}

fn unit_table(kind: UnitKind) -> (&'static str, &'static str) {
    match kind {
        UnitKind::Migration => ("migrations", "migration_id"),
        UnitKind::Seed => ("seeds", "seed_id"),
    }
}

fn node_table(kind: NodeKind) -> (&'static str, &'static str) {
    match kind.unit_kind() {
        Some(unit_kind) => unit_table(unit_kind),
        None => ("versions", "version_id"),
    }
}

fn strip_memberships(conn: &Connection, unit: UnitRef, at: OffsetDateTime) -> Result<()> {
    let mut stmt = conn.prepare(&format!("SELECT {VERSION_COLUMNS} FROM versions"))?;
    let mut rows = stmt.query([])?;
    let mut touched = Vec::new();
    while let Some(row) = rows.next()? {
        let mut version = version_from_row(row)?;
        if version.remove_member(unit) {
            touched.push(version);
        }
    }
    drop(rows);
    drop(stmt);

    for version in touched {
        conn.execute(
            "UPDATE versions SET migrations_json = ?2, seeds_json = ?3, updated_at = ?4
             WHERE version_id = ?1",
            params![
                version.id.to_string(),
                serde_json::to_string(&version.migrations)?,
                serde_json::to_string(&version.seeds)?,
                rfc3339(at)?,
            ],
        )
        .with_context(|| format!("failed to drop {unit} from version {}", version.version))?;
    }
    Ok(())
}

fn update_unit_status(
    conn: &Connection,
    unit: UnitRef,
    status: UnitStatus,
    at: OffsetDateTime,
) -> Result<()> {
    let (table, key) = unit_table(unit.kind);
    let changed = conn
        .execute(
            &format!("UPDATE {table} SET status = ?2, updated_at = ?3 WHERE {key} = ?1"),
            params![unit.id.to_string(), status.as_str(), rfc3339(at)?],
        )
        .with_context(|| format!("failed to update status of {unit}"))?;
    if changed == 0 {
        return Err(anyhow!("unknown unit {unit}"));
    }
    Ok(())
}

fn select_run_lock(conn: &Connection, scope: &str) -> Result<Option<RunLock>> {
    let raw = conn
        .query_row(
            "SELECT scope, run_id, holder, acquired_at FROM run_locks WHERE scope = ?1",
            params![scope],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .context("failed to read run lock")?;

    raw.map(|(scope, run_id, holder, acquired_at)| {
        Ok(RunLock {
            scope,
            run_id: RunId(parse_ulid("run_id", &run_id)?),
            holder,
            acquired_at: parse_rfc3339(&acquired_at)?,
        })
    })
    .transpose()
}

fn migration_from_row(row: &Row<'_>) -> Result<Migration> {
    Ok(Migration {
        id: UnitId(parse_ulid("migration_id", &row.get::<_, String>(0)?)?),
        name: row.get(1)?,
        version: row.get(2)?,
        migration_type: parse_migration_type(&row.get::<_, String>(3)?)?,
        description: row.get(4)?,
        forward_script: row.get(5)?,
        reverse_script: row.get(6)?,
        is_reversible: sql_to_bool(row.get::<_, i64>(7)?),
        batch_size: row
            .get::<_, Option<i64>>(8)?
            .map(u32::try_from)
            .transpose()?,
        checksum: row.get(9)?,
        status: parse_unit_status(&row.get::<_, String>(10)?)?,
        created_by: row.get(11)?,
        created_at: parse_rfc3339(&row.get::<_, String>(12)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(13)?)?,
        retired_at: row
            .get::<_, Option<String>>(14)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
    })
}

fn seed_from_row(row: &Row<'_>) -> Result<Seed> {
    let data_raw: String = row.get(5)?;
    let match_raw: String = row.get(6)?;
    let data: Vec<SeedRow> = serde_json::from_str(&data_raw).context("invalid data_json")?;
    Ok(Seed {
        id: UnitId(parse_ulid("seed_id", &row.get::<_, String>(0)?)?),
        name: row.get(1)?,
        version: row.get(2)?,
        description: row.get(3)?,
        target_table: row.get(4)?,
        data,
        match_conditions: serde_json::from_str(&match_raw)
            .context("invalid match_conditions_json")?,
        update_existing: sql_to_bool(row.get::<_, i64>(7)?),
        is_reversible: sql_to_bool(row.get::<_, i64>(8)?),
        batch_size: row
            .get::<_, Option<i64>>(9)?
            .map(u32::try_from)
            .transpose()?,
        checksum: row.get(10)?,
        status: parse_unit_status(&row.get::<_, String>(11)?)?,
        created_by: row.get(12)?,
        created_at: parse_rfc3339(&row.get::<_, String>(13)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(14)?)?,
        retired_at: row
            .get::<_, Option<String>>(15)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
    })
}

fn version_from_row(row: &Row<'_>) -> Result<Version> {
    let migrations_raw: String = row.get(5)?;
    let seeds_raw: String = row.get(6)?;
    Ok(Version {
        id: VersionId(parse_ulid("version_id", &row.get::<_, String>(0)?)?),
        version: row.get(1)?,
        description: row.get(2)?,
        is_major: sql_to_bool(row.get::<_, i64>(3)?),
        is_breaking: sql_to_bool(row.get::<_, i64>(4)?),
        migrations: serde_json::from_str(&migrations_raw).context("invalid migrations_json")?,
        seeds: serde_json::from_str(&seeds_raw).context("invalid seeds_json")?,
        created_by: row.get(7)?,
        created_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
        retired_at: row
            .get::<_, Option<String>>(10)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
    })
}

fn dependency_from_row(row: &Row<'_>) -> Result<Dependency> {
    Ok(Dependency {
        id: DependencyId(parse_ulid("dependency_id", &row.get::<_, String>(0)?)?),
        source: node_ref(&row.get::<_, String>(1)?, &row.get::<_, String>(2)?)?,
        target: node_ref(&row.get::<_, String>(3)?, &row.get::<_, String>(4)?)?,
        dependency_type: parse_dependency_type(&row.get::<_, String>(5)?)?,
        created_by: row.get(6)?,
        created_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> Result<ExecutionRecord> {
    let unit_kind: String = row.get(3)?;
    let detail_raw: String = row.get(14)?;
    Ok(ExecutionRecord {
        seq: row.get(0)?,
        execution_id: parse_ulid("execution_id", &row.get::<_, String>(1)?)?,
        run_id: RunId(parse_ulid("run_id", &row.get::<_, String>(2)?)?),
        unit: UnitRef {
            kind: UnitKind::parse(&unit_kind)
                .ok_or_else(|| anyhow!("unknown unit kind: {unit_kind}"))?,
            id: UnitId(parse_ulid("unit_id", &row.get::<_, String>(4)?)?),
        },
        kind: parse_execution_kind(&row.get::<_, String>(5)?)?,
        outcome: parse_execution_outcome(&row.get::<_, String>(6)?)?,
        dry_run: sql_to_bool(row.get::<_, i64>(7)?),
        started_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
        completed_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
        duration_ms: u64::try_from(row.get::<_, i64>(10)?)?,
        error: row.get(11)?,
        rows_committed: row
            .get::<_, Option<i64>>(12)?
            .map(u64::try_from)
            .transpose()?,
        executed_by: row.get(13)?,
        detail: serde_json::from_str(&detail_raw).context("invalid detail_json")?,
    })
}

fn audit_from_row(row: &Row<'_>) -> Result<AuditEntry> {
    let action: String = row.get(4)?;
    let resource_type: String = row.get(5)?;
    let detail_raw: String = row.get(9)?;
    Ok(AuditEntry {
        seq: row.get(0)?,
        entry_id: parse_ulid("entry_id", &row.get::<_, String>(1)?)?,
        actor: row.get(2)?,
        source: row.get(3)?,
        action: AuditAction::parse(&action)
            .ok_or_else(|| anyhow!("unknown audit action: {action}"))?,
        resource_type: ResourceType::parse(&resource_type)
            .ok_or_else(|| anyhow!("unknown resource type: {resource_type}"))?,
        resource_id: row.get(6)?,
        succeeded: sql_to_bool(row.get::<_, i64>(7)?),
        error: row.get(8)?,
        detail: serde_json::from_str(&detail_raw).context("invalid detail_json")?,
        recorded_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
    })
}

fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"),
        [],
    )
    .with_context(|| format!("failed to add missing column {table}.{column}"))?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table info for {table}"))?;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn node_ref(kind: &str, id: &str) -> Result<NodeRef> {
    Ok(NodeRef {
        kind: NodeKind::parse(kind).ok_or_else(|| anyhow!("unknown node kind: {kind}"))?,
        id: parse_ulid("node id", id)?,
    })
}

fn parse_migration_type(value: &str) -> Result<MigrationType> {
    MigrationType::parse(value).ok_or_else(|| anyhow!("unknown migration type: {value}"))
}

fn parse_unit_status(value: &str) -> Result<UnitStatus> {
    UnitStatus::parse(value).ok_or_else(|| anyhow!("unknown unit status: {value}"))
}

fn parse_dependency_type(value: &str) -> Result<DependencyType> {
    DependencyType::parse(value).ok_or_else(|| anyhow!("unknown dependency type: {value}"))
}

fn parse_execution_kind(value: &str) -> Result<ExecutionKind> {
    ExecutionKind::parse(value).ok_or_else(|| anyhow!("unknown execution kind: {value}"))
}

fn parse_execution_outcome(value: &str) -> Result<ExecutionOutcome> {
    ExecutionOutcome::parse(value).ok_or_else(|| anyhow!("unknown execution outcome: {value}"))
}

fn parse_ulid(field: &str, value: &str) -> Result<Ulid> {
    Ulid::from_str(value).map_err(|err| anyhow!("invalid {field} ULID: {err}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[cfg(test)]
mod tests {
    use super::SqliteStateStore;
    use schemaflow_core::query::{AuditFilter, DependencyFilter, HistoryFilter, UnitQuery};
    use schemaflow_core::{
        now_utc, AuditAction, AuditEntryInput, Dependency, DependencyId, DependencyType,
        ExecutionKind, ExecutionOutcome, ExecutionRecordInput, LockAttempt, Migration,
        MigrationType, NodeRef, ResourceType, RunId, Seed, StateStore, UnitId, UnitRef,
        UnitStatus, Version, VersionId,
    };
    use rusqlite::params;
    use serde_json::json;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "schemaflow-state-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn open_store(name: &str) -> SqliteStateStore {
        let store = SqliteStateStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn fixture_migration(name: &str, version: &str) -> Migration {
        let now = now_utc();
        let mut migration = Migration {
            id: UnitId::new(),
            name: name.to_string(),
            version: version.to_string(),
            migration_type: MigrationType::Schema,
            description: Some("adds a table".to_string()),
            forward_script: format!("CREATE TABLE {name} (id INTEGER PRIMARY KEY);"),
            reverse_script: Some(format!("DROP TABLE {name};")),
            is_reversible: true,
            batch_size: None,
            checksum: String::new(),
            status: UnitStatus::Pending,
            created_by: "tester".to_string(),
            created_at: now,
            updated_at: now,
            retired_at: None,
        };
        migration.checksum = migration.compute_checksum();
        migration
    }

    fn fixture_seed(name: &str) -> Seed {
        let now = now_utc();
        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), json!(1));
        row.insert("label".to_string(), json!("admin"));
        let mut seed = Seed {
            id: UnitId::new(),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: None,
            target_table: "roles".to_string(),
            data: vec![row],
            match_conditions: vec!["id".to_string()],
            update_existing: true,
            is_reversible: true,
            batch_size: Some(10),
            checksum: String::new(),
            status: UnitStatus::Pending,
            created_by: "tester".to_string(),
            created_at: now,
            updated_at: now,
            retired_at: None,
        };
        seed.checksum = seed.compute_checksum();
        seed
    }

    fn record_input(unit: UnitRef, outcome: ExecutionOutcome) -> ExecutionRecordInput {
        let now = now_utc();
        ExecutionRecordInput {
            run_id: RunId::new(),
            unit,
            kind: ExecutionKind::Apply,
            outcome,
            dry_run: false,
            started_at: now,
            completed_at: now,
            error: None,
            rows_committed: Some(3),
            executed_by: "tester".to_string(),
            detail: json!({"attempt": 1}),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = open_store("migrate");
        assert!(store.migrate().is_ok());

        let conn = store.conn();
        assert!(conn.is_ok());
        let conn = conn.unwrap_or_else(|_| unreachable!());
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or(-1);
        assert_eq!(versions, 1);
    }

    #[test]
    fn migration_and_seed_round_trip() {
        let store = open_store("round-trip");
        let migration = fixture_migration("accounts", "1.2.0");
        let seed = fixture_seed("default_roles");
        assert!(store.insert_migration(&migration).is_ok());
        assert!(store.insert_seed(&seed).is_ok());
        assert!(store.insert_migration(&migration).is_err());

        let loaded = store.get_migration(migration.id);
        assert!(matches!(loaded, Ok(Some(ref found)) if found == &migration));
        let loaded = store.get_seed(seed.id);
        assert!(matches!(loaded, Ok(Some(ref found)) if found == &seed));

        let mut changed = migration.clone();
        changed.description = None;
        changed.retired_at = Some(now_utc());
        assert!(store.update_migration(&changed).is_ok());
        let live = store.list_migrations(&UnitQuery::all());
        assert!(matches!(live, Ok(ref rows) if rows.is_empty()));
        let everything = store.list_migrations(&UnitQuery::everything());
        assert!(matches!(everything, Ok(ref rows) if rows.len() == 1));

        let node = NodeRef::from(seed.unit_ref());
        assert!(matches!(store.purge_node(node, now_utc()), Ok(Some(0))));
        assert!(matches!(store.purge_node(node, now_utc()), Ok(None)));
        assert!(matches!(store.get_seed(seed.id), Ok(None)));
    }

    #[test]
    fn unit_queries_filter_sort_and_page() {
        let store = open_store("query");
        for (name, version) in [("c", "1.10.0"), ("a", "1.2.0"), ("b", "1.9.0")] {
            assert!(store.insert_migration(&fixture_migration(name, version)).is_ok());
        }

        let ordered = store.list_migrations(&UnitQuery::all());
        assert!(ordered.is_ok());
        let names: Vec<String> = ordered
            .unwrap_or_default()
            .into_iter()
            .map(|migration| migration.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let query = UnitQuery {
            version: Some("1.9.0".to_string()),
            ..UnitQuery::default()
        };
        let filtered = store.list_migrations(&query);
        assert!(matches!(filtered, Ok(ref rows) if rows.len() == 1 && rows[0].name == "b"));

        let seeds_only = UnitQuery {
            target_table: Some("roles".to_string()),
            ..UnitQuery::default()
        };
        assert!(matches!(store.list_migrations(&seeds_only), Ok(ref rows) if rows.is_empty()));
    }

    #[test]
    fn record_execution_updates_status_atomically() {
        let store = open_store("record");
        let migration = fixture_migration("ledger", "1.0.0");
        assert!(store.insert_migration(&migration).is_ok());

        let first = store.record_execution(
            &record_input(migration.unit_ref(), ExecutionOutcome::Completed),
            Some(UnitStatus::Completed),
        );
        assert!(matches!(first, Ok(ref record) if record.seq == 1));
        let loaded = store.get_migration(migration.id);
        assert!(matches!(loaded, Ok(Some(ref found)) if found.status == UnitStatus::Completed));

        let unknown = UnitRef::migration(UnitId::new());
        let orphan = store.record_execution(
            &record_input(unknown, ExecutionOutcome::Failed),
            Some(UnitStatus::Failed),
        );
        assert!(orphan.is_err());
        assert!(matches!(store.count_executions(unknown), Ok(0)));

        let second = store.record_execution(
            &record_input(migration.unit_ref(), ExecutionOutcome::Skipped),
            None,
        );
        assert!(second.is_ok());
        let history = store.list_executions(&HistoryFilter {
            limit: Some(1),
            ..HistoryFilter::for_unit(migration.unit_ref())
        });
        let skipped = ExecutionOutcome::Skipped;
        assert!(matches!(history, Ok(ref rows) if rows.len() == 1 && rows[0].outcome == skipped));
        assert!(matches!(store.count_executions(migration.unit_ref()), Ok(2)));
    }

    #[test]
    fn execution_history_and_audit_are_append_only() {
        let store = open_store("append-only");
        let migration = fixture_migration("events", "1.0.0");
        assert!(store.insert_migration(&migration).is_ok());
        assert!(store
            .record_execution(
                &record_input(migration.unit_ref(), ExecutionOutcome::Completed),
                None
            )
            .is_ok());
        let entry = store.append_audit(&AuditEntryInput {
            actor: "tester".to_string(),
            source: None,
            action: AuditAction::Run,
            resource_type: ResourceType::Batch,
            resource_id: None,
            succeeded: true,
            error: None,
            detail: json!({}),
            recorded_at: now_utc(),
        });
        assert!(matches!(entry, Ok(ref entry) if entry.seq == 1));

        let conn = store.conn();
        assert!(conn.is_ok());
        let conn = conn.unwrap_or_else(|_| unreachable!());
        let mutated = conn.execute(
            "UPDATE execution_history SET outcome = 'failed' WHERE seq = 1",
            [],
        );
        assert!(mutated.is_err());
        let removed = conn.execute("DELETE FROM audit_log WHERE seq = 1", []);
        assert!(removed.is_err());
        drop(conn);

        let audit = store.list_audit(&AuditFilter {
            action: Some(AuditAction::Run),
            ..AuditFilter::default()
        });
        assert!(matches!(audit, Ok(ref rows) if rows.len() == 1));
    }

    #[test]
    fn dependency_edges_are_unique_and_filterable() {
        let store = open_store("dependencies");
        let source: NodeRef = UnitRef::migration(UnitId::new()).into();
        let target: NodeRef = UnitRef::seed(UnitId::new()).into();
        let edge = Dependency {
            id: DependencyId::new(),
            source,
            target,
            dependency_type: DependencyType::Requires,
            created_by: "tester".to_string(),
            created_at: now_utc(),
        };
        assert!(store.insert_dependency(&edge).is_ok());
        let duplicate = Dependency {
            id: DependencyId::new(),
            ..edge.clone()
        };
        assert!(store.insert_dependency(&duplicate).is_err());

        let filter = DependencyFilter {
            source: Some(source),
            target: Some(target),
            dependency_type: None,
        };
        let listed = store.list_dependencies(&filter);
        assert!(matches!(listed, Ok(ref rows) if rows == &vec![edge.clone()]));
        let wrong_type = DependencyFilter {
            dependency_type: Some(DependencyType::ConflictsWith),
            ..filter
        };
        assert!(matches!(store.list_dependencies(&wrong_type), Ok(ref rows) if rows.is_empty()));

        assert!(matches!(store.delete_dependency(edge.id), Ok(true)));
        assert!(matches!(store.get_dependency(edge.id), Ok(None)));
    }

    fn fixture_version(label: &str, migrations: Vec<UnitId>) -> Version {
        let now = now_utc();
        Version {
            id: VersionId::new(),
            version: label.to_string(),
            description: None,
            is_major: false,
            is_breaking: false,
            migrations,
            seeds: Vec::new(),
            created_by: "tester".to_string(),
            created_at: now,
            updated_at: now,
            retired_at: None,
        }
    }

    fn requires(source: NodeRef, target: NodeRef) -> Dependency {
        Dependency {
            id: DependencyId::new(),
            source,
            target,
            dependency_type: DependencyType::Requires,
            created_by: "tester".to_string(),
            created_at: now_utc(),
        }
    }

    #[test]
    fn purge_node_drops_edges_and_memberships_together() {
        let store = open_store("purge");
        let base = fixture_migration("base", "1.0.0");
        let child = fixture_migration("child", "1.1.0");
        assert!(store.insert_migration(&base).is_ok());
        assert!(store.insert_migration(&child).is_ok());
        let release = fixture_version("1.0.0", vec![base.id, child.id]);
        assert!(store.insert_version(&release).is_ok());
        let base_node = NodeRef::from(base.unit_ref());
        let edge = requires(NodeRef::from(child.unit_ref()), base_node);
        assert!(store.insert_dependency(&edge).is_ok());

        let at = now_utc();
        assert!(matches!(store.purge_node(base_node, at), Ok(Some(1))));

        assert!(matches!(store.get_migration(base.id), Ok(None)));
        assert!(matches!(store.get_dependency(edge.id), Ok(None)));
        let stored = store.get_version(release.id);
        assert!(matches!(
            stored,
            Ok(Some(ref found)) if found.migrations == vec![child.id] && found.updated_at == at
        ));
    }

    #[test]
    fn failed_purge_leaves_every_row_in_place() {
        let store = open_store("purge-rollback");
        let base = fixture_migration("base", "1.0.0");
        let child = fixture_migration("child", "1.1.0");
        assert!(store.insert_migration(&base).is_ok());
        assert!(store.insert_migration(&child).is_ok());
        let release = fixture_version("1.0.0", vec![base.id]);
        assert!(store.insert_version(&release).is_ok());
        let base_node = NodeRef::from(base.unit_ref());
        let edge = requires(NodeRef::from(child.unit_ref()), base_node);
        assert!(store.insert_dependency(&edge).is_ok());

        {
            let conn = store.conn().unwrap_or_else(|_| unreachable!());
            let corrupted = conn.execute(
                "UPDATE versions SET seeds_json = 'not json' WHERE version_id = ?1",
                params![release.id.to_string()],
            );
            assert!(matches!(corrupted, Ok(1)));
        }

        assert!(store.purge_node(base_node, now_utc()).is_err());
        assert!(matches!(store.get_migration(base.id), Ok(Some(_))));
        let edges = store.list_dependencies(&DependencyFilter::default());
        assert!(matches!(edges, Ok(ref rows) if rows == &vec![edge.clone()]));
    }

    #[test]
    fn find_version_prefers_live_label() {
        let store = open_store("versions");
        let now = now_utc();
        let retired = Version {
            id: VersionId::new(),
            version: "2.0.0".to_string(),
            description: None,
            is_major: true,
            is_breaking: false,
            migrations: vec![UnitId::new()],
            seeds: Vec::new(),
            created_by: "tester".to_string(),
            created_at: now,
            updated_at: now,
            retired_at: Some(now),
        };
        let live = Version {
            id: VersionId::new(),
            retired_at: None,
            ..retired.clone()
        };
        assert!(store.insert_version(&retired).is_ok());
        assert!(store.insert_version(&live).is_ok());

        assert!(matches!(store.find_version("2.0.0"), Ok(Some(ref found)) if found.id == live.id));
        assert!(matches!(store.list_versions(false), Ok(ref rows) if rows.len() == 1));
        assert!(matches!(store.list_versions(true), Ok(ref rows) if rows.len() == 2));
    }

    #[test]
    fn run_lock_is_exclusive_per_scope() {
        let store = open_store("locks");
        let first = RunId::new();
        let second = RunId::new();

        let acquired = store.try_acquire_run_lock("default", first, "alice", now_utc());
        assert!(matches!(acquired, Ok(LockAttempt::Acquired)));
        let contended = store.try_acquire_run_lock("default", second, "bob", now_utc());
        assert!(matches!(contended, Ok(LockAttempt::Held(ref lock)) if lock.run_id == first));
        let other_scope = store.try_acquire_run_lock("reporting", second, "bob", now_utc());
        assert!(matches!(other_scope, Ok(LockAttempt::Acquired)));

        assert!(matches!(store.release_run_lock("default", second), Ok(false)));
        assert!(matches!(store.release_run_lock("default", first), Ok(true)));
        assert!(matches!(store.current_run_lock("default"), Ok(None)));

        let forced = store.force_release_run_lock("reporting");
        assert!(matches!(forced, Ok(Some(ref lock)) if lock.holder == "bob"));
        assert!(matches!(store.force_release_run_lock("reporting"), Ok(None)));
    }
}
