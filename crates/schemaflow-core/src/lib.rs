use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod error;
pub mod graph;
pub mod lifecycle;
pub mod ports;
pub mod query;
pub mod script;
pub mod version;

pub use error::{EngineError, ExecutorError};
pub use graph::{DependencyGraph, GraphNode};
pub use ports::{
    BackupHandle, CancelSignal, LockAttempt, RunLock, SchemaExecutor, SeedChunk, StateStore,
};
pub use query::{
    AuditFilter, DependencyFilter, HistoryFilter, Page, SortDirection, SortField, SortSpec,
    UnitQuery,
};
pub use version::{aggregate_status, VersionKey};

pub type SeedRow = Map<String, Value>;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// # Errors
            /// Returns [`EngineError::Validation`] when `value` is not a ULID.
            pub fn parse(value: &str) -> Result<Self, EngineError> {
                Ulid::from_string(value.trim()).map(Self).map_err(|err| {
                    EngineError::Validation(format!("invalid {} `{value}`: {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(
    /// Identifier shared by migrations and seeds.
    UnitId,
    "unit id"
);
ulid_id!(VersionId, "version id");
ulid_id!(DependencyId, "dependency id");
ulid_id!(
    /// Identifies one engine invocation (run, rollback or test) across its records.
    RunId,
    "run id"
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Migration,
    Seed,
}

impl UnitKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Seed => "seed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "migration" => Some(Self::Migration),
            "seed" => Some(Self::Seed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Migration,
    Seed,
    Version,
}

impl NodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Seed => "seed",
            Self::Version => "version",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "migration" => Some(Self::Migration),
            "seed" => Some(Self::Seed),
            "version" => Some(Self::Version),
            _ => None,
        }
    }

    #[must_use]
    pub fn unit_kind(self) -> Option<UnitKind> {
        match self {
            Self::Migration => Some(UnitKind::Migration),
            Self::Seed => Some(UnitKind::Seed),
            Self::Version => None,
        }
    }
}

impl From<UnitKind> for NodeKind {
    fn from(kind: UnitKind) -> Self {
        match kind {
            UnitKind::Migration => Self::Migration,
            UnitKind::Seed => Self::Seed,
        }
    }
}

/// Reference to an executable unit, rendered as `kind:ulid`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UnitRef {
    pub kind: UnitKind,
    pub id: UnitId,
}

impl UnitRef {
    #[must_use]
    pub fn migration(id: UnitId) -> Self {
        Self {
            kind: UnitKind::Migration,
            id,
        }
    }

    #[must_use]
    pub fn seed(id: UnitId) -> Self {
        Self {
            kind: UnitKind::Seed,
            id,
        }
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] unless `value` is `migration:<ulid>` or `seed:<ulid>`.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let node = NodeRef::parse(value)?;
        node.as_unit().ok_or_else(|| {
            EngineError::Validation(format!("`{value}` does not reference a migration or seed"))
        })
    }
}

impl Display for UnitRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Endpoint of a dependency edge: a unit or a version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub id: Ulid,
}

impl NodeRef {
    #[must_use]
    pub fn version(id: VersionId) -> Self {
        Self {
            kind: NodeKind::Version,
            id: id.0,
        }
    }

    #[must_use]
    pub fn as_unit(self) -> Option<UnitRef> {
        self.kind.unit_kind().map(|kind| UnitRef {
            kind,
            id: UnitId(self.id),
        })
    }

    #[must_use]
    pub fn as_version(self) -> Option<VersionId> {
        match self.kind {
            NodeKind::Version => Some(VersionId(self.id)),
            _ => None,
        }
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] unless `value` is `<kind>:<ulid>`.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let (kind, id) = value.split_once(':').ok_or_else(|| {
            EngineError::Validation(format!("`{value}` MUST be formatted as <kind>:<id>"))
        })?;
        let kind = NodeKind::parse(kind.trim()).ok_or_else(|| {
            EngineError::Validation(format!("unknown reference kind `{kind}` in `{value}`"))
        })?;
        let id = Ulid::from_string(id.trim())
            .map_err(|err| EngineError::Validation(format!("invalid id in `{value}`: {err}")))?;
        Ok(Self { kind, id })
    }
}

impl From<UnitRef> for NodeRef {
    fn from(unit: UnitRef) -> Self {
        Self {
            kind: unit.kind.into(),
            id: unit.id.0,
        }
    }
}

impl Display for NodeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    Schema,
    Data,
    Index,
    Constraint,
    View,
    Function,
    Trigger,
    Other,
}

impl MigrationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Data => "data",
            Self::Index => "index",
            Self::Constraint => "constraint",
            Self::View => "view",
            Self::Function => "function",
            Self::Trigger => "trigger",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schema" => Some(Self::Schema),
            "data" => Some(Self::Data),
            "index" => Some(Self::Index),
            "constraint" => Some(Self::Constraint),
            "view" => Some(Self::View),
            "function" => Some(Self::Function),
            "trigger" => Some(Self::Trigger),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl UnitStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Requires,
    ConflictsWith,
}

impl DependencyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requires => "requires",
            Self::ConflictsWith => "conflicts_with",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "requires" => Some(Self::Requires),
            "conflicts_with" | "conflicts-with" => Some(Self::ConflictsWith),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Apply,
    Rollback,
    Test,
}

impl ExecutionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Rollback => "rollback",
            Self::Test => "test",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "apply" => Some(Self::Apply),
            "rollback" => Some(Self::Rollback),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    TimedOut,
    Skipped,
    Passed,
    RolledBack,
    RollbackFailed,
    Interrupted,
}

impl ExecutionOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Skipped => "skipped",
            Self::Passed => "passed",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
            Self::Interrupted => "interrupted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "skipped" => Some(Self::Skipped),
            "passed" => Some(Self::Passed),
            "rolled_back" => Some(Self::RolledBack),
            "rollback_failed" => Some(Self::RollbackFailed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::TimedOut | Self::RollbackFailed | Self::Interrupted
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Pending,
    Partial,
    Completed,
    Failed,
}

impl VersionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Retire,
    Run,
    Rollback,
    Validate,
    Test,
    Import,
    AddDependency,
    RemoveDependency,
    ReleaseLock,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Retire => "retire",
            Self::Run => "run",
            Self::Rollback => "rollback",
            Self::Validate => "validate",
            Self::Test => "test",
            Self::Import => "import",
            Self::AddDependency => "add_dependency",
            Self::RemoveDependency => "remove_dependency",
            Self::ReleaseLock => "release_lock",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "retire" => Some(Self::Retire),
            "run" => Some(Self::Run),
            "rollback" => Some(Self::Rollback),
            "validate" => Some(Self::Validate),
            "test" => Some(Self::Test),
            "import" => Some(Self::Import),
            "add_dependency" => Some(Self::AddDependency),
            "remove_dependency" => Some(Self::RemoveDependency),
            "release_lock" => Some(Self::ReleaseLock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Migration,
    Seed,
    Version,
    Dependency,
    Batch,
    Lock,
}

impl ResourceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Seed => "seed",
            Self::Version => "version",
            Self::Dependency => "dependency",
            Self::Batch => "batch",
            Self::Lock => "lock",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "migration" => Some(Self::Migration),
            "seed" => Some(Self::Seed),
            "version" => Some(Self::Version),
            "dependency" => Some(Self::Dependency),
            "batch" => Some(Self::Batch),
            "lock" => Some(Self::Lock),
            _ => None,
        }
    }
}

impl From<UnitKind> for ResourceType {
    fn from(kind: UnitKind) -> Self {
        match kind {
            UnitKind::Migration => Self::Migration,
            UnitKind::Seed => Self::Seed,
        }
    }
}

/// Who asked for an operation, and from where.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub name: String,
    pub source: Option<String>,
}

impl Actor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the actor name is blank.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation(
                "actor name MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Migration {
    pub id: UnitId,
    pub name: String,
    pub version: String,
    pub migration_type: MigrationType,
    pub description: Option<String>,
    pub forward_script: String,
    pub reverse_script: Option<String>,
    pub is_reversible: bool,
    pub batch_size: Option<u32>,
    pub checksum: String,
    pub status: UnitStatus,
    pub created_by: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub retired_at: Option<OffsetDateTime>,
}

impl Migration {
    #[must_use]
    pub fn unit_ref(&self) -> UnitRef {
        UnitRef::migration(self.id)
    }

    #[must_use]
    pub fn compute_checksum(&self) -> String {
        script_checksum(&self.forward_script, self.reverse_script.as_deref())
    }

    /// Reverse script to run on rollback, or `None` when the migration cannot be reverted.
    #[must_use]
    pub fn revert_script(&self) -> Option<&str> {
        if self.is_reversible {
            self.reverse_script.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationInput {
    pub name: String,
    pub version: String,
    pub migration_type: MigrationType,
    #[serde(default)]
    pub description: Option<String>,
    pub forward_script: String,
    #[serde(default)]
    pub reverse_script: Option<String>,
    #[serde(default = "default_true")]
    pub is_reversible: bool,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<UnitRef>,
}

impl MigrationInput {
    /// Checksum the migration will carry once registered.
    #[must_use]
    pub fn checksum(&self) -> String {
        script_checksum(&self.forward_script, self.reverse_script.as_deref())
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when required fields are missing or
    /// a reversible migration lacks a reverse script.
    pub fn validate(&self) -> Result<(), EngineError> {
        require_text("migration name", &self.name)?;
        require_text("migration version", &self.version)?;
        require_text("forward_script", &self.forward_script)?;
        if self.is_reversible
            && self
                .reverse_script
                .as_deref()
                .map_or(true, |script| script.trim().is_empty())
        {
            return Err(EngineError::Validation(
                "reverse_script MUST be provided when is_reversible=true".to_string(),
            ));
        }
        validate_batch_size(self.batch_size)
    }
}

/// Partial update of a migration definition; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationPatch {
    pub name: Option<String>,
    pub version: Option<String>,
    pub migration_type: Option<MigrationType>,
    pub description: Option<String>,
    pub forward_script: Option<String>,
    pub reverse_script: Option<String>,
    pub is_reversible: Option<bool>,
    pub batch_size: Option<u32>,
}

impl MigrationPatch {
    #[must_use]
    pub fn touches_scripts(&self) -> bool {
        self.forward_script.is_some()
            || self.reverse_script.is_some()
            || self.is_reversible.is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the patch and re-validates the resulting definition.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when the patched definition is invalid.
    pub fn apply_to(&self, migration: &mut Migration) -> Result<(), EngineError> {
        if let Some(name) = &self.name {
            migration.name.clone_from(name);
        }
        if let Some(version) = &self.version {
            migration.version.clone_from(version);
        }
        if let Some(migration_type) = self.migration_type {
            migration.migration_type = migration_type;
        }
        if let Some(description) = &self.description {
            migration.description = Some(description.clone());
        }
        if let Some(script) = &self.forward_script {
            migration.forward_script.clone_from(script);
        }
        if let Some(script) = &self.reverse_script {
            migration.reverse_script = Some(script.clone());
        }
        if let Some(is_reversible) = self.is_reversible {
            migration.is_reversible = is_reversible;
        }
        if let Some(batch_size) = self.batch_size {
            migration.batch_size = Some(batch_size);
        }

        MigrationInput::from(&*migration).validate()?;
        migration.checksum = migration.compute_checksum();
        Ok(())
    }
}

impl From<&Migration> for MigrationInput {
    fn from(migration: &Migration) -> Self {
        Self {
            name: migration.name.clone(),
            version: migration.version.clone(),
            migration_type: migration.migration_type,
            description: migration.description.clone(),
            forward_script: migration.forward_script.clone(),
            reverse_script: migration.reverse_script.clone(),
            is_reversible: migration.is_reversible,
            batch_size: migration.batch_size,
            depends_on: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Seed {
    pub id: UnitId,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub target_table: String,
    pub data: Vec<SeedRow>,
    pub match_conditions: Vec<String>,
    pub update_existing: bool,
    pub is_reversible: bool,
    pub batch_size: Option<u32>,
    pub checksum: String,
    pub status: UnitStatus,
    pub created_by: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub retired_at: Option<OffsetDateTime>,
}

impl Seed {
    #[must_use]
    pub fn unit_ref(&self) -> UnitRef {
        UnitRef::seed(self.id)
    }

    #[must_use]
    pub fn compute_checksum(&self) -> String {
        data_checksum(&self.target_table, &self.data, &self.match_conditions)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SeedInput {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target_table: String,
    pub data: Vec<SeedRow>,
    #[serde(default)]
    pub match_conditions: Vec<String>,
    #[serde(default)]
    pub update_existing: bool,
    #[serde(default = "default_true")]
    pub is_reversible: bool,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<UnitRef>,
}

impl SeedInput {
    #[must_use]
    pub fn checksum(&self) -> String {
        data_checksum(&self.target_table, &self.data, &self.match_conditions)
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the table or a column name is
    /// not a plain identifier, data is empty, or a row lacks a match column.
    pub fn validate(&self) -> Result<(), EngineError> {
        require_text("seed name", &self.name)?;
        require_text("seed version", &self.version)?;
        if !is_identifier(&self.target_table) {
            return Err(EngineError::Validation(format!(
                "target_table `{}` MUST be a plain identifier",
                self.target_table
            )));
        }
        if self.data.is_empty() {
            return Err(EngineError::Validation(
                "seed data MUST contain at least one row".to_string(),
            ));
        }
        for column in &self.match_conditions {
            if !is_identifier(column) {
                return Err(EngineError::Validation(format!(
                    "match column `{column}` MUST be a plain identifier"
                )));
            }
        }
        for (index, row) in self.data.iter().enumerate() {
            if row.is_empty() {
                return Err(EngineError::Validation(format!("seed row {index} is empty")));
            }
            if let Some(column) = row.keys().find(|column| !is_identifier(column)) {
                return Err(EngineError::Validation(format!(
                    "seed row {index} column `{column}` MUST be a plain identifier"
                )));
            }
            if let Some(column) = self
                .match_conditions
                .iter()
                .find(|column| !row.contains_key(column.as_str()))
            {
                return Err(EngineError::Validation(format!(
                    "seed row {index} is missing match column `{column}`"
                )));
            }
        }
        validate_batch_size(self.batch_size)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SeedPatch {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub target_table: Option<String>,
    pub data: Option<Vec<SeedRow>>,
    pub match_conditions: Option<Vec<String>>,
    pub update_existing: Option<bool>,
    pub is_reversible: Option<bool>,
    pub batch_size: Option<u32>,
}

impl SeedPatch {
    #[must_use]
    pub fn touches_data(&self) -> bool {
        self.target_table.is_some()
            || self.data.is_some()
            || self.match_conditions.is_some()
            || self.update_existing.is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the patched definition is invalid.
    pub fn apply_to(&self, seed: &mut Seed) -> Result<(), EngineError> {
        if let Some(name) = &self.name {
            seed.name.clone_from(name);
        }
        if let Some(version) = &self.version {
            seed.version.clone_from(version);
        }
        if let Some(description) = &self.description {
            seed.description = Some(description.clone());
        }
        if let Some(table) = &self.target_table {
            seed.target_table.clone_from(table);
        }
        if let Some(data) = &self.data {
            seed.data.clone_from(data);
        }
        if let Some(columns) = &self.match_conditions {
            seed.match_conditions.clone_from(columns);
        }
        if let Some(update_existing) = self.update_existing {
            seed.update_existing = update_existing;
        }
        if let Some(is_reversible) = self.is_reversible {
            seed.is_reversible = is_reversible;
        }
        if let Some(batch_size) = self.batch_size {
            seed.batch_size = Some(batch_size);
        }

        SeedInput::from(&*seed).validate()?;
        seed.checksum = seed.compute_checksum();
        Ok(())
    }
}

impl From<&Seed> for SeedInput {
    fn from(seed: &Seed) -> Self {
        Self {
            name: seed.name.clone(),
            version: seed.version.clone(),
            description: seed.description.clone(),
            target_table: seed.target_table.clone(),
            data: seed.data.clone(),
            match_conditions: seed.match_conditions.clone(),
            update_existing: seed.update_existing,
            is_reversible: seed.is_reversible,
            batch_size: seed.batch_size,
            depends_on: Vec::new(),
        }
    }
}

/// Either kind of executable unit.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Unit {
    Migration(Migration),
    Seed(Seed),
}

impl Unit {
    #[must_use]
    pub fn unit_ref(&self) -> UnitRef {
        match self {
            Self::Migration(migration) => migration.unit_ref(),
            Self::Seed(seed) => seed.unit_ref(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Migration(migration) => &migration.name,
            Self::Seed(seed) => &seed.name,
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        match self {
            Self::Migration(migration) => &migration.version,
            Self::Seed(seed) => &seed.version,
        }
    }

    #[must_use]
    pub fn status(&self) -> UnitStatus {
        match self {
            Self::Migration(migration) => migration.status,
            Self::Seed(seed) => seed.status,
        }
    }

    #[must_use]
    pub fn created_at(&self) -> OffsetDateTime {
        match self {
            Self::Migration(migration) => migration.created_at,
            Self::Seed(seed) => seed.created_at,
        }
    }

    #[must_use]
    pub fn is_reversible(&self) -> bool {
        match self {
            Self::Migration(migration) => migration.revert_script().is_some(),
            Self::Seed(seed) => seed.is_reversible,
        }
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        match self {
            Self::Migration(migration) => migration.retired_at.is_some(),
            Self::Seed(seed) => seed.retired_at.is_some(),
        }
    }

    #[must_use]
    pub fn graph_node(&self) -> GraphNode {
        GraphNode {
            node: self.unit_ref().into(),
            version: self.version().to_string(),
            created_at: self.created_at(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Dependency {
    pub id: DependencyId,
    pub source: NodeRef,
    pub target: NodeRef,
    pub dependency_type: DependencyType,
    pub created_by: String,
    pub created_at: OffsetDateTime,
}

/// `source` requires (runs after) `target`, or the two conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DependencyInput {
    pub source: NodeRef,
    pub target: NodeRef,
    pub dependency_type: DependencyType,
}

impl DependencyInput {
    #[must_use]
    pub fn requires(source: impl Into<NodeRef>, target: impl Into<NodeRef>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            dependency_type: DependencyType::Requires,
        }
    }

    #[must_use]
    pub fn conflicts(source: impl Into<NodeRef>, target: impl Into<NodeRef>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            dependency_type: DependencyType::ConflictsWith,
        }
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] for self-edges and for edges that
    /// mix units with versions.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.source == self.target {
            return Err(EngineError::Validation(format!(
                "{} cannot depend on itself",
                self.source
            )));
        }
        let source_is_version = self.source.kind == NodeKind::Version;
        let target_is_version = self.target.kind == NodeKind::Version;
        if source_is_version != target_is_version {
            return Err(EngineError::Validation(format!(
                "dependency {} -> {} MUST connect two units or two versions",
                self.source, self.target
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Version {
    pub id: VersionId,
    pub version: String,
    pub description: Option<String>,
    pub is_major: bool,
    pub is_breaking: bool,
    pub migrations: Vec<UnitId>,
    pub seeds: Vec<UnitId>,
    pub created_by: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub retired_at: Option<OffsetDateTime>,
}

impl Version {
    pub fn members(&self) -> impl Iterator<Item = UnitRef> + '_ {
        self.migrations
            .iter()
            .copied()
            .map(UnitRef::migration)
            .chain(self.seeds.iter().copied().map(UnitRef::seed))
    }

    /// Drops `unit` from the member lists; `true` when it was a member.
    pub fn remove_member(&mut self, unit: UnitRef) -> bool {
        let members = match unit.kind {
            UnitKind::Migration => &mut self.migrations,
            UnitKind::Seed => &mut self.seeds,
        };
        let before = members.len();
        members.retain(|id| *id != unit.id);
        members.len() != before
    }

    #[must_use]
    pub fn graph_node(&self) -> GraphNode {
        GraphNode {
            node: NodeRef::version(self.id),
            version: self.version.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionInput {
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_major: bool,
    #[serde(default)]
    pub is_breaking: bool,
    #[serde(default)]
    pub migrations: Vec<UnitId>,
    #[serde(default)]
    pub seeds: Vec<UnitId>,
    #[serde(default)]
    pub depends_on: Vec<VersionId>,
}

impl VersionInput {
    /// # Errors
    /// Returns [`EngineError::Validation`] for a blank label or duplicated members.
    pub fn validate(&self) -> Result<(), EngineError> {
        require_text("version label", &self.version)?;
        ensure_distinct("migration member", &self.migrations)?;
        ensure_distinct("seed member", &self.seeds)?;
        ensure_distinct("version dependency", &self.depends_on)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionPatch {
    pub description: Option<String>,
    pub is_major: Option<bool>,
    pub is_breaking: Option<bool>,
    pub migrations: Option<Vec<UnitId>>,
    pub seeds: Option<Vec<UnitId>>,
    pub depends_on: Option<Vec<VersionId>>,
}

/// A version together with its derived status and direct prerequisites.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionView {
    #[serde(flatten)]
    pub version: Version,
    pub status: VersionStatus,
    pub depends_on: Vec<VersionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub seq: i64,
    pub execution_id: Ulid,
    pub run_id: RunId,
    pub unit: UnitRef,
    pub kind: ExecutionKind,
    pub outcome: ExecutionOutcome,
    pub dry_run: bool,
    pub started_at: OffsetDateTime,
    pub completed_at: OffsetDateTime,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub rows_committed: Option<u64>,
    pub executed_by: String,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecordInput {
    pub run_id: RunId,
    pub unit: UnitRef,
    pub kind: ExecutionKind,
    pub outcome: ExecutionOutcome,
    pub dry_run: bool,
    pub started_at: OffsetDateTime,
    pub completed_at: OffsetDateTime,
    pub error: Option<String>,
    pub rows_committed: Option<u64>,
    pub executed_by: String,
    pub detail: Value,
}

impl ExecutionRecordInput {
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        let elapsed = self.completed_at - self.started_at;
        u64::try_from(elapsed.whole_milliseconds()).unwrap_or(0)
    }

    #[must_use]
    pub fn into_record(self, seq: i64, execution_id: Ulid) -> ExecutionRecord {
        let duration_ms = self.duration_ms();
        ExecutionRecord {
            seq,
            execution_id,
            run_id: self.run_id,
            unit: self.unit,
            kind: self.kind,
            outcome: self.outcome,
            dry_run: self.dry_run,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms,
            error: self.error,
            rows_committed: self.rows_committed,
            executed_by: self.executed_by,
            detail: self.detail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub seq: i64,
    pub entry_id: Ulid,
    pub actor: String,
    pub source: Option<String>,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    pub succeeded: bool,
    pub error: Option<String>,
    pub detail: Value,
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntryInput {
    pub actor: String,
    pub source: Option<String>,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    pub succeeded: bool,
    pub error: Option<String>,
    pub detail: Value,
    pub recorded_at: OffsetDateTime,
}

impl AuditEntryInput {
    #[must_use]
    pub fn into_entry(self, seq: i64, entry_id: Ulid) -> AuditEntry {
        AuditEntry {
            seq,
            entry_id,
            actor: self.actor,
            source: self.source,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            succeeded: self.succeeded,
            error: self.error,
            detail: self.detail,
            recorded_at: self.recorded_at,
        }
    }
}

fn script_checksum(forward: &str, reverse: Option<&str>) -> String {
    checksum_of(&[forward, reverse.unwrap_or_default()])
}

fn data_checksum(target_table: &str, data: &[SeedRow], match_conditions: &[String]) -> String {
    let data = Value::Array(data.iter().cloned().map(Value::Object).collect());
    checksum_of(&[target_table, &data.to_string(), &match_conditions.join(",")])
}

/// Hex-encoded SHA-256 over `parts`, each terminated by a NUL byte.
#[must_use]
pub fn checksum_of(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0_u8]);
    }
    hex::encode(hasher.finalize())
}

/// Plain SQL identifier: ASCII letter or underscore, then letters, digits or underscores.
#[must_use]
pub fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// # Errors
/// Returns [`EngineError::Validation`] if `value` is not RFC3339 or not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// # Errors
/// Returns [`EngineError::Validation`] if formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            EngineError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

fn default_true() -> bool {
    true
}

fn require_text(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} MUST be non-empty")));
    }
    Ok(())
}

fn validate_batch_size(batch_size: Option<u32>) -> Result<(), EngineError> {
    if batch_size == Some(0) {
        return Err(EngineError::Validation(
            "batch_size MUST be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn ensure_distinct<T: Ord + Display>(field: &str, values: &[T]) -> Result<(), EngineError> {
    let mut seen = std::collections::BTreeSet::new();
    for value in values {
        if !seen.insert(value) {
            return Err(EngineError::Validation(format!("duplicate {field} `{value}`")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn row(value: Value) -> SeedRow {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object row, got {other}"),
        }
    }

    fn fixture_migration_input() -> MigrationInput {
        MigrationInput {
            name: "create_accounts".to_string(),
            version: "1.0.0".to_string(),
            migration_type: MigrationType::Schema,
            description: None,
            forward_script: "CREATE TABLE accounts (id INTEGER PRIMARY KEY);".to_string(),
            reverse_script: Some("DROP TABLE accounts;".to_string()),
            is_reversible: true,
            batch_size: None,
            depends_on: Vec::new(),
        }
    }

    fn fixture_seed_input() -> SeedInput {
        SeedInput {
            name: "default_plans".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            target_table: "plans".to_string(),
            data: vec![row(json!({"id": 1, "name": "free"}))],
            match_conditions: vec!["id".to_string()],
            update_existing: true,
            is_reversible: true,
            batch_size: Some(100),
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn reversible_migration_requires_reverse_script() {
        let mut input = fixture_migration_input();
        input.reverse_script = None;
        assert!(matches!(input.validate(), Err(EngineError::Validation(_))));

        input.is_reversible = false;
        must_ok(input.validate());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut input = fixture_migration_input();
        input.batch_size = Some(0);
        assert!(matches!(input.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn seed_rows_must_carry_match_columns() {
        let mut input = fixture_seed_input();
        must_ok(input.validate());

        input.data.push(row(json!({"name": "pro"})));
        let err = input.validate().err();
        assert!(matches!(err, Some(EngineError::Validation(message)) if message.contains("`id`")));
    }

    #[test]
    fn seed_identifiers_are_checked() {
        let mut input = fixture_seed_input();
        input.target_table = "plans; DROP TABLE x".to_string();
        assert!(input.validate().is_err());

        let mut input = fixture_seed_input();
        input.data = vec![row(json!({"id": 1, "bad column": 2}))];
        assert!(input.validate().is_err());
    }

    #[test]
    fn unit_refs_round_trip_through_display() {
        let unit = UnitRef::seed(UnitId::new());
        assert_eq!(must_ok(UnitRef::parse(&unit.to_string())), unit);

        let version = NodeRef::version(VersionId::new());
        assert!(UnitRef::parse(&version.to_string()).is_err());
        assert!(NodeRef::parse("table:01J0SQQP7M70P6Y3R4T8D8G8M2").is_err());
    }

    #[test]
    fn dependency_endpoints_must_share_granularity() {
        let unit = UnitRef::migration(UnitId::new());
        let version = NodeRef::version(VersionId::new());
        assert!(DependencyInput::requires(unit, version).validate().is_err());
        assert!(DependencyInput::requires(unit, unit).validate().is_err());
        must_ok(DependencyInput::requires(unit, UnitRef::seed(UnitId::new())).validate());
    }

    #[test]
    fn patch_recomputes_checksum() {
        let now = now_utc();
        let input = fixture_migration_input();
        let mut migration = Migration {
            id: UnitId::new(),
            name: input.name,
            version: input.version,
            migration_type: input.migration_type,
            description: None,
            forward_script: input.forward_script,
            reverse_script: input.reverse_script,
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
        let before = migration.checksum.clone();

        let patch = MigrationPatch {
            forward_script: Some("CREATE TABLE accounts (id INTEGER);".to_string()),
            ..MigrationPatch::default()
        };
        assert!(patch.touches_scripts());
        must_ok(patch.apply_to(&mut migration));
        assert_ne!(migration.checksum, before);

        let invalid = MigrationPatch {
            name: Some("  ".to_string()),
            ..MigrationPatch::default()
        };
        assert!(invalid.apply_to(&mut migration).is_err());
    }

    #[test]
    fn irreversible_migration_has_no_revert_script() {
        let now = now_utc();
        let migration = Migration {
            id: UnitId::new(),
            name: "drop_legacy".to_string(),
            version: "2.0.0".to_string(),
            migration_type: MigrationType::Schema,
            description: None,
            forward_script: "DROP TABLE legacy;".to_string(),
            reverse_script: Some("CREATE TABLE legacy (id INTEGER);".to_string()),
            is_reversible: false,
            batch_size: None,
            checksum: String::new(),
            status: UnitStatus::Completed,
            created_by: "tester".to_string(),
            created_at: now,
            updated_at: now,
            retired_at: None,
        };
        assert!(migration.revert_script().is_none());
        assert!(!Unit::Migration(migration).is_reversible());
    }

    #[test]
    fn timestamps_must_be_utc() {
        must_ok(parse_rfc3339_utc("2026-01-01T00:00:00Z"));
        assert!(parse_rfc3339_utc("2026-01-01T00:00:00+02:00").is_err());
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("tenant_settings"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
