//! Structured filter and sort specifications.
//!
//! Stores translate these into their own query language; [`UnitQuery::matches_migration`]
//! and friends give the reference semantics used by in-memory stores and by
//! post-filtering.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{
    AuditAction, AuditEntry, Dependency, DependencyType, ExecutionKind, ExecutionOutcome,
    ExecutionRecord, Migration, MigrationType, NodeRef, ResourceType, RunId, Seed, UnitRef,
    UnitStatus, VersionKey,
};

pub const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Version,
    Name,
    CreatedAt,
    UpdatedAt,
    Status,
}

impl SortField {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "version" => Some(Self::Version),
            "name" => Some(Self::Name),
            "created_at" => Some(Self::CreatedAt),
            "updated_at" => Some(Self::UpdatedAt),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// Filter over migrations or seeds. All set fields must match (AND).
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnitQuery {
    pub version: Option<String>,
    pub migration_type: Option<MigrationType>,
    pub status: Option<UnitStatus>,
    pub name_contains: Option<String>,
    pub target_table: Option<String>,
    pub include_retired: bool,
    pub sort: SortSpec,
    pub page: Option<Page>,
}

impl UnitQuery {
    /// Every non-retired unit, unpaginated.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Every unit including retired ones, unpaginated.
    #[must_use]
    pub fn everything() -> Self {
        Self {
            include_retired: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn matches_migration(&self, migration: &Migration) -> bool {
        self.matches_common(
            &migration.name,
            &migration.version,
            migration.status,
            migration.retired_at.is_some(),
        ) && self
            .migration_type
            .map_or(true, |kind| kind == migration.migration_type)
            && self.target_table.is_none()
    }

    #[must_use]
    pub fn matches_seed(&self, seed: &Seed) -> bool {
        self.matches_common(&seed.name, &seed.version, seed.status, seed.retired_at.is_some())
            && self.migration_type.is_none()
            && self
                .target_table
                .as_deref()
                .map_or(true, |table| table == seed.target_table)
    }

    /// Sorts and paginates already-filtered rows.
    #[must_use]
    pub fn sort_and_page<T: Sortable>(&self, mut rows: Vec<T>) -> Vec<T> {
        rows.sort_by(|left, right| {
            let ordering = compare_by(self.sort.field, left, right)
                .then_with(|| left.sort_id().cmp(&right.sort_id()));
            match self.sort.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
        match self.page {
            Some(page) => rows.into_iter().skip(page.offset).take(page.limit).collect(),
            None => rows,
        }
    }

    fn matches_common(&self, name: &str, version: &str, status: UnitStatus, retired: bool) -> bool {
        (self.include_retired || !retired)
            && self.version.as_deref().map_or(true, |wanted| wanted == version)
            && self.status.map_or(true, |wanted| wanted == status)
            && self.name_contains.as_deref().map_or(true, |needle| {
                name.to_lowercase().contains(&needle.to_lowercase())
            })
    }
}

/// Row accessors needed for sorting.
pub trait Sortable {
    fn sort_name(&self) -> &str;
    fn sort_version(&self) -> &str;
    fn sort_status(&self) -> UnitStatus;
    fn sort_created_at(&self) -> time::OffsetDateTime;
    fn sort_updated_at(&self) -> time::OffsetDateTime;
    fn sort_id(&self) -> ulid::Ulid;
}

impl Sortable for Migration {
    fn sort_name(&self) -> &str {
        &self.name
    }
    fn sort_version(&self) -> &str {
        &self.version
    }
    fn sort_status(&self) -> UnitStatus {
        self.status
    }
    fn sort_created_at(&self) -> time::OffsetDateTime {
        self.created_at
    }
    fn sort_updated_at(&self) -> time::OffsetDateTime {
        self.updated_at
    }
    fn sort_id(&self) -> ulid::Ulid {
        self.id.0
    }
}

impl Sortable for Seed {
    fn sort_name(&self) -> &str {
        &self.name
    }
    fn sort_version(&self) -> &str {
        &self.version
    }
    fn sort_status(&self) -> UnitStatus {
        self.status
    }
    fn sort_created_at(&self) -> time::OffsetDateTime {
        self.created_at
    }
    fn sort_updated_at(&self) -> time::OffsetDateTime {
        self.updated_at
    }
    fn sort_id(&self) -> ulid::Ulid {
        self.id.0
    }
}

fn compare_by<T: Sortable>(field: SortField, left: &T, right: &T) -> Ordering {
    match field {
        SortField::Version => VersionKey::new(left.sort_version())
            .cmp(&VersionKey::new(right.sort_version()))
            .then_with(|| left.sort_created_at().cmp(&right.sort_created_at())),
        SortField::Name => left.sort_name().cmp(right.sort_name()),
        SortField::CreatedAt => left.sort_created_at().cmp(&right.sort_created_at()),
        SortField::UpdatedAt => left.sort_updated_at().cmp(&right.sort_updated_at()),
        SortField::Status => left.sort_status().as_str().cmp(right.sort_status().as_str()),
    }
}

/// Dependency filter. Set fields are combined with AND.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DependencyFilter {
    pub source: Option<NodeRef>,
    pub target: Option<NodeRef>,
    pub dependency_type: Option<DependencyType>,
}

impl DependencyFilter {
    /// Edges where `node` is either endpoint.
    #[must_use]
    pub fn touching(node: NodeRef) -> TouchingFilter {
        TouchingFilter { node }
    }

    #[must_use]
    pub fn matches(&self, dependency: &Dependency) -> bool {
        self.source.map_or(true, |source| source == dependency.source)
            && self.target.map_or(true, |target| target == dependency.target)
            && self
                .dependency_type
                .map_or(true, |kind| kind == dependency.dependency_type)
    }
}

/// Either-endpoint match, used when removing a node.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TouchingFilter {
    pub node: NodeRef,
}

impl TouchingFilter {
    #[must_use]
    pub fn matches(&self, dependency: &Dependency) -> bool {
        dependency.source == self.node || dependency.target == self.node
    }
}

/// Execution history filter; results come back newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryFilter {
    pub unit: Option<UnitRef>,
    pub run_id: Option<RunId>,
    pub kind: Option<ExecutionKind>,
    pub outcome: Option<ExecutionOutcome>,
    pub dry_run: Option<bool>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    #[must_use]
    pub fn for_unit(unit: UnitRef) -> Self {
        Self {
            unit: Some(unit),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.unit.map_or(true, |unit| unit == record.unit)
            && self.run_id.map_or(true, |run| run == record.run_id)
            && self.kind.map_or(true, |kind| kind == record.kind)
            && self.outcome.map_or(true, |outcome| outcome == record.outcome)
            && self.dry_run.map_or(true, |dry_run| dry_run == record.dry_run)
    }
}

/// Audit log filter; results come back newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<String>,
    pub succeeded: Option<bool>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor.as_deref().map_or(true, |actor| actor == entry.actor)
            && self.action.map_or(true, |action| action == entry.action)
            && self
                .resource_type
                .map_or(true, |resource_type| resource_type == entry.resource_type)
            && self
                .resource_id
                .as_deref()
                .map_or(true, |id| Some(id) == entry.resource_id.as_deref())
            && self.succeeded.map_or(true, |succeeded| succeeded == entry.succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{now_utc, DependencyId, UnitId, VersionId};
    use time::Duration;

    fn migration(name: &str, version: &str, offset: i64) -> Migration {
        let created = now_utc() + Duration::seconds(offset);
        Migration {
            id: UnitId::new(),
            name: name.to_string(),
            version: version.to_string(),
            migration_type: MigrationType::Schema,
            description: None,
            forward_script: "SELECT 1;".to_string(),
            reverse_script: None,
            is_reversible: false,
            batch_size: None,
            checksum: String::new(),
            status: UnitStatus::Pending,
            created_by: "tester".to_string(),
            created_at: created,
            updated_at: created,
            retired_at: None,
        }
    }

    #[test]
    fn unit_query_filters_are_conjunctive() {
        let mut first = migration("add_Accounts", "1.0.0", 0);
        first.migration_type = MigrationType::Index;
        let second = migration("add_users", "1.0.0", 1);

        let query = UnitQuery {
            version: Some("1.0.0".to_string()),
            migration_type: Some(MigrationType::Index),
            name_contains: Some("accounts".to_string()),
            ..UnitQuery::default()
        };
        assert!(query.matches_migration(&first));
        assert!(!query.matches_migration(&second));

        first.retired_at = Some(now_utc());
        assert!(!query.matches_migration(&first));
        let with_retired = UnitQuery {
            include_retired: true,
            ..query
        };
        assert!(with_retired.matches_migration(&first));
    }

    #[test]
    fn version_sort_is_numeric_and_paged() {
        let rows = vec![
            migration("c", "1.10.0", 0),
            migration("a", "1.2.0", 1),
            migration("b", "1.9.0", 2),
        ];
        let query = UnitQuery {
            page: Some(Page {
                limit: 2,
                offset: 0,
            }),
            ..UnitQuery::default()
        };
        let names: Vec<String> = query
            .sort_and_page(rows.clone())
            .into_iter()
            .map(|row| row.name)
            .collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        let query = UnitQuery {
            sort: SortSpec {
                field: SortField::Name,
                direction: SortDirection::Desc,
            },
            page: Some(Page {
                limit: 10,
                offset: 1,
            }),
            ..UnitQuery::default()
        };
        let names: Vec<String> = query
            .sort_and_page(rows)
            .into_iter()
            .map(|row| row.name)
            .collect();
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn dependency_filter_uses_and_semantics() {
        let source: NodeRef = UnitRef::migration(UnitId::new()).into();
        let target: NodeRef = UnitRef::migration(UnitId::new()).into();
        let edge = Dependency {
            id: DependencyId::new(),
            source,
            target,
            dependency_type: DependencyType::Requires,
            created_by: "tester".to_string(),
            created_at: now_utc(),
        };

        let both = DependencyFilter {
            source: Some(source),
            target: Some(target),
            dependency_type: None,
        };
        assert!(both.matches(&edge));

        let mismatched_target = DependencyFilter {
            source: Some(source),
            target: Some(NodeRef::version(VersionId::new())),
            dependency_type: None,
        };
        assert!(!mismatched_target.matches(&edge));

        let wrong_type = DependencyFilter {
            dependency_type: Some(DependencyType::ConflictsWith),
            ..DependencyFilter::default()
        };
        assert!(!wrong_type.matches(&edge));
        assert!(DependencyFilter::touching(target).matches(&edge));
    }
}
