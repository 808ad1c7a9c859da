use std::collections::BTreeSet;

use schemaflow_core::{
    aggregate_status, now_utc, Actor, AuditAction, Dependency, DependencyId, DependencyType,
    EngineError, NodeRef, ResourceType, Version, VersionId, VersionInput, VersionPatch,
    VersionStatus, VersionView, UnitRef,
};
use serde::{Deserialize, Serialize};

use crate::audit::AuditScope;
use crate::registry::{ensure_live_node, DeleteOutcome};
use crate::{Catalog, MigrationService};

/// Which versions `get_versions` returns, by aggregate status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct VersionQuery {
    pub include_completed: bool,
    pub include_failed: bool,
    pub include_retired: bool,
}

impl Default for VersionQuery {
    fn default() -> Self {
        Self {
            include_completed: true,
            include_failed: true,
            include_retired: false,
        }
    }
}

impl VersionQuery {
    fn admits(&self, view: &VersionView) -> bool {
        (self.include_retired || view.version.retired_at.is_none())
            && (self.include_completed || view.status != VersionStatus::Completed)
            && (self.include_failed || view.status != VersionStatus::Failed)
    }
}

impl MigrationService<'_> {
    /// # Errors
    /// Returns [`EngineError::Validation`] for a duplicate label or retired
    /// member, [`EngineError::NotFound`] for an unknown member or prerequisite
    /// version and [`EngineError::CyclicDependency`] when the version
    /// prerequisites would form a cycle.
    pub fn create_version(
        &self,
        input: VersionInput,
        actor: &Actor,
    ) -> Result<VersionView, EngineError> {
        let entry = AuditScope::new(AuditAction::Create, ResourceType::Version);
        self.audited(actor, entry, |audit| {
            input.validate()?;
            let mut catalog = self.load_catalog()?;
            ensure_unique_label(&catalog, &input.version)?;

            let now = now_utc();
            let version = Version {
                id: VersionId::new(),
                version: input.version.trim().to_string(),
                description: input.description.clone(),
                is_major: input.is_major,
                is_breaking: input.is_breaking,
                migrations: input.migrations.clone(),
                seeds: input.seeds.clone(),
                created_by: actor.name.clone(),
                created_at: now,
                updated_at: now,
                retired_at: None,
            };
            audit.resource_id = Some(version.id.to_string());
            for member in version.members() {
                ensure_live_node(&catalog, member.into())?;
            }

            catalog.graph.insert_node(version.graph_node());
            let edges = plan_version_requires(&mut catalog, version.id, &input.depends_on, actor)?;

            self.store.insert_version(&version)?;
            for edge in &edges {
                self.store.insert_dependency(edge)?;
            }
            audit.note("version", &version.version);
            audit.note("members", version.members().count());
            tracing::info!(version = %version.version, id = %version.id, "version created");

            catalog.versions.push(version.clone());
            Ok(view_of(&catalog, version))
        })
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] for an empty patch or a retired
    /// version, plus the errors of [`MigrationService::create_version`] for
    /// changed members and prerequisites.
    pub fn update_version(
        &self,
        id: VersionId,
        patch: &VersionPatch,
        actor: &Actor,
    ) -> Result<VersionView, EngineError> {
        let entry = AuditScope::on(AuditAction::Update, ResourceType::Version, id);
        self.audited(actor, entry, |audit| {
            if patch == &VersionPatch::default() {
                return Err(EngineError::Validation("version patch is empty".to_string()));
            }
            let mut catalog = self.load_catalog()?;
            let mut version = find_in(&catalog, id)?.clone();
            if version.retired_at.is_some() {
                let label = &version.version;
                return Err(EngineError::Validation(format!("version {label} is retired")));
            }

            if let Some(description) = &patch.description {
                version.description = Some(description.clone());
            }
            if let Some(is_major) = patch.is_major {
                version.is_major = is_major;
            }
            if let Some(is_breaking) = patch.is_breaking {
                version.is_breaking = is_breaking;
            }
            if let Some(migrations) = &patch.migrations {
                version.migrations.clone_from(migrations);
            }
            if let Some(seeds) = &patch.seeds {
                version.seeds.clone_from(seeds);
            }
            let node = NodeRef::version(id);
            let current: Vec<Dependency> = catalog
                .dependencies
                .iter()
                .filter(|edge| {
                    edge.source == node && edge.dependency_type == DependencyType::Requires
                })
                .cloned()
                .collect();
            let depends_on = patch.depends_on.clone().unwrap_or_else(|| {
                current
                    .iter()
                    .filter_map(|edge| edge.target.as_version())
                    .collect()
            });
            VersionInput {
                version: version.version.clone(),
                description: version.description.clone(),
                is_major: version.is_major,
                is_breaking: version.is_breaking,
                migrations: version.migrations.clone(),
                seeds: version.seeds.clone(),
                depends_on: depends_on.clone(),
            }
            .validate()?;
            for member in version.members() {
                ensure_live_node(&catalog, member.into())?;
            }

            let wanted: BTreeSet<VersionId> = depends_on.iter().copied().collect();
            let dropped: Vec<&Dependency> = current
                .iter()
                .filter(|edge| {
                    edge.target
                        .as_version()
                        .is_some_and(|target| !wanted.contains(&target))
                })
                .collect();
            for edge in &dropped {
                catalog
                    .graph
                    .remove_dependency(edge.source, edge.target, DependencyType::Requires);
            }
            let existing: BTreeSet<VersionId> = current
                .iter()
                .filter_map(|edge| edge.target.as_version())
                .collect();
            let added: Vec<VersionId> = depends_on
                .iter()
                .copied()
                .filter(|target| !existing.contains(target))
                .collect();
            let edges = plan_version_requires(&mut catalog, id, &added, actor)?;

            version.updated_at = now_utc();
            self.store.update_version(&version)?;
            for edge in &dropped {
                self.store.delete_dependency(edge.id)?;
            }
            for edge in &edges {
                self.store.insert_dependency(edge)?;
            }
            audit.note("dependencies_added", edges.len());
            audit.note("dependencies_removed", dropped.len());
            tracing::info!(version = %version.version, "version updated");

            catalog.versions.retain(|candidate| candidate.id != id);
            catalog.versions.push(version.clone());
            Ok(view_of(&catalog, version))
        })
    }

    /// Deletes a version, or retires it when its members have history and `force` is set.
    ///
    /// # Errors
    /// Returns [`EngineError::HasHistory`] when a member has execution records
    /// and `force` is not set, and [`EngineError::Validation`] when other
    /// versions depend on it and `force` is not set.
    pub fn delete_version(
        &self,
        id: VersionId,
        force: bool,
        actor: &Actor,
    ) -> Result<DeleteOutcome, EngineError> {
        let mut records = 0;
        if let Some(existing) = self.store.get_version(id)? {
            for member in existing.members() {
                records += self.store.count_executions(member)?;
            }
        }
        let action = if records > 0 && force {
            AuditAction::Retire
        } else {
            AuditAction::Delete
        };

        let entry = AuditScope::on(action, ResourceType::Version, id);

        self.audited(actor, entry, |audit| {
            let catalog = self.load_catalog()?;
            let mut version = find_in(&catalog, id)?.clone();
            if version.retired_at.is_some() {
                let label = &version.version;
                return Err(EngineError::Validation(format!(
                    "version {label} is already retired"
                )));
            }
            audit.note("history_records", records);

            if records > 0 {
                if !force {
                    return Err(EngineError::HasHistory {
                        resource: format!("version {}", version.version),
                        records,
                    });
                }
                let now = now_utc();
                version.retired_at = Some(now);
                version.updated_at = now;
                self.store.update_version(&version)?;
                tracing::info!(version = %version.version, "version retired");
                return Ok(DeleteOutcome::Retired);
            }

            let node = NodeRef::version(id);
            let dependents = catalog.graph.dependents(node);
            if !dependents.is_empty() && !force {
                return Err(EngineError::Validation(format!(
                    "version {} is required by {}; pass force to drop those edges",
                    version.version,
                    crate::registry::join(&dependents)
                )));
            }
            let edges = self
                .store
                .purge_node(node, now_utc())?
                .ok_or_else(|| EngineError::NotFound(format!("version {id}")))?;
            audit.note("edges_removed", edges);
            tracing::info!(version = %version.version, edges, "version deleted");
            Ok(DeleteOutcome::Deleted)
        })
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn get_version(&self, id: VersionId) -> Result<VersionView, EngineError> {
        let catalog = self.load_catalog()?;
        let version = find_in(&catalog, id)?.clone();
        Ok(view_of(&catalog, version))
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] when no live version has `label`.
    pub fn find_version(&self, label: &str) -> Result<VersionView, EngineError> {
        let catalog = self.load_catalog()?;
        let version = catalog
            .versions
            .iter()
            .find(|version| version.retired_at.is_none() && version.version == label.trim())
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("version {label}")))?;
        Ok(view_of(&catalog, version))
    }

    /// Versions in release order with their aggregate status.
    ///
    /// # Errors
    /// Returns [`EngineError::Store`] when the catalog cannot be read.
    pub fn get_versions(&self, query: &VersionQuery) -> Result<Vec<VersionView>, EngineError> {
        let catalog = self.load_catalog()?;
        let nodes: BTreeSet<NodeRef> = catalog
            .versions
            .iter()
            .map(|version| NodeRef::version(version.id))
            .collect();
        Ok(ordered_views(&catalog, &nodes)?
            .into_iter()
            .filter(|view| query.admits(view))
            .collect())
    }

    /// Transitive prerequisite versions of `id`, in the order they must be released.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn version_dependencies(&self, id: VersionId) -> Result<Vec<VersionView>, EngineError> {
        let catalog = self.load_catalog()?;
        find_in(&catalog, id)?;
        let node = NodeRef::version(id);
        let mut closure = catalog.graph.requires_closure([node]);
        closure.remove(&node);
        ordered_views(&catalog, &closure)
    }

    /// Every live version in deterministic release order.
    ///
    /// # Errors
    /// Returns [`EngineError::CyclicDependency`] if stored edges form a cycle.
    pub fn version_order(&self) -> Result<Vec<VersionView>, EngineError> {
        let catalog = self.load_catalog()?;
        let nodes: BTreeSet<NodeRef> = catalog
            .versions
            .iter()
            .filter(|version| version.retired_at.is_none())
            .map(|version| NodeRef::version(version.id))
            .collect();
        ordered_views(&catalog, &nodes)
    }
}

fn find_in(catalog: &Catalog, id: VersionId) -> Result<&Version, EngineError> {
    catalog
        .versions
        .iter()
        .find(|version| version.id == id)
        .ok_or_else(|| EngineError::NotFound(format!("version {id}")))
}

fn ensure_unique_label(catalog: &Catalog, label: &str) -> Result<(), EngineError> {
    let label = label.trim();
    let taken = catalog
        .versions
        .iter()
        .any(|version| version.retired_at.is_none() && version.version == label);
    if taken {
        return Err(EngineError::Validation(format!("version `{label}` already exists")));
    }
    Ok(())
}

fn plan_version_requires(
    catalog: &mut Catalog,
    source: VersionId,
    depends_on: &[VersionId],
    actor: &Actor,
) -> Result<Vec<Dependency>, EngineError> {
    let source = NodeRef::version(source);
    let mut edges = Vec::with_capacity(depends_on.len());
    for target in depends_on {
        let target = NodeRef::version(*target);
        ensure_live_node(catalog, target)?;
        catalog
            .graph
            .add_dependency(source, target, DependencyType::Requires)?;
        edges.push(Dependency {
            id: DependencyId::new(),
            source,
            target,
            dependency_type: DependencyType::Requires,
            created_by: actor.name.clone(),
            created_at: now_utc(),
        });
    }
    Ok(edges)
}

fn ordered_views(
    catalog: &Catalog,
    nodes: &BTreeSet<NodeRef>,
) -> Result<Vec<VersionView>, EngineError> {
    let mut views = Vec::with_capacity(nodes.len());
    for node in catalog.graph.resolve_order(nodes)? {
        let Some(id) = node.as_version() else {
            continue;
        };
        views.push(view_of(catalog, find_in(catalog, id)?.clone()));
    }
    Ok(views)
}

pub(crate) fn view_of(catalog: &Catalog, version: Version) -> VersionView {
    let statuses: Vec<_> = version
        .members()
        .filter_map(|member: UnitRef| catalog.units.get(&member).map(schemaflow_core::Unit::status))
        .collect();
    let depends_on = catalog
        .graph
        .prerequisites(NodeRef::version(version.id))
        .into_iter()
        .filter_map(NodeRef::as_version)
        .collect();
    VersionView {
        status: aggregate_status(statuses),
        depends_on,
        version,
    }
}
