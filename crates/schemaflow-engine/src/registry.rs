use schemaflow_core::{
    now_utc, Actor, AuditAction, Dependency, DependencyFilter, DependencyId, DependencyInput,
    DependencyType, EngineError, Migration, MigrationInput, MigrationPatch, NodeKind, NodeRef,
    ResourceType, Seed, SeedInput, SeedPatch, Unit, UnitId, UnitKind, UnitQuery, UnitRef,
    UnitStatus,
};
use serde::{Deserialize, Serialize};

use crate::audit::AuditScope;
use crate::{Catalog, MigrationService};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    Retired,
}

impl MigrationService<'_> {
    /// Registers a pending migration and its `requires` edges.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for an invalid definition or a
    /// duplicate name, [`EngineError::NotFound`] for an unknown prerequisite
    /// and [`EngineError::CyclicDependency`] if an edge would close a cycle.
    pub fn create_migration(
        &self,
        input: MigrationInput,
        actor: &Actor,
    ) -> Result<Migration, EngineError> {
        let id = UnitId::new();
        let entry = AuditScope::on(AuditAction::Create, ResourceType::Migration, id);
        self.audited(actor, entry, |audit| {
            input.validate()?;
            let mut catalog = self.load_catalog()?;
            ensure_unique_name(&catalog, UnitKind::Migration, &input.name, None)?;

            let now = now_utc();
            let mut migration = Migration {
                id,
                name: input.name.trim().to_string(),
                version: input.version.trim().to_string(),
                migration_type: input.migration_type,
                description: input.description.clone(),
                forward_script: input.forward_script.clone(),
                reverse_script: input.reverse_script.clone(),
                is_reversible: input.is_reversible,
                batch_size: input.batch_size,
                checksum: String::new(),
                status: UnitStatus::Pending,
                created_by: actor.name.clone(),
                created_at: now,
                updated_at: now,
                retired_at: None,
            };
            migration.checksum = migration.compute_checksum();

            let unit = Unit::Migration(migration.clone());
            let edges = plan_requires(&mut catalog, &unit, &input.depends_on, actor)?;
            self.store.insert_migration(&migration)?;
            for edge in &edges {
                self.store.insert_dependency(edge)?;
            }

            tracing::info!(migration = %migration.id, name = %migration.name, "migration created");
            audit.note("name", &migration.name);
            audit.note("version", &migration.version);
            audit.note("checksum", &migration.checksum);
            audit.note("depends_on", &input.depends_on);
            Ok(migration)
        })
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the patch is empty, the
    /// migration is retired or running, or it rewrites the scripts of a
    /// completed migration.
    pub fn update_migration(
        &self,
        id: UnitId,
        patch: &MigrationPatch,
        actor: &Actor,
    ) -> Result<Migration, EngineError> {
        let entry = AuditScope::on(AuditAction::Update, ResourceType::Migration, id);
        self.audited(actor, entry, |audit| {
            if patch.is_empty() {
                return Err(EngineError::Validation("update contains no changes".to_string()));
            }
            let mut migration = self
                .store
                .get_migration(id)?
                .ok_or_else(|| EngineError::NotFound(UnitRef::migration(id).to_string()))?;
            ensure_editable(&Unit::Migration(migration.clone()), patch.touches_scripts())?;
            if let Some(name) = &patch.name {
                let catalog = self.load_catalog()?;
                ensure_unique_name(&catalog, UnitKind::Migration, name, Some(id))?;
            }

            let previous_checksum = migration.checksum.clone();
            patch.apply_to(&mut migration)?;
            migration.updated_at = now_utc();
            self.store.update_migration(&migration)?;

            audit.note("patch", patch);
            if previous_checksum != migration.checksum {
                audit.note("previous_checksum", previous_checksum);
                audit.note("checksum", &migration.checksum);
            }
            Ok(migration)
        })
    }

    /// Hard-deletes a migration without history; with history it is retired
    /// when `force` is set and refused otherwise.
    ///
    /// # Errors
    /// Returns [`EngineError::HasHistory`] when execution records exist and
    /// `force` is not set.
    pub fn delete_migration(
        &self,
        id: UnitId,
        force: bool,
        actor: &Actor,
    ) -> Result<DeleteOutcome, EngineError> {
        self.delete_unit(UnitRef::migration(id), force, actor)
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn get_migration(&self, id: UnitId) -> Result<Migration, EngineError> {
        self.store
            .get_migration(id)?
            .ok_or_else(|| EngineError::NotFound(UnitRef::migration(id).to_string()))
    }

    /// # Errors
    /// Returns [`EngineError::Store`] when the store query fails.
    pub fn get_migrations(&self, query: &UnitQuery) -> Result<Vec<Migration>, EngineError> {
        Ok(self.store.list_migrations(query)?)
    }

    /// Registers a pending seed and its `requires` edges.
    ///
    /// # Errors
    /// Same as [`MigrationService::create_migration`].
    pub fn create_seed(&self, input: SeedInput, actor: &Actor) -> Result<Seed, EngineError> {
        let id = UnitId::new();
        let entry = AuditScope::on(AuditAction::Create, ResourceType::Seed, id);
        self.audited(actor, entry, |audit| {
            input.validate()?;
            let mut catalog = self.load_catalog()?;
            ensure_unique_name(&catalog, UnitKind::Seed, &input.name, None)?;

            let now = now_utc();
            let mut seed = Seed {
                id,
                name: input.name.trim().to_string(),
                version: input.version.trim().to_string(),
                description: input.description.clone(),
                target_table: input.target_table.clone(),
                data: input.data.clone(),
                match_conditions: input.match_conditions.clone(),
                update_existing: input.update_existing,
                is_reversible: input.is_reversible,
                batch_size: input.batch_size,
                checksum: String::new(),
                status: UnitStatus::Pending,
                created_by: actor.name.clone(),
                created_at: now,
                updated_at: now,
                retired_at: None,
            };
            seed.checksum = seed.compute_checksum();

            let unit = Unit::Seed(seed.clone());
            let edges = plan_requires(&mut catalog, &unit, &input.depends_on, actor)?;
            self.store.insert_seed(&seed)?;
            for edge in &edges {
                self.store.insert_dependency(edge)?;
            }

            tracing::info!(
                seed = %seed.id,
                name = %seed.name,
                rows = seed.data.len(),
                "seed created"
            );
            audit.note("name", &seed.name);
            audit.note("target_table", &seed.target_table);
            audit.note("rows", seed.data.len());
            audit.note("depends_on", &input.depends_on);
            Ok(seed)
        })
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the patch is empty, the seed
    /// is retired or running, or it rewrites the data of a completed seed.
    pub fn update_seed(
        &self,
        id: UnitId,
        patch: &SeedPatch,
        actor: &Actor,
    ) -> Result<Seed, EngineError> {
        let entry = AuditScope::on(AuditAction::Update, ResourceType::Seed, id);
        self.audited(actor, entry, |audit| {
            if patch.is_empty() {
                return Err(EngineError::Validation("update contains no changes".to_string()));
            }
            let mut seed = self
                .store
                .get_seed(id)?
                .ok_or_else(|| EngineError::NotFound(UnitRef::seed(id).to_string()))?;
            ensure_editable(&Unit::Seed(seed.clone()), patch.touches_data())?;
            if let Some(name) = &patch.name {
                let catalog = self.load_catalog()?;
                ensure_unique_name(&catalog, UnitKind::Seed, name, Some(id))?;
            }

            patch.apply_to(&mut seed)?;
            seed.updated_at = now_utc();
            self.store.update_seed(&seed)?;
            audit.note("checksum", &seed.checksum);
            Ok(seed)
        })
    }

    /// # Errors
    /// Returns [`EngineError::HasHistory`] when execution records exist and
    /// `force` is not set.
    pub fn delete_seed(
        &self,
        id: UnitId,
        force: bool,
        actor: &Actor,
    ) -> Result<DeleteOutcome, EngineError> {
        self.delete_unit(UnitRef::seed(id), force, actor)
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn get_seed(&self, id: UnitId) -> Result<Seed, EngineError> {
        self.store
            .get_seed(id)?
            .ok_or_else(|| EngineError::NotFound(UnitRef::seed(id).to_string()))
    }

    /// # Errors
    /// Returns [`EngineError::Store`] when the store query fails.
    pub fn get_seeds(&self, query: &UnitQuery) -> Result<Vec<Seed>, EngineError> {
        Ok(self.store.list_seeds(query)?)
    }

    /// Adds a `requires` or `conflicts_with` edge between two units or two versions.
    ///
    /// # Errors
    /// Returns [`EngineError::CyclicDependency`] or [`EngineError::Conflict`]
    /// when the edge would break the graph invariants; the graph is left unchanged.
    pub fn add_dependency(
        &self,
        input: DependencyInput,
        actor: &Actor,
    ) -> Result<Dependency, EngineError> {
        let entry = AuditScope::new(AuditAction::AddDependency, ResourceType::Dependency);
        self.audited(actor, entry, |audit| {
            audit.note("source", input.source.to_string());
            audit.note("target", input.target.to_string());
            audit.note("dependency_type", input.dependency_type);
            input.validate()?;

            let mut catalog = self.load_catalog()?;
            ensure_live_node(&catalog, input.source)?;
            ensure_live_node(&catalog, input.target)?;
            let duplicate = catalog.dependencies.iter().any(|existing| {
                existing.dependency_type == input.dependency_type
                    && ((existing.source == input.source && existing.target == input.target)
                        || (input.dependency_type == DependencyType::ConflictsWith
                            && existing.source == input.target
                            && existing.target == input.source))
            });
            if duplicate {
                return Err(EngineError::Validation(format!(
                    "{} {} {} already exists",
                    input.source,
                    input.dependency_type.as_str(),
                    input.target
                )));
            }
            catalog
                .graph
                .add_dependency(input.source, input.target, input.dependency_type)?;

            let dependency = Dependency {
                id: DependencyId::new(),
                source: input.source,
                target: input.target,
                dependency_type: input.dependency_type,
                created_by: actor.name.clone(),
                created_at: now_utc(),
            };
            self.store.insert_dependency(&dependency)?;
            audit.resource_id = Some(dependency.id.to_string());
            tracing::info!(
                source = %dependency.source,
                target = %dependency.target,
                kind = dependency.dependency_type.as_str(),
                "dependency added"
            );
            Ok(dependency)
        })
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn remove_dependency(
        &self,
        id: DependencyId,
        actor: &Actor,
    ) -> Result<Dependency, EngineError> {
        let entry = AuditScope::on(AuditAction::RemoveDependency, ResourceType::Dependency, id);
        self.audited(actor, entry, |audit| {
            let dependency = self
                .store
                .get_dependency(id)?
                .ok_or_else(|| EngineError::NotFound(format!("dependency {id}")))?;
            self.store.delete_dependency(id)?;
            audit.note("source", dependency.source.to_string());
            audit.note("target", dependency.target.to_string());
            Ok(dependency)
        })
    }

    /// # Errors
    /// Returns [`EngineError::Store`] when the store query fails.
    pub fn list_dependencies(
        &self,
        filter: &DependencyFilter,
    ) -> Result<Vec<Dependency>, EngineError> {
        Ok(self.store.list_dependencies(filter)?)
    }

    fn delete_unit(
        &self,
        unit: UnitRef,
        force: bool,
        actor: &Actor,
    ) -> Result<DeleteOutcome, EngineError> {
        let records = self.store.count_executions(unit)?;
        let action = if records > 0 && force {
            AuditAction::Retire
        } else {
            AuditAction::Delete
        };

        let entry = AuditScope::on(action, unit.kind, unit.id);

        self.audited(actor, entry, |audit| {
            let catalog = self.load_catalog()?;
            let current = catalog.unit(unit)?;
            if current.is_retired() {
                return Err(EngineError::Validation(format!("{unit} is already retired")));
            }
            if current.status() == UnitStatus::Running {
                return Err(EngineError::Validation(format!("{unit} is running")));
            }
            audit.note("history_records", records);

            if records > 0 {
                if !force {
                    return Err(EngineError::HasHistory {
                        resource: unit.to_string(),
                        records,
                    });
                }
                let now = now_utc();
                match current.clone() {
                    Unit::Migration(mut migration) => {
                        migration.retired_at = Some(now);
                        migration.updated_at = now;
                        self.store.update_migration(&migration)?;
                    }
                    Unit::Seed(mut seed) => {
                        seed.retired_at = Some(now);
                        seed.updated_at = now;
                        self.store.update_seed(&seed)?;
                    }
                }
                tracing::info!(unit = %unit, "unit retired");
                return Ok(DeleteOutcome::Retired);
            }

            let node = NodeRef::from(unit);
            let dependents = catalog.graph.dependents(node);
            if !dependents.is_empty() && !force {
                return Err(EngineError::Validation(format!(
                    "{unit} is required by {}; pass force to drop those edges",
                    join(&dependents)
                )));
            }
            let member_of: Vec<_> = catalog
                .versions
                .iter()
                .filter(|version| version.members().any(|member| member == unit))
                .collect();
            if !member_of.is_empty() && !force {
                return Err(EngineError::Validation(format!(
                    "{unit} is a member of version(s) {}; pass force to remove it",
                    member_of
                        .iter()
                        .map(|version| version.version.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            audit.note("memberships_removed", member_of.len());

            let edges = self
                .store
                .purge_node(node, now_utc())?
                .ok_or_else(|| EngineError::NotFound(unit.to_string()))?;
            audit.note("edges_removed", edges);
            tracing::info!(unit = %unit, edges, "unit deleted");
            Ok(DeleteOutcome::Deleted)
        })
    }
}

/// Validates each prerequisite and adds its edge to the catalog graph,
/// returning the edges to persist.
pub(crate) fn plan_requires(
    catalog: &mut Catalog,
    unit: &Unit,
    depends_on: &[UnitRef],
    actor: &Actor,
) -> Result<Vec<Dependency>, EngineError> {
    let source = NodeRef::from(unit.unit_ref());
    catalog.graph.insert_node(unit.graph_node());
    let mut edges = Vec::with_capacity(depends_on.len());
    for target in depends_on {
        let node = NodeRef::from(*target);
        ensure_live_node(catalog, node)?;
        catalog
            .graph
            .add_dependency(source, node, DependencyType::Requires)?;
        edges.push(Dependency {
            id: DependencyId::new(),
            source,
            target: node,
            dependency_type: DependencyType::Requires,
            created_by: actor.name.clone(),
            created_at: now_utc(),
        });
    }
    Ok(edges)
}

pub(crate) fn ensure_live_node(catalog: &Catalog, node: NodeRef) -> Result<(), EngineError> {
    let retired = match node.kind {
        NodeKind::Version => catalog
            .versions
            .iter()
            .find(|version| version.id.0 == node.id)
            .ok_or_else(|| EngineError::NotFound(node.to_string()))?
            .retired_at
            .is_some(),
        NodeKind::Migration | NodeKind::Seed => {
            let unit = node
                .as_unit()
                .ok_or_else(|| EngineError::NotFound(node.to_string()))?;
            catalog.unit(unit)?.is_retired()
        }
    };
    if retired {
        return Err(EngineError::Validation(format!("{node} is retired")));
    }
    Ok(())
}

fn ensure_unique_name(
    catalog: &Catalog,
    kind: UnitKind,
    name: &str,
    except: Option<UnitId>,
) -> Result<(), EngineError> {
    let name = name.trim();
    let taken = catalog.units.values().any(|unit| {
        let unit_ref = unit.unit_ref();
        unit_ref.kind == kind
            && Some(unit_ref.id) != except
            && !unit.is_retired()
            && unit.name() == name
    });
    if taken {
        return Err(EngineError::Validation(format!(
            "a {} named `{name}` already exists",
            kind.as_str()
        )));
    }
    Ok(())
}

fn ensure_editable(unit: &Unit, touches_body: bool) -> Result<(), EngineError> {
    let unit_ref = unit.unit_ref();
    if unit.is_retired() {
        return Err(EngineError::Validation(format!("{unit_ref} is retired")));
    }
    match unit.status() {
        UnitStatus::Running => Err(EngineError::Validation(format!("{unit_ref} is running"))),
        UnitStatus::Completed if touches_body => Err(EngineError::Validation(format!(
            "{unit_ref} is completed; its body cannot change, register a new {} instead",
            unit_ref.kind.as_str()
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn join(nodes: &[NodeRef]) -> String {
    nodes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
