//! Portable unit bundles for moving migrations and seeds between environments.
//!
//! Dependencies travel by unit name, since ids are local to one state store.

use schemaflow_core::script::analyze;
use schemaflow_core::{
    Actor, AuditAction, DependencyInput, EngineError, Migration, MigrationInput, MigrationPatch,
    NodeRef, Seed, SeedInput, SeedPatch, Unit, UnitId, UnitKind, UnitRef, UnitStatus,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::audit::AuditScope;
use crate::{Catalog, MigrationService};

pub const EXPORT_FORMAT: &str = "schemaflow.unit.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "definition", rename_all = "snake_case")]
pub enum BundleBody {
    Migration(MigrationInput),
    Seed(SeedInput),
}

impl BundleBody {
    #[must_use]
    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Migration(_) => UnitKind::Migration,
            Self::Seed(_) => UnitKind::Seed,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Migration(input) => &input.name,
            Self::Seed(input) => &input.name,
        }
    }

    #[must_use]
    pub fn checksum(&self) -> String {
        match self {
            Self::Migration(input) => input.checksum(),
            Self::Seed(input) => input.checksum(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BundledDependency {
    pub kind: UnitKind,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BundleMetadata {
    pub id: UnitId,
    pub status: UnitStatus,
    pub created_by: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitBundle {
    pub format: String,
    pub checksum: String,
    pub body: BundleBody,
    #[serde(default)]
    pub dependencies: Vec<BundledDependency>,
    #[serde(default)]
    pub metadata: Option<BundleMetadata>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ExportOptions {
    pub include_dependencies: bool,
    pub include_metadata: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_dependencies: true,
            include_metadata: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ImportOptions {
    pub validate_before_import: bool,
    pub overwrite_existing: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            validate_before_import: true,
            overwrite_existing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ImportAction {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ImportReport {
    pub unit: UnitRef,
    pub name: String,
    pub action: ImportAction,
    pub checksum: String,
    pub dependencies_added: usize,
}

impl MigrationService<'_> {
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown migration.
    pub fn export_migration(
        &self,
        id: UnitId,
        options: &ExportOptions,
    ) -> Result<UnitBundle, EngineError> {
        self.export_unit(UnitRef::migration(id), options)
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown seed.
    pub fn export_seed(
        &self,
        id: UnitId,
        options: &ExportOptions,
    ) -> Result<UnitBundle, EngineError> {
        self.export_unit(UnitRef::seed(id), options)
    }

    fn export_unit(
        &self,
        unit: UnitRef,
        options: &ExportOptions,
    ) -> Result<UnitBundle, EngineError> {
        let catalog = self.load_catalog()?;
        let found = catalog.unit(unit)?;
        let (body, checksum, metadata) = match found {
            Unit::Migration(migration) => (
                BundleBody::Migration(MigrationInput::from(migration)),
                migration.checksum.clone(),
                metadata_of_migration(migration),
            ),
            Unit::Seed(seed) => (
                BundleBody::Seed(SeedInput::from(seed)),
                seed.checksum.clone(),
                metadata_of_seed(seed),
            ),
        };

        let mut dependencies = Vec::new();
        if options.include_dependencies {
            for prerequisite in catalog.graph.prerequisites(NodeRef::from(unit)) {
                let Some(prerequisite) = prerequisite.as_unit() else {
                    continue;
                };
                let target = catalog.unit(prerequisite)?;
                dependencies.push(BundledDependency {
                    kind: prerequisite.kind,
                    name: target.name().to_string(),
                });
            }
        }
        tracing::debug!(unit = %unit, dependencies = dependencies.len(), "unit exported");
        Ok(UnitBundle {
            format: EXPORT_FORMAT.to_string(),
            checksum,
            body,
            dependencies,
            metadata: options.include_metadata.then_some(metadata),
        })
    }

    /// # Errors
    /// See [`MigrationService::import_bundle`].
    pub fn import_migration(
        &self,
        bundle: &UnitBundle,
        options: &ImportOptions,
        actor: &Actor,
    ) -> Result<ImportReport, EngineError> {
        expect_kind(bundle, UnitKind::Migration)?;
        self.import_bundle(bundle, options, actor)
    }

    /// # Errors
    /// See [`MigrationService::import_bundle`].
    pub fn import_seed(
        &self,
        bundle: &UnitBundle,
        options: &ImportOptions,
        actor: &Actor,
    ) -> Result<ImportReport, EngineError> {
        expect_kind(bundle, UnitKind::Seed)?;
        self.import_bundle(bundle, options, actor)
    }

    /// Registers the bundled unit, or updates the live unit of the same name
    /// when `overwrite_existing` is set.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for an unknown format, a checksum
    /// mismatch, a malformed definition or an existing unit without
    /// `overwrite_existing`, and [`EngineError::NotFound`] when a bundled
    /// dependency has no live unit of that name.
    pub fn import_bundle(
        &self,
        bundle: &UnitBundle,
        options: &ImportOptions,
        actor: &Actor,
    ) -> Result<ImportReport, EngineError> {
        let kind = bundle.body.kind();
        let entry = AuditScope::new(AuditAction::Import, kind);
        self.audited(actor, entry, |audit| {
            if bundle.format != EXPORT_FORMAT {
                return Err(EngineError::Validation(format!(
                    "unsupported bundle format `{}`; expected `{EXPORT_FORMAT}`",
                    bundle.format
                )));
            }
            audit.note("name", bundle.body.name());
            audit.note("checksum", &bundle.checksum);
            if options.validate_before_import {
                verify_bundle(bundle)?;
            }

            let catalog = self.load_catalog()?;
            let depends_on = bundle
                .dependencies
                .iter()
                .map(|dependency| {
                    live_named(&catalog, dependency.kind, &dependency.name)
                        .map(Unit::unit_ref)
                        .ok_or_else(|| {
                            EngineError::NotFound(format!(
                                "{} named `{}`",
                                dependency.kind.as_str(),
                                dependency.name
                            ))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let existing = live_named(&catalog, kind, bundle.body.name()).cloned();
            let report = match existing {
                None => self.import_new(bundle, depends_on, actor)?,
                Some(_) if !options.overwrite_existing => {
                    return Err(EngineError::Validation(format!(
                        "a {} named `{}` already exists; set overwrite_existing to replace it",
                        kind.as_str(),
                        bundle.body.name()
                    )));
                }
                Some(current) => self.import_over(&catalog, &current, bundle, &depends_on, actor)?,
            };
            audit.resource_id = Some(report.unit.id.to_string());
            audit.note("action", report.action);
            tracing::info!(unit = %report.unit, action = ?report.action, "unit imported");
            Ok(report)
        })
    }

    fn import_new(
        &self,
        bundle: &UnitBundle,
        depends_on: Vec<UnitRef>,
        actor: &Actor,
    ) -> Result<ImportReport, EngineError> {
        let dependencies_added = depends_on.len();
        let (unit, name, checksum) = match &bundle.body {
            BundleBody::Migration(input) => {
                let mut input = input.clone();
                input.depends_on = depends_on;
                let created = self.create_migration(input, actor)?;
                (created.unit_ref(), created.name, created.checksum)
            }
            BundleBody::Seed(input) => {
                let mut input = input.clone();
                input.depends_on = depends_on;
                let created = self.create_seed(input, actor)?;
                (created.unit_ref(), created.name, created.checksum)
            }
        };
        Ok(ImportReport {
            unit,
            name,
            action: ImportAction::Created,
            checksum,
            dependencies_added,
        })
    }

    fn import_over(
        &self,
        catalog: &Catalog,
        current: &Unit,
        bundle: &UnitBundle,
        depends_on: &[UnitRef],
        actor: &Actor,
    ) -> Result<ImportReport, EngineError> {
        let unit = current.unit_ref();
        let mut changed = false;
        let checksum = match (&bundle.body, current) {
            (BundleBody::Migration(input), Unit::Migration(existing)) => {
                let patch = migration_patch(input, existing);
                if patch == MigrationPatch::default() {
                    existing.checksum.clone()
                } else {
                    changed = true;
                    self.update_migration(existing.id, &patch, actor)?.checksum
                }
            }
            (BundleBody::Seed(input), Unit::Seed(existing)) => {
                let patch = seed_patch(input, existing);
                if patch == SeedPatch::default() {
                    existing.checksum.clone()
                } else {
                    changed = true;
                    self.update_seed(existing.id, &patch, actor)?.checksum
                }
            }
            _ => {
                return Err(EngineError::Validation(format!(
                    "{unit} does not match the bundle kind"
                )))
            }
        };

        let present = catalog.graph.prerequisites(NodeRef::from(unit));
        let mut dependencies_added = 0;
        for target in depends_on {
            if present.contains(&NodeRef::from(*target)) {
                continue;
            }
            self.add_dependency(DependencyInput::requires(unit, *target), actor)?;
            dependencies_added += 1;
        }

        let action = if changed || dependencies_added > 0 {
            ImportAction::Updated
        } else {
            ImportAction::Unchanged
        };
        Ok(ImportReport {
            unit,
            name: current.name().to_string(),
            action,
            checksum,
            dependencies_added,
        })
    }
}

fn expect_kind(bundle: &UnitBundle, kind: UnitKind) -> Result<(), EngineError> {
    if bundle.body.kind() == kind {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "bundle holds a {}, not a {}",
            bundle.body.kind().as_str(),
            kind.as_str()
        )))
    }
}

fn verify_bundle(bundle: &UnitBundle) -> Result<(), EngineError> {
    match &bundle.body {
        BundleBody::Migration(input) => {
            input.validate()?;
            let scripts = [
                Some(("forward", input.forward_script.as_str())),
                input.reverse_script.as_deref().map(|script| ("reverse", script)),
            ];
            for (label, script) in scripts.into_iter().flatten() {
                if let Some(issue) = analyze(script).issues.first() {
                    return Err(EngineError::Validation(format!(
                        "{label} script line {}: {}",
                        issue.line, issue.message
                    )));
                }
            }
        }
        BundleBody::Seed(input) => input.validate()?,
    }
    let computed = bundle.body.checksum();
    if computed != bundle.checksum {
        return Err(EngineError::Validation(format!(
            "bundle checksum mismatch: declared {}, computed {computed}",
            bundle.checksum
        )));
    }
    Ok(())
}

fn live_named<'c>(catalog: &'c Catalog, kind: UnitKind, name: &str) -> Option<&'c Unit> {
    catalog.units.values().find(|unit| {
        unit.unit_ref().kind == kind && !unit.is_retired() && unit.name() == name.trim()
    })
}

fn metadata_of_migration(migration: &Migration) -> BundleMetadata {
    BundleMetadata {
        id: migration.id,
        status: migration.status,
        created_by: migration.created_by.clone(),
        created_at: migration.created_at,
        updated_at: migration.updated_at,
    }
}

fn metadata_of_seed(seed: &Seed) -> BundleMetadata {
    BundleMetadata {
        id: seed.id,
        status: seed.status,
        created_by: seed.created_by.clone(),
        created_at: seed.created_at,
        updated_at: seed.updated_at,
    }
}

fn changed<T: PartialEq + Clone>(incoming: &T, current: &T) -> Option<T> {
    (incoming != current).then(|| incoming.clone())
}

fn migration_patch(input: &MigrationInput, existing: &Migration) -> MigrationPatch {
    MigrationPatch {
        name: None,
        version: changed(&input.version, &existing.version),
        migration_type: changed(&input.migration_type, &existing.migration_type),
        description: input
            .description
            .as_ref()
            .filter(|description| existing.description.as_ref() != Some(*description))
            .cloned(),
        forward_script: changed(&input.forward_script, &existing.forward_script),
        reverse_script: input
            .reverse_script
            .as_ref()
            .filter(|script| existing.reverse_script.as_ref() != Some(*script))
            .cloned(),
        is_reversible: changed(&input.is_reversible, &existing.is_reversible),
        batch_size: input.batch_size.filter(|size| existing.batch_size != Some(*size)),
    }
}

fn seed_patch(input: &SeedInput, existing: &Seed) -> SeedPatch {
    SeedPatch {
        name: None,
        version: changed(&input.version, &existing.version),
        description: input
            .description
            .as_ref()
            .filter(|description| existing.description.as_ref() != Some(*description))
            .cloned(),
        target_table: changed(&input.target_table, &existing.target_table),
        data: changed(&input.data, &existing.data),
        match_conditions: changed(&input.match_conditions, &existing.match_conditions),
        update_existing: changed(&input.update_existing, &existing.update_existing),
        is_reversible: changed(&input.is_reversible, &existing.is_reversible),
        batch_size: input.batch_size.filter(|size| existing.batch_size != Some(*size)),
    }
}

#[cfg(test)]
mod tests {
    use schemaflow_core::query::AuditFilter;
    use schemaflow_core::DependencyFilter;

    use crate::testkit::{actor, migration_input, must, seed_input, Harness};

    use super::*;

    #[test]
    fn exported_migration_imports_into_a_fresh_store_with_dependencies() {
        let source = Harness::new();
        let service = source.service();
        let base = must(service.create_migration(migration_input("base", "1.0.0"), &actor()));
        let mut child_input = migration_input("child", "1.1.0");
        child_input.depends_on = vec![base.unit_ref()];
        let child = must(service.create_migration(child_input, &actor()));

        let base_bundle = must(service.export_migration(base.id, &ExportOptions::default()));
        let child_bundle = must(service.export_migration(child.id, &ExportOptions::default()));
        assert_eq!(child_bundle.dependencies.len(), 1);
        assert!(child_bundle.metadata.is_none());

        let target = Harness::new();
        let imported = target.service();
        let options = ImportOptions::default();
        assert!(matches!(
            imported.import_migration(&child_bundle, &options, &actor()),
            Err(EngineError::NotFound(_))
        ));
        let first = must(imported.import_migration(&base_bundle, &options, &actor()));
        assert_eq!(first.action, ImportAction::Created);
        let second = must(imported.import_migration(&child_bundle, &options, &actor()));
        assert_eq!(second.checksum, child.checksum);
        assert_eq!(second.dependencies_added, 1);
        assert_eq!(must(imported.list_dependencies(&DependencyFilter::default())).len(), 1);
    }

    #[test]
    fn tampered_bundle_fails_checksum_verification() {
        let harness = Harness::new();
        let service = harness.service();
        let seed = must(service.create_seed(seed_input("regions", "regions"), &actor()));
        let mut bundle = must(service.export_seed(seed.id, &ExportOptions::default()));
        if let BundleBody::Seed(input) = &mut bundle.body {
            input.name = "regions_copy".to_string();
            input.data.pop();
        }

        let target = Harness::new();
        let imported = target.service();
        assert!(matches!(
            imported.import_seed(&bundle, &ImportOptions::default(), &actor()),
            Err(EngineError::Validation(_))
        ));
        let trusting = ImportOptions {
            validate_before_import: false,
            overwrite_existing: false,
        };
        let report = must(imported.import_seed(&bundle, &trusting, &actor()));
        assert_ne!(report.checksum, bundle.checksum);

        let failures = must(imported.get_audit_log(&AuditFilter {
            action: Some(AuditAction::Import),
            succeeded: Some(false),
            ..AuditFilter::default()
        }));
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn overwrite_updates_in_place_or_reports_unchanged() {
        let harness = Harness::new();
        let service = harness.service();
        let migration = must(service.create_migration(migration_input("a", "1.0.0"), &actor()));
        let mut bundle = must(service.export_migration(migration.id, &ExportOptions::default()));

        assert!(matches!(
            service.import_migration(&bundle, &ImportOptions::default(), &actor()),
            Err(EngineError::Validation(_))
        ));
        let overwrite = ImportOptions {
            validate_before_import: true,
            overwrite_existing: true,
        };
        let unchanged = must(service.import_migration(&bundle, &overwrite, &actor()));
        assert_eq!(unchanged.action, ImportAction::Unchanged);
        assert_eq!(unchanged.unit, migration.unit_ref());

        if let BundleBody::Migration(input) = &mut bundle.body {
            input.description = Some("documented".to_string());
        }
        let updated = must(service.import_migration(&bundle, &overwrite, &actor()));
        assert_eq!(updated.action, ImportAction::Updated);
        assert_eq!(
            must(service.get_migration(migration.id)).description.as_deref(),
            Some("documented")
        );
    }

    #[test]
    fn bundle_kind_must_match_the_import_call() {
        let harness = Harness::new();
        let service = harness.service();
        let migration = must(service.create_migration(migration_input("a", "1.0.0"), &actor()));
        let bundle = must(service.export_migration(migration.id, &ExportOptions {
            include_dependencies: false,
            include_metadata: true,
        }));
        assert_eq!(bundle.metadata.as_ref().map(|meta| meta.id), Some(migration.id));
        assert!(matches!(
            service.import_seed(&bundle, &ImportOptions::default(), &actor()),
            Err(EngineError::Validation(_))
        ));
    }
}
