//! Migration and seed execution engine.
//!
//! [`MigrationService`] is built from an injected [`StateStore`], a
//! [`SchemaExecutor`] and an [`EngineConfig`]. Every operation takes the
//! calling actor; state-changing operations append an audit entry whether
//! or not they succeed.

use std::collections::BTreeMap;

use schemaflow_core::{
    Dependency, DependencyFilter, DependencyGraph, EngineError, SchemaExecutor, StateStore,
    Unit, UnitQuery, UnitRef, Version,
};

mod audit;
pub mod capability;
pub mod config;
mod lock;
pub mod memory;
mod registry;
pub mod report;
pub mod runner;
pub mod scripted;
pub mod transfer;
pub mod validator;
pub mod versions;

pub use capability::{AllowAll, CapabilityCheck, Operation, ReadOnly};
pub use config::EngineConfig;
pub use memory::MemoryStateStore;
pub use registry::DeleteOutcome;
pub use report::{ExecutionStats, Report, StatusCounts, Statistics, UnitStatusView, UnitSummary};
pub use runner::{RollbackPolicy, RunPolicy, RunReport, RunStatus, RunTarget, StepReport};
pub use scripted::ScriptedExecutor;
pub use transfer::{
    BundleBody, BundleMetadata, BundledDependency, ExportOptions, ImportAction, ImportOptions,
    ImportReport, UnitBundle, EXPORT_FORMAT,
};
pub use validator::{
    CheckKind, CheckResult, TestOptions, TestReport, ValidateOptions, ValidationReport,
};
pub use versions::VersionQuery;

pub struct MigrationService<'a> {
    store: &'a dyn StateStore,
    executor: &'a dyn SchemaExecutor,
    config: EngineConfig,
}

impl<'a> MigrationService<'a> {
    /// # Errors
    /// Returns [`EngineError::Validation`] when `config` is invalid.
    pub fn new(
        store: &'a dyn StateStore,
        executor: &'a dyn SchemaExecutor,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            store,
            executor,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn load_unit(&self, unit: UnitRef) -> Result<Unit, EngineError> {
        self.store
            .get_unit(unit)?
            .ok_or_else(|| EngineError::NotFound(unit.to_string()))
    }

    fn load_catalog(&self) -> Result<Catalog, EngineError> {
        let everything = UnitQuery::everything();
        let mut units = BTreeMap::new();
        for migration in self.store.list_migrations(&everything)? {
            units.insert(migration.unit_ref(), Unit::Migration(migration));
        }
        for seed in self.store.list_seeds(&everything)? {
            units.insert(seed.unit_ref(), Unit::Seed(seed));
        }
        let versions = self.store.list_versions(true)?;
        let dependencies = self.store.list_dependencies(&DependencyFilter::default())?;

        let nodes = units
            .values()
            .map(Unit::graph_node)
            .chain(versions.iter().map(Version::graph_node));
        let graph = DependencyGraph::from_parts(nodes, dependencies.iter());
        Ok(Catalog {
            units,
            versions,
            dependencies,
            graph,
        })
    }
}

/// Snapshot of every definition and edge, with the graph built over them.
pub(crate) struct Catalog {
    units: BTreeMap<UnitRef, Unit>,
    versions: Vec<Version>,
    dependencies: Vec<Dependency>,
    graph: DependencyGraph,
}

impl Catalog {
    fn unit(&self, unit: UnitRef) -> Result<&Unit, EngineError> {
        self.units
            .get(&unit)
            .ok_or_else(|| EngineError::NotFound(unit.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testkit;
