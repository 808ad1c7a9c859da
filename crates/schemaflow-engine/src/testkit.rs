use schemaflow_core::{
    now_utc, Actor, MigrationInput, MigrationType, SeedInput, SeedRow, StateStore, UnitRef,
    UnitStatus,
};
use serde_json::json;

use crate::{EngineConfig, MemoryStateStore, MigrationService, ScriptedExecutor};

pub(crate) struct Harness {
    pub(crate) store: MemoryStateStore,
    pub(crate) executor: ScriptedExecutor,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self {
            store: MemoryStateStore::new(),
            executor: ScriptedExecutor::new(),
        }
    }

    pub(crate) fn service(&self) -> MigrationService<'_> {
        self.service_with(EngineConfig::default())
    }

    pub(crate) fn service_with(&self, config: EngineConfig) -> MigrationService<'_> {
        must(MigrationService::new(&self.store, &self.executor, config))
    }

    pub(crate) fn force_status(&self, unit: UnitRef, status: UnitStatus) {
        if let Err(err) = self.store.set_unit_status(unit, status, now_utc()) {
            panic!("test failure: {err:#}");
        }
    }
}

pub(crate) fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

pub(crate) fn actor() -> Actor {
    Actor::new("tester").with_source("unit-test")
}

pub(crate) fn migration_input(name: &str, version: &str) -> MigrationInput {
    MigrationInput {
        name: name.to_string(),
        version: version.to_string(),
        migration_type: MigrationType::Schema,
        description: None,
        forward_script: format!("CREATE TABLE {name} (id INTEGER PRIMARY KEY);"),
        reverse_script: Some(format!("DROP TABLE {name};")),
        is_reversible: true,
        batch_size: None,
        depends_on: Vec::new(),
    }
}

pub(crate) fn seed_row(id: i64, label: &str) -> SeedRow {
    let mut row = SeedRow::new();
    row.insert("id".to_string(), json!(id));
    row.insert("label".to_string(), json!(label));
    row
}

pub(crate) fn seed_input(name: &str, table: &str) -> SeedInput {
    SeedInput {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        description: None,
        target_table: table.to_string(),
        data: vec![seed_row(1, "alpha"), seed_row(2, "beta")],
        match_conditions: vec!["id".to_string()],
        update_existing: false,
        is_reversible: true,
        batch_size: None,
        depends_on: Vec::new(),
    }
}
