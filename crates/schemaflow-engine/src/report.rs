use std::fmt::Write as _;

use schemaflow_core::query::HistoryFilter;
use schemaflow_core::{
    now_utc, EngineError, ExecutionKind, ExecutionOutcome, ExecutionRecord, NodeRef, RunLock,
    Unit, UnitId, UnitRef, UnitStatus,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::MigrationService;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub rolled_back: usize,
    /// Retired units are counted here and not under their status.
    pub retired: usize,
}

impl StatusCounts {
    fn add(&mut self, unit: &Unit) {
        self.total += 1;
        if unit.is_retired() {
            self.retired += 1;
            return;
        }
        match unit.status() {
            UnitStatus::Pending => self.pending += 1,
            UnitStatus::Running => self.running += 1,
            UnitStatus::Completed => self.completed += 1,
            UnitStatus::Failed => self.failed += 1,
            UnitStatus::RolledBack => self.rolled_back += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExecutionStats {
    pub total: usize,
    pub applied: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub rolled_back: usize,
    pub rollback_failed: usize,
    pub interrupted: usize,
    pub dry_runs: usize,
    pub tests: usize,
    /// Mean duration of records that did work, i.e. excluding skipped and dry-run records.
    pub average_duration_ms: Option<u64>,
}

impl ExecutionStats {
    fn from_records(records: &[ExecutionRecord]) -> Self {
        let mut stats = Self {
            total: records.len(),
            ..Self::default()
        };
        let mut timed_total = 0_u64;
        let mut timed_count = 0_u64;
        for record in records {
            if record.dry_run {
                stats.dry_runs += 1;
            }
            if record.kind == ExecutionKind::Test {
                stats.tests += 1;
            }
            match record.outcome {
                ExecutionOutcome::Completed => stats.applied += 1,
                ExecutionOutcome::Failed => stats.failed += 1,
                ExecutionOutcome::TimedOut => stats.timed_out += 1,
                ExecutionOutcome::Skipped => stats.skipped += 1,
                ExecutionOutcome::RolledBack => stats.rolled_back += 1,
                ExecutionOutcome::RollbackFailed => stats.rollback_failed += 1,
                ExecutionOutcome::Interrupted => stats.interrupted += 1,
                ExecutionOutcome::Passed => {}
            }
            if !record.dry_run && record.outcome != ExecutionOutcome::Skipped {
                timed_total = timed_total.saturating_add(record.duration_ms);
                timed_count += 1;
            }
        }
        stats.average_duration_ms = (timed_count > 0).then(|| timed_total / timed_count);
        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Statistics {
    pub scope: String,
    pub migrations: StatusCounts,
    pub seeds: StatusCounts,
    pub versions: usize,
    pub dependencies: usize,
    pub executions: ExecutionStats,
    pub generated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnitSummary {
    pub unit: UnitRef,
    pub name: String,
    pub version: String,
    pub status: UnitStatus,
}

impl From<&Unit> for UnitSummary {
    fn from(unit: &Unit) -> Self {
        Self {
            unit: unit.unit_ref(),
            name: unit.name().to_string(),
            version: unit.version().to_string(),
            status: unit.status(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub statistics: Statistics,
    pub failed: Vec<UnitSummary>,
    pub pending: Vec<UnitSummary>,
    pub recent_history: Vec<ExecutionRecord>,
    pub run_lock: Option<RunLock>,
}

impl Report {
    /// Plain-text rendering for terminals.
    #[must_use]
    pub fn render_text(&self) -> String {
        let stats = &self.statistics;
        let mut out = String::new();
        let _ = writeln!(out, "scope: {}", stats.scope);
        for (label, counts) in [("migrations", &stats.migrations), ("seeds", &stats.seeds)] {
            let _ = writeln!(
                out,
                "{label}: total={} pending={} running={} completed={} failed={} rolled_back={} retired={}",
                counts.total,
                counts.pending,
                counts.running,
                counts.completed,
                counts.failed,
                counts.rolled_back,
                counts.retired
            );
        }
        let _ = writeln!(out, "versions: {} dependencies: {}", stats.versions, stats.dependencies);
        let executions = &stats.executions;
        let _ = writeln!(
            out,
            "executions: total={} applied={} failed={} timed_out={} skipped={} rolled_back={} avg_ms={}",
            executions.total,
            executions.applied,
            executions.failed,
            executions.timed_out,
            executions.skipped,
            executions.rolled_back,
            executions
                .average_duration_ms
                .map_or_else(|| "-".to_string(), |ms| ms.to_string())
        );
        if let Some(lock) = &self.run_lock {
            let _ = writeln!(out, "run lock: held by {} for run {}", lock.holder, lock.run_id);
        }
        for (label, units) in [("failed", &self.failed), ("pending", &self.pending)] {
            if units.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{label}:");
            for unit in units {
                let _ = writeln!(out, "  {} {} ({})", unit.unit, unit.name, unit.version);
            }
        }
        if !self.recent_history.is_empty() {
            let _ = writeln!(out, "recent history:");
            for record in &self.recent_history {
                let _ = writeln!(
                    out,
                    "  #{} {} {} {}{}",
                    record.seq,
                    record.unit,
                    record.kind.as_str(),
                    record.outcome.as_str(),
                    if record.dry_run { " (dry run)" } else { "" }
                );
            }
        }
        out
    }
}

/// Current state of one unit with its most recent execution and graph neighbours.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitStatusView {
    pub unit: UnitRef,
    pub name: String,
    pub version: String,
    pub status: UnitStatus,
    pub retired: bool,
    pub last_execution: Option<ExecutionRecord>,
    pub depends_on: Vec<NodeRef>,
    pub dependents: Vec<NodeRef>,
    pub conflicts_with: Vec<NodeRef>,
}

impl MigrationService<'_> {
    /// # Errors
    /// Returns [`EngineError::Store`] when the state store cannot be read.
    pub fn get_statistics(&self) -> Result<Statistics, EngineError> {
        let catalog = self.load_catalog()?;
        let mut migrations = StatusCounts::default();
        let mut seeds = StatusCounts::default();
        for unit in catalog.units.values() {
            match unit {
                Unit::Migration(_) => migrations.add(unit),
                Unit::Seed(_) => seeds.add(unit),
            }
        }
        let records = self.store.list_executions(&HistoryFilter::default())?;
        Ok(Statistics {
            scope: self.config.schema_scope.clone(),
            migrations,
            seeds,
            versions: catalog
                .versions
                .iter()
                .filter(|version| version.retired_at.is_none())
                .count(),
            dependencies: catalog.dependencies.len(),
            executions: ExecutionStats::from_records(&records),
            generated_at: now_utc(),
        })
    }

    /// Statistics plus the failed and pending units and the latest history.
    ///
    /// # Errors
    /// Returns [`EngineError::Store`] when the state store cannot be read.
    pub fn generate_report(&self, history_limit: Option<usize>) -> Result<Report, EngineError> {
        let statistics = self.get_statistics()?;
        let catalog = self.load_catalog()?;
        let live = catalog.units.values().filter(|unit| !unit.is_retired());
        let (failed, pending): (Vec<&Unit>, Vec<&Unit>) = live
            .filter(|unit| matches!(unit.status(), UnitStatus::Failed | UnitStatus::Pending))
            .partition(|unit| unit.status() == UnitStatus::Failed);
        let recent_history = self.store.list_executions(&HistoryFilter {
            limit: Some(history_limit.unwrap_or(self.config.history_page_limit)),
            ..HistoryFilter::default()
        })?;
        Ok(Report {
            statistics,
            failed: failed.into_iter().map(UnitSummary::from).collect(),
            pending: pending.into_iter().map(UnitSummary::from).collect(),
            recent_history,
            run_lock: self.store.current_run_lock(&self.config.schema_scope)?,
        })
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown migration.
    pub fn get_migration_status(&self, id: UnitId) -> Result<UnitStatusView, EngineError> {
        self.unit_status(UnitRef::migration(id))
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown seed.
    pub fn get_seed_status(&self, id: UnitId) -> Result<UnitStatusView, EngineError> {
        self.unit_status(UnitRef::seed(id))
    }

    fn unit_status(&self, unit: UnitRef) -> Result<UnitStatusView, EngineError> {
        let catalog = self.load_catalog()?;
        let found = catalog.unit(unit)?;
        let node = NodeRef::from(unit);
        let last_execution = self
            .store
            .list_executions(&HistoryFilter {
                limit: Some(1),
                ..HistoryFilter::for_unit(unit)
            })?
            .into_iter()
            .next();
        Ok(UnitStatusView {
            unit,
            name: found.name().to_string(),
            version: found.version().to_string(),
            status: found.status(),
            retired: found.is_retired(),
            last_execution,
            depends_on: catalog.graph.prerequisites(node),
            dependents: catalog.graph.dependents(node),
            conflicts_with: catalog.graph.conflicts_of(node),
        })
    }

    /// Execution records, newest first.
    ///
    /// # Errors
    /// Returns [`EngineError::Store`] when history cannot be read.
    pub fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<ExecutionRecord>, EngineError> {
        let mut filter = filter.clone();
        filter.limit.get_or_insert(self.config.history_page_limit);
        Ok(self.store.list_executions(&filter)?)
    }
}

#[cfg(test)]
mod tests {
    use schemaflow_core::DependencyInput;

    use crate::testkit::{actor, migration_input, must, seed_input, Harness};
    use crate::RunPolicy;

    use super::*;

    #[test]
    fn statistics_count_units_and_executions() {
        let harness = Harness::new();
        let service = harness.service();
        let a = must(service.create_migration(migration_input("a", "1.0.0"), &actor()));
        must(service.create_migration(migration_input("b", "1.0.0"), &actor()));
        let seed = must(service.create_seed(seed_input("regions", "regions"), &actor()));

        must(service.run_migration(a.id, &RunPolicy::default(), &actor()));
        must(service.run_migration(a.id, &RunPolicy::default(), &actor()));
        harness.force_status(seed.unit_ref(), UnitStatus::Failed);

        let stats = must(service.get_statistics());
        assert_eq!(stats.migrations.total, 2);
        assert_eq!(stats.migrations.completed, 1);
        assert_eq!(stats.migrations.pending, 1);
        assert_eq!(stats.seeds.failed, 1);
        assert_eq!(stats.executions.total, 2);
        assert_eq!(stats.executions.applied, 1);
        assert_eq!(stats.executions.skipped, 1);
        assert!(stats.executions.average_duration_ms.is_some());

        let report = must(service.generate_report(None));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.pending.len(), 1);
        assert_eq!(report.recent_history.len(), 2);
        assert!(report.run_lock.is_none());
        let text = report.render_text();
        assert!(text.contains("failed:"));
        assert!(text.contains("skipped"));
    }

    #[test]
    fn status_view_lists_neighbours_and_last_execution() {
        let harness = Harness::new();
        let service = harness.service();
        let a = must(service.create_migration(migration_input("a", "1.0.0"), &actor()));
        let mut b_input = migration_input("b", "1.0.0");
        b_input.depends_on = vec![a.unit_ref()];
        let b = must(service.create_migration(b_input, &actor()));
        let c = must(service.create_migration(migration_input("c", "1.0.0"), &actor()));
        let conflict = DependencyInput::conflicts(b.unit_ref(), c.unit_ref());
        must(service.add_dependency(conflict, &actor()));

        let view = must(service.get_migration_status(b.id));
        assert_eq!(view.depends_on, vec![NodeRef::from(a.unit_ref())]);
        assert_eq!(view.conflicts_with, vec![NodeRef::from(c.unit_ref())]);
        assert!(view.last_execution.is_none());

        must(service.run_migration(b.id, &RunPolicy::default(), &actor()));
        let view = must(service.get_migration_status(a.id));
        assert_eq!(view.status, UnitStatus::Completed);
        assert_eq!(view.dependents, vec![NodeRef::from(b.unit_ref())]);
        assert_eq!(
            view.last_execution.map(|record| record.outcome),
            Some(ExecutionOutcome::Completed)
        );
    }

    #[test]
    fn history_defaults_to_configured_page() {
        let harness = Harness::new();
        let service = harness.service_with(crate::EngineConfig {
            history_page_limit: 1,
            ..crate::EngineConfig::default()
        });
        let a = must(service.create_migration(migration_input("a", "1.0.0"), &actor()));
        must(service.run_migration(a.id, &RunPolicy::default(), &actor()));
        must(service.run_migration(a.id, &RunPolicy::default(), &actor()));

        let history = must(service.get_history(&HistoryFilter::default()));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, ExecutionOutcome::Skipped);
        let everything = must(service.get_history(&HistoryFilter {
            limit: Some(10),
            ..HistoryFilter::default()
        }));
        assert_eq!(everything.len(), 2);
    }
}
