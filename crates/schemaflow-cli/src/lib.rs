//! `sfm`: command surface over the migration and seed engine.
//!
//! State lives in the `--db` `SQLite` file; scripts and seeds are applied to
//! the `--target` database. Every command prints pretty JSON on stdout except
//! `report` without `--json`. Logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use schemaflow_core::{
    Actor, AuditAction, AuditFilter, DependencyFilter, DependencyId, DependencyInput,
    DependencyType, ExecutionKind, ExecutionOutcome, HistoryFilter, MigrationInput,
    MigrationPatch, MigrationType, NodeRef, Page, ResourceType, RunId, SeedInput, SeedPatch,
    SortDirection, SortField, SortSpec, UnitId, UnitKind, UnitQuery, UnitRef, UnitStatus,
    StateStore, VersionId, VersionInput, VersionPatch,
};
use schemaflow_engine::{
    AllowAll, CapabilityCheck, EngineConfig, ExportOptions, ImportOptions, MigrationService,
    Operation, ReadOnly, RollbackPolicy, RunPolicy, RunReport, RunTarget, TestOptions, UnitBundle,
    ValidateOptions, VersionQuery,
};
use schemaflow_store_sqlite::{SqliteSchemaExecutor, SqliteStateStore};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "sfm")]
#[command(about = "SchemaFlow migration and seed engine")]
pub struct Cli {
    /// Engine state database.
    #[arg(long, env = "SCHEMAFLOW_DB", default_value = "./schemaflow.sqlite3")]
    db: PathBuf,

    /// Database the scripts and seeds are applied to.
    #[arg(long, env = "SCHEMAFLOW_TARGET", default_value = "./target.sqlite3")]
    target: PathBuf,

    #[arg(long, env = "SCHEMAFLOW_ACTOR", default_value = "sfm")]
    actor: String,

    #[arg(long, default_value = "cli")]
    source: String,

    /// JSON engine config; absent fields keep their defaults.
    #[arg(long, env = "SCHEMAFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for pre-run and test backups of the target.
    #[arg(long, env = "SCHEMAFLOW_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Reject every command that could change state or the target schema.
    #[arg(long)]
    read_only: bool,

    #[arg(long, value_enum, env = "SCHEMAFLOW_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migration {
        #[command(subcommand)]
        command: Box<UnitCommand>,
    },
    Seed {
        #[command(subcommand)]
        command: Box<UnitCommand>,
    },
    Version {
        #[command(subcommand)]
        command: Box<VersionCommand>,
    },
    Dependency {
        #[command(subcommand)]
        command: Box<DependencyCommand>,
    },
    History(HistoryArgs),
    Audit(AuditArgs),
    Report(ReportArgs),
    Stats,
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
}

/// Commands shared by migrations and seeds.
#[derive(Debug, Subcommand)]
pub enum UnitCommand {
    Create(FileArgs),
    List(ListArgs),
    Get(IdArgs),
    Update(UpdateArgs),
    Delete(DeleteArgs),
    Run(RunArgs),
    Rollback(RollbackArgs),
    Validate(ValidateArgs),
    Test(TestArgs),
    Export(ExportArgs),
    Import(ImportArgs),
    Status(IdArgs),
}

#[derive(Debug, Args)]
pub struct FileArgs {
    /// JSON definition.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    id: String,
    /// JSON patch; omitted fields stay unchanged.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    #[arg(long)]
    id: String,
    /// Retire the unit even when other units or versions still reference it.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
pub struct FilterArgs {
    #[arg(long)]
    version: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    name_contains: Option<String>,
    /// Migration type; migrations only.
    #[arg(long = "type")]
    migration_type: Option<String>,
    /// Target table; seeds only.
    #[arg(long)]
    table: Option<String>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long)]
    include_retired: bool,
    #[arg(long, value_enum, default_value_t = SortFieldArg::Version)]
    sort: SortFieldArg,
    #[arg(long)]
    desc: bool,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Debug, Args)]
pub struct PolicyArgs {
    /// Re-execute completed units and skip pulling in prerequisites.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    rollback_on_failure: bool,
    #[arg(long)]
    timeout_seconds: Option<u64>,
    #[arg(long)]
    batch_size: Option<u32>,
}

impl PolicyArgs {
    fn policy(&self) -> RunPolicy {
        RunPolicy {
            force: self.force,
            dry_run: self.dry_run,
            rollback_on_failure: self.rollback_on_failure,
            timeout_seconds: self.timeout_seconds,
            batch_size: self.batch_size,
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Units to run; every unit matching the filters when omitted.
    #[arg(long = "id")]
    ids: Vec<String>,
    #[command(flatten)]
    filter: FilterArgs,
    #[command(flatten)]
    policy: PolicyArgs,
}

#[derive(Debug, Args)]
pub struct RollbackPolicyArgs {
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    timeout_seconds: Option<u64>,
    #[arg(long)]
    batch_size: Option<u32>,
}

impl RollbackPolicyArgs {
    fn policy(&self) -> RollbackPolicy {
        RollbackPolicy {
            dry_run: self.dry_run,
            timeout_seconds: self.timeout_seconds,
            batch_size: self.batch_size,
        }
    }
}

#[derive(Debug, Args)]
pub struct RollbackArgs {
    #[arg(long = "id")]
    ids: Vec<String>,
    #[command(flatten)]
    filter: FilterArgs,
    #[command(flatten)]
    policy: RollbackPolicyArgs,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    skip_syntax: bool,
    #[arg(long)]
    skip_dependencies: bool,
    #[arg(long)]
    skip_conflicts: bool,
}

#[derive(Debug, Args)]
pub struct TestArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    no_backup: bool,
    /// Leave the forward effects in place after the test.
    #[arg(long)]
    no_restore: bool,
    #[arg(long)]
    skip_reverse: bool,
    #[arg(long)]
    timeout_seconds: Option<u64>,
    #[arg(long)]
    batch_size: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    no_dependencies: bool,
    #[arg(long)]
    include_metadata: bool,
    /// Write the bundle here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    no_validate: bool,
}

#[derive(Debug, Subcommand)]
pub enum VersionCommand {
    Create(FileArgs),
    List(VersionListArgs),
    Get(VersionGetArgs),
    Update(UpdateArgs),
    Delete(DeleteArgs),
    Run(VersionRunArgs),
    Rollback(VersionRollbackArgs),
    Dependencies(IdArgs),
    /// Live versions in dependency order.
    Order,
}

#[derive(Debug, Args)]
pub struct VersionListArgs {
    #[arg(long)]
    exclude_completed: bool,
    #[arg(long)]
    exclude_failed: bool,
    #[arg(long)]
    include_retired: bool,
}

#[derive(Debug, Args)]
pub struct VersionGetArgs {
    #[arg(long, conflicts_with = "label", required_unless_present = "label")]
    id: Option<String>,
    #[arg(long)]
    label: Option<String>,
}

#[derive(Debug, Args)]
pub struct VersionRunArgs {
    #[arg(long)]
    label: String,
    #[command(flatten)]
    policy: PolicyArgs,
}

#[derive(Debug, Args)]
pub struct VersionRollbackArgs {
    #[arg(long)]
    label: String,
    #[command(flatten)]
    policy: RollbackPolicyArgs,
}

#[derive(Debug, Subcommand)]
pub enum DependencyCommand {
    Add(DependencyAddArgs),
    Remove(IdArgs),
    List(DependencyListArgs),
}

#[derive(Debug, Args)]
pub struct DependencyAddArgs {
    /// `<kind>:<id>` of the dependent node.
    #[arg(long)]
    source: String,
    #[arg(long)]
    target: String,
    #[arg(long = "type", value_enum, default_value_t = DependencyTypeArg::Requires)]
    dependency_type: DependencyTypeArg,
}

#[derive(Debug, Args)]
pub struct DependencyListArgs {
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    target: Option<String>,
    #[arg(long = "type", value_enum)]
    dependency_type: Option<DependencyTypeArg>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// `migration:<id>` or `seed:<id>`.
    #[arg(long)]
    unit: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    outcome: Option<String>,
    #[arg(long)]
    dry_run: Option<bool>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    /// Actor name to filter on.
    #[arg(long)]
    by: Option<String>,
    #[arg(long)]
    action: Option<String>,
    #[arg(long)]
    resource_type: Option<String>,
    #[arg(long)]
    resource_id: Option<String>,
    #[arg(long)]
    succeeded: Option<bool>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[arg(long)]
    history_limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum LockCommand {
    Show,
    /// Clear the run lock left behind by a crashed run.
    Release {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SortFieldArg {
    Version,
    Name,
    CreatedAt,
    UpdatedAt,
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DependencyTypeArg {
    Requires,
    ConflictsWith,
}

impl Command {
    /// Capability the command needs before it touches the store.
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::Migration { command } | Self::Seed { command } => command.operation(),
            Self::Version { command } => command.operation(),
            Self::Dependency { command } => match command.as_ref() {
                DependencyCommand::List(_) => Operation::Read,
                DependencyCommand::Add(_) | DependencyCommand::Remove(_) => {
                    Operation::ManageDependencies
                }
            },
            Self::History(_) | Self::Audit(_) | Self::Report(_) | Self::Stats => Operation::Read,
            Self::Lock { command } => match command {
                LockCommand::Show => Operation::Read,
                LockCommand::Release { .. } => Operation::ManageLocks,
            },
        }
    }
}

impl UnitCommand {
    fn operation(&self) -> Operation {
        match self {
            Self::Create(_) => Operation::Create,
            Self::List(_) | Self::Get(_) | Self::Status(_) => Operation::Read,
            Self::Update(_) => Operation::Update,
            Self::Delete(_) => Operation::Delete,
            Self::Run(args) if args.policy.dry_run => Operation::Validate,
            Self::Run(_) => Operation::Run,
            Self::Rollback(args) if args.policy.dry_run => Operation::Validate,
            Self::Rollback(_) => Operation::Rollback,
            Self::Validate(_) => Operation::Validate,
            Self::Test(_) => Operation::Test,
            Self::Export(_) => Operation::Export,
            Self::Import(_) => Operation::Import,
        }
    }
}

impl VersionCommand {
    fn operation(&self) -> Operation {
        match self {
            Self::Create(_) => Operation::Create,
            Self::List(_) | Self::Get(_) | Self::Dependencies(_) | Self::Order => Operation::Read,
            Self::Update(_) => Operation::Update,
            Self::Delete(_) => Operation::Delete,
            Self::Run(args) if args.policy.dry_run => Operation::Validate,
            Self::Run(_) => Operation::Run,
            Self::Rollback(args) if args.policy.dry_run => Operation::Validate,
            Self::Rollback(_) => Operation::Rollback,
        }
    }
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when the actor is refused, a store or target database
/// cannot be opened, the command fails, or a run finishes unsuccessfully.
pub fn run_cli(cli: Cli) -> Result<()> {
    let actor = Actor::new(cli.actor).with_source(cli.source);
    actor.validate()?;
    let capability: Box<dyn CapabilityCheck> = if cli.read_only {
        Box::new(ReadOnly)
    } else {
        Box::new(AllowAll)
    };
    capability.authorize(&actor, cli.command.operation())?;

    let config = match cli.config.as_deref() {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let store = SqliteStateStore::open(&cli.db)?;
    store.migrate()?;
    let mut executor = SqliteSchemaExecutor::open(&cli.target)?;
    if let Some(dir) = cli.backup_dir {
        executor = executor.with_backup_dir(dir);
    }
    let service = MigrationService::new(&store, &executor, config)?;
    tracing::debug!(
        db = %cli.db.display(),
        target = %cli.target.display(),
        actor = %actor.name,
        "dispatching command"
    );

    run_command(cli.command, &service, &actor)
}

/// Executes one command against an already-built service.
///
/// # Errors
/// Returns an error when the command fails or a run finishes unsuccessfully.
pub fn run_command(command: Command, service: &MigrationService<'_>, actor: &Actor) -> Result<()> {
    match command {
        Command::Migration { command } => run_unit(UnitKind::Migration, *command, service, actor),
        Command::Seed { command } => run_unit(UnitKind::Seed, *command, service, actor),
        Command::Version { command } => run_version(*command, service, actor),
        Command::Dependency { command } => run_dependency(*command, service, actor),
        Command::History(args) => {
            let filter = HistoryFilter {
                unit: args.unit.as_deref().map(UnitRef::parse).transpose()?,
                run_id: args.run_id.as_deref().map(RunId::parse).transpose()?,
                kind: args
                    .kind
                    .as_deref()
                    .map(|raw| parse_choice("kind", raw, ExecutionKind::parse))
                    .transpose()?,
                outcome: args
                    .outcome
                    .as_deref()
                    .map(|raw| parse_choice("outcome", raw, ExecutionOutcome::parse))
                    .transpose()?,
                dry_run: args.dry_run,
                limit: args.limit,
            };
            print_json(&service.get_history(&filter)?)
        }
        Command::Audit(args) => {
            let filter = AuditFilter {
                actor: args.by,
                action: args
                    .action
                    .as_deref()
                    .map(|raw| parse_choice("action", raw, AuditAction::parse))
                    .transpose()?,
                resource_type: args
                    .resource_type
                    .as_deref()
                    .map(|raw| parse_choice("resource-type", raw, ResourceType::parse))
                    .transpose()?,
                resource_id: args.resource_id,
                succeeded: args.succeeded,
                limit: args.limit,
            };
            print_json(&service.get_audit_log(&filter)?)
        }
        Command::Report(args) => {
            let report = service.generate_report(args.history_limit)?;
            if args.json {
                print_json(&report)
            } else {
                print!("{}", report.render_text());
                Ok(())
            }
        }
        Command::Stats => print_json(&service.get_statistics()?),
        Command::Lock { command } => match command {
            LockCommand::Show => print_json(&service.current_run_lock()?),
            LockCommand::Release { force } => {
                print_json(&service.release_run_lock(force, actor)?)
            }
        },
    }
}

fn run_unit(
    kind: UnitKind,
    command: UnitCommand,
    service: &MigrationService<'_>,
    actor: &Actor,
) -> Result<()> {
    match command {
        UnitCommand::Create(args) => match kind {
            UnitKind::Migration => {
                let input: MigrationInput = read_json(&args.file)?;
                print_json(&service.create_migration(input, actor)?)
            }
            UnitKind::Seed => {
                let input: SeedInput = read_json(&args.file)?;
                print_json(&service.create_seed(input, actor)?)
            }
        },
        UnitCommand::List(args) => {
            let query = list_query(&args)?;
            match kind {
                UnitKind::Migration => print_json(&service.get_migrations(&query)?),
                UnitKind::Seed => print_json(&service.get_seeds(&query)?),
            }
        }
        UnitCommand::Get(args) => {
            let id = UnitId::parse(&args.id)?;
            match kind {
                UnitKind::Migration => print_json(&service.get_migration(id)?),
                UnitKind::Seed => print_json(&service.get_seed(id)?),
            }
        }
        UnitCommand::Update(args) => {
            let id = UnitId::parse(&args.id)?;
            match kind {
                UnitKind::Migration => {
                    let patch: MigrationPatch = read_json(&args.file)?;
                    print_json(&service.update_migration(id, &patch, actor)?)
                }
                UnitKind::Seed => {
                    let patch: SeedPatch = read_json(&args.file)?;
                    print_json(&service.update_seed(id, &patch, actor)?)
                }
            }
        }
        UnitCommand::Delete(args) => {
            let id = UnitId::parse(&args.id)?;
            let outcome = match kind {
                UnitKind::Migration => service.delete_migration(id, args.force, actor)?,
                UnitKind::Seed => service.delete_seed(id, args.force, actor)?,
            };
            print_json(&serde_json::json!({ "id": id, "outcome": outcome }))
        }
        UnitCommand::Run(args) => {
            let target = run_target(kind, &args.ids, &args.filter)?;
            finish_run(&service.run(&target, &args.policy.policy(), actor)?)
        }
        UnitCommand::Rollback(args) => {
            let target = run_target(kind, &args.ids, &args.filter)?;
            finish_run(&service.rollback(&target, &args.policy.policy(), actor)?)
        }
        UnitCommand::Validate(args) => {
            let unit = unit_ref(kind, &args.id)?;
            let options = ValidateOptions {
                check_syntax: !args.skip_syntax,
                check_dependencies: !args.skip_dependencies,
                check_conflicts: !args.skip_conflicts,
            };
            let report = service.validate_unit(unit, &options, actor)?;
            print_json(&report)?;
            if report.valid {
                Ok(())
            } else {
                Err(anyhow!("{unit} failed validation"))
            }
        }
        UnitCommand::Test(args) => {
            let unit = unit_ref(kind, &args.id)?;
            let options = TestOptions {
                backup_before_test: !args.no_backup,
                restore_after_test: !args.no_restore,
                verify_reverse: !args.skip_reverse,
                timeout_seconds: args.timeout_seconds,
                batch_size: args.batch_size,
            };
            let report = service.test_unit(unit, &options, actor)?;
            print_json(&report)?;
            if report.passed() {
                Ok(())
            } else {
                Err(anyhow!(
                    "test of {unit} failed: {}",
                    report.step.error.as_deref().unwrap_or("unknown error")
                ))
            }
        }
        UnitCommand::Export(args) => {
            let id = UnitId::parse(&args.id)?;
            let options = ExportOptions {
                include_dependencies: !args.no_dependencies,
                include_metadata: args.include_metadata,
            };
            let bundle = match kind {
                UnitKind::Migration => service.export_migration(id, &options)?,
                UnitKind::Seed => service.export_seed(id, &options)?,
            };
            match args.output {
                Some(path) => {
                    let raw = serde_json::to_string_pretty(&bundle)?;
                    std::fs::write(&path, raw)
                        .with_context(|| format!("failed to write bundle {}", path.display()))?;
                    print_json(&serde_json::json!({
                        "written": path.display().to_string(),
                        "checksum": bundle.checksum,
                    }))
                }
                None => print_json(&bundle),
            }
        }
        UnitCommand::Import(args) => {
            let bundle: UnitBundle = read_json(&args.file)?;
            let options = ImportOptions {
                validate_before_import: !args.no_validate,
                overwrite_existing: args.overwrite,
            };
            let report = match kind {
                UnitKind::Migration => service.import_migration(&bundle, &options, actor)?,
                UnitKind::Seed => service.import_seed(&bundle, &options, actor)?,
            };
            print_json(&report)
        }
        UnitCommand::Status(args) => {
            let id = UnitId::parse(&args.id)?;
            match kind {
                UnitKind::Migration => print_json(&service.get_migration_status(id)?),
                UnitKind::Seed => print_json(&service.get_seed_status(id)?),
            }
        }
    }
}

fn run_version(
    command: VersionCommand,
    service: &MigrationService<'_>,
    actor: &Actor,
) -> Result<()> {
    match command {
        VersionCommand::Create(args) => {
            let input: VersionInput = read_json(&args.file)?;
            print_json(&service.create_version(input, actor)?)
        }
        VersionCommand::List(args) => {
            let query = VersionQuery {
                include_completed: !args.exclude_completed,
                include_failed: !args.exclude_failed,
                include_retired: args.include_retired,
            };
            print_json(&service.get_versions(&query)?)
        }
        VersionCommand::Get(args) => match (args.id, args.label) {
            (Some(id), _) => print_json(&service.get_version(VersionId::parse(&id)?)?),
            (None, Some(label)) => print_json(&service.find_version(&label)?),
            (None, None) => Err(anyhow!("either --id or --label is required")),
        },
        VersionCommand::Update(args) => {
            let patch: VersionPatch = read_json(&args.file)?;
            print_json(&service.update_version(VersionId::parse(&args.id)?, &patch, actor)?)
        }
        VersionCommand::Delete(args) => {
            let id = VersionId::parse(&args.id)?;
            let outcome = service.delete_version(id, args.force, actor)?;
            print_json(&serde_json::json!({ "id": id, "outcome": outcome }))
        }
        VersionCommand::Run(args) => {
            finish_run(&service.run_version(&args.label, &args.policy.policy(), actor)?)
        }
        VersionCommand::Rollback(args) => {
            let target = RunTarget::Version(args.label);
            finish_run(&service.rollback(&target, &args.policy.policy(), actor)?)
        }
        VersionCommand::Dependencies(args) => {
            print_json(&service.version_dependencies(VersionId::parse(&args.id)?)?)
        }
        VersionCommand::Order => print_json(&service.version_order()?),
    }
}

fn run_dependency(
    command: DependencyCommand,
    service: &MigrationService<'_>,
    actor: &Actor,
) -> Result<()> {
    match command {
        DependencyCommand::Add(args) => {
            let input = DependencyInput {
                source: NodeRef::parse(&args.source)?,
                target: NodeRef::parse(&args.target)?,
                dependency_type: map_dependency_type(args.dependency_type),
            };
            print_json(&service.add_dependency(input, actor)?)
        }
        DependencyCommand::Remove(args) => {
            print_json(&service.remove_dependency(DependencyId::parse(&args.id)?, actor)?)
        }
        DependencyCommand::List(args) => {
            let filter = DependencyFilter {
                source: args.source.as_deref().map(NodeRef::parse).transpose()?,
                target: args.target.as_deref().map(NodeRef::parse).transpose()?,
                dependency_type: args.dependency_type.map(map_dependency_type),
            };
            print_json(&service.list_dependencies(&filter)?)
        }
    }
}

/// Prints the report, then fails unless the run succeeded.
fn finish_run(report: &RunReport) -> Result<()> {
    print_json(report)?;
    report.clone().into_result()?;
    Ok(())
}

fn run_target(kind: UnitKind, ids: &[String], filter: &FilterArgs) -> Result<RunTarget> {
    if !ids.is_empty() {
        let units = ids
            .iter()
            .map(|raw| unit_ref(kind, raw))
            .collect::<Result<Vec<_>>>()?;
        return Ok(RunTarget::Units(units));
    }
    let query = filter_query(filter)?;
    Ok(match kind {
        UnitKind::Migration => RunTarget::Migrations(query),
        UnitKind::Seed => RunTarget::Seeds(query),
    })
}

fn unit_ref(kind: UnitKind, raw: &str) -> Result<UnitRef> {
    let id = UnitId::parse(raw)?;
    Ok(match kind {
        UnitKind::Migration => UnitRef::migration(id),
        UnitKind::Seed => UnitRef::seed(id),
    })
}

fn filter_query(filter: &FilterArgs) -> Result<UnitQuery> {
    Ok(UnitQuery {
        version: filter.version.clone(),
        migration_type: filter
            .migration_type
            .as_deref()
            .map(|raw| parse_choice("type", raw, MigrationType::parse))
            .transpose()?,
        status: filter
            .status
            .as_deref()
            .map(|raw| parse_choice("status", raw, UnitStatus::parse))
            .transpose()?,
        name_contains: filter.name_contains.clone(),
        target_table: filter.table.clone(),
        ..UnitQuery::default()
    })
}

fn list_query(args: &ListArgs) -> Result<UnitQuery> {
    let mut query = filter_query(&args.filter)?;
    query.include_retired = args.include_retired;
    query.sort = SortSpec {
        field: map_sort_field(args.sort),
        direction: if args.desc {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        },
    };
    if args.limit.is_some() || args.offset > 0 {
        query.page = Some(Page {
            limit: args.limit.unwrap_or(Page::default().limit),
            offset: args.offset,
        });
    }
    Ok(query)
}

fn parse_choice<T>(flag: &str, raw: &str, parse: fn(&str) -> Option<T>) -> Result<T> {
    parse(raw.trim()).ok_or_else(|| anyhow!("invalid --{flag} value `{raw}`"))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn map_sort_field(value: SortFieldArg) -> SortField {
    match value {
        SortFieldArg::Version => SortField::Version,
        SortFieldArg::Name => SortField::Name,
        SortFieldArg::CreatedAt => SortField::CreatedAt,
        SortFieldArg::UpdatedAt => SortField::UpdatedAt,
        SortFieldArg::Status => SortField::Status,
    }
}

fn map_dependency_type(value: DependencyTypeArg) -> DependencyType {
    match value {
        DependencyTypeArg::Requires => DependencyType::Requires,
        DependencyTypeArg::ConflictsWith => DependencyType::ConflictsWith,
    }
}
