//! Command surface for the meta database lifecycle tooling.
//!
//! The binary parses a [`Cli`] and hands it to [`run_cli`]. Hosts that
//! already hold a store can call [`run_command`] directly.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use meta_lifecycle_core::migration::DEFAULT_BATCH_SIZE;
use meta_lifecycle_core::validate::{
    DEFAULT_MAX_AVG_OBJECT_BYTES, DEFAULT_SHAPE_SAMPLE_SIZE, DEFAULT_STALE_AFTER_DAYS,
};
use meta_lifecycle_core::{
    format_rfc3339, CatalogReconcileReport, DocumentStore, IndexCatalog, IndexReconciler,
    IntegrityValidator, MigrationAbort, MigrationOutcome, MigrationPhase, MigrationRegistry,
    MigrationReport, MigrationRunner, MigrationState, MigrationStatus, RollbackPlan, RunnerConfig,
    ValidationReport, ValidatorConfig,
};
use meta_lifecycle_store_sqlite::SqliteDocumentStore;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const INDEX_RECONCILE_CONTRACT: &str = "index_reconcile.v1";
pub const MIGRATION_RUN_CONTRACT: &str = "migration_run.v1";
pub const MIGRATION_PENDING_CONTRACT: &str = "migration_pending.v1";
pub const MIGRATION_STATUS_CONTRACT: &str = "migration_status.v1";
pub const ROLLBACK_PLAN_CONTRACT: &str = "rollback_plan.v1";
pub const VALIDATION_REPORT_CONTRACT: &str = "validation_report.v1";

#[derive(Debug, Parser)]
#[command(name = "ga-meta")]
#[command(about = "Grand Archive meta database: indexes, migrations, integrity checks")]
pub struct Cli {
    /// `sqlite://<path>`, `sqlite::memory:`, or a plain file path.
    #[arg(long, env = "GA_META_DB", global = true)]
    db: Option<String>,

    /// Only log warnings and errors.
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn quiet(&self) -> bool {
        self.quiet
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the declared indexes that are missing.
    Indexes {
        #[command(subcommand)]
        command: IndexesCommand,
    },
    /// Run and inspect data migrations.
    Migrate {
        #[command(subcommand)]
        command: MigrateCommand,
    },
    /// Audit structure, references, and operational health.
    Validate(ValidateArgs),
}

#[derive(Debug, Subcommand)]
pub enum IndexesCommand {
    Apply(IndexesArgs),
    /// Report what `apply` would create without creating anything.
    Plan(IndexesArgs),
}

#[derive(Debug, Args)]
pub struct IndexesArgs {
    /// Restrict to one catalog collection.
    #[arg(long)]
    collection: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum MigrateCommand {
    /// Run one migration by name or identifier.
    Run(MigrateRunArgs),
    /// Run every migration not yet applied, in identifier order.
    Pending(MigratePendingArgs),
    Status(JsonArgs),
    /// Print the manual steps that undo a migration.
    RollbackPlan(RollbackPlanArgs),
}

#[derive(Debug, Args)]
pub struct MigrateRunArgs {
    name: String,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct MigratePendingArgs {
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RollbackPlanArgs {
    name: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[arg(long)]
    json: bool,
    /// Average document size, in bytes, above which a collection is flagged.
    #[arg(long, default_value_t = DEFAULT_MAX_AVG_OBJECT_BYTES)]
    max_avg_doc_bytes: f64,
    #[arg(long, default_value_t = DEFAULT_STALE_AFTER_DAYS)]
    stale_after_days: i64,
    #[arg(long, default_value_t = DEFAULT_SHAPE_SAMPLE_SIZE)]
    shape_sample_size: usize,
}

/// How a command ended; the binary maps this to its exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliOutcome {
    Success,
    /// The requested migration was already recorded.
    AlreadyApplied,
    Failed,
}

impl CliOutcome {
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::AlreadyApplied => 2,
        }
    }
}

/// Installs the stderr log subscriber. `RUST_LOG` wins unless `quiet` is set.
pub fn init_tracing(quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Executes the parsed command line.
///
/// # Errors
/// Returns an error when no connection string is given, the store cannot be
/// opened, or a command cannot run at all. Failed checks and aborted
/// migrations are reported through [`CliOutcome::Failed`] instead.
pub fn run_cli(cli: Cli) -> Result<CliOutcome> {
    match cli.command {
        Command::Migrate { command: MigrateCommand::RollbackPlan(args) } => {
            run_rollback_plan(&args)
        }
        command => {
            let Some(db) = cli.db else {
                return Err(anyhow!("a connection string is required: pass --db or set GA_META_DB"));
            };
            let store = SqliteDocumentStore::connect(&db)
                .with_context(|| format!("failed to open database {db:?}"))?;
            info!(database = store.label(), "connected");
            run_command(command, &store)
        }
    }
}

/// Executes one command against an open store.
///
/// # Errors
/// See [`run_cli`].
pub fn run_command(command: Command, store: &dyn DocumentStore) -> Result<CliOutcome> {
    match command {
        Command::Indexes { command } => run_indexes(command, store),
        Command::Migrate { command } => run_migrate(command, store),
        Command::Validate(args) => run_validate(&args, store),
    }
}

fn run_indexes(command: IndexesCommand, store: &dyn DocumentStore) -> Result<CliOutcome> {
    let (args, dry_run) = match command {
        IndexesCommand::Apply(args) => (args, false),
        IndexesCommand::Plan(args) => (args, true),
    };

    let catalog = match &args.collection {
        Some(collection) => IndexCatalog::standard().only(collection)?,
        None => IndexCatalog::standard(),
    };
    let reconciler = IndexReconciler::new(store);
    let report = if dry_run {
        reconciler.plan_catalog(&catalog)
    } else {
        reconciler.reconcile_catalog(&catalog)
    };

    if args.json {
        print_json(&Envelope { contract_version: INDEX_RECONCILE_CONTRACT, body: &report })?;
    } else {
        print_reconcile_report(&report, dry_run);
    }

    Ok(if report.is_clean() { CliOutcome::Success } else { CliOutcome::Failed })
}

fn run_migrate(command: MigrateCommand, store: &dyn DocumentStore) -> Result<CliOutcome> {
    let registry = MigrationRegistry::standard()?;
    match command {
        MigrateCommand::Run(args) => {
            let migration = lookup(&registry, &args.name)?;
            let runner = MigrationRunner::new(store)
                .with_config(RunnerConfig { batch_size: args.batch_size });
            let result = runner.run(migration);
            let name = migration.descriptor().name;

            if args.json {
                print_json(&MigrationRunPayload::from_result(name, &result))?;
            } else {
                match &result {
                    Ok(MigrationOutcome::Applied(report)) => print_migration_report(report),
                    Ok(MigrationOutcome::AlreadyApplied { name }) => {
                        println!("migration '{name}' has already been applied; nothing to do");
                    }
                    Err(abort) => print_abort(abort),
                }
            }

            Ok(match result {
                Ok(MigrationOutcome::Applied(_)) => CliOutcome::Success,
                Ok(MigrationOutcome::AlreadyApplied { .. }) => CliOutcome::AlreadyApplied,
                Err(_) => CliOutcome::Failed,
            })
        }
        MigrateCommand::Pending(args) => {
            let runner = MigrationRunner::new(store)
                .with_config(RunnerConfig { batch_size: args.batch_size });
            let run = registry.run_pending(&runner);

            let mut applied = Vec::new();
            let mut already_applied = Vec::new();
            for outcome in &run.outcomes {
                match outcome {
                    MigrationOutcome::Applied(report) => applied.push(report.record.name.as_str()),
                    MigrationOutcome::AlreadyApplied { name } => {
                        already_applied.push(name.as_str());
                    }
                }
            }

            if args.json {
                print_json(&MigrationPendingPayload {
                    contract_version: MIGRATION_PENDING_CONTRACT,
                    applied: &applied,
                    already_applied: &already_applied,
                    abort: run.abort.as_ref().map(AbortPayload::from),
                })?;
            } else {
                for outcome in &run.outcomes {
                    match outcome {
                        MigrationOutcome::Applied(report) => print_migration_report(report),
                        MigrationOutcome::AlreadyApplied { name } => {
                            println!("already applied: {name}");
                        }
                    }
                }
                if let Some(abort) = &run.abort {
                    print_abort(abort);
                } else if applied.is_empty() {
                    println!("no pending migrations");
                }
            }

            Ok(if run.abort.is_some() { CliOutcome::Failed } else { CliOutcome::Success })
        }
        MigrateCommand::Status(args) => {
            let statuses = registry.status(store).context("failed to read migration history")?;
            if args.json {
                print_json(&Envelope {
                    contract_version: MIGRATION_STATUS_CONTRACT,
                    body: &StatusList { migrations: &statuses },
                })?;
            } else {
                print_status_table(&statuses)?;
            }
            Ok(CliOutcome::Success)
        }
        MigrateCommand::RollbackPlan(args) => run_rollback_plan(&args),
    }
}

fn run_rollback_plan(args: &RollbackPlanArgs) -> Result<CliOutcome> {
    let registry = MigrationRegistry::standard()?;
    let plan = lookup(&registry, &args.name)?.rollback_plan();
    if args.json {
        print_json(&Envelope { contract_version: ROLLBACK_PLAN_CONTRACT, body: &plan })?;
    } else {
        print!("{plan}");
    }
    Ok(CliOutcome::Success)
}

fn run_validate(args: &ValidateArgs, store: &dyn DocumentStore) -> Result<CliOutcome> {
    if args.stale_after_days < 0 {
        return Err(anyhow!("--stale-after-days must be zero or more"));
    }
    if !args.max_avg_doc_bytes.is_finite() || args.max_avg_doc_bytes <= 0.0 {
        return Err(anyhow!("--max-avg-doc-bytes must be a positive number"));
    }

    let catalog = IndexCatalog::standard();
    let config = ValidatorConfig {
        max_avg_object_bytes: args.max_avg_doc_bytes,
        stale_after: time::Duration::days(args.stale_after_days),
        shape_sample_size: args.shape_sample_size,
        reference_time: None,
    };
    let report = IntegrityValidator::new(store, &catalog).with_config(config).validate();

    if args.json {
        print_json(&Envelope { contract_version: VALIDATION_REPORT_CONTRACT, body: &report })?;
    } else {
        print_validation_report(&report);
    }

    Ok(if report.is_success() { CliOutcome::Success } else { CliOutcome::Failed })
}

fn lookup<'r>(
    registry: &'r MigrationRegistry,
    name: &str,
) -> Result<&'r dyn meta_lifecycle_core::Migration> {
    registry.get(name).ok_or_else(|| {
        let known = registry
            .iter()
            .map(|migration| migration.descriptor().name)
            .collect::<Vec<_>>()
            .join(", ");
        anyhow!("unknown migration {name:?}; known migrations: {known}")
    })
}

/// Adds `contract_version` to a JSON document.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    contract_version: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Debug, Serialize)]
struct StatusList<'a> {
    migrations: &'a [MigrationStatus],
}

#[derive(Debug, Serialize)]
struct AbortPayload<'a> {
    migration: &'a str,
    phase: MigrationPhase,
    state: &'a MigrationState,
    error: String,
    rollback: &'a RollbackPlan,
}

impl<'a> From<&'a MigrationAbort> for AbortPayload<'a> {
    fn from(abort: &'a MigrationAbort) -> Self {
        Self {
            migration: &abort.migration,
            phase: abort.phase,
            state: &abort.state,
            error: abort.error.to_string(),
            rollback: &abort.rollback,
        }
    }
}

#[derive(Debug, Serialize)]
struct MigrationRunPayload<'a> {
    contract_version: &'static str,
    migration: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a MigrationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    abort: Option<AbortPayload<'a>>,
}

impl<'a> MigrationRunPayload<'a> {
    fn from_result(
        migration: &'a str,
        result: &'a Result<MigrationOutcome, MigrationAbort>,
    ) -> Self {
        let (status, report, abort) = match result {
            Ok(MigrationOutcome::Applied(report)) => ("applied", Some(&**report), None),
            Ok(MigrationOutcome::AlreadyApplied { .. }) => ("already_applied", None, None),
            Err(abort) => ("aborted", None, Some(AbortPayload::from(abort))),
        };
        Self { contract_version: MIGRATION_RUN_CONTRACT, migration, status, report, abort }
    }
}

#[derive(Debug, Serialize)]
struct MigrationPendingPayload<'a> {
    contract_version: &'static str,
    applied: &'a [&'a str],
    already_applied: &'a [&'a str],
    abort: Option<AbortPayload<'a>>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_reconcile_report(report: &CatalogReconcileReport, dry_run: bool) {
    let verb = if dry_run { "to_create" } else { "created" };
    println!(
        "{:<24} {:<9} {:<8} {:<9} {:<8} notes",
        "collection", verb, "present", "conflicts", "failures"
    );
    println!("{}", "-".repeat(80));
    for collection in &report.collections {
        println!(
            "{:<24} {:<9} {:<8} {:<9} {:<8} {}",
            collection.collection,
            collection.created.len(),
            collection.already_present.len(),
            collection.conflicts.len(),
            collection.failures.len(),
            if collection.collection_missing { "collection missing" } else { "" }
        );
    }
    for conflict in report.conflicts() {
        println!("conflict: {conflict}");
    }
    for collection in &report.collections {
        for failure in &collection.failures {
            println!("failure: {} on {}: {}", failure.name, collection.collection, failure.error);
        }
    }
    for (collection, error) in &report.errors {
        println!("error: {collection}: {error}");
    }
    println!(
        "{verb}={} already_present={} clean={}",
        report.created(),
        report.already_present(),
        if report.is_clean() { "yes" } else { "no" }
    );
}

fn print_migration_report(report: &MigrationReport) {
    println!(
        "applied {} v{} run_id={} updated={} batches={}",
        report.record.name,
        report.record.version,
        report.record.run_id,
        report.transform.updated,
        report.transform.batches
    );
    for (key, value) in &report.record.statistics {
        println!("  {key}={value}");
    }
    for warning in &report.post_validation.warnings {
        println!("warning: {warning}");
    }
}

fn print_abort(abort: &MigrationAbort) {
    eprintln!("error: {abort}");
    eprintln!("state at abort: {}", abort.state);
    print!("{}", abort.rollback);
}

fn print_status_table(statuses: &[MigrationStatus]) -> Result<()> {
    println!("{:<44} {:<8} applied_at", "migration", "version");
    println!("{}", "-".repeat(80));
    for status in statuses {
        let applied_at = match &status.applied {
            Some(record) => format_rfc3339(record.applied_at)?,
            None => "pending".to_string(),
        };
        println!("{:<44} {:<8} {}", status.id, status.version, applied_at);
    }
    Ok(())
}

fn print_validation_report(report: &ValidationReport) {
    for test in &report.tests {
        match (&test.message, test.passed) {
            (_, true) => println!("PASS {}", test.name),
            (Some(message), false) => println!("FAIL {}: {message}", test.name),
            (None, false) => println!("FAIL {}", test.name),
        }
    }
    for skipped in &report.skipped {
        println!("SKIP {} ({})", skipped.test, skipped.reason);
    }
    for warning in &report.warning_messages {
        println!("WARN {warning}");
    }
    for stats in &report.collections {
        println!(
            "stats {}: {} document(s), avg {:.2} KB",
            stats.collection,
            stats.count,
            stats.avg_obj_size_bytes / 1024.0
        );
    }
    println!(
        "passed={} failed={} warnings={} skipped={}",
        report.passed,
        report.failed,
        report.warnings,
        report.skipped.len()
    );
}
