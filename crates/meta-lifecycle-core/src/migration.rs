//! Guarded, recorded, one-way data migrations.
//!
//! A run goes through five phases in order: guard check, prerequisite
//! checks, batched transformation plus index creation, post-validation, and
//! recording. Nothing is recorded unless every earlier phase succeeded, and a
//! failure returns the migration's manual rollback plan instead.

use std::fmt::{Display, Formatter};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::history::{MigrationHistory, MigrationRecord, RecordOutcome, MIGRATIONS_COLLECTION};
use crate::index::IndexSpec;
use crate::reconcile::{IndexConflict, IndexFailure, IndexReconciler, ReconcileReport};
use crate::store::{DocumentStore, StoreError};

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationDescriptor {
    /// `YYYY-MM-DD-<name>`; orders migrations.
    pub id: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub reversible: bool,
    pub estimated_duration: &'static str,
    pub prerequisites: &'static [&'static str],
}

/// One versioned data transformation.
///
/// `transform` must be idempotent: every write is scoped by the migration's
/// completion predicate so a re-run touches only documents still unmigrated.
pub trait Migration {
    fn descriptor(&self) -> &MigrationDescriptor;

    /// Store failures convert into [`MigrationError::TransformationFailure`]
    /// through `?`.
    ///
    /// # Errors
    /// Any error aborts the run.
    fn transform(
        &self,
        store: &dyn DocumentStore,
        ctx: &mut TransformContext<'_>,
    ) -> Result<TransformSummary, MigrationError>;

    /// Indexes created after the transformation.
    fn indexes(&self) -> Vec<IndexSpec>;

    /// # Errors
    /// Any store failure aborts the run.
    fn post_validate(&self, store: &dyn DocumentStore) -> Result<PostValidation, StoreError>;

    fn rollback_plan(&self) -> RollbackPlan;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    NotStarted,
    GuardChecked,
    PrerequisitesVerified,
    Transforming { batch: usize, of: usize },
    Validated,
    Recorded,
    Aborted { reason: String },
}

impl MigrationState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Recorded | Self::Aborted { .. })
    }

    /// Moves to `next` if the transition is legal.
    ///
    /// # Errors
    /// Returns [`MigrationError::IllegalTransition`] otherwise; the state is
    /// left unchanged.
    pub fn advance(&mut self, next: MigrationState) -> Result<(), MigrationError> {
        let legal = match (&*self, &next) {
            (Self::NotStarted, Self::GuardChecked)
            | (Self::GuardChecked, Self::PrerequisitesVerified)
            | (Self::PrerequisitesVerified, Self::Transforming { batch: 0, .. })
            | (Self::Transforming { .. }, Self::Validated)
            | (Self::Validated, Self::Recorded) => true,
            (
                Self::Transforming { batch, of },
                Self::Transforming { batch: next_batch, of: next_of },
            ) => {
                of == next_of && *next_batch == batch + 1 && next_batch <= next_of
            }
            (current, Self::Aborted { .. }) => !current.is_terminal(),
            _ => false,
        };

        if !legal {
            return Err(MigrationError::IllegalTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl Display for MigrationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::GuardChecked => f.write_str("guard checked"),
            Self::PrerequisitesVerified => f.write_str("prerequisites verified"),
            Self::Transforming { batch, of } => write!(f, "transforming (batch {batch} of {of})"),
            Self::Validated => f.write_str("validated"),
            Self::Recorded => f.write_str("recorded"),
            Self::Aborted { reason } => write!(f, "aborted: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    GuardCheck,
    PreChecks,
    Transformation,
    IndexCreation,
    PostValidation,
    Record,
}

impl Display for MigrationPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::GuardCheck => "guard check",
            Self::PreChecks => "pre-checks",
            Self::Transformation => "transformation",
            Self::IndexCreation => "index creation",
            Self::PostValidation => "post-validation",
            Self::Record => "record",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum MigrationError {
    #[error("missing prerequisite collections: {}", .missing.join(", "))]
    PrerequisiteMissing { missing: Vec<String> },
    #[error("transformation failed: {source}")]
    TransformationFailure {
        #[from]
        source: StoreError,
    },
    #[error("{} index conflict(s): {}", .conflicts.len(), join_display(.conflicts))]
    IndexConflict { conflicts: Vec<IndexConflict> },
    #[error("{} index(es) could not be created: {}", .failures.len(), join_failures(.failures))]
    IndexCreation { failures: Vec<IndexFailure> },
    #[error("store error during {phase}: {source}")]
    Store { phase: MigrationPhase, source: StoreError },
    #[error("illegal state transition from '{from}' to '{to}'")]
    IllegalTransition { from: String, to: String },
}

fn join_display<T: Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

fn join_failures(failures: &[IndexFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.name, failure.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A failed run: what went wrong, where, and how to undo partial work.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("migration '{migration}' aborted during {phase}: {error}")]
pub struct MigrationAbort {
    pub migration: String,
    pub phase: MigrationPhase,
    /// The state the run was in when it failed.
    pub state: MigrationState,
    pub error: MigrationError,
    pub rollback: RollbackPlan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RollbackStep {
    UnsetField { collection: String, field: String },
    DropIndex { collection: String, name: String },
    DeleteHistoryRecord { name: String },
}

impl Display for RollbackStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsetField { collection, field } => {
                write!(f, "unset '{field}' on every document in '{collection}'")
            }
            Self::DropIndex { collection, name } => {
                write!(f, "drop index '{name}' on '{collection}'")
            }
            Self::DeleteHistoryRecord { name } => {
                write!(f, "delete the '{name}' record from '{MIGRATIONS_COLLECTION}'")
            }
        }
    }
}

/// Ordered manual steps that undo one migration. Printed, never executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackPlan {
    pub migration: String,
    pub steps: Vec<RollbackStep>,
}

impl RollbackPlan {
    /// Undo for a migration that added fields and indexes: unset the fields,
    /// drop the indexes, forget the record.
    #[must_use]
    pub fn for_added_fields(
        migration: &str,
        collection: &str,
        fields: &[&str],
        indexes: &[IndexSpec],
    ) -> Self {
        let mut steps: Vec<RollbackStep> = fields
            .iter()
            .map(|field| RollbackStep::UnsetField {
                collection: collection.to_string(),
                field: (*field).to_string(),
            })
            .collect();
        steps.extend(indexes.iter().map(|index| RollbackStep::DropIndex {
            collection: index.collection.clone(),
            name: index.name().to_string(),
        }));
        steps.push(RollbackStep::DeleteHistoryRecord { name: migration.to_string() });
        Self { migration: migration.to_string(), steps }
    }
}

impl Display for RollbackPlan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Rollback plan for '{}':", self.migration)?;
        for (position, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {}. {step}", position + 1)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransformSummary {
    pub driving_keys: usize,
    pub batches: usize,
    /// Documents modified by this run.
    pub updated: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostValidation {
    pub satisfied: u64,
    pub unsatisfied: u64,
    /// Migration-specific counters persisted in the history record.
    pub statistics: Map<String, Value>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub migration: String,
    pub batch: usize,
    pub batches: usize,
    pub processed: usize,
    pub total: usize,
    pub updated: u64,
}

/// Handed to [`Migration::transform`]; tracks batches and reports progress.
pub struct TransformContext<'a> {
    migration: &'a str,
    batch_size: usize,
    state: &'a mut MigrationState,
    progress: &'a mut dyn FnMut(&BatchProgress),
}

impl<'a> TransformContext<'a> {
    fn new(
        migration: &'a str,
        batch_size: usize,
        state: &'a mut MigrationState,
        progress: &'a mut dyn FnMut(&BatchProgress),
    ) -> Self {
        Self { migration, batch_size: batch_size.max(1), state, progress }
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Announces `total` driving keys and returns the number of batches.
    ///
    /// # Errors
    /// Returns [`MigrationError::IllegalTransition`] if called twice in one
    /// run.
    pub fn begin(&mut self, total: usize) -> Result<usize, MigrationError> {
        let batches = total.div_ceil(self.batch_size);
        self.state.advance(MigrationState::Transforming { batch: 0, of: batches })?;
        info!(migration = self.migration, total, batches, "transformation started");
        Ok(batches)
    }

    /// Marks the next batch complete and reports cumulative progress.
    ///
    /// # Errors
    /// Returns [`MigrationError::IllegalTransition`] when no batches were
    /// announced or more batches are reported than were announced.
    pub fn complete_batch(
        &mut self,
        processed: usize,
        total: usize,
        updated: u64,
    ) -> Result<(), MigrationError> {
        let MigrationState::Transforming { batch, of } = *self.state else {
            return Err(MigrationError::IllegalTransition {
                from: self.state.to_string(),
                to: "next batch".to_string(),
            });
        };
        self.state.advance(MigrationState::Transforming { batch: batch + 1, of })?;

        let progress = BatchProgress {
            migration: self.migration.to_string(),
            batch: batch + 1,
            batches: of,
            processed,
            total,
            updated,
        };
        info!(
            migration = self.migration,
            batch = progress.batch,
            batches = progress.batches,
            processed,
            total,
            updated,
            "batch complete"
        );
        (self.progress)(&progress);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub batch_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub record: MigrationRecord,
    pub transform: TransformSummary,
    pub post_validation: PostValidation,
    pub indexes: Vec<ReconcileReport>,
    pub state: MigrationState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    Applied(Box<MigrationReport>),
    AlreadyApplied { name: String },
}

pub struct MigrationRunner<'a> {
    store: &'a dyn DocumentStore,
    config: RunnerConfig,
}

impl<'a> MigrationRunner<'a> {
    #[must_use]
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store, config: RunnerConfig::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs one migration through every phase.
    ///
    /// # Errors
    /// Returns a [`MigrationAbort`] carrying the rollback plan when any phase
    /// fails. No history is written in that case.
    pub fn run(&self, migration: &dyn Migration) -> Result<MigrationOutcome, MigrationAbort> {
        self.run_with_progress(migration, &mut |_| {})
    }

    /// Like [`MigrationRunner::run`], calling `progress` after every batch.
    ///
    /// # Errors
    /// See [`MigrationRunner::run`].
    pub fn run_with_progress(
        &self,
        migration: &dyn Migration,
        progress: &mut dyn FnMut(&BatchProgress),
    ) -> Result<MigrationOutcome, MigrationAbort> {
        let descriptor = migration.descriptor();
        let history = MigrationHistory::new(self.store);
        let run_id = Ulid::new();
        let mut state = MigrationState::NotStarted;
        let abort = |state: &mut MigrationState, phase: MigrationPhase, error: MigrationError| {
            abort_run(migration, state, phase, error)
        };

        info!(
            migration = descriptor.name,
            version = descriptor.version,
            %run_id,
            "migration starting"
        );

        // Phase 1: guard.
        match history.has_applied(descriptor.name) {
            Ok(true) => {
                info!(migration = descriptor.name, "migration already applied; nothing to do");
                return Ok(MigrationOutcome::AlreadyApplied { name: descriptor.name.to_string() });
            }
            Ok(false) => {}
            Err(source) => {
                return Err(abort(
                    &mut state,
                    MigrationPhase::GuardCheck,
                    MigrationError::Store { phase: MigrationPhase::GuardCheck, source },
                ))
            }
        }
        step(&mut state, MigrationState::GuardChecked, migration)?;

        // Phase 2: prerequisites.
        let mut missing = Vec::new();
        for collection in descriptor.prerequisites {
            match self.store.collection_exists(collection) {
                Ok(true) => {}
                Ok(false) => missing.push((*collection).to_string()),
                Err(source) => {
                    return Err(abort(
                        &mut state,
                        MigrationPhase::PreChecks,
                        MigrationError::Store { phase: MigrationPhase::PreChecks, source },
                    ))
                }
            }
        }
        if !missing.is_empty() {
            return Err(abort(
                &mut state,
                MigrationPhase::PreChecks,
                MigrationError::PrerequisiteMissing { missing },
            ));
        }
        step(&mut state, MigrationState::PrerequisitesVerified, migration)?;

        // Phase 3: transformation, then indexes.
        let transform = {
            let mut ctx = TransformContext::new(
                descriptor.name,
                self.config.batch_size,
                &mut state,
                progress,
            );
            migration.transform(self.store, &mut ctx)
        };
        let transform = match transform {
            Ok(summary) => summary,
            Err(error) => return Err(abort(&mut state, MigrationPhase::Transformation, error)),
        };
        if state == MigrationState::PrerequisitesVerified {
            // the migration never announced its driving keys
            step(&mut state, MigrationState::Transforming { batch: 0, of: 0 }, migration)?;
        }

        let indexes = match self.create_indexes(&migration.indexes()) {
            Ok(reports) => reports,
            Err(error) => return Err(abort(&mut state, MigrationPhase::IndexCreation, error)),
        };

        // Phase 4: post-validation.
        let mut post_validation = match migration.post_validate(self.store) {
            Ok(post_validation) => post_validation,
            Err(source) => {
                return Err(abort(
                    &mut state,
                    MigrationPhase::PostValidation,
                    MigrationError::Store { phase: MigrationPhase::PostValidation, source },
                ))
            }
        };
        for message in &post_validation.warnings {
            warn!(migration = descriptor.name, "{message}");
        }
        let indexes_created: usize = indexes
            .iter()
            .map(|report| report.created.len() + report.already_present.len())
            .sum();
        post_validation
            .statistics
            .insert("indexesCreated".to_string(), Value::from(indexes_created));
        post_validation
            .statistics
            .insert("updatedThisRun".to_string(), Value::from(transform.updated));
        step(&mut state, MigrationState::Validated, migration)?;

        // Phase 5: record.
        let record = MigrationRecord {
            name: descriptor.name.to_string(),
            version: descriptor.version.to_string(),
            description: descriptor.description.to_string(),
            reversible: descriptor.reversible,
            applied_at: crate::now_utc(),
            estimated_duration: Some(descriptor.estimated_duration.to_string()),
            run_id,
            statistics: post_validation.statistics.clone(),
        };
        match history.record(&record) {
            Ok(RecordOutcome::Recorded) => {}
            Ok(RecordOutcome::AlreadyRecorded) => {
                return Ok(MigrationOutcome::AlreadyApplied { name: descriptor.name.to_string() });
            }
            Err(source) => {
                return Err(abort(
                    &mut state,
                    MigrationPhase::Record,
                    MigrationError::Store { phase: MigrationPhase::Record, source },
                ))
            }
        }
        step(&mut state, MigrationState::Recorded, migration)?;

        info!(
            migration = descriptor.name,
            updated = transform.updated,
            unsatisfied = post_validation.unsatisfied,
            "migration recorded"
        );

        Ok(MigrationOutcome::Applied(Box::new(MigrationReport {
            record,
            transform,
            post_validation,
            indexes,
            state,
        })))
    }

    fn create_indexes(&self, specs: &[IndexSpec]) -> Result<Vec<ReconcileReport>, MigrationError> {
        let mut collections: Vec<&str> = Vec::new();
        for spec in specs {
            if !collections.contains(&spec.collection.as_str()) {
                collections.push(&spec.collection);
            }
        }

        let reconciler = IndexReconciler::new(self.store);
        let mut reports = Vec::new();
        for collection in collections {
            let owned: Vec<IndexSpec> = specs
                .iter()
                .filter(|spec| spec.collection == collection)
                .cloned()
                .collect();
            let report = reconciler
                .reconcile(collection, &owned)
                .map_err(|source| MigrationError::Store {
                    phase: MigrationPhase::IndexCreation,
                    source,
                })?;
            reports.push(report);
        }

        let conflicts: Vec<IndexConflict> =
            reports.iter().flat_map(|report| report.conflicts.iter().cloned()).collect();
        if !conflicts.is_empty() {
            return Err(MigrationError::IndexConflict { conflicts });
        }
        let failures: Vec<IndexFailure> =
            reports.iter().flat_map(|report| report.failures.iter().cloned()).collect();
        if !failures.is_empty() {
            return Err(MigrationError::IndexCreation { failures });
        }
        if let Some(report) = reports.iter().find(|report| report.collection_missing) {
            return Err(MigrationError::Store {
                phase: MigrationPhase::IndexCreation,
                source: StoreError::CollectionMissing(report.collection.clone()),
            });
        }
        Ok(reports)
    }
}

fn step(
    state: &mut MigrationState,
    next: MigrationState,
    migration: &dyn Migration,
) -> Result<(), MigrationAbort> {
    let phase = match next {
        MigrationState::GuardChecked => MigrationPhase::GuardCheck,
        MigrationState::PrerequisitesVerified => MigrationPhase::PreChecks,
        MigrationState::Transforming { .. } => MigrationPhase::Transformation,
        MigrationState::Validated => MigrationPhase::PostValidation,
        _ => MigrationPhase::Record,
    };
    state
        .advance(next)
        .map_err(|error| abort_run(migration, state, phase, error))
}

fn abort_run(
    migration: &dyn Migration,
    state: &mut MigrationState,
    phase: MigrationPhase,
    error: MigrationError,
) -> MigrationAbort {
    let name = migration.descriptor().name;
    error!(migration = name, %phase, state = %state, error = %error, "migration aborted");
    let reached = state.clone();
    // advance only fails from a terminal state, and none is reachable here
    let _ = state.advance(MigrationState::Aborted { reason: error.to_string() });
    MigrationAbort {
        migration: name.to_string(),
        phase,
        state: reached,
        error,
        rollback: migration.rollback_plan(),
    }
}
