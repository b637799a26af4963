//! Schema and data lifecycle engine for the Grand Archive meta document store.
//!
//! The crate is store-agnostic: everything here talks to the database through
//! the [`DocumentStore`] port. The SQLite adapter lives in
//! `meta-lifecycle-store-sqlite`, the operator surface in `meta-lifecycle-cli`.
//!
//! - [`catalog`]: the declarative index catalog.
//! - [`reconcile`]: applies catalog entries idempotently.
//! - [`history`] and [`migration`]: recorded, guarded, one-way migrations.
//! - [`validate`]: read-only integrity and health audit.

pub mod catalog;
pub mod history;
pub mod index;
pub mod migration;
pub mod migrations;
pub mod model;
pub mod reconcile;
pub mod store;
pub mod validate;

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

pub use catalog::{CollectionIndexes, IndexCatalog};
pub use history::{MigrationHistory, MigrationRecord, RecordOutcome, MIGRATIONS_COLLECTION};
pub use index::{Direction, IndexKey, IndexOptions, IndexSpec, PRIMARY_INDEX_NAME};
pub use migration::{
    BatchProgress, Migration, MigrationAbort, MigrationDescriptor, MigrationError,
    MigrationOutcome, MigrationPhase, MigrationReport, MigrationRunner, MigrationState,
    PostValidation, RollbackPlan, RollbackStep, RunnerConfig, TransformContext,
    TransformSummary,
};
pub use migrations::{MigrationRegistry, MigrationStatus, PendingRun};
pub use reconcile::{
    CatalogReconcileReport, IndexConflict, IndexFailure, IndexReconciler, ReconcileReport,
};
pub use store::{
    CollectionStats, DatabaseStats, DocumentStore, FieldAgreement, Filter, ForeignKey,
    IndexUsage, StoreError, Update,
};
pub use validate::{
    CheckFamily, CollectionIndexUsage, FailedTest, IntegrityValidator, SkippedTest, TestResult,
    ValidationReport, ValidatorConfig,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Checks a dotted document path such as `location.country`.
///
/// Paths end up inside SQL expression indexes, so only ASCII alphanumerics and
/// `_` are accepted in each segment.
///
/// # Errors
/// Returns [`CoreError::Validation`] for empty paths, empty segments, or
/// segments with other characters.
pub fn validate_field_path(path: &str) -> Result<(), CoreError> {
    if path.is_empty() {
        return Err(CoreError::Validation("field path MUST be non-empty".to_string()));
    }

    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(CoreError::Validation(format!(
                "field path {path:?} contains an empty segment"
            )));
        }
        if !segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(CoreError::Validation(format!(
                "field path {path:?} contains unsupported characters"
            )));
        }
    }

    Ok(())
}

/// Checks a collection or index name.
///
/// # Errors
/// Returns [`CoreError::Validation`] for empty names, names with characters
/// other than ASCII alphanumerics and `_`, names starting with `_`, or names
/// containing `__`.
pub fn validate_identifier(kind: &str, name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation(format!("{kind} name MUST be non-empty")));
    }
    if name.starts_with('_') || name.contains("__") {
        return Err(CoreError::Validation(format!(
            "{kind} name {name:?} uses a reserved underscore pattern"
        )));
    }
    if !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(CoreError::Validation(format!(
            "{kind} name {name:?} contains unsupported characters"
        )));
    }
    Ok(())
}

/// Parses an RFC 3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`CoreError::Validation`] when the input is not RFC 3339.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CoreError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| CoreError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;
    Ok(parsed.to_offset(UtcOffset::UTC))
}

/// Formats a timestamp as RFC 3339 in UTC.
///
/// # Errors
/// Returns [`CoreError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| CoreError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Serde adapter storing [`OffsetDateTime`] as an RFC 3339 string.
pub(crate) mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(
        value: &OffsetDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let formatted = super::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_rfc3339_utc(&raw).map_err(serde::de::Error::custom)
    }
}
