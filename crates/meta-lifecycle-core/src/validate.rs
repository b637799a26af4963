//! Read-only integrity and health audit.
//!
//! Three families of checks run independently: structural (collections,
//! indexes, document shapes), referential (orphans and denormalized copies),
//! and operational (sizes, index usage, staleness). A store error inside one
//! check fails that check only; every check always runs.

use std::collections::BTreeSet;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::catalog::IndexCatalog;
use crate::index::PRIMARY_INDEX_NAME;
use crate::model::{
    CollectionShape, CARD_PERFORMANCE_STATS, CHAMPIONS, CRAWLER_STATE, DECKLISTS, EVENTS,
    STANDINGS,
};
use crate::store::{
    CollectionStats, DatabaseStats, DocumentStore, FieldAgreement, Filter, ForeignKey,
    IndexUsage, StoreError,
};

pub const DEFAULT_MAX_AVG_OBJECT_BYTES: f64 = 100_000.0;
pub const DEFAULT_STALE_AFTER_DAYS: i64 = 7;
pub const DEFAULT_SHAPE_SAMPLE_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorConfig {
    /// Average document size above which a collection is flagged.
    pub max_avg_object_bytes: f64,
    pub stale_after: Duration,
    /// Documents per collection decoded against their shape.
    pub shape_sample_size: usize,
    /// Clock used for staleness; `None` means now.
    pub reference_time: Option<OffsetDateTime>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_avg_object_bytes: DEFAULT_MAX_AVG_OBJECT_BYTES,
            stale_after: Duration::days(DEFAULT_STALE_AFTER_DAYS),
            shape_sample_size: DEFAULT_SHAPE_SAMPLE_SIZE,
            reference_time: None,
        }
    }
}

/// Operational checks only ever produce warnings, so they have no family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckFamily {
    Structural,
    Referential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub family: CheckFamily,
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTest {
    pub test: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTest {
    pub test: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionIndexUsage {
    pub collection: String,
    pub indexes: Vec<IndexUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub passed: u32,
    pub failed: u32,
    pub warnings: u32,
    pub errors: Vec<FailedTest>,
    pub warning_messages: Vec<String>,
    pub skipped: Vec<SkippedTest>,
    pub tests: Vec<TestResult>,
    pub collections: Vec<CollectionStats>,
    pub index_usage: Vec<CollectionIndexUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseStats>,
}

impl ValidationReport {
    /// Warnings never fail a run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    #[must_use]
    pub fn test(&self, name: &str) -> Option<&TestResult> {
        self.tests.iter().find(|test| test.name == name)
    }

    fn record(&mut self, family: CheckFamily, name: String, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => {
                debug!(test = %name, "check passed");
                self.passed += 1;
                self.tests.push(TestResult { family, name, passed: true, message: None });
            }
            Err(message) => {
                warn!(test = %name, %message, "check failed");
                self.failed += 1;
                self.errors.push(FailedTest { test: name.clone(), message: message.clone() });
                self.tests.push(TestResult { family, name, passed: false, message: Some(message) });
            }
        }
    }

    fn warn(&mut self, message: String) {
        warn!(%message, "validation warning");
        self.warnings += 1;
        self.warning_messages.push(message);
    }

    fn skip(&mut self, test: String, reason: String) {
        debug!(%test, %reason, "check skipped");
        self.skipped.push(SkippedTest { test, reason });
    }
}

struct Relation {
    test: &'static str,
    failure: &'static str,
    link: (&'static str, &'static str, &'static str, &'static str),
}

const ORPHAN_RELATIONS: [Relation; 4] = [
    Relation {
        test: "No orphaned standings (standings without matching events)",
        failure: "orphaned standings",
        link: (STANDINGS, "eventId", EVENTS, "eventId"),
    },
    Relation {
        test: "No orphaned decklists (decklists without matching events)",
        failure: "orphaned decklists",
        link: (DECKLISTS, "eventId", EVENTS, "eventId"),
    },
    Relation {
        test: "No invalid champion references in standings",
        failure: "standings with invalid champion references",
        link: (STANDINGS, "championSlug", CHAMPIONS, "slug"),
    },
    Relation {
        test: "No invalid champion references in decklists",
        failure: "decklists with invalid champion references",
        link: (DECKLISTS, "championSlug", CHAMPIONS, "slug"),
    },
];

const FORMAT_AGREEMENT_TEST: &str = "Standing format matches its event's format";

/// Restores the store's usage tracking setting on drop.
struct UsagePause<'a> {
    store: &'a dyn DocumentStore,
    previous: bool,
}

impl<'a> UsagePause<'a> {
    fn new(store: &'a dyn DocumentStore) -> Self {
        let previous = store.set_usage_tracking(false);
        Self { store, previous }
    }
}

impl Drop for UsagePause<'_> {
    fn drop(&mut self) {
        self.store.set_usage_tracking(self.previous);
    }
}

pub struct IntegrityValidator<'a> {
    store: &'a dyn DocumentStore,
    catalog: &'a IndexCatalog,
    config: ValidatorConfig,
}

impl<'a> IntegrityValidator<'a> {
    #[must_use]
    pub fn new(store: &'a dyn DocumentStore, catalog: &'a IndexCatalog) -> Self {
        Self { store, catalog, config: ValidatorConfig::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: ValidatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs every check. Never fails; inspect [`ValidationReport::is_success`].
    ///
    /// Index usage counting is paused for the duration, so an audit neither
    /// changes the counters it reports nor a later audit's result.
    #[must_use]
    pub fn validate(&self) -> ValidationReport {
        let _paused = UsagePause::new(self.store);
        let mut report = ValidationReport::default();

        let existing: BTreeSet<String> = match self.store.list_collections() {
            Ok(collections) => collections.into_iter().collect(),
            Err(err) => {
                report.record(
                    CheckFamily::Structural,
                    "Collections can be listed".to_string(),
                    Err(err.to_string()),
                );
                BTreeSet::new()
            }
        };

        info!("validating structure");
        self.check_collections(&mut report, &existing);
        self.check_indexes(&mut report);
        self.check_shapes(&mut report, &existing);

        info!("validating references");
        self.check_references(&mut report, &existing);

        info!("validating operational health");
        self.check_sizes(&mut report, &existing);
        self.check_index_usage(&mut report, &existing);
        self.check_staleness(&mut report, &existing);

        info!(
            passed = report.passed,
            failed = report.failed,
            warnings = report.warnings,
            skipped = report.skipped.len(),
            "validation complete"
        );
        report
    }

    fn check_collections(&self, report: &mut ValidationReport, existing: &BTreeSet<String>) {
        for entry in self.catalog.required_collections() {
            let outcome = if existing.contains(&entry.collection) {
                Ok(())
            } else {
                Err(format!("Collection '{}' not found", entry.collection))
            };
            report.record(
                CheckFamily::Structural,
                format!("Collection '{}' exists", entry.collection),
                outcome,
            );
        }
    }

    fn check_indexes(&self, report: &mut ValidationReport) {
        for entry in self.catalog.required_collections() {
            let live = self.store.list_indexes(&entry.collection);
            for spec in &entry.specs {
                let outcome = match &live {
                    Ok(live) if live.iter().any(|index| index.name() == spec.name()) => Ok(()),
                    Ok(_) | Err(StoreError::CollectionMissing(_)) => Err(format!(
                        "Index '{}' not found on {} collection",
                        spec.name(),
                        entry.collection
                    )),
                    Err(err) => Err(err.to_string()),
                };
                report.record(
                    CheckFamily::Structural,
                    format!("{}.{}", entry.collection, spec.name()),
                    outcome,
                );
            }
        }
    }

    fn check_shapes(&self, report: &mut ValidationReport, existing: &BTreeSet<String>) {
        for entry in self.catalog.required_collections() {
            let Some(shape) = CollectionShape::for_collection(&entry.collection) else {
                continue;
            };
            if !existing.contains(&entry.collection) {
                continue;
            }

            for field in shape.required_fields() {
                match self.store.count(&entry.collection, &Filter::missing(field)) {
                    Ok(0) => {}
                    Ok(missing) => report.warn(format!(
                        "{missing} document(s) in {} are missing required field '{field}'",
                        entry.collection
                    )),
                    Err(err) => report.warn(format!(
                        "could not check required field '{field}' on {}: {err}",
                        entry.collection
                    )),
                }
            }

            let sample = match self.store.find(
                &entry.collection,
                &Filter::All,
                Some(self.config.shape_sample_size),
            ) {
                Ok(sample) => sample,
                Err(err) => {
                    report.warn(format!("could not sample {}: {err}", entry.collection));
                    continue;
                }
            };
            let mut first_error = None;
            let mut mismatched = 0_usize;
            for document in &sample {
                if let Err(err) = shape.conforms(document) {
                    mismatched += 1;
                    first_error.get_or_insert(err);
                }
            }
            if let Some(first_error) = first_error {
                report.warn(format!(
                    "{mismatched} of {} sampled document(s) in {} do not match the expected shape (first: {first_error})",
                    sample.len(),
                    entry.collection
                ));
            }
        }
    }

    fn check_references(&self, report: &mut ValidationReport, existing: &BTreeSet<String>) {
        for relation in &ORPHAN_RELATIONS {
            let (source, source_field, target, target_field) = relation.link;
            if let Some(reason) = missing_reason(existing, source, target) {
                report.skip(relation.test.to_string(), reason);
                continue;
            }
            let link = ForeignKey::new(source, source_field, target, target_field);
            let outcome = match self.store.count_orphans(&link) {
                Ok(0) => Ok(()),
                Ok(count) => Err(format!("Found {count} {}", relation.failure)),
                Err(err) => Err(err.to_string()),
            };
            report.record(CheckFamily::Referential, relation.test.to_string(), outcome);
        }

        if let Some(reason) = missing_reason(existing, STANDINGS, EVENTS) {
            report.skip(FORMAT_AGREEMENT_TEST.to_string(), reason);
            return;
        }
        let agreement = FieldAgreement {
            link: ForeignKey::new(STANDINGS, "eventId", EVENTS, "eventId"),
            source_value: "format".to_string(),
            target_value: "format".to_string(),
        };
        let outcome = match self.store.count_disagreements(&agreement) {
            Ok(0) => Ok(()),
            Ok(count) => Err(format!(
                "Found {count} standings whose format differs from their event"
            )),
            Err(err) => Err(err.to_string()),
        };
        report.record(CheckFamily::Referential, FORMAT_AGREEMENT_TEST.to_string(), outcome);
    }

    fn check_sizes(&self, report: &mut ValidationReport, existing: &BTreeSet<String>) {
        for entry in self.catalog.required_collections() {
            if !existing.contains(&entry.collection) {
                continue;
            }
            match self.store.collection_stats(&entry.collection) {
                Ok(stats) => {
                    if stats.avg_obj_size_bytes > self.config.max_avg_object_bytes {
                        report.warn(format!(
                            "{} has large average document size: {:.2} KB",
                            entry.collection,
                            stats.avg_obj_size_bytes / 1024.0
                        ));
                    }
                    report.collections.push(stats);
                }
                Err(err) => report.warn(format!(
                    "could not read statistics for {}: {err}",
                    entry.collection
                )),
            }
        }

        match self.store.database_stats() {
            Ok(stats) => report.database = Some(stats),
            Err(err) => report.warn(format!("could not read database statistics: {err}")),
        }
    }

    fn check_index_usage(&self, report: &mut ValidationReport, existing: &BTreeSet<String>) {
        for entry in self.catalog.required_collections() {
            if !existing.contains(&entry.collection) {
                continue;
            }
            match self.store.index_usage(&entry.collection) {
                Ok(indexes) => {
                    for usage in &indexes {
                        if usage.ops == 0 && usage.name != PRIMARY_INDEX_NAME {
                            report.warn(format!(
                                "Index '{}' on {} has never been used",
                                usage.name, entry.collection
                            ));
                        }
                    }
                    report.index_usage.push(CollectionIndexUsage {
                        collection: entry.collection.clone(),
                        indexes,
                    });
                }
                Err(err) => report.warn(format!(
                    "could not read index usage for {}: {err}",
                    entry.collection
                )),
            }
        }
    }

    fn check_staleness(&self, report: &mut ValidationReport, existing: &BTreeSet<String>) {
        let now = self.config.reference_time.unwrap_or_else(crate::now_utc);
        let cutoff = (now - self.config.stale_after).replace_nanosecond(0).unwrap_or(now);
        let cutoff = match crate::format_rfc3339(cutoff) {
            Ok(cutoff) => cutoff,
            Err(err) => {
                report.warn(format!("could not compute staleness cutoff: {err}"));
                return;
            }
        };

        // timestamps are stored as UTC RFC 3339 strings, which sort chronologically
        if existing.contains(CARD_PERFORMANCE_STATS) {
            let stale = Filter::lt("lastCalculated", cutoff.as_str());
            match self.store.count(CARD_PERFORMANCE_STATS, &stale) {
                Ok(0) => {}
                Ok(count) => report.warn(format!(
                    "{count} card performance stat(s) last calculated before {cutoff}"
                )),
                Err(err) => report.warn(format!("could not check card stat staleness: {err}")),
            }
        }

        if existing.contains(CRAWLER_STATE) {
            let stale = Filter::eq("config.enabled", true)
                .and(Filter::lt("lastRunAt", cutoff.as_str()));
            match self.store.count(CRAWLER_STATE, &stale) {
                Ok(0) => {}
                Ok(count) => report.warn(format!(
                    "{count} enabled crawler(s) have not run since {cutoff}"
                )),
                Err(err) => report.warn(format!("could not check crawler staleness: {err}")),
            }
        }
    }
}

fn missing_reason(existing: &BTreeSet<String>, source: &str, target: &str) -> Option<String> {
    let missing: Vec<&str> = [source, target]
        .into_iter()
        .filter(|collection| !existing.contains(*collection))
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(format!("missing collection(s): {}", missing.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_counted_and_listed() {
        let mut report = ValidationReport::default();
        report.record(CheckFamily::Structural, "a".to_string(), Ok(()));
        report.record(
            CheckFamily::Referential,
            "b".to_string(),
            Err("Found 2 orphans".to_string()),
        );
        report.warn("big".to_string());

        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.warnings, 1);
        assert!(!report.is_success());
        assert_eq!(
            report.errors,
            vec![FailedTest { test: "b".to_string(), message: "Found 2 orphans".to_string() }]
        );
        assert_eq!(report.test("b").map(|test| test.passed), Some(false));
    }

    #[test]
    fn warnings_alone_do_not_fail() {
        let mut report = ValidationReport::default();
        report.warn("stale".to_string());
        assert!(report.is_success());
    }

    #[test]
    fn missing_reason_lists_absent_sides() {
        let existing: BTreeSet<String> = [STANDINGS.to_string()].into_iter().collect();
        assert_eq!(
            missing_reason(&existing, STANDINGS, EVENTS).as_deref(),
            Some("missing collection(s): events")
        );
        assert_eq!(missing_reason(&existing, STANDINGS, STANDINGS), None);
    }

    #[test]
    fn default_config_uses_documented_thresholds() {
        let config = ValidatorConfig::default();
        assert!((config.max_avg_object_bytes - 100_000.0).abs() < f64::EPSILON);
        assert_eq!(config.stale_after, Duration::days(7));
        assert!(config.reference_time.is_none());
    }
}
