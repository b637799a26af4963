use std::fmt::{Display, Formatter};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::IndexCatalog;
use crate::index::IndexSpec;
use crate::store::{DocumentStore, StoreError};

/// A declared index whose name is taken by a different live definition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexConflict {
    pub collection: String,
    pub name: String,
    pub declared: IndexSpec,
    pub existing: IndexSpec,
}

impl Display for IndexConflict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "index '{}' on '{}' is declared as {{{}}}{}{} but exists as {{{}}}{}{}",
            self.name,
            self.collection,
            self.declared.key_signature(),
            flag(self.declared.options.unique, " unique"),
            flag(self.declared.options.sparse, " sparse"),
            self.existing.key_signature(),
            flag(self.existing.options.unique, " unique"),
            flag(self.existing.options.sparse, " sparse"),
        )
    }
}

fn flag(set: bool, text: &'static str) -> &'static str {
    if set {
        text
    } else {
        ""
    }
}

/// A declared index the store refused to build, e.g. a unique index over
/// data that already has duplicates.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexFailure {
    pub name: String,
    pub error: StoreError,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconcileReport {
    pub collection: String,
    pub dry_run: bool,
    pub collection_missing: bool,
    pub created: Vec<String>,
    pub already_present: Vec<String>,
    pub conflicts: Vec<IndexConflict>,
    pub failures: Vec<IndexFailure>,
    /// Live index listing after the run, primary index first.
    pub indexes: Vec<IndexSpec>,
}

impl ReconcileReport {
    fn new(collection: &str, dry_run: bool) -> Self {
        Self {
            collection: collection.to_string(),
            dry_run,
            collection_missing: false,
            created: Vec::new(),
            already_present: Vec::new(),
            conflicts: Vec::new(),
            failures: Vec::new(),
            indexes: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct CatalogReconcileReport {
    pub collections: Vec<ReconcileReport>,
    /// Collections that could not be reconciled at all, with the reason.
    pub errors: Vec<(String, String)>,
}

impl CatalogReconcileReport {
    #[must_use]
    pub fn created(&self) -> usize {
        self.collections.iter().map(|report| report.created.len()).sum()
    }

    #[must_use]
    pub fn already_present(&self) -> usize {
        self.collections.iter().map(|report| report.already_present.len()).sum()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &IndexConflict> {
        self.collections.iter().flat_map(|report| report.conflicts.iter())
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.collections.iter().all(ReconcileReport::is_clean)
    }
}

/// Brings live indexes in line with declared specs. Only creates; never drops
/// or rebuilds.
pub struct IndexReconciler<'a> {
    store: &'a dyn DocumentStore,
}

impl<'a> IndexReconciler<'a> {
    #[must_use]
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store }
    }

    /// Creates every spec whose name is absent and classifies the rest.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the live index listing cannot be read.
    /// Per-index creation failures are collected in the report instead.
    pub fn reconcile(
        &self,
        collection: &str,
        specs: &[IndexSpec],
    ) -> Result<ReconcileReport, StoreError> {
        self.run(collection, specs, false)
    }

    /// Same classification as [`IndexReconciler::reconcile`] without creating
    /// anything.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the live index listing cannot be read.
    pub fn plan(
        &self,
        collection: &str,
        specs: &[IndexSpec],
    ) -> Result<ReconcileReport, StoreError> {
        self.run(collection, specs, true)
    }

    #[must_use]
    pub fn reconcile_catalog(&self, catalog: &IndexCatalog) -> CatalogReconcileReport {
        self.run_catalog(catalog, false)
    }

    #[must_use]
    pub fn plan_catalog(&self, catalog: &IndexCatalog) -> CatalogReconcileReport {
        self.run_catalog(catalog, true)
    }

    fn run_catalog(&self, catalog: &IndexCatalog, dry_run: bool) -> CatalogReconcileReport {
        let mut aggregate = CatalogReconcileReport::default();
        for entry in catalog.collections() {
            match self.run(&entry.collection, &entry.specs, dry_run) {
                Ok(report) => aggregate.collections.push(report),
                Err(err) => {
                    warn!(
                        collection = %entry.collection,
                        error = %err,
                        "index reconciliation failed"
                    );
                    aggregate.errors.push((entry.collection.clone(), err.to_string()));
                }
            }
        }
        aggregate
    }

    fn run(
        &self,
        collection: &str,
        specs: &[IndexSpec],
        dry_run: bool,
    ) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::new(collection, dry_run);

        let mut live = match self.store.list_indexes(collection) {
            Ok(live) => live,
            Err(StoreError::CollectionMissing(_)) => {
                report.collection_missing = true;
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        for spec in specs {
            if spec.collection != collection {
                report.failures.push(IndexFailure {
                    name: spec.name().to_string(),
                    error: StoreError::InvalidName(format!(
                        "index {} targets {} but was reconciled under {collection}",
                        spec.name(),
                        spec.collection
                    )),
                });
                continue;
            }

            if let Some(existing) = live.iter().find(|index| index.name() == spec.name()) {
                if existing.same_definition(spec) {
                    debug!(collection, index = spec.name(), "index already present");
                    report.already_present.push(spec.name().to_string());
                } else {
                    let conflict = IndexConflict {
                        collection: collection.to_string(),
                        name: spec.name().to_string(),
                        declared: spec.clone(),
                        existing: existing.clone(),
                    };
                    warn!(%conflict, "index conflict");
                    report.conflicts.push(conflict);
                }
                continue;
            }

            if dry_run {
                report.created.push(spec.name().to_string());
                continue;
            }

            match self.store.create_index(spec) {
                Ok(()) => {
                    info!(
                        collection,
                        index = spec.name(),
                        keys = %spec.key_signature(),
                        "created index"
                    );
                    report.created.push(spec.name().to_string());
                    live.push(spec.clone());
                    report.collection_missing = false;
                }
                Err(StoreError::CollectionMissing(_)) => {
                    report.collection_missing = true;
                }
                Err(err) => {
                    warn!(collection, index = spec.name(), error = %err, "index creation failed");
                    report
                        .failures
                        .push(IndexFailure { name: spec.name().to_string(), error: err });
                }
            }
        }

        if report.collection_missing {
            warn!(collection, "collection does not exist; no indexes created");
        }

        report.indexes = if dry_run || report.collection_missing {
            live
        } else {
            self.store.list_indexes(collection)?
        };

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_both_definitions() {
        let declared = IndexSpec::builder("events").asc("startAt").build();
        let mut existing = declared.clone();
        existing.keys[0] = crate::index::IndexKey::desc("startAt");
        let conflict = IndexConflict {
            collection: "events".to_string(),
            name: declared.name().to_string(),
            declared,
            existing,
        };
        assert_eq!(
            conflict.to_string(),
            "index 'idx_events_startAt' on 'events' is declared as {startAt:1} but exists as {startAt:-1}"
        );
    }

    #[test]
    fn empty_catalog_report_is_clean() {
        let report = CatalogReconcileReport::default();
        assert!(report.is_clean());
        assert_eq!(report.created(), 0);
        assert_eq!(report.conflicts().count(), 0);
    }
}
