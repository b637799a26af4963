//! Applied-migration ledger kept in the `migrations` collection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::index::IndexSpec;
use crate::store::{DocumentStore, Filter, StoreError};

pub const MIGRATIONS_COLLECTION: &str = "migrations";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub name: String,
    pub version: String,
    pub description: String,
    pub reversible: bool,
    #[serde(with = "crate::rfc3339")]
    pub applied_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
    pub run_id: Ulid,
    #[serde(default)]
    pub statistics: Map<String, Value>,
}

impl MigrationRecord {
    /// # Errors
    /// Returns [`StoreError::MalformedDocument`] when serialization fails.
    pub fn to_document(&self) -> Result<Value, StoreError> {
        serde_json::to_value(self).map_err(|err| malformed(&err))
    }

    /// # Errors
    /// Returns [`StoreError::MalformedDocument`] when the document does not
    /// describe a migration record.
    pub fn from_document(document: &Value) -> Result<Self, StoreError> {
        Self::deserialize(document).map_err(|err| malformed(&err))
    }

    #[must_use]
    pub fn statistic_u64(&self, key: &str) -> Option<u64> {
        self.statistics.get(key).and_then(Value::as_u64)
    }
}

fn malformed(err: &serde_json::Error) -> StoreError {
    StoreError::MalformedDocument {
        collection: MIGRATIONS_COLLECTION.to_string(),
        message: err.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// Another invocation recorded the same name first.
    AlreadyRecorded,
}

pub struct MigrationHistory<'a> {
    store: &'a dyn DocumentStore,
}

impl<'a> MigrationHistory<'a> {
    #[must_use]
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store }
    }

    /// The unique index that makes [`MigrationHistory::record`] a
    /// compare-and-set.
    #[must_use]
    pub fn name_index() -> IndexSpec {
        IndexSpec::builder(MIGRATIONS_COLLECTION).asc("name").unique().build()
    }

    /// # Errors
    /// Returns a [`StoreError`] when the ledger cannot be read.
    pub fn has_applied(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.store.count(MIGRATIONS_COLLECTION, &Filter::eq("name", name))? > 0)
    }

    /// # Errors
    /// Returns a [`StoreError`] when the ledger cannot be read or the stored
    /// record is malformed.
    pub fn find(&self, name: &str) -> Result<Option<MigrationRecord>, StoreError> {
        self.store
            .find(MIGRATIONS_COLLECTION, &Filter::eq("name", name), Some(1))?
            .first()
            .map(MigrationRecord::from_document)
            .transpose()
    }

    /// Every recorded migration in recording order.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the ledger cannot be read or a stored
    /// record is malformed.
    pub fn list(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        self.store
            .find(MIGRATIONS_COLLECTION, &Filter::All, None)?
            .iter()
            .map(MigrationRecord::from_document)
            .collect()
    }

    /// Inserts the record unless one with the same name exists.
    ///
    /// # Errors
    /// Returns a [`StoreError`] for any failure other than the duplicate name.
    pub fn record(&self, record: &MigrationRecord) -> Result<RecordOutcome, StoreError> {
        self.ensure_ledger()?;
        let document = record.to_document()?;
        match self.store.insert_one(MIGRATIONS_COLLECTION, &document) {
            Ok(()) => {
                debug!(migration = %record.name, run_id = %record.run_id, "recorded migration");
                Ok(RecordOutcome::Recorded)
            }
            Err(StoreError::DuplicateKey { .. }) => {
                warn!(migration = %record.name, "migration was recorded by another run");
                Ok(RecordOutcome::AlreadyRecorded)
            }
            Err(err) => Err(err),
        }
    }

    fn ensure_ledger(&self) -> Result<(), StoreError> {
        self.store.create_collection(MIGRATIONS_COLLECTION)?;
        let index = Self::name_index();
        let present = self
            .store
            .list_indexes(MIGRATIONS_COLLECTION)?
            .iter()
            .any(|live| live.name() == index.name());
        if !present {
            self.store.create_index(&index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn record_document_uses_camel_case_and_rfc3339() {
        let applied_at = match crate::parse_rfc3339_utc("2024-02-15T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        let mut statistics = Map::new();
        statistics.insert("standingsUpdated".to_string(), json!(5));
        let record = MigrationRecord {
            name: "add-format-to-standings".to_string(),
            version: "1.0.0".to_string(),
            description: "Backfill format".to_string(),
            reversible: true,
            applied_at,
            estimated_duration: Some("1-2 minutes".to_string()),
            run_id: Ulid::nil(),
            statistics,
        };

        let document = match record.to_document() {
            Ok(document) => document,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(document["appliedAt"], json!("2024-02-15T12:00:00Z"));
        assert_eq!(document["estimatedDuration"], json!("1-2 minutes"));
        assert_eq!(document["statistics"]["standingsUpdated"], json!(5));

        let decoded = match MigrationRecord::from_document(&document) {
            Ok(decoded) => decoded,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(decoded, record);
        assert_eq!(decoded.statistic_u64("standingsUpdated"), Some(5));
    }

    #[test]
    fn malformed_record_is_reported() {
        let result = MigrationRecord::from_document(&json!({"name": "x"}));
        assert!(matches!(result, Err(StoreError::MalformedDocument { .. })));
    }
}
