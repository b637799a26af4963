//! The document store port.
//!
//! The reconciler, runner, and validator only ever see a store through
//! [`DocumentStore`]. Filters and updates are a deliberately small vocabulary:
//! what the engine needs and nothing more.

use serde::Serialize;
use serde_json::Value;

use crate::index::IndexSpec;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StoreError {
    #[error("collection '{0}' does not exist")]
    CollectionMissing(String),
    #[error("duplicate key in '{collection}' violates unique index '{index}'")]
    DuplicateKey { collection: String, index: String },
    #[error("index '{name}' on '{collection}' already exists as {existing}")]
    IndexExists { collection: String, name: String, existing: String },
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),
    #[error("malformed document in '{collection}': {message}")]
    MalformedDocument { collection: String, message: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl Serialize for StoreError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    /// `true` matches documents where the path is present (null included).
    Exists(String, bool),
    Lt(String, Value),
    And(Vec<Filter>),
}

impl Filter {
    #[must_use]
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::Eq(field.to_string(), value.into())
    }

    #[must_use]
    pub fn is_in(field: &str, values: Vec<Value>) -> Self {
        Self::In(field.to_string(), values)
    }

    #[must_use]
    pub fn exists(field: &str) -> Self {
        Self::Exists(field.to_string(), true)
    }

    #[must_use]
    pub fn missing(field: &str) -> Self {
        Self::Exists(field.to_string(), false)
    }

    #[must_use]
    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self::Lt(field.to_string(), value.into())
    }

    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::All => other,
            Self::And(mut clauses) => {
                clauses.push(other);
                Self::And(clauses)
            }
            first => Self::And(vec![first, other]),
        }
    }
}

/// `$set`/`$unset` style modification applied to every matching document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Vec<(String, Value)>,
    pub unset: Vec<String>,
}

impl Update {
    #[must_use]
    pub fn set(field: &str, value: impl Into<Value>) -> Self {
        Self { set: vec![(field.to_string(), value.into())], unset: Vec::new() }
    }

    #[must_use]
    pub fn unset(field: &str) -> Self {
        Self { set: Vec::new(), unset: vec![field.to_string()] }
    }

    #[must_use]
    pub fn and_set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.push((field.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

/// `source.source_field` must match some `target.target_field`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ForeignKey {
    pub source: String,
    pub source_field: String,
    pub target: String,
    pub target_field: String,
}

impl ForeignKey {
    #[must_use]
    pub fn new(source: &str, source_field: &str, target: &str, target_field: &str) -> Self {
        Self {
            source: source.to_string(),
            source_field: source_field.to_string(),
            target: target.to_string(),
            target_field: target_field.to_string(),
        }
    }
}

/// A denormalized copy that must agree with the referenced document.
///
/// Counts source documents that carry `source_value`, resolve through `link`,
/// and whose `source_value` differs from the target's `target_value`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldAgreement {
    pub link: ForeignKey,
    pub source_value: String,
    pub target_value: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexUsage {
    pub name: String,
    pub ops: u64,
    pub since: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub collection: String,
    pub count: u64,
    pub size_bytes: u64,
    pub avg_obj_size_bytes: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStats {
    pub database: String,
    pub collections: u64,
    pub indexes: u64,
    pub documents: u64,
    pub data_size_bytes: u64,
    pub storage_size_bytes: u64,
}

pub trait DocumentStore {
    /// # Errors
    /// Returns a [`StoreError`] when the store cannot be read.
    fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// # Errors
    /// Returns a [`StoreError`] when the store cannot be read.
    fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        Ok(self.list_collections()?.iter().any(|name| name == collection))
    }

    /// Creates the collection if it does not exist.
    ///
    /// # Errors
    /// Returns a [`StoreError`] for invalid names or backend failures.
    fn create_collection(&self, collection: &str) -> Result<(), StoreError>;

    /// Creates one index. Creating an index whose name and definition already
    /// exist is a no-op; the same name with another definition is
    /// [`StoreError::IndexExists`].
    ///
    /// # Errors
    /// Returns [`StoreError::CollectionMissing`] when the store does not create
    /// collections implicitly, [`StoreError::DuplicateKey`] when existing data
    /// violates a unique spec.
    fn create_index(&self, spec: &IndexSpec) -> Result<(), StoreError>;

    /// Live indexes in creation order, primary index first.
    ///
    /// # Errors
    /// Returns [`StoreError::CollectionMissing`] for unknown collections.
    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError>;

    /// A missing collection counts as empty.
    ///
    /// # Errors
    /// Returns a [`StoreError`] for unsupported filters or backend failures.
    fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Matching documents in insertion order.
    ///
    /// # Errors
    /// Returns a [`StoreError`] for unsupported filters or backend failures.
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, StoreError>;

    /// Distinct values of `field` among matching documents. Documents without
    /// the field, or with `null` in it, contribute nothing.
    ///
    /// # Errors
    /// Returns a [`StoreError`] for unsupported filters or backend failures.
    fn distinct(&self, collection: &str, field: &str, filter: &Filter)
        -> Result<Vec<Value>, StoreError>;

    /// Returns the number of documents modified.
    ///
    /// # Errors
    /// Returns [`StoreError::DuplicateKey`] when the update violates a unique
    /// index; nothing is modified in that case.
    fn update_many(&self, collection: &str, filter: &Filter, update: &Update)
        -> Result<u64, StoreError>;

    /// # Errors
    /// Returns [`StoreError::DuplicateKey`] on unique index violations.
    fn insert_one(&self, collection: &str, document: &Value) -> Result<(), StoreError>;

    /// Per-index access counters, primary index first.
    ///
    /// # Errors
    /// Returns [`StoreError::CollectionMissing`] for unknown collections.
    fn index_usage(&self, collection: &str) -> Result<Vec<IndexUsage>, StoreError>;

    /// Turns index usage counting on or off and returns the previous
    /// setting. Stores that do not count usage always report `false`.
    fn set_usage_tracking(&self, _enabled: bool) -> bool {
        false
    }

    /// # Errors
    /// Returns [`StoreError::CollectionMissing`] for unknown collections.
    fn collection_stats(&self, collection: &str) -> Result<CollectionStats, StoreError>;

    /// # Errors
    /// Returns a [`StoreError`] when the store cannot be read.
    fn database_stats(&self) -> Result<DatabaseStats, StoreError>;

    /// Source documents whose reference resolves to no target document. A
    /// missing or `null` reference resolves to nothing and is counted.
    ///
    /// # Errors
    /// Returns [`StoreError::CollectionMissing`] when either side is absent.
    fn count_orphans(&self, link: &ForeignKey) -> Result<u64, StoreError>;

    /// # Errors
    /// Returns [`StoreError::CollectionMissing`] when either side is absent.
    fn count_disagreements(&self, agreement: &FieldAgreement) -> Result<u64, StoreError>;
}
