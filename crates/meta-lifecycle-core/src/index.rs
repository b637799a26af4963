use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Name the store reports for the implicit primary-key index.
pub const PRIMARY_INDEX_NAME: &str = "_id_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(into = "i8", try_from = "i8")]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    #[must_use]
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Ascending => 1,
            Self::Descending => -1,
        }
    }

    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

impl From<Direction> for i8 {
    fn from(value: Direction) -> Self {
        value.as_i8()
    }
}

impl TryFrom<i8> for Direction {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ascending),
            -1 => Ok(Self::Descending),
            other => Err(format!("index direction must be 1 or -1, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct IndexKey {
    pub field: String,
    pub direction: Direction,
}

impl IndexKey {
    #[must_use]
    pub fn asc(field: &str) -> Self {
        Self { field: field.to_string(), direction: Direction::Ascending }
    }

    #[must_use]
    pub fn desc(field: &str) -> Self {
        Self { field: field.to_string(), direction: Direction::Descending }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexOptions {
    pub name: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

/// One declared (or observed) index on a collection.
///
/// Key order is significant. Indexing an array-valued path makes the index
/// multi-key; nothing in the declaration distinguishes it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexSpec {
    pub collection: String,
    pub keys: Vec<IndexKey>,
    pub options: IndexOptions,
}

impl IndexSpec {
    #[must_use]
    pub fn builder(collection: &str) -> IndexSpecBuilder {
        IndexSpecBuilder {
            collection: collection.to_string(),
            prefix: collection.to_string(),
            keys: Vec::new(),
            unique: false,
            sparse: false,
        }
    }

    /// The descriptor of the primary-key index every collection carries.
    #[must_use]
    pub fn primary(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            keys: vec![IndexKey::asc("_id")],
            options: IndexOptions {
                name: PRIMARY_INDEX_NAME.to_string(),
                unique: true,
                sparse: false,
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// `field:dir` pairs in declaration order, e.g. `eventId:1,startAt:-1`.
    #[must_use]
    pub fn key_signature(&self) -> String {
        self.keys
            .iter()
            .map(|key| format!("{}:{}", key.field, key.direction.as_i8()))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// True when both specs describe the same physical index: same keys in the
    /// same order and direction, same uniqueness and sparseness.
    #[must_use]
    pub fn same_definition(&self, other: &IndexSpec) -> bool {
        self.keys == other.keys
            && self.options.unique == other.options.unique
            && self.options.sparse == other.options.sparse
    }
}

impl Display for IndexSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {{{}}}", self.options.name, self.key_signature())?;
        if self.options.unique {
            f.write_str(" unique")?;
        }
        if self.options.sparse {
            f.write_str(" sparse")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IndexSpecBuilder {
    collection: String,
    prefix: String,
    keys: Vec<IndexKey>,
    unique: bool,
    sparse: bool,
}

impl IndexSpecBuilder {
    /// Overrides the name prefix, which otherwise is the collection name.
    #[must_use]
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    #[must_use]
    pub fn asc(mut self, field: &str) -> Self {
        self.keys.push(IndexKey::asc(field));
        self
    }

    #[must_use]
    pub fn desc(mut self, field: &str) -> Self {
        self.keys.push(IndexKey::desc(field));
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    #[must_use]
    pub fn build(self) -> IndexSpec {
        let name = derive_index_name(&self.prefix, &self.keys, self.unique);
        IndexSpec {
            collection: self.collection,
            keys: self.keys,
            options: IndexOptions { name, unique: self.unique, sparse: self.sparse },
        }
    }
}

/// `idx_<prefix>_<segments>` plus `_unique` for unique indexes. Dotted paths
/// contribute every segment, so `location.country` becomes `location_country`.
#[must_use]
pub fn derive_index_name(prefix: &str, keys: &[IndexKey], unique: bool) -> String {
    let mut name = format!("idx_{prefix}");
    for key in keys {
        for segment in key.field.split('.') {
            name.push('_');
            name.push_str(segment);
        }
    }
    if unique {
        name.push_str("_unique");
    }
    name
}
