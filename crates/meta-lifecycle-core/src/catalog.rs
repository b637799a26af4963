//! The declarative index catalog.
//!
//! Adding an index means appending one builder call to the relevant
//! collection below. Names are derived, never written by hand.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::index::{IndexSpec, IndexSpecBuilder};
use crate::model::{
    CARD_PERFORMANCE_STATS, CHAMPIONS, CRAWLER_STATE, DECKLISTS, EVENTS, SAVED_DECKLISTS,
    STANDINGS, USERS,
};
use crate::{validate_field_path, validate_identifier, CoreError};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CollectionIndexes {
    pub collection: String,
    /// Whether the validator treats this collection as mandatory.
    pub required: bool,
    pub specs: Vec<IndexSpec>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexCatalog {
    collections: Vec<CollectionIndexes>,
}

impl IndexCatalog {
    /// Builds a catalog and checks it.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when a collection appears twice, a
    /// name or field path is malformed, a spec belongs to another collection,
    /// or two specs in one collection share a name.
    pub fn new(collections: Vec<CollectionIndexes>) -> Result<Self, CoreError> {
        let catalog = Self { collections };
        catalog.check()?;
        Ok(catalog)
    }

    /// The index set for the meta database.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            collections: vec![
                champions(),
                events(),
                standings(),
                decklists(),
                card_performance_stats(),
                crawler_state(),
                users(),
                saved_decklists(),
            ],
        }
    }

    #[must_use]
    pub fn collections(&self) -> &[CollectionIndexes] {
        &self.collections
    }

    #[must_use]
    pub fn get(&self, collection: &str) -> Option<&CollectionIndexes> {
        self.collections.iter().find(|entry| entry.collection == collection)
    }

    pub fn required_collections(&self) -> impl Iterator<Item = &CollectionIndexes> {
        self.collections.iter().filter(|entry| entry.required)
    }

    #[must_use]
    pub fn total_indexes(&self) -> usize {
        self.collections.iter().map(|entry| entry.specs.len()).sum()
    }

    /// Restricts the catalog to one collection.
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] when the collection is unknown.
    pub fn only(&self, collection: &str) -> Result<Self, CoreError> {
        let entry = self.get(collection).cloned().ok_or_else(|| {
            CoreError::Configuration(format!(
                "collection {collection:?} is not in the index catalog"
            ))
        })?;
        Ok(Self { collections: vec![entry] })
    }

    /// # Errors
    /// See [`IndexCatalog::new`].
    pub fn check(&self) -> Result<(), CoreError> {
        let mut seen_collections = BTreeSet::new();
        for entry in &self.collections {
            validate_identifier("collection", &entry.collection)?;
            if !seen_collections.insert(entry.collection.as_str()) {
                return Err(CoreError::Validation(format!(
                    "collection {} is declared twice",
                    entry.collection
                )));
            }

            let mut seen_names = BTreeSet::new();
            for spec in &entry.specs {
                if spec.collection != entry.collection {
                    return Err(CoreError::Validation(format!(
                        "index {} is declared under {} but targets {}",
                        spec.name(),
                        entry.collection,
                        spec.collection
                    )));
                }
                if spec.keys.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "index {} declares no keys",
                        spec.name()
                    )));
                }
                validate_identifier("index", spec.name())?;
                for key in &spec.keys {
                    validate_field_path(&key.field)?;
                }
                if !seen_names.insert(spec.name()) {
                    return Err(CoreError::Validation(format!(
                        "index name {} is declared twice on {}",
                        spec.name(),
                        entry.collection
                    )));
                }
            }
        }
        Ok(())
    }
}

struct Declare {
    collection: &'static str,
    prefix: &'static str,
    required: bool,
    specs: Vec<IndexSpec>,
}

impl Declare {
    fn new(collection: &'static str) -> Self {
        Self { collection, prefix: collection, required: true, specs: Vec::new() }
    }

    fn prefix(mut self, prefix: &'static str) -> Self {
        self.prefix = prefix;
        self
    }

    fn provisional(mut self) -> Self {
        self.required = false;
        self
    }

    fn index(mut self, build: impl FnOnce(IndexSpecBuilder) -> IndexSpecBuilder) -> Self {
        let builder = IndexSpec::builder(self.collection).prefix(self.prefix);
        self.specs.push(build(builder).build());
        self
    }

    fn finish(self) -> CollectionIndexes {
        CollectionIndexes {
            collection: self.collection.to_string(),
            required: self.required,
            specs: self.specs,
        }
    }
}

fn champions() -> CollectionIndexes {
    Declare::new(CHAMPIONS)
        .index(|b| b.asc("slug").unique())
        .index(|b| b.asc("name"))
        .index(|b| b.asc("uuid").unique())
        .index(|b| b.asc("element"))
        .finish()
}

fn events() -> CollectionIndexes {
    Declare::new(EVENTS)
        .index(|b| b.asc("eventId").unique())
        .index(|b| b.asc("format").desc("startAt"))
        .index(|b| b.asc("category").asc("status"))
        .index(|b| b.asc("status").asc("ranked"))
        .index(|b| b.desc("startAt"))
        .index(|b| b.asc("location.country").desc("startAt"))
        .finish()
}

fn standings() -> CollectionIndexes {
    Declare::new(STANDINGS)
        .index(|b| b.asc("eventId").asc("playerId").unique())
        .index(|b| b.asc("eventId").asc("placement"))
        .index(|b| b.asc("championSlug").asc("placement"))
        .index(|b| b.asc("playerId").desc("createdAt"))
        .index(|b| b.asc("eventId").asc("madeCut"))
        .index(|b| b.asc("decklistId"))
        .finish()
}

fn decklists() -> CollectionIndexes {
    Declare::new(DECKLISTS)
        .index(|b| b.asc("eventId").asc("playerId"))
        .index(|b| b.asc("championSlug").asc("eventId"))
        .index(|b| b.asc("deckHash"))
        // multi-key over the card array
        .index(|b| b.asc("mainDeck.cardId"))
        .index(|b| b.asc("eventId").asc("placement"))
        .index(|b| b.asc("archetype").desc("createdAt"))
        .index(|b| b.desc("createdAt"))
        .index(|b| b.asc("championSlug").asc("verified").desc("createdAt"))
        .finish()
}

/// Nested keys keep every path segment in the derived name, e.g.
/// `idx_card_stats_overallStats_totalInclusions` and
/// `idx_card_stats_byChampion_championSlug`. A database indexed under the
/// shortened names (`idx_card_stats_totalInclusions`,
/// `idx_card_stats_byChampion_slug`) ends up with a second index on the same
/// keys after reconciliation.
fn card_performance_stats() -> CollectionIndexes {
    Declare::new(CARD_PERFORMANCE_STATS)
        .prefix("card_stats")
        .index(|b| b.asc("cardId").unique())
        .index(|b| b.asc("cardName"))
        .index(|b| b.desc("overallStats.totalInclusions"))
        .index(|b| b.desc("overallStats.winRate"))
        .index(|b| b.asc("byChampion.championSlug"))
        .index(|b| b.asc("element").asc("cardType"))
        .index(|b| b.asc("lastCalculated"))
        .index(|b| b.desc("overallStats.topCutWinRate"))
        .finish()
}

/// Declares `idx_crawler_state_status_config_enabled`; the shortened
/// `idx_crawler_state_status_enabled` is not recognized as the same index.
fn crawler_state() -> CollectionIndexes {
    Declare::new(CRAWLER_STATE)
        .index(|b| b.asc("crawlerName").unique())
        .index(|b| b.asc("sourceType").asc("status"))
        .index(|b| b.asc("lastRunAt"))
        .index(|b| b.asc("status").asc("config.enabled"))
        .finish()
}

fn users() -> CollectionIndexes {
    Declare::new(USERS)
        .provisional()
        .index(|b| b.asc("userId").unique())
        .index(|b| b.asc("email").unique())
        .index(|b| b.asc("username").unique())
        .index(|b| b.asc("emailVerificationToken").sparse())
        .index(|b| b.asc("passwordResetToken").sparse())
        .index(|b| b.asc("accountStatus"))
        .index(|b| b.desc("createdAt"))
        .finish()
}

fn saved_decklists() -> CollectionIndexes {
    Declare::new(SAVED_DECKLISTS)
        .provisional()
        .index(|b| b.asc("userId").desc("createdAt"))
        .index(|b| b.asc("championSlug").asc("visibility"))
        .index(|b| b.asc("visibility").desc("likes"))
        .index(|b| b.asc("tags"))
        .index(|b| b.asc("deckHash"))
        .index(|b| b.asc("forkedFrom").sparse())
        .index(|b| b.asc("mainDeck.cardId").asc("visibility"))
        .index(|b| b.asc("visibility").desc("createdAt"))
        .finish()
}
