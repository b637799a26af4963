//! Expected document shapes, one struct per collection.
//!
//! These describe what the validator expects to find. Required fields are
//! plain types, everything else is `Option`. Unknown fields are tolerated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CHAMPIONS: &str = "champions";
pub const EVENTS: &str = "events";
pub const STANDINGS: &str = "standings";
pub const DECKLISTS: &str = "decklists";
pub const CARD_PERFORMANCE_STATS: &str = "card_performance_stats";
pub const CRAWLER_STATE: &str = "crawler_state";
pub const USERS: &str = "users";
pub const SAVED_DECKLISTS: &str = "saved_decklists";

/// Event and player ids arrive as integers from some sources and strings
/// from others.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(untagged)]
pub enum DocumentKey {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Champion {
    pub slug: String,
    pub name: String,
    pub uuid: String,
    pub element: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: DocumentKey,
    pub format: String,
    pub category: Option<String>,
    pub start_at: Option<String>,
    pub status: Option<String>,
    pub ranked: Option<bool>,
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub event_id: DocumentKey,
    pub player_id: DocumentKey,
    pub champion_slug: String,
    pub placement: Option<u32>,
    pub decklist_id: Option<DocumentKey>,
    pub made_cut: Option<bool>,
    /// Copied from the owning event by the format backfill.
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decklist {
    pub event_id: DocumentKey,
    pub player_id: DocumentKey,
    pub champion_slug: String,
    pub deck_hash: Option<String>,
    #[serde(default)]
    pub main_deck: Vec<DeckEntry>,
    pub archetype: Option<String>,
    pub verified: Option<bool>,
    pub placement: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeckEntry {
    pub card_id: String,
    pub quantity: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardPerformanceStat {
    pub card_id: String,
    pub card_name: String,
    pub element: Option<String>,
    pub card_type: Option<String>,
    pub overall_stats: Option<OverallStats>,
    #[serde(default)]
    pub by_champion: Vec<ChampionCardStat>,
    pub last_calculated: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverallStats {
    pub total_inclusions: Option<u64>,
    pub win_rate: Option<f64>,
    pub top_cut_win_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChampionCardStat {
    pub champion_slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerState {
    pub crawler_name: String,
    pub source_type: Option<String>,
    pub status: Option<String>,
    pub last_run_at: Option<String>,
    pub config: Option<CrawlerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerConfig {
    pub enabled: Option<bool>,
}

/// The collections the validator knows a shape for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CollectionShape {
    Champion,
    Event,
    Standing,
    Decklist,
    CardPerformanceStat,
    CrawlerState,
}

impl CollectionShape {
    pub const ALL: [CollectionShape; 6] = [
        Self::Champion,
        Self::Event,
        Self::Standing,
        Self::Decklist,
        Self::CardPerformanceStat,
        Self::CrawlerState,
    ];

    #[must_use]
    pub fn for_collection(collection: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|shape| shape.collection() == collection)
    }

    #[must_use]
    pub fn collection(self) -> &'static str {
        match self {
            Self::Champion => CHAMPIONS,
            Self::Event => EVENTS,
            Self::Standing => STANDINGS,
            Self::Decklist => DECKLISTS,
            Self::CardPerformanceStat => CARD_PERFORMANCE_STATS,
            Self::CrawlerState => CRAWLER_STATE,
        }
    }

    /// Field paths every document of this shape must carry.
    #[must_use]
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Champion => &["slug", "name", "uuid"],
            Self::Event => &["eventId", "format"],
            Self::Standing => &["eventId", "playerId", "championSlug"],
            Self::Decklist => &["eventId", "playerId", "championSlug"],
            Self::CardPerformanceStat => &["cardId", "cardName"],
            Self::CrawlerState => &["crawlerName"],
        }
    }

    /// Decodes `document` into this shape's struct.
    ///
    /// # Errors
    /// Returns the decoder's message when the document does not fit.
    pub fn conforms(self, document: &Value) -> Result<(), String> {
        fn decode<T: for<'de> Deserialize<'de>>(document: &Value) -> Result<(), String> {
            T::deserialize(document).map(|_| ()).map_err(|err| err.to_string())
        }

        match self {
            Self::Champion => decode::<Champion>(document),
            Self::Event => decode::<Event>(document),
            Self::Standing => decode::<Standing>(document),
            Self::Decklist => decode::<Decklist>(document),
            Self::CardPerformanceStat => decode::<CardPerformanceStat>(document),
            Self::CrawlerState => decode::<CrawlerState>(document),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn standing_accepts_numeric_and_text_ids() {
        let numeric = json!({"eventId": 42, "playerId": 7, "championSlug": "lorraine"});
        let text = json!({
            "eventId": "E1",
            "playerId": "P1",
            "championSlug": "lorraine",
            "format": "Standard"
        });
        assert!(CollectionShape::Standing.conforms(&numeric).is_ok());
        assert!(CollectionShape::Standing.conforms(&text).is_ok());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let doc = json!({"eventId": "E1", "playerId": "P1"});
        let err = match CollectionShape::Standing.conforms(&doc) {
            Ok(()) => panic!("expected a shape mismatch"),
            Err(err) => err,
        };
        assert!(err.contains("championSlug"), "unexpected message: {err}");
    }

    #[test]
    fn wrongly_typed_optional_field_is_reported() {
        let doc = json!({"crawlerName": "omnidex", "config": {"enabled": "yes"}});
        assert!(CollectionShape::CrawlerState.conforms(&doc).is_err());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let doc =
            json!({"slug": "lorraine", "name": "Lorraine", "uuid": "u-1", "lineage": ["spirit"]});
        assert!(CollectionShape::Champion.conforms(&doc).is_ok());
    }

    #[test]
    fn required_fields_decode_as_non_optional() {
        for shape in CollectionShape::ALL {
            assert_eq!(CollectionShape::for_collection(shape.collection()), Some(shape));
            assert!(shape.conforms(&json!({})).is_err(), "{shape:?} accepted an empty document");
        }
    }
}
