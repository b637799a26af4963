//! Copies each event's `format` onto its standings so format-scoped queries
//! no longer need a join.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::index::IndexSpec;
use crate::migration::{
    Migration, MigrationDescriptor, MigrationError, PostValidation, RollbackPlan,
    TransformContext, TransformSummary,
};
use crate::model::{EVENTS, STANDINGS};
use crate::store::{DocumentStore, Filter, StoreError, Update};

const DESCRIPTOR: MigrationDescriptor = MigrationDescriptor {
    id: "2024-02-15-add-format-to-standings",
    name: "add-format-to-standings",
    version: "1.0.0",
    description: "Add format field to standings collection for efficient format-based filtering",
    reversible: true,
    estimated_duration: "1-2 minutes for 10k standings",
    prerequisites: &[STANDINGS, EVENTS],
};

/// Backfill-once: standings that already carry a format are never touched,
/// even if the event's format changes later.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddFormatToStandings;

impl Migration for AddFormatToStandings {
    fn descriptor(&self) -> &MigrationDescriptor {
        &DESCRIPTOR
    }

    fn transform(
        &self,
        store: &dyn DocumentStore,
        ctx: &mut TransformContext<'_>,
    ) -> Result<TransformSummary, MigrationError> {
        let event_ids = store.distinct(STANDINGS, "eventId", &Filter::All)?;
        let total = event_ids.len();
        let batches = ctx.begin(total)?;
        let batch_size = ctx.batch_size();

        let mut processed = 0;
        let mut updated = 0;
        for batch in event_ids.chunks(batch_size) {
            let formats = load_formats(store, batch)?;
            for event_id in batch {
                let Some(format) = formats.get(&key_of(event_id)) else {
                    continue;
                };
                let filter = Filter::Eq("eventId".to_string(), event_id.clone())
                    .and(Filter::missing("format"));
                updated +=
                    store.update_many(STANDINGS, &filter, &Update::set("format", format.clone()))?;
            }
            processed += batch.len();
            ctx.complete_batch(processed, total, updated)?;
        }

        Ok(TransformSummary { driving_keys: total, batches, updated })
    }

    fn indexes(&self) -> Vec<IndexSpec> {
        vec![
            IndexSpec::builder(STANDINGS).asc("format").build(),
            IndexSpec::builder(STANDINGS).asc("championSlug").asc("format").build(),
        ]
    }

    fn post_validate(&self, store: &dyn DocumentStore) -> Result<PostValidation, StoreError> {
        let total = store.count(STANDINGS, &Filter::All)?;
        let with_format = store.count(STANDINGS, &Filter::exists("format"))?;
        let without_format = store.count(STANDINGS, &Filter::missing("format"))?;

        let mut statistics = Map::new();
        statistics.insert("totalStandings".to_string(), Value::from(total));
        statistics.insert("standingsUpdated".to_string(), Value::from(with_format));
        statistics.insert("standingsSkipped".to_string(), Value::from(without_format));

        let mut warnings = Vec::new();
        if without_format > 0 {
            warnings.push(format!(
                "{without_format} standings still missing format field; \
                 they may reference events that do not exist"
            ));
        }

        Ok(PostValidation {
            satisfied: with_format,
            unsatisfied: without_format,
            statistics,
            warnings,
        })
    }

    fn rollback_plan(&self) -> RollbackPlan {
        RollbackPlan::for_added_fields(DESCRIPTOR.name, STANDINGS, &["format"], &self.indexes())
    }
}

/// `eventId -> format` for the events referenced by one batch. Events with a
/// null or empty format are left out.
fn load_formats(
    store: &dyn DocumentStore,
    event_ids: &[Value],
) -> Result<HashMap<String, Value>, StoreError> {
    let events = store.find(EVENTS, &Filter::is_in("eventId", event_ids.to_vec()), None)?;
    let mut formats = HashMap::with_capacity(events.len());
    for event in events {
        let (Some(event_id), Some(format)) = (event.get("eventId"), event.get("format")) else {
            continue;
        };
        if format.is_null() || format.as_str() == Some("") {
            continue;
        }
        formats.insert(key_of(event_id), format.clone());
    }
    debug!(requested = event_ids.len(), resolved = formats.len(), "loaded event formats");
    Ok(formats)
}

/// JSON text of an id, so `1` and `"1"` stay distinct map keys.
fn key_of(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_indexes_follow_naming_rule() {
        let names: Vec<String> = AddFormatToStandings
            .indexes()
            .iter()
            .map(|spec| spec.name().to_string())
            .collect();
        assert_eq!(names, vec!["idx_standings_format", "idx_standings_championSlug_format"]);
    }

    #[test]
    fn rollback_covers_field_indexes_and_record() {
        let plan = AddFormatToStandings.rollback_plan();
        assert_eq!(plan.migration, "add-format-to-standings");
        assert_eq!(plan.steps.len(), 4);
        assert!(plan.to_string().contains("delete the 'add-format-to-standings' record"));
    }

    #[test]
    fn descriptor_id_ends_with_name() {
        let descriptor = AddFormatToStandings.descriptor();
        assert!(descriptor.id.ends_with(descriptor.name));
        assert_eq!(descriptor.prerequisites, &[STANDINGS, EVENTS]);
    }
}
