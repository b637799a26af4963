use meta_lifecycle_core::{
    parse_rfc3339_utc, CheckFamily, DocumentStore, Filter, IndexCatalog, IndexReconciler,
    IntegrityValidator, ValidationReport, ValidatorConfig,
};
use meta_lifecycle_store_sqlite::SqliteDocumentStore;
use serde_json::{json, Value};
use time::Duration;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn seed(store: &SqliteDocumentStore, collection: &str, documents: &[Value]) {
    for document in documents {
        must(store.insert_one(collection, document));
    }
}

/// Indexes every catalog collection except `skip`, then loads consistent data.
fn indexed_store(skip: Option<&str>) -> SqliteDocumentStore {
    let store = must(SqliteDocumentStore::open_in_memory());
    let catalog = IndexCatalog::standard();
    let reconciler = IndexReconciler::new(&store);
    for entry in catalog.collections() {
        if Some(entry.collection.as_str()) == skip {
            continue;
        }
        let report = must(reconciler.reconcile(&entry.collection, &entry.specs));
        assert!(report.is_clean(), "{report:?}");
    }

    if skip != Some("champions") {
        seed(
            &store,
            "champions",
            &[
                json!({"slug": "lorraine", "name": "Lorraine", "uuid": "c-1", "element": "Fire"}),
                json!({"slug": "zander", "name": "Zander", "uuid": "c-2"}),
            ],
        );
    }
    seed(
        &store,
        "events",
        &[
            json!({"eventId": "E1", "format": "Standard", "startAt": "2024-03-01T10:00:00Z"}),
            json!({"eventId": "E2", "format": "Draft", "startAt": "2024-03-02T10:00:00Z"}),
        ],
    );
    seed(
        &store,
        "standings",
        &[
            json!({"eventId": "E1", "playerId": 1, "championSlug": "lorraine", "placement": 1}),
            json!({"eventId": "E2", "playerId": 2, "championSlug": "zander", "placement": 1}),
        ],
    );
    seed(
        &store,
        "decklists",
        &[json!({
            "eventId": "E1",
            "playerId": 1,
            "championSlug": "lorraine",
            "mainDeck": [{"cardId": "card-1", "quantity": 3}]
        })],
    );
    seed(
        &store,
        "card_performance_stats",
        &[json!({
            "cardId": "card-1",
            "cardName": "Spark",
            "lastCalculated": "2024-03-09T00:00:00Z"
        })],
    );
    seed(
        &store,
        "crawler_state",
        &[json!({
            "crawlerName": "events",
            "lastRunAt": "2024-03-09T00:00:00Z",
            "config": {"enabled": true}
        })],
    );
    store
}

fn validate(store: &SqliteDocumentStore, config: ValidatorConfig) -> ValidationReport {
    let catalog = IndexCatalog::standard();
    IntegrityValidator::new(store, &catalog).with_config(config).validate()
}

fn fixed_clock() -> ValidatorConfig {
    ValidatorConfig {
        reference_time: Some(must(parse_rfc3339_utc("2024-03-10T00:00:00Z"))),
        ..ValidatorConfig::default()
    }
}

fn has_warning(report: &ValidationReport, needle: &str) -> bool {
    report.warning_messages.iter().any(|message| message.contains(needle))
}

#[test]
fn healthy_database_passes() {
    let store = indexed_store(None);
    let report = validate(&store, fixed_clock());

    assert!(report.is_success(), "unexpected failures: {:?}", report.errors);
    assert_eq!(report.failed, 0);
    assert!(report.skipped.is_empty());
    // 6 collections, 36 indexes, 4 orphan checks, 1 agreement check
    assert_eq!(report.passed, 6 + 36 + 4 + 1);
    assert_eq!(report.collections.len(), 6);
    assert!(report.database.is_some());
    assert!(!has_warning(&report, "missing required field"));
    assert!(!has_warning(&report, "last calculated before"));
    assert!(!has_warning(&report, "have not run since"));
}

#[test]
fn missing_champions_fail_structure_and_skip_champion_references() {
    let store = indexed_store(Some("champions"));
    let report = validate(&store, fixed_clock());

    assert!(!report.is_success());
    assert_eq!(report.failed, 5);

    let collection = report.test("Collection 'champions' exists");
    assert_eq!(collection.map(|test| test.passed), Some(false));
    assert_eq!(
        collection.and_then(|test| test.message.as_deref()),
        Some("Collection 'champions' not found")
    );
    assert_eq!(collection.map(|test| test.family), Some(CheckFamily::Structural));

    let index = report.test("champions.idx_champions_slug_unique");
    assert_eq!(
        index.and_then(|test| test.message.as_deref()),
        Some("Index 'idx_champions_slug_unique' not found on champions collection")
    );

    let skipped: Vec<&str> = report.skipped.iter().map(|skip| skip.test.as_str()).collect();
    assert_eq!(
        skipped,
        vec![
            "No invalid champion references in standings",
            "No invalid champion references in decklists",
        ]
    );
    assert!(report.skipped.iter().all(|skip| skip.reason == "missing collection(s): champions"));

    let orphaned = report.test("No orphaned standings (standings without matching events)");
    assert_eq!(orphaned.map(|test| test.passed), Some(true));
}

#[test]
fn orphans_and_bad_references_are_counted() {
    let store = indexed_store(None);
    seed(
        &store,
        "standings",
        &[json!({"eventId": "E404", "playerId": 9, "championSlug": "lorraine"})],
    );
    seed(
        &store,
        "decklists",
        &[
            json!({"eventId": "E2", "playerId": 2, "championSlug": "nobody"}),
            json!({"eventId": "E2", "playerId": 3, "championSlug": "ghost"}),
        ],
    );

    let report = validate(&store, fixed_clock());
    assert_eq!(report.failed, 2);
    let messages: Vec<(&str, &str)> = report
        .errors
        .iter()
        .map(|failure| (failure.test.as_str(), failure.message.as_str()))
        .collect();
    assert_eq!(
        messages,
        vec![
            (
                "No orphaned standings (standings without matching events)",
                "Found 1 orphaned standings"
            ),
            (
                "No invalid champion references in decklists",
                "Found 2 decklists with invalid champion references"
            ),
        ]
    );
    assert!(report.errors.iter().all(|failure| report
        .test(&failure.test)
        .is_some_and(|test| test.family == CheckFamily::Referential)));
}

#[test]
fn unresolvable_event_references_fail_the_orphan_check() {
    let store = indexed_store(None);
    seed(
        &store,
        "standings",
        &[
            json!({"playerId": 8, "championSlug": "lorraine"}),
            json!({"eventId": null, "playerId": 9, "championSlug": "zander"}),
        ],
    );

    let report = validate(&store, fixed_clock());
    let orphaned = report.test("No orphaned standings (standings without matching events)");
    assert_eq!(orphaned.map(|test| test.passed), Some(false));
    assert_eq!(
        orphaned.and_then(|test| test.message.as_deref()),
        Some("Found 2 orphaned standings")
    );
}

#[test]
fn denormalized_format_must_match_the_event() {
    let store = indexed_store(None);
    seed(
        &store,
        "standings",
        &[json!({"eventId": "E1", "playerId": 7, "championSlug": "zander", "format": "Draft"})],
    );

    let report = validate(&store, fixed_clock());
    let agreement = report.test("Standing format matches its event's format");
    assert_eq!(agreement.map(|test| test.passed), Some(false));
    assert_eq!(
        agreement.and_then(|test| test.message.as_deref()),
        Some("Found 1 standings whose format differs from their event")
    );
}

#[test]
fn stale_data_and_shape_problems_only_warn() {
    let store = indexed_store(None);
    seed(
        &store,
        "card_performance_stats",
        &[json!({
            "cardId": "card-2",
            "cardName": "Ember",
            "lastCalculated": "2024-03-01T00:00:00Z"
        })],
    );
    seed(
        &store,
        "crawler_state",
        &[
            json!({
                "crawlerName": "decks",
                "lastRunAt": "2024-02-01T00:00:00Z",
                "config": {"enabled": true}
            }),
            json!({
                "crawlerName": "legacy",
                "lastRunAt": "2023-01-01T00:00:00Z",
                "config": {"enabled": false}
            }),
        ],
    );
    seed(&store, "events", &[json!({"eventId": "E3"})]);

    let report = validate(&store, fixed_clock());
    assert!(report.is_success(), "unexpected failures: {:?}", report.errors);
    assert!(has_warning(
        &report,
        "1 card performance stat(s) last calculated before 2024-03-03T00:00:00Z"
    ));
    assert!(has_warning(&report, "1 enabled crawler(s) have not run since 2024-03-03T00:00:00Z"));
    assert!(has_warning(&report, "1 document(s) in events are missing required field 'format'"));
    assert!(has_warning(&report, "sampled document(s) in events do not match the expected shape"));
}

#[test]
fn thresholds_are_configurable() {
    let store = indexed_store(None);
    let config = ValidatorConfig {
        max_avg_object_bytes: 10.0,
        stale_after: Duration::days(30),
        ..fixed_clock()
    };
    let report = validate(&store, config);
    assert!(has_warning(&report, "champions has large average document size"));
    assert!(!has_warning(&report, "last calculated before"));
}

#[test]
fn unused_indexes_are_flagged_and_primary_is_not() {
    let store = indexed_store(None);
    let report = validate(&store, fixed_clock());

    // provisional collections are not audited
    assert!(!has_warning(&report, "on users has never been used"));
    assert!(has_warning(&report, "Index 'idx_champions_element' on champions has never been used"));
    assert!(!has_warning(&report, "Index '_id_'"));

    let champions = report
        .index_usage
        .iter()
        .find(|usage| usage.collection == "champions")
        .map(|usage| usage.indexes.len());
    assert_eq!(champions, Some(5));
}

fn usage_snapshot(store: &SqliteDocumentStore) -> Vec<(String, String, u64)> {
    let mut snapshot = Vec::new();
    for collection in must(store.list_collections()) {
        for usage in must(store.index_usage(&collection)) {
            snapshot.push((collection.clone(), usage.name, usage.ops));
        }
    }
    snapshot
}

#[test]
fn validator_never_writes() {
    let store = indexed_store(Some("champions"));
    must(store.count("events", &Filter::eq("eventId", "E1")));
    let before = must(store.list_collections());
    let documents_before = must(store.database_stats()).documents;
    let usage_before = usage_snapshot(&store);
    assert!(usage_before.iter().any(|(_, _, ops)| *ops > 0));

    let first = validate(&store, fixed_clock());

    assert_eq!(must(store.list_collections()), before);
    assert_eq!(must(store.database_stats()).documents, documents_before);
    assert!(!must(store.collection_exists("champions")));
    assert_eq!(usage_snapshot(&store), usage_before);

    let second = validate(&store, fixed_clock());
    assert_eq!(first, second);
}

#[test]
fn usage_tracking_resumes_after_validation() {
    let store = indexed_store(None);
    let _ = validate(&store, fixed_clock());

    must(store.count("events", &Filter::eq("eventId", "E1")));
    let ops = must(store.index_usage("events"))
        .into_iter()
        .find(|usage| usage.name == "idx_events_eventId_unique")
        .map(|usage| usage.ops);
    assert_eq!(ops, Some(1));
}
