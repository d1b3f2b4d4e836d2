//! End-to-end relational scenarios against in-memory SQLite.


use leases::{LeaseStore, MemLeaseStore};
use pretty_assertions::assert_eq;
use schema_registry::SchemaCheckResult;
use schemaforge_core::{IngestOutcome, RecordIngestor};
use serde_json::json;
use sink_test_common::{
    RecordingClient, init_test_tracing, relational_service,
};
use sinks::{DdlStatement, LiveColumn, RelationalClient};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn names(columns: &[LiveColumn]) -> Vec<&str> {
    columns.iter().map(|c| c.name.as_str()).collect()
}

#[tokio::test]
async fn first_sighting_creates_root_then_repeat_is_idempotent() {
    init_test_tracing();
    let client = Arc::new(RecordingClient::in_memory());
    let store: Arc<dyn LeaseStore> = Arc::new(MemLeaseStore::new());
    let service = relational_service(client.clone(), store);
    let cancel = CancellationToken::new();

    let record = json!({
        "objectKey": "k1", "objectType": "T", "dataVersion": "v1", "a": "x"
    });

    let outcome = service.ingest_record(&record, &cancel).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Written);

    let ddl = client.ddl_log();
    assert_eq!(ddl.len(), 1);
    let DdlStatement::CreateTable { table, columns, primary_key, foreign_key } = &ddl[0]
    else {
        panic!("expected create, got {:?}", ddl[0]);
    };
    assert_eq!(table, "T");
    let typed: Vec<(&str, &str)> = columns
        .iter()
        .map(|c| (c.name.as_str(), c.column_type.as_str()))
        .collect();
    assert_eq!(typed, vec![("objectKey", "key"), ("a", "string")]);
    assert_eq!(primary_key, "objectKey");
    assert!(foreign_key.is_none());
    assert_eq!(client.inserted(), 1);

    service.ingest_record(&record, &cancel).await.unwrap();
    assert_eq!(client.ddl_log().len(), 1, "no DDL for a known shape");
    assert_eq!(client.write_calls(), 2);
    assert_eq!(client.inserted(), 1, "second write is a no-op");
}

#[tokio::test]
async fn items_array_becomes_child_table() {
    init_test_tracing();
    let client = Arc::new(RecordingClient::in_memory());
    let service = relational_service(client.clone(), Arc::new(MemLeaseStore::new()));
    let cancel = CancellationToken::new();

    service
        .ingest_record(
            &json!({
                "objectKey": "k1", "objectType": "T", "dataVersion": "v1",
                "data": {"items": [{"sku": "A"}, {"sku": "B"}]}
            }),
            &cancel,
        )
        .await
        .unwrap();

    let rows = client.rows_for("T0");
    let keys: Vec<(&str, &str)> = rows
        .iter()
        .map(|r| (r.primary_key().unwrap(), r.value("FK").unwrap()))
        .collect();
    assert_eq!(keys, vec![("k1_0", "k1"), ("k1_1", "k1")]);

    let live = client.inner().live_columns("T0").await.unwrap();
    assert_eq!(names(&live), vec!["PK", "FK", "sku"]);
}

#[tokio::test]
async fn delta_records_never_reach_the_sink() {
    let client = Arc::new(RecordingClient::in_memory());
    let service = relational_service(client.clone(), Arc::new(MemLeaseStore::new()));

    let outcome = service
        .ingest_record(
            &json!({"objectKey": "k1", "objectType": "T", "eventType": "delta"}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, IngestOutcome::Skipped);
    assert!(client.ddl_log().is_empty());
    assert_eq!(client.write_calls(), 0);
}

#[tokio::test]
async fn new_field_at_same_version_is_added() {
    let client = Arc::new(RecordingClient::in_memory());
    let service = relational_service(client.clone(), Arc::new(MemLeaseStore::new()));
    let cancel = CancellationToken::new();

    service
        .ingest_record(
            &json!({"objectKey": "k1", "objectType": "T", "dataVersion": "v1", "a": "x"}),
            &cancel,
        )
        .await
        .unwrap();
    service
        .ingest_record(
            &json!({"objectKey": "k2", "objectType": "T", "dataVersion": "v1", "A": "y", "b": "z"}),
            &cancel,
        )
        .await
        .unwrap();

    let ddl = client.ddl_log();
    assert_eq!(ddl.len(), 2);
    let DdlStatement::AddColumns { table, columns } = &ddl[1] else {
        panic!("expected alter, got {:?}", ddl[1]);
    };
    assert_eq!(table, "T");
    assert_eq!(columns.len(), 1);
    assert_eq!(columns[0].name, "b");

    // `A` was written to the live column `a`
    let rows = client.rows_for("T");
    assert_eq!(rows[1].columns, vec!["objectKey", "a", "b"]);
    let live = client.inner().live_columns("T").await.unwrap();
    assert_eq!(names(&live), vec!["objectKey", "a", "b"]);
}

#[tokio::test]
async fn table_names_are_stable_across_instances() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let store: Arc<dyn LeaseStore> = Arc::new(MemLeaseStore::new());
    let cancel = CancellationToken::new();

    let first = Arc::new(RecordingClient::open(db.path()));
    relational_service(first.clone(), store.clone())
        .ingest_record(
            &json!({
                "objectKey": "k1", "objectType": "T", "dataVersion": "v1",
                "items": [{"sku": "A"}]
            }),
            &cancel,
        )
        .await
        .unwrap();

    // a second instance sees `customer` first but must not reuse index 0
    let second = Arc::new(RecordingClient::open(db.path()));
    relational_service(second.clone(), store)
        .ingest_record(
            &json!({
                "objectKey": "k2", "objectType": "T", "dataVersion": "v2",
                "customer": {"name": "c"}, "items": [{"sku": "B"}]
            }),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(second.rows_for("T1").len(), 1);
    assert_eq!(second.rows_for("T0")[0].value("sku"), Some("B"));

    let ctx = second.inner().load_naming_context("T").await.unwrap();
    assert_eq!(
        ctx.entries(),
        vec![("$.items".to_owned(), 0), ("$.customer".to_owned(), 1)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_instances_allocate_distinct_table_names() {
    const INSTANCES: usize = 6;
    const ROUNDS: usize = 3;

    let db = tempfile::NamedTempFile::new().unwrap();
    let store: Arc<dyn LeaseStore> = Arc::new(MemLeaseStore::new());

    let mut handles = Vec::new();
    for i in 0..INSTANCES {
        let client = Arc::new(RecordingClient::open(db.path()));
        let service = relational_service(client, store.clone());
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for r in 0..ROUNDS {
                let mut record = json!({
                    "objectKey": format!("k{i}-{r}"),
                    "objectType": "T",
                    "dataVersion": "v1",
                    "items": [{"sku": "A"}]
                });
                record[format!("f{i}r{r}").as_str()] = json!({"x": "1"});
                let outcome = service.ingest_record(&record, &cancel).await.unwrap();
                assert_eq!(outcome, IngestOutcome::Written);
            }
            service
        }));
    }

    let mut services = Vec::new();
    for h in handles {
        services.push(h.await.unwrap());
    }

    let reader = RecordingClient::open(db.path());
    let entries = reader.inner().load_naming_context("T").await.unwrap().entries();
    let k = 1 + INSTANCES * ROUNDS;

    let mut indices: Vec<usize> = entries.iter().map(|(_, idx)| *idx).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..k).collect::<Vec<_>>());

    let paths: BTreeSet<String> = entries.into_iter().map(|(p, _)| p).collect();
    let mut expected = BTreeSet::from(["$.items".to_owned()]);
    for i in 0..INSTANCES {
        for r in 0..ROUNDS {
            expected.insert(format!("$.f{i}r{r}"));
        }
    }
    assert_eq!(paths, expected);

    let cancel = CancellationToken::new();
    for service in &services {
        assert_eq!(
            service
                .coordinator()
                .check_schema("T", "v1", &cancel)
                .await
                .unwrap(),
            SchemaCheckResult::Current
        );
    }
}

#[tokio::test]
async fn structural_errors_are_fatal_for_the_record() {
    let client = Arc::new(RecordingClient::in_memory());
    let service = relational_service(client.clone(), Arc::new(MemLeaseStore::new()));

    let err = service
        .ingest_record(
            &json!({
                "objectKey": "k1", "objectType": "T", "dataVersion": "v1",
                "items": [1, 2]
            }),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(err.is_structural(), "{err}");
    assert!(client.ddl_log().is_empty());
}
