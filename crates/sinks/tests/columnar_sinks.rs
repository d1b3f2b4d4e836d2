//! Analytics and log-workspace services over their in-memory clients.


use leases::{LeaseStore, MemLeaseStore};
use pretty_assertions::assert_eq;
use schemaforge_core::{RecordIngestor, SinkKind};
use serde_json::{Value, json};
use sink_test_common::{coordinator, init_test_tracing};
use sinks::analytics::{AnalyticsClient, MappingColumn};
use sinks::log_workspace::LogWorkspaceClient;
use sinks::{
    AnalyticsService, LogWorkspaceService, MemAnalyticsClient,
    MemLogWorkspaceClient,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn order(key: &str, version: &str, extra: Value) -> Value {
    let mut record = json!({
        "objectKey": key,
        "objectType": "Order",
        "dataVersion": version,
        "data": {"amount": "12", "items": [{"sku": "A"}]}
    });
    if let (Some(fields), Value::Object(extra)) = (record.as_object_mut(), extra) {
        fields.extend(extra);
    }
    record
}

fn analytics(client: Arc<MemAnalyticsClient>, store: Arc<dyn LeaseStore>) -> AnalyticsService {
    AnalyticsService::new(
        client,
        coordinator(SinkKind::Analytics, store),
        Duration::from_secs(5),
    )
}

fn workspace(
    client: Arc<MemLogWorkspaceClient>,
    store: Arc<dyn LeaseStore>,
) -> LogWorkspaceService {
    LogWorkspaceService::new(
        client,
        coordinator(SinkKind::LogWorkspace, store),
        Duration::from_secs(5),
    )
}

// ============================================================================
// Analytics
// ============================================================================

#[tokio::test]
async fn analytics_creates_table_and_mapping() {
    init_test_tracing();
    let client = Arc::new(MemAnalyticsClient::new());
    let service = analytics(client.clone(), Arc::new(MemLeaseStore::new()));
    let cancel = CancellationToken::new();

    service
        .ingest_record(&order("k1", "v1", json!({})), &cancel)
        .await
        .unwrap();

    let live = client.live_columns("Order").await.unwrap();
    let live: Vec<(&str, &str)> = live
        .iter()
        .map(|c| (c.name.as_str(), c.native_type.as_str()))
        .collect();
    assert_eq!(
        live,
        vec![("objectKey", "string"), ("amount", "string"), ("items", "string")]
    );

    let mapping = client.mapping("OrderJSONMapping").unwrap();
    assert_eq!(
        mapping.columns[1],
        MappingColumn {
            column: "amount".into(),
            path: "$.amount".into(),
            datatype: "string".into(),
        }
    );

    let rows = client.direct_rows("Order");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["items"], json!("[{\"sku\":\"A\"}]"));
}

#[tokio::test]
async fn analytics_migrates_once_per_version() {
    let client = Arc::new(MemAnalyticsClient::new());
    let service = analytics(client.clone(), Arc::new(MemLeaseStore::new()));
    let cancel = CancellationToken::new();

    service.ingest_record(&order("k1", "v1", json!({})), &cancel).await.unwrap();
    service.ingest_record(&order("k2", "v1", json!({})), &cancel).await.unwrap();
    assert_eq!(client.create_merge_calls(), 1);

    service
        .ingest_record(&order("k3", "v2", json!({"region": "eu"})), &cancel)
        .await
        .unwrap();
    assert_eq!(client.create_merge_calls(), 2);
    let mapping = client.mapping("OrderJSONMapping").unwrap();
    assert_eq!(mapping.columns.last().unwrap().column, "region");
    assert_eq!(client.direct_rows("Order").len(), 3);
}

#[tokio::test]
async fn throttled_direct_ingest_falls_back_to_queue() {
    let client = Arc::new(MemAnalyticsClient::new());
    let service = analytics(client.clone(), Arc::new(MemLeaseStore::new()));
    let cancel = CancellationToken::new();

    client.set_throttled(true);
    service.ingest_record(&order("k1", "v1", json!({})), &cancel).await.unwrap();

    assert!(client.direct_rows("Order").is_empty());
    assert_eq!(client.queued_rows("Order").len(), 1);
}

// ============================================================================
// Log workspace
// ============================================================================

#[tokio::test]
async fn workspace_builds_table_and_rule() {
    let client = Arc::new(MemLogWorkspaceClient::new());
    let service = workspace(client.clone(), Arc::new(MemLeaseStore::new()));
    let cancel = CancellationToken::new();

    service.ingest_record(&order("k1", "v1", json!({})), &cancel).await.unwrap();

    let live = client.live_columns("Order_CL").await.unwrap();
    let names: Vec<&str> = live.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["TimeGenerated", "objectKey", "amount", "items"]);
    assert_eq!(live[0].native_type, "datetime");

    let (id, rule) = client.rule("OrderDCR").unwrap();
    assert_eq!(rule.stream, "Custom-Order_CL");
    assert_eq!(rule.table, "Order_CL");
    assert_eq!(service.cached_rule_id("Order"), Some(id));

    let uploads = client.uploads("Custom-Order_CL");
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0]["TimeGenerated"].is_string());
    assert_eq!(uploads[0]["objectKey"], json!("k1"));
}

#[tokio::test]
async fn workspace_peer_adopts_new_rule_id() {
    let client = Arc::new(MemLogWorkspaceClient::new());
    let store: Arc<dyn LeaseStore> = Arc::new(MemLeaseStore::new());
    let a = workspace(client.clone(), store.clone());
    let b = workspace(client.clone(), store);
    let cancel = CancellationToken::new();

    a.ingest_record(&order("k1", "v1", json!({})), &cancel).await.unwrap();
    b.ingest_record(&order("k2", "v1", json!({})), &cancel).await.unwrap();
    let (first_id, _) = client.rule("OrderDCR").unwrap();
    assert_eq!(b.cached_rule_id("Order"), Some(first_id.clone()));

    a.ingest_record(&order("k3", "v2", json!({"region": "eu"})), &cancel)
        .await
        .unwrap();
    let (second_id, rule) = client.rule("OrderDCR").unwrap();
    assert_ne!(first_id, second_id);
    assert!(rule.columns.iter().any(|c| c.name == "region"));

    // b learns v2 from the lease metadata and picks up the new id
    b.ingest_record(&order("k4", "v2", json!({})), &cancel).await.unwrap();
    assert_eq!(b.cached_rule_id("Order"), Some(second_id));
    assert_eq!(client.uploads("Custom-Order_CL").len(), 4);
}

#[tokio::test]
async fn workspace_recreates_a_deleted_rule() {
    let client = Arc::new(MemLogWorkspaceClient::new());
    let store: Arc<dyn LeaseStore> = Arc::new(MemLeaseStore::new());
    let cancel = CancellationToken::new();

    workspace(client.clone(), store.clone())
        .ingest_record(&order("k1", "v1", json!({})), &cancel)
        .await
        .unwrap();
    client.delete_rule("OrderDCR");

    // a fresh instance finds the version synced but no rule
    let fresh = workspace(client.clone(), store);
    fresh
        .ingest_record(&order("k2", "v1", json!({})), &cancel)
        .await
        .unwrap();

    assert!(client.rule("OrderDCR").is_some());
    assert_eq!(client.uploads("Custom-Order_CL").len(), 2);
}
