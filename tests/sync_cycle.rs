//! Full sync cycles over an in-memory object store and warehouse.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use common::config::{Configuration, ProcessBy};
use common::storage::PartitionStore;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use syncer::testing::{InMemoryWarehouse, WarehouseRow};
use syncer::warehouse::StatementKind;
use syncer::{ObjectStoreCatalog, Shutdown, SyncRunner};

const ROLE_VAR: &str = "PARTSYNC_IT_ROLE";

fn config() -> Configuration {
    // SAFETY: every test in this binary sets the same value
    unsafe { std::env::set_var(ROLE_VAR, "arn:aws:iam::123456789012:role/loader") };
    let mut config = Configuration::default();
    config.bulk_load.role_env_var = ROLE_VAR.to_string();
    config
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

async fn put(store: &InMemory, key: &str, body: &'static str) {
    store
        .put(&Path::from(key), PutPayload::from(Bytes::from_static(body.as_bytes())))
        .await
        .unwrap();
}

fn runner(store: Arc<InMemory>, warehouse: &InMemoryWarehouse) -> SyncRunner {
    let catalog = ObjectStoreCatalog::new(PartitionStore::new(store, "temp"));
    SyncRunner::new(
        &config(),
        Arc::new(catalog),
        warehouse.connector(),
        Shutdown::never(),
    )
}

#[tokio::test]
async fn test_new_org_is_loaded_then_left_alone() {
    let store = Arc::new(InMemory::new());
    put(&store, "temp/date=2024-01-01/acme", "h\na\nb\nc\n").await;

    let loaded_at = Utc::now();
    let rows: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|payload| WarehouseRow::new(date("2024-01-01"), "1", "acme", loaded_at, payload))
        .collect();
    let warehouse = InMemoryWarehouse::new();
    warehouse.add_source("s3://temp/date=2024-01-01/acme", rows.clone());

    let runner = runner(store, &warehouse);

    let worklist = runner.plan(ProcessBy::DateOrg).await.unwrap();
    assert_eq!(worklist.len(), 1);
    assert_eq!(worklist[0].to_string(), "acme - 2024-01-01");

    let report = runner.run_cycle(ProcessBy::DateOrg).await.unwrap();
    assert_eq!(report.planned, 1);
    assert_eq!(report.succeeded, 1);
    assert!(report.failed.is_empty());
    assert_eq!(warehouse.target_rows(), rows);

    let summary = runner.metrics().summary();
    assert_eq!(summary.rows_loaded, 3);
    assert_eq!(summary.rows_deleted, 0);
    assert_eq!(summary.rows_inserted, 3);

    // Unchanged data on the next run produces no work
    let report = runner.run_cycle(ProcessBy::DateOrg).await.unwrap();
    assert_eq!(report.planned, 0);
    assert_eq!(warehouse.target_rows(), rows);
    assert_eq!(warehouse.count(StatementKind::Begin), 1);
    assert_eq!(warehouse.open_sessions(), 0);
}

#[tokio::test]
async fn test_process_by_date_reloads_whole_dates() {
    let store = Arc::new(InMemory::new());
    put(&store, "temp/date=2024-01-01/acme", "h\na\n").await;
    put(&store, "temp/date=2024-01-01/globex", "h\ng\n").await;
    put(&store, "temp/date=2024-01-02/acme", "h\nb\n").await;
    // skipped: empty and malformed
    put(&store, "temp/date=2024-01-03/initech", "").await;
    put(&store, "temp/README", "notes").await;

    let now = Utc::now();
    let warehouse = InMemoryWarehouse::new();
    warehouse.seed_target(vec![WarehouseRow::new(date("2024-01-01"), "1", "acme", now, "old")]);
    warehouse.add_source(
        "s3://temp/date=2024-01-01/acme",
        vec![WarehouseRow::new(date("2024-01-01"), "1", "acme", now, "a")],
    );
    warehouse.add_source(
        "s3://temp/date=2024-01-01/globex",
        vec![WarehouseRow::new(date("2024-01-01"), "2", "globex", now, "g")],
    );
    warehouse.add_source(
        "s3://temp/date=2024-01-02/acme",
        vec![WarehouseRow::new(date("2024-01-02"), "1", "acme", now, "b")],
    );

    let runner = runner(store, &warehouse);
    let report = runner.run_cycle(ProcessBy::Date).await.unwrap();

    assert_eq!(report.planned, 2);
    assert_eq!(report.succeeded, 2);

    let mut payloads: Vec<_> = warehouse
        .target_rows()
        .into_iter()
        .map(|row| row.payload)
        .collect();
    payloads.sort();
    assert_eq!(payloads, vec!["a", "b", "g"]);
}
