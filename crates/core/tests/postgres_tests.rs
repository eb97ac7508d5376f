//! Integration tests for the PostgreSQL store and advisory locks
//!
//! Run against a scratch database with:
//! ELT_DATABASE_URL=postgresql://... cargo test --features postgres-backend -p elt-core
//!
//! Every test returns early when `ELT_DATABASE_URL` is unset. Tables and
//! functions get unique names and are dropped at the end of each test.

#![cfg(feature = "postgres-backend")]

use std::sync::Arc;
use std::time::Duration;

use elt_core::config::{LoadMethod, PipelineConfig};
use elt_core::ledger::RunStatus;
use elt_core::lock::postgres::advisory_key;
use elt_core::lock::{LockManager, PgAdvisoryLockManager};
use elt_core::runner::TransformRunner;
use elt_core::store::{PgStore, Store, StoreTransaction};
use tokio_postgres::{Client, NoTls};

fn database_url() -> Option<String> {
    let url = std::env::var("ELT_DATABASE_URL")
        .ok()
        .filter(|u| !u.trim().is_empty());
    if url.is_none() {
        eprintln!("ELT_DATABASE_URL not set; skipping PostgreSQL test");
    }
    url
}

/// Same server, sessions pinned to a time zone away from UTC
fn with_time_zone(url: &str, zone: &str) -> String {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}options=-c%20TimeZone%3D{}", zone.replace('/', "%2F"))
    } else {
        format!("{url} options='-c TimeZone={zone}'")
    }
}

async fn admin(url: &str) -> Client {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .expect("Failed to connect to ELT_DATABASE_URL");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

async fn ids(client: &Client, table: &str) -> Vec<i32> {
    client
        .query(&format!("SELECT id FROM {table} ORDER BY id"), &[])
        .await
        .unwrap()
        .iter()
        .map(|r| r.get::<_, i32>(0))
        .collect()
}

/// Staging table, destination table and a procedure that truncates what it
/// is told to and moves one run's staged ids
async fn create_transform_objects(client: &Client, staging: &str, destination: &str, procedure: &str) {
    client
        .batch_execute(&format!(
            "CREATE TABLE {staging} (id int, run_id text);
             CREATE TABLE {destination} (id int, load_timestamp timestamp DEFAULT now());
             CREATE FUNCTION {procedure}(run_id text, tables_to_truncate text) RETURNS bigint
             LANGUAGE plpgsql AS $$
             DECLARE moved bigint;
             BEGIN
                 IF tables_to_truncate IS NOT NULL THEN
                     EXECUTE 'TRUNCATE TABLE ' || tables_to_truncate;
                 END IF;
                 INSERT INTO {destination} (id)
                     SELECT s.id FROM {staging} s WHERE s.run_id = {procedure}.run_id;
                 GET DIAGNOSTICS moved = ROW_COUNT;
                 RETURN moved;
             END $$;"
        ))
        .await
        .unwrap();
}

async fn drop_transform_objects(client: &Client, staging: &str, destination: &str, procedure: &str) {
    client
        .batch_execute(&format!(
            "DROP FUNCTION IF EXISTS {procedure}(text, text);
             DROP TABLE IF EXISTS {staging};
             DROP TABLE IF EXISTS {destination};"
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_latest_load_in_non_utc_session() {
    let Some(url) = database_url() else {
        return;
    };
    let berlin = with_time_zone(&url, "Europe/Berlin");
    let client = admin(&berlin).await;
    let table = unique("elt_test_clock");
    client
        .batch_execute(&format!(
            "CREATE TABLE {table} (id int, load_timestamp timestamp DEFAULT now())"
        ))
        .await
        .unwrap();

    let store = PgStore::connect(&berlin, 2).unwrap();
    let empty = store.latest_load(&table).await.unwrap();
    assert_eq!(empty.seconds_since_last_load(), None);

    client
        .execute(&format!("INSERT INTO {table} (id) VALUES (1)"), &[])
        .await
        .unwrap();
    let clock = store.latest_load(&table).await.unwrap();
    let elapsed = clock.seconds_since_last_load().unwrap();

    client
        .batch_execute(&format!("DROP TABLE {table}"))
        .await
        .unwrap();
    assert!(
        (-1.0..5.0).contains(&elapsed),
        "a load done just now measured {elapsed}s ago"
    );
}

#[tokio::test]
async fn test_call_procedure_truncates_only_when_asked() {
    let Some(url) = database_url() else {
        return;
    };
    let client = admin(&url).await;
    let staging = unique("elt_test_stg");
    let destination = unique("elt_test_dst");
    let procedure = unique("elt_test_sp");
    create_transform_objects(&client, &staging, &destination, &procedure).await;
    client
        .batch_execute(&format!(
            "INSERT INTO {destination} (id) VALUES (99);
             INSERT INTO {staging} VALUES (1, 'r1'), (2, 'r1'), (3, 'r2');"
        ))
        .await
        .unwrap();

    let store = PgStore::connect(&url, 2).unwrap();

    let mut tx = store.begin().await.unwrap();
    let moved = tx
        .call_procedure(&procedure, "r1", Some(destination.as_str()))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(moved, 2);
    assert_eq!(ids(&client, &destination).await, vec![1, 2]);

    let mut tx = store.begin().await.unwrap();
    tx.call_procedure(&procedure, "r2", None).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(ids(&client, &destination).await, vec![1, 2, 3]);

    let mut tx = store.begin().await.unwrap();
    tx.call_procedure(&procedure, "r1", Some(destination.as_str()))
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(ids(&client, &destination).await, vec![1, 2, 3]);

    drop_transform_objects(&client, &staging, &destination, &procedure).await;
}

#[tokio::test]
async fn test_advisory_lock_released_on_drop() {
    let Some(url) = database_url() else {
        return;
    };
    let client = admin(&url).await;
    let resource = unique("lock_elt_test");
    let key = advisory_key(&resource);
    let locks = PgAdvisoryLockManager::connect(&url, 2).unwrap();

    let handle = locks.acquire(&resource).await.unwrap();
    let taken: bool = client
        .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
        .await
        .unwrap()
        .get(0);
    assert!(!taken, "lock held elsewhere must not be granted");

    drop(handle);

    // The unlock runs on a spawned task
    let mut released = false;
    for _ in 0..50 {
        let row = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
            .await
            .unwrap();
        if row.get::<_, bool>(0) {
            released = true;
            client
                .execute("SELECT pg_advisory_unlock($1)", &[&key])
                .await
                .unwrap();
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(released, "lock was not released after the handle was dropped");
}

#[tokio::test]
async fn test_transform_with_single_connection_store_pool() {
    let Some(url) = database_url() else {
        return;
    };
    let client = admin(&url).await;
    let staging = unique("elt_test_stg");
    let destination = unique("elt_test_dst");
    let procedure = unique("elt_test_sp");
    create_transform_objects(&client, &staging, &destination, &procedure).await;
    client
        .batch_execute(&format!(
            "INSERT INTO {staging} VALUES (1, 'r1'), (2, 'r1');"
        ))
        .await
        .unwrap();

    // Unique config and ledger tables that do not exist: the runtime fetch
    // falls back to append and ledger writes are only logged
    let store = PgStore::connect(&url, 1)
        .unwrap()
        .with_tables(&unique("elt_test_cfg"), &unique("elt_test_ledger"))
        .unwrap();
    let locks = PgAdvisoryLockManager::connect(&url, 1).unwrap();
    let runner = TransformRunner::new(Arc::new(store), Arc::new(locks));
    let config = PipelineConfig::builder(&unique("import"))
        .staging_table(&staging)
        .destination(&destination)
        .procedure(&procedure)
        .load_method(LoadMethod::Append)
        .build()
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), runner.run(&config, "r1")).await;

    let moved = ids(&client, &destination).await;
    let staged = ids(&client, &staging).await;
    drop_transform_objects(&client, &staging, &destination, &procedure).await;

    let report = outcome
        .expect("transform did not finish within 10s")
        .unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.rows_affected, 2);
    assert_eq!(moved, vec![1, 2]);
    assert!(staged.is_empty());
}
