//! Concurrent transform runs and bounded-memory loading

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use elt_core::config::ColumnMapping;
use elt_core::lock::{InProcessLockManager, LockManager};
use elt_core::store::{MemoryEventKind, MemoryProcedure, MemoryStore, Store};
use elt_core::{BulkLoader, PipelineConfig, TransformRunner};
use tempfile::NamedTempFile;

/// Two imports writing into the same destination, which has no
/// `load_timestamp` column so every replace run truncates
fn shared_destination_store() -> (MemoryStore, Vec<PipelineConfig>) {
    let store = MemoryStore::new();
    store.create_table("sales", &["id"]);
    store.set_procedure_latency(Duration::from_millis(30));

    let mut configs = Vec::new();
    for region in ["eu", "us"] {
        let import = format!("sales_{region}");
        let staging = format!("stg_sales_{region}");
        let procedure = format!("sp_sales_{region}");
        store.create_table(&staging, &["id", "run_id"]);
        store.register_procedure(
            &procedure,
            MemoryProcedure::CopyStaged {
                staging: staging.clone(),
                destination: "sales".to_string(),
            },
        );
        let config = PipelineConfig::builder(&import)
            .pipeline("Sales")
            .staging_table(&staging)
            .destination("Sales")
            .procedure(&procedure)
            .load_method(elt_core::LoadMethod::Replace)
            .build()
            .unwrap();
        store.add_config(&config).unwrap();
        configs.push(config);
    }
    (store, configs)
}

async fn stage(store: &MemoryStore, table: &str, run_id: &str) {
    store
        .insert_rows(
            table,
            &["id".to_string(), "run_id".to_string()],
            &[vec![Some(format!("{run_id}-row")), Some(run_id.to_string())]],
        )
        .await
        .expect("Failed to stage rows");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_truncate_and_insert_are_never_interleaved() {
    let (store, configs) = shared_destination_store();
    let locks: Arc<dyn LockManager> = Arc::new(InProcessLockManager::new());
    let runner = TransformRunner::new(Arc::new(store.clone()), Arc::clone(&locks));

    let mut handles = Vec::new();
    for round in 0..3 {
        for config in &configs {
            let run_id = format!("{}-{round}", config.import_name);
            stage(&store, &config.staging_table, &run_id).await;

            let runner = runner.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                runner.run(&config, &run_id).await
            }));
        }
    }
    for handle in handles {
        let report = handle.await.expect("task panicked").expect("transform failed");
        assert!(report.decision.should_truncate);
    }

    let events: Vec<_> = store
        .events()
        .into_iter()
        .filter(|e| e.table == "sales")
        .collect();
    assert_eq!(events.len(), 12);

    // Every truncate is immediately followed by the insert of the same run
    for pair in events.chunks(2) {
        assert_eq!(pair[0].kind, MemoryEventKind::Truncate);
        assert_eq!(pair[1].kind, MemoryEventKind::Insert);
        assert_eq!(pair[0].run_id, pair[1].run_id);
    }

    // Exactly one run's rows survive the last truncate
    assert_eq!(store.row_count("sales").unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_separate_destinations_do_not_block_each_other() {
    let locks = InProcessLockManager::new();
    let first = locks.acquire("lock_sales").await.unwrap();
    let other = tokio::time::timeout(Duration::from_secs(1), locks.acquire("lock_orders"))
        .await
        .expect("a different resource must not wait");
    assert!(other.is_ok());

    let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire("lock_sales")).await;
    assert!(blocked.is_err());
    drop(first);

    let reacquired =
        tokio::time::timeout(Duration::from_secs(1), locks.acquire("lock_sales")).await;
    assert!(reacquired.is_ok());
}

fn large_csv(rows: usize) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
    writeln!(file, "id,amount").unwrap();
    for i in 0..rows {
        writeln!(file, "{i},{}.50", i % 97).unwrap();
    }
    file.flush().unwrap();
    file
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunks_in_memory_stay_bounded() {
    let store = MemoryStore::new();
    store.create_table("stg_payments", &["id", "amount", "run_id"]);
    store.set_insert_latency(Duration::from_millis(5));
    let file = large_csv(400);

    let loader = BulkLoader::new(Arc::new(store.clone())).with_concurrency(4);
    let report = loader
        .load_chunked(file.path(), "stg_payments", "run-1", &ColumnMapping::new(), 10)
        .await
        .unwrap();

    assert_eq!(report.rows_loaded, 400);
    assert_eq!(report.chunks, 40);
    assert!(report.peak_chunks_in_memory >= 2, "inserts never overlapped");
    assert!(
        report.peak_chunks_in_memory <= 5,
        "peak of {} chunks exceeds concurrency + 1",
        report.peak_chunks_in_memory
    );
    assert_eq!(store.row_count("stg_payments").unwrap(), 400);
}

#[tokio::test]
async fn test_single_worker_loads_sequentially() {
    let store = MemoryStore::new();
    store.create_table("stg_payments", &["id", "amount", "run_id"]);
    store.set_insert_latency(Duration::from_millis(1));
    let file = large_csv(50);

    let loader = BulkLoader::new(Arc::new(store.clone())).with_concurrency(1);
    let report = loader
        .load_chunked(file.path(), "stg_payments", "run-1", &ColumnMapping::new(), 7)
        .await
        .unwrap();

    assert_eq!(report.rows_loaded, 50);
    assert_eq!(report.chunks, 8);
    assert!(report.peak_chunks_in_memory <= 2);
}
