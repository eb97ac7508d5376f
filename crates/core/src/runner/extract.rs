//! Extract unit: source file into staging table

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;

use super::error::{RunError, RunResult};
use crate::config::{PipelineConfig, RuntimeConfig};
use crate::graph::extract_unit_name;
use crate::ledger::{FeedbackLog, RunLedger, RunLedgerEntry, RunStatus};
use crate::loader::{BulkLoader, DEFAULT_CHUNK_SIZE, LoadError};
use crate::sensor::{FilePattern, TriggerRequest, is_lock_file, newest_match, resolve_lock_file};
use crate::store::Store;

/// Outcome of one extract run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractReport {
    pub import_name: String,
    pub status: RunStatus,
    pub rows_loaded: u64,
    pub staging_table: String,
    pub source_file: Option<PathBuf>,
    pub message: String,
}

enum Source {
    File(PathBuf),
    OrphanLock(PathBuf),
    NotFound(String),
}

/// Runs extract units
#[derive(Clone)]
pub struct ExtractRunner {
    store: Arc<dyn Store>,
    loader: BulkLoader,
    ledger: RunLedger,
    chunk_size: usize,
}

impl ExtractRunner {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            loader: BulkLoader::new(Arc::clone(&store)),
            ledger: RunLedger::new(Arc::clone(&store)),
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_loader(mut self, loader: BulkLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Load the import's source into its staging table.
    ///
    /// With a trigger the triggered file is loaded; otherwise the newest file
    /// matching the pattern in the monitored directory. A missing source is
    /// a successful run with zero rows.
    pub async fn run(
        &self,
        config: &PipelineConfig,
        run_id: &str,
        trigger: Option<&TriggerRequest>,
    ) -> RunResult<ExtractReport> {
        let span = tracing::info_span!("extract", import = %config.import_name, run_id);
        self.run_inner(config, run_id, trigger).instrument(span).await
    }

    async fn run_inner(
        &self,
        config: &PipelineConfig,
        run_id: &str,
        trigger: Option<&TriggerRequest>,
    ) -> RunResult<ExtractReport> {
        let unit = extract_unit_name(&config.import_name);
        let entry = RunLedgerEntry::start(run_id, &config.pipeline_name, &config.import_name, &unit);
        let staging_table = self.current_staging_table(config).await;
        tracing::info!(table = %staging_table, "Starting extraction");

        let source = match self.resolve_source(config, trigger) {
            Ok(source) => source,
            Err(e) => return Err(self.fail(config, entry, &unit, None, e).await),
        };
        let path = match source {
            Source::File(path) => path,
            Source::OrphanLock(path) => {
                tracing::warn!(file = %path.display(), "Triggered on a lock file without its document; skipping");
                let message = "Ignored orphan lock file.";
                self.ledger
                    .record(&entry.finish(RunStatus::Skipped, message))
                    .await;
                return Ok(ExtractReport {
                    import_name: config.import_name.clone(),
                    status: RunStatus::Skipped,
                    rows_loaded: 0,
                    staging_table,
                    source_file: Some(path),
                    message: message.to_string(),
                });
            }
            Source::NotFound(wanted) => {
                return Ok(self.source_missing(entry, staging_table, &wanted).await);
            }
        };

        match self.load(config, &path, &staging_table, run_id).await {
            Ok(rows) => {
                let message = format!(
                    "Successfully processed and loaded {rows} rows into {staging_table}."
                );
                tracing::info!(rows, table = %staging_table, "Load to staging complete");
                self.ledger
                    .record(&entry.finish(RunStatus::Success, &message).with_rows(rows))
                    .await;
                Ok(ExtractReport {
                    import_name: config.import_name.clone(),
                    status: RunStatus::Success,
                    rows_loaded: rows,
                    staging_table,
                    source_file: Some(path),
                    message,
                })
            }
            Err(e) if e.is_benign() => {
                Ok(self
                    .source_missing(entry, staging_table, &path.display().to_string())
                    .await)
            }
            Err(e) => Err(self.fail(config, entry, &unit, Some(&path), e).await),
        }
    }

    async fn load(
        &self,
        config: &PipelineConfig,
        path: &Path,
        staging_table: &str,
        run_id: &str,
    ) -> RunResult<u64> {
        let parser = self
            .loader
            .registry()
            .resolve(&config.file_type, config.parser_function.as_deref())?;
        let report = self
            .loader
            .load_with_parser(
                parser,
                path,
                staging_table,
                run_id,
                &config.column_map(),
                self.chunk_size,
            )
            .await?;

        let failures = self.store.quality_failures(run_id, staging_table).await?;
        tracing::info!(table = staging_table, failures, "Data quality checks completed");
        if failures > 0 {
            return Err(RunError::QualityGateFailed {
                table: staging_table.to_string(),
                failures,
            });
        }
        Ok(report.rows_loaded)
    }

    /// The staging table as stored now, falling back to the cached value
    async fn current_staging_table(&self, config: &PipelineConfig) -> String {
        match self.store.config_row(&config.import_name).await {
            Ok(Some(row)) => match RuntimeConfig::from_row(&row).staging_table {
                Some(table) if table != config.staging_table => {
                    tracing::info!(
                        table = %table,
                        configured = %config.staging_table,
                        "Runtime config override for staging table"
                    );
                    table
                }
                _ => config.staging_table.clone(),
            },
            Ok(None) => config.staging_table.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch staging table; using cached value");
                config.staging_table.clone()
            }
        }
    }

    fn resolve_source(
        &self,
        config: &PipelineConfig,
        trigger: Option<&TriggerRequest>,
    ) -> RunResult<Source> {
        if let Some(trigger) = trigger {
            let path = &trigger.source_file_path;
            if !is_lock_file(path) {
                return Ok(Source::File(path.clone()));
            }
            return Ok(match resolve_lock_file(path) {
                Some(real) => {
                    tracing::info!(from = %path.display(), to = %real.display(), "Redirecting lock file");
                    Source::File(real)
                }
                None => Source::OrphanLock(path.clone()),
            });
        }

        let pattern = FilePattern::new(&config.file_pattern)?;
        let dir = config
            .monitored_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(match newest_match(&dir, &pattern)? {
            Some(path) => {
                tracing::info!(pattern = pattern.as_str(), file = %path.display(), "Resolved source pattern");
                Source::File(path)
            }
            None => Source::NotFound(dir.join(pattern.as_str()).display().to_string()),
        })
    }

    async fn source_missing(
        &self,
        entry: RunLedgerEntry,
        staging_table: String,
        wanted: &str,
    ) -> ExtractReport {
        tracing::warn!(source = wanted, "Source file not found; skipping");
        let message = format!("Source file not found: '{wanted}'. No data loaded.");
        let import_name = entry.import_name.clone();
        self.ledger
            .record(&entry.finish(RunStatus::Success, &message))
            .await;
        ExtractReport {
            import_name,
            status: RunStatus::Success,
            rows_loaded: 0,
            staging_table,
            source_file: None,
            message,
        }
    }

    async fn fail(
        &self,
        config: &PipelineConfig,
        entry: RunLedgerEntry,
        unit: &str,
        path: Option<&Path>,
        error: RunError,
    ) -> RunError {
        tracing::error!(error = %error, "Extraction failed");
        let mut entry = entry
            .finish(RunStatus::Failure, error.to_string())
            .with_resolution(error.resolution_steps(&config.import_name, unit));
        if !matches!(error, RunError::Load(LoadError::SchemaMismatch { .. })) {
            entry = entry.with_error(format!("An unexpected error of type {} occurred.", error.kind()));
        }

        if let Some(dir) = &config.monitored_directory {
            FeedbackLog::new(dir.clone()).append(RunStatus::Failure, path, &entry.message);
        }
        self.ledger.record(&entry).await;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::fs;
    use tempfile::TempDir;

    fn setup(dir: &Path) -> (MemoryStore, PipelineConfig) {
        let store = MemoryStore::new();
        store.create_table("stg_orders", &["order_id", "amount", "run_id"]);
        let config = PipelineConfig::builder("orders")
            .pipeline("Shop")
            .file_pattern("orders_*.csv")
            .file_type("csv")
            .staging_table("stg_orders")
            .destination("orders")
            .procedure("sp_orders")
            .monitored_directory(dir)
            .build()
            .unwrap();
        store.add_config(&config).unwrap();
        (store, config)
    }

    #[tokio::test]
    async fn test_manual_run_loads_newest_file() {
        let dir = TempDir::new().unwrap();
        let (store, config) = setup(dir.path());
        fs::write(dir.path().join("orders_1.csv"), "order_id,amount\n1,10\n2,20\n").unwrap();

        let runner = ExtractRunner::new(Arc::new(store.clone()));
        let report = runner.run(&config, "run-1", None).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.rows_loaded, 2);
        assert_eq!(store.row_count("stg_orders").unwrap(), 2);
        let ledger = store.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].asset_name, "orders_extract_and_load_staging");
        assert_eq!(ledger[0].rows_processed, 2);
    }

    #[tokio::test]
    async fn test_missing_source_is_success_with_zero_rows() {
        let dir = TempDir::new().unwrap();
        let (store, config) = setup(dir.path());

        let runner = ExtractRunner::new(Arc::new(store.clone()));
        let report = runner.run(&config, "run-1", None).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.rows_loaded, 0);
        assert!(report.message.starts_with("Source file not found"));
    }

    #[tokio::test]
    async fn test_orphan_lock_trigger_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (store, config) = setup(dir.path());
        let lock = dir.path().join("~$orders_1.csv");
        fs::write(&lock, "").unwrap();
        let trigger = TriggerRequest {
            run_key: "k".to_string(),
            import_name: "orders".to_string(),
            job_name: "orders_job".to_string(),
            source_file_path: lock,
        };

        let runner = ExtractRunner::new(Arc::new(store.clone()));
        let report = runner.run(&config, "run-1", Some(&trigger)).await.unwrap();
        assert_eq!(report.status, RunStatus::Skipped);
        assert_eq!(store.ledger()[0].status, RunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_diagnosed() {
        let dir = TempDir::new().unwrap();
        let (store, config) = setup(dir.path());
        fs::write(dir.path().join("orders_1.csv"), "Bestellnummer,Betrag\n1,10\n").unwrap();

        let runner = ExtractRunner::new(Arc::new(store.clone()));
        let err = runner.run(&config, "run-1", None).await.unwrap_err();
        assert!(matches!(err, RunError::Load(LoadError::SchemaMismatch { .. })));

        let entry = &store.ledger()[0];
        assert_eq!(entry.status, RunStatus::Failure);
        assert!(entry.resolution_steps.as_ref().unwrap().contains("Bestellnummer"));
        assert!(entry.error_details.is_none());

        let history: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with("__run_history.log"))
            .collect();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_quality_gate_stops_run() {
        let dir = TempDir::new().unwrap();
        let (store, config) = setup(dir.path());
        store.set_quality_failures("stg_orders", 3);
        fs::write(dir.path().join("orders_1.csv"), "order_id,amount\n1,10\n").unwrap();

        let runner = ExtractRunner::new(Arc::new(store.clone()));
        let err = runner.run(&config, "run-1", None).await.unwrap_err();
        assert!(matches!(err, RunError::QualityGateFailed { failures: 3, .. }));
        assert_eq!(
            store.ledger()[0].error_details.as_deref(),
            Some("An unexpected error of type QualityGateFailed occurred.")
        );
    }
}
