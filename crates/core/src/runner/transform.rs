//! Transform unit: staged rows into the destination under the
//! destination's serialization lock

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;

use super::error::{RunError, RunResult};
use crate::arbiter::{AutoSwitch, BatchWindow, LoadDecision, LoadMethodArbiter};
use crate::config::{PipelineConfig, RuntimeConfig};
use crate::graph::transform_unit_name;
use crate::ledger::{FeedbackLog, RunLedger, RunLedgerEntry, RunStatus};
use crate::lock::LockManager;
use crate::store::Store;
use crate::transform::TransformExecutor;

/// Outcome of one transform run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformReport {
    pub import_name: String,
    pub status: RunStatus,
    pub decision: LoadDecision,
    pub rows_affected: u64,
    /// Staged rows removed as duplicates before the procedure ran
    pub duplicates_removed: u64,
    pub auto_switch: Option<AutoSwitch>,
    /// Whether the user feedback log was written
    pub notified: bool,
}

/// Runs transform units
#[derive(Clone)]
pub struct TransformRunner {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockManager>,
    arbiter: LoadMethodArbiter,
    executor: TransformExecutor,
    ledger: RunLedger,
}

impl TransformRunner {
    pub fn new(store: Arc<dyn Store>, locks: Arc<dyn LockManager>) -> Self {
        Self {
            arbiter: LoadMethodArbiter::new(Arc::clone(&store)),
            executor: TransformExecutor::new(Arc::clone(&store)),
            ledger: RunLedger::new(Arc::clone(&store)),
            store,
            locks,
        }
    }

    pub fn with_batch_window(mut self, window: BatchWindow) -> Self {
        self.arbiter = self.arbiter.with_window(window);
        self
    }

    /// Move this run's staged rows into the destination.
    ///
    /// Holds the destination lock from before the runtime config is read
    /// until the ledger row is written. On failure the procedure's
    /// transaction is rolled back, the lock released and a FAILURE row
    /// recorded before the error is returned.
    pub async fn run(&self, config: &PipelineConfig, run_id: &str) -> RunResult<TransformReport> {
        let span = tracing::info_span!("transform", import = %config.import_name, run_id);
        self.run_inner(config, run_id).instrument(span).await
    }

    async fn run_inner(&self, config: &PipelineConfig, run_id: &str) -> RunResult<TransformReport> {
        let unit = transform_unit_name(&config.import_name);
        let resource = config.lock_resource();
        let _lock = self.locks.acquire(&resource).await?;
        tracing::info!(resource = %resource, "Serialization lock acquired");

        let runtime = self.arbiter.fetch_runtime(config).await;
        let entry = RunLedgerEntry::start(run_id, &config.pipeline_name, &config.import_name, &unit);
        let decision = self.arbiter.decide(config, &runtime).await;

        if decision.skip {
            self.ledger
                .record(&entry.finish(RunStatus::Skipped, &decision.reason))
                .await;
            return Ok(TransformReport {
                import_name: config.import_name.clone(),
                status: RunStatus::Skipped,
                decision,
                rows_affected: 0,
                duplicates_removed: 0,
                auto_switch: None,
                notified: false,
            });
        }

        match self.execute(config, &runtime, &decision, run_id).await {
            Ok((rows, duplicates_removed, auto_switch)) => {
                let entry = entry
                    .finish(
                        RunStatus::Success,
                        format!("Transform complete. Rows affected: {rows}. {}", decision.reason),
                    )
                    .with_rows(rows);
                let notified = self.notify_success(config, &decision, &entry).await;
                self.ledger.record(&entry).await;
                Ok(TransformReport {
                    import_name: config.import_name.clone(),
                    status: RunStatus::Success,
                    decision,
                    rows_affected: rows,
                    duplicates_removed,
                    auto_switch,
                    notified,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "Transform failed");
                let entry = entry
                    .finish(RunStatus::Failure, e.to_string())
                    .with_error(error_chain(&e))
                    .with_resolution(e.resolution_steps(&config.import_name, &unit));
                self.feedback(config, &entry);
                self.ledger.record(&entry).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        config: &PipelineConfig,
        runtime: &RuntimeConfig,
        decision: &LoadDecision,
        run_id: &str,
    ) -> RunResult<(u64, u64, Option<AutoSwitch>)> {
        let staging_table = runtime
            .staging_table
            .clone()
            .unwrap_or_else(|| config.staging_table.clone());

        let duplicates = self
            .arbiter
            .deduplicate_staged(config, &staging_table, decision, run_id)
            .await?;

        let truncate = decision.tables_to_truncate(config);
        tracing::info!(
            procedure = %config.transform_procedure,
            tables_to_truncate = truncate.as_deref().unwrap_or("None"),
            "Executing transform"
        );
        let rows = self
            .executor
            .execute(&config.transform_procedure, run_id, truncate.as_deref())
            .await?;

        let cleaned = self.store.delete_staged_run(&staging_table, run_id).await?;
        tracing::info!(table = %staging_table, rows = cleaned, "Cleaned up staged rows");

        let auto_switch = self.arbiter.apply_auto_switch(config, runtime).await?;
        Ok((rows, duplicates, auto_switch))
    }

    /// Successful runs notify unless they joined a batch or an active
    /// import depends on this one
    async fn notify_success(
        &self,
        config: &PipelineConfig,
        decision: &LoadDecision,
        entry: &RunLedgerEntry,
    ) -> bool {
        if decision.is_batch_append() {
            tracing::info!("Suppressing success notification: batch append run");
            return false;
        }
        match self.store.active_dependents(&config.import_name).await {
            Ok(dependents) if !dependents.is_empty() => {
                tracing::info!(?dependents, "Suppressing success notification: active downstream imports");
                return false;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to check downstream dependencies"),
        }
        self.feedback(config, entry)
    }

    fn feedback(&self, config: &PipelineConfig, entry: &RunLedgerEntry) -> bool {
        let Some(dir) = &config.monitored_directory else {
            return false;
        };
        let source = Path::new(&config.file_pattern);
        FeedbackLog::new(dir.clone()).append(entry.status, Some(source), &entry.message);
        true
    }
}

fn error_chain(error: &RunError) -> String {
    let mut chain = vec![error.to_string()];
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain.dedup();
    chain.join("\ncaused by: ")
}
