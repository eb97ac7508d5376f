//! Load-method arbitration
//!
//! Decides, fresh for every transform run, whether the destination is
//! truncated before staged rows move in. Priority order:
//!
//! 1. any upstream dependency forces append
//! 2. an inactive import is skipped, unless it is the successor of an
//!    auto-switch chain (then it runs as a queued append)
//! 3. `append` appends
//! 4. `replace` truncates, unless the primary destination was loaded within
//!    the batch window (then the run joins that batch and appends)
//! 5. anything else appends

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{LoadMethod, PipelineConfig, RuntimeConfig};
use crate::store::{Store, StoreError, StoreResult};

/// Reason marker used to recognise batch appends in logs and ledger rows
pub const BATCH_DETECTION: &str = "Batch detection";

/// Elapsed-time window in which a `replace` run joins the previous load.
///
/// A small negative lower bound tolerates clock skew between the load
/// timestamp writer and the store clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchWindow {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl BatchWindow {
    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    /// `min <= elapsed < max`
    pub fn contains(&self, elapsed_secs: f64) -> bool {
        self.min_secs <= elapsed_secs && elapsed_secs < self.max_secs
    }
}

impl Default for BatchWindow {
    fn default() -> Self {
        Self::new(-5.0, 120.0)
    }
}

/// Which rule produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    Dependency,
    QueuedAutoSwitch,
    Inactive,
    ConfiguredAppend,
    BatchAppend,
    Replace,
    /// Batch detection could not read the destination; truncation proceeds
    ReplaceUnchecked,
    UnknownMethod,
}

impl DecisionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionRule::Dependency => "dependency",
            DecisionRule::QueuedAutoSwitch => "queued_auto_switch",
            DecisionRule::Inactive => "inactive",
            DecisionRule::ConfiguredAppend => "configured_append",
            DecisionRule::BatchAppend => "batch_append",
            DecisionRule::Replace => "replace",
            DecisionRule::ReplaceUnchecked => "replace_unchecked",
            DecisionRule::UnknownMethod => "unknown_method",
        }
    }
}

impl fmt::Display for DecisionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of arbitration for one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadDecision {
    pub should_truncate: bool,
    /// The run must not execute at all
    pub skip: bool,
    pub rule: DecisionRule,
    pub reason: String,
}

impl LoadDecision {
    fn append(rule: DecisionRule, reason: impl Into<String>) -> Self {
        Self {
            should_truncate: false,
            skip: false,
            rule,
            reason: reason.into(),
        }
    }

    fn truncate(rule: DecisionRule, reason: impl Into<String>) -> Self {
        Self {
            should_truncate: true,
            skip: false,
            rule,
            reason: reason.into(),
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            should_truncate: false,
            skip: true,
            rule: DecisionRule::Inactive,
            reason: reason.into(),
        }
    }

    /// A replace run downgraded to append because it joined a batch
    pub fn is_batch_append(&self) -> bool {
        self.rule == DecisionRule::BatchAppend
    }

    /// The truncate list handed to the transform procedure
    pub fn tables_to_truncate(&self, config: &PipelineConfig) -> Option<String> {
        self.should_truncate
            .then(|| config.destination_tables().join(","))
    }
}

/// Result of the replace-to-append switch after a successful replace run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoSwitch {
    pub deactivated: String,
    pub activated: String,
    /// False when the successor row was not found
    pub successor_found: bool,
}

/// Decides load behaviour and applies auto-switch chains
#[derive(Clone)]
pub struct LoadMethodArbiter {
    store: Arc<dyn Store>,
    window: BatchWindow,
}

impl LoadMethodArbiter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            window: BatchWindow::default(),
        }
    }

    pub fn with_window(mut self, window: BatchWindow) -> Self {
        self.window = window;
        self
    }

    pub fn window(&self) -> BatchWindow {
        self.window
    }

    /// Re-read the import's row from the store.
    ///
    /// A missing row or a failed read falls back to append with the cached
    /// active flag.
    pub async fn fetch_runtime(&self, config: &PipelineConfig) -> RuntimeConfig {
        let fallback = || RuntimeConfig {
            load_method: LoadMethod::Append,
            is_active: config.is_active,
            staging_table: None,
            upstream_imports: Vec::new(),
            legacy_declared: false,
        };

        match self.store.config_row(&config.import_name).await {
            Ok(Some(row)) => {
                let runtime = RuntimeConfig::from_row(&row);
                tracing::info!(
                    import = %config.import_name,
                    load_method = %runtime.load_method,
                    is_active = runtime.is_active,
                    "Fetched runtime config"
                );
                runtime
            }
            Ok(None) => {
                tracing::error!(
                    import = %config.import_name,
                    "Runtime config not found; defaulting to append"
                );
                fallback()
            }
            Err(e) => {
                tracing::error!(
                    import = %config.import_name,
                    error = %e,
                    "Failed to fetch runtime config; defaulting to append"
                );
                fallback()
            }
        }
    }

    /// Decide truncate, append or skip for one run
    pub async fn decide(&self, config: &PipelineConfig, runtime: &RuntimeConfig) -> LoadDecision {
        let decision = self.evaluate(config, runtime).await;
        tracing::info!(
            import = %config.import_name,
            truncate = decision.should_truncate,
            skip = decision.skip,
            rule = %decision.rule,
            reason = %decision.reason,
            "Load decision"
        );
        decision
    }

    async fn evaluate(&self, config: &PipelineConfig, runtime: &RuntimeConfig) -> LoadDecision {
        if config.has_upstream_dependency() || runtime.has_upstream_dependency() {
            return LoadDecision::append(
                DecisionRule::Dependency,
                "Upstream dependency detected (static or runtime).",
            );
        }

        if !runtime.is_active {
            if config.auto_switch_target().is_some() {
                return LoadDecision::append(
                    DecisionRule::QueuedAutoSwitch,
                    "Pipeline is inactive but part of an auto-switch chain (treating as queued run).",
                );
            }
            tracing::warn!(import = %config.import_name, "Pipeline is inactive; skipping transform");
            return LoadDecision::skipped("Skipped because pipeline is inactive.");
        }

        match &runtime.load_method {
            LoadMethod::Append => {
                LoadDecision::append(DecisionRule::ConfiguredAppend, "Configured as append.")
            }
            LoadMethod::Replace => self.detect_batch(config.primary_destination()).await,
            LoadMethod::Other(method) => LoadDecision::append(
                DecisionRule::UnknownMethod,
                format!("Unknown load method '{method}', defaulting to append."),
            ),
        }
    }

    async fn detect_batch(&self, destination: &str) -> LoadDecision {
        let clock = match self.store.latest_load(destination).await {
            Ok(clock) => clock,
            Err(e @ (StoreError::ColumnNotFound { .. } | StoreError::TableNotFound(_))) => {
                tracing::warn!(
                    table = destination,
                    error = %e,
                    "Batch detection skipped: destination is missing or has no load_timestamp column; truncating"
                );
                return LoadDecision::truncate(
                    DecisionRule::ReplaceUnchecked,
                    format!("Configured as replace. {BATCH_DETECTION} skipped: {e}."),
                );
            }
            Err(e) => {
                tracing::warn!(table = destination, error = %e, "Batch detection failed; truncating");
                return LoadDecision::truncate(
                    DecisionRule::ReplaceUnchecked,
                    format!("Configured as replace. {BATCH_DETECTION} failed: {e}."),
                );
            }
        };

        match clock.seconds_since_last_load() {
            Some(elapsed) if self.window.contains(elapsed) => {
                tracing::debug!(table = destination, elapsed, "Destination loaded within batch window");
                LoadDecision::append(
                    DecisionRule::BatchAppend,
                    format!(
                        "Downgraded replace to append. Table updated {}s ago ({BATCH_DETECTION}).",
                        elapsed.trunc() as i64
                    ),
                )
            }
            _ => LoadDecision::truncate(DecisionRule::Replace, "Configured as replace."),
        }
    }

    /// Remove staged rows of this run that already exist in the primary
    /// destination. Only appending runs with a deduplication key do this.
    pub async fn deduplicate_staged(
        &self,
        config: &PipelineConfig,
        staging_table: &str,
        decision: &LoadDecision,
        run_id: &str,
    ) -> StoreResult<u64> {
        let keys = config.deduplication_keys();
        if decision.should_truncate || decision.skip || keys.is_empty() {
            return Ok(0);
        }

        let removed = self
            .store
            .delete_staged_duplicates(staging_table, config.primary_destination(), &keys, run_id)
            .await?;
        if removed > 0 {
            tracing::info!(
                import = %config.import_name,
                table = staging_table,
                rows = removed,
                ?keys,
                "Removed duplicate staged rows"
            );
        } else {
            tracing::debug!(import = %config.import_name, "No duplicate staged rows");
        }
        Ok(removed)
    }

    /// After a successful replace run, deactivate this import and activate
    /// its successor in append mode, in one transaction.
    ///
    /// Returns `None` when the run was not a replace or no successor is set.
    pub async fn apply_auto_switch(
        &self,
        config: &PipelineConfig,
        runtime: &RuntimeConfig,
    ) -> StoreResult<Option<AutoSwitch>> {
        let Some(target) = config.auto_switch_target() else {
            return Ok(None);
        };
        if runtime.load_method != LoadMethod::Replace {
            return Ok(None);
        }

        tracing::info!(import = %config.import_name, successor = target, "Applying auto-switch");
        let mut tx = self.store.begin().await?;
        let switched = async {
            tx.set_import_state(&config.import_name, false, None).await?;
            tx.set_import_state(target, true, Some(&LoadMethod::Append))
                .await
        }
        .await;

        let activated = match switched {
            Ok(rows) => rows,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(error = %rollback, "Auto-switch rollback failed");
                }
                return Err(e);
            }
        };
        if activated == 0 {
            tracing::error!(
                import = %config.import_name,
                successor = target,
                "CRITICAL: auto-switch successor not found; pipeline chain is broken"
            );
        }
        tx.commit().await?;

        Ok(Some(AutoSwitch {
            deactivated: config.import_name.clone(),
            activated: target.to_string(),
            successor_found: activated > 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};

    fn config(method: LoadMethod) -> PipelineConfig {
        PipelineConfig::builder("sales_daily")
            .pipeline("Sales")
            .file_pattern("sales_*.csv")
            .file_type("csv")
            .staging_table("stg_sales")
            .destination("sales, sales_archive")
            .procedure("sp_sales")
            .load_method(method)
            .build()
            .unwrap()
    }

    fn runtime(method: LoadMethod, active: bool) -> RuntimeConfig {
        RuntimeConfig {
            load_method: method,
            is_active: active,
            staging_table: None,
            upstream_imports: Vec::new(),
            legacy_declared: false,
        }
    }

    async fn store_loaded_ago(seconds: i64) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table("sales", &["id", "load_timestamp"]);
        let stamp = (Utc::now() - Duration::seconds(seconds)).to_rfc3339();
        store
            .insert_rows(
                "sales",
                &["id".to_string(), "load_timestamp".to_string()],
                &[vec![Some("1".to_string()), Some(stamp)]],
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_window_bounds() {
        let window = BatchWindow::default();
        assert!(window.contains(-5.0));
        assert!(window.contains(0.0));
        assert!(window.contains(119.9));
        assert!(!window.contains(120.0));
        assert!(!window.contains(-5.1));
    }

    #[tokio::test]
    async fn test_dependency_forces_append() {
        let store = store_loaded_ago(500).await;
        let arbiter = LoadMethodArbiter::new(Arc::new(store));
        let mut rt = runtime(LoadMethod::Replace, true);
        rt.upstream_imports = vec!["customers".to_string()];

        let decision = arbiter.decide(&config(LoadMethod::Replace), &rt).await;
        assert!(!decision.should_truncate);
        assert_eq!(decision.rule, DecisionRule::Dependency);
    }

    #[tokio::test]
    async fn test_unparsable_legacy_blob_forces_append() {
        let arbiter = LoadMethodArbiter::new(Arc::new(MemoryStore::new()));
        let mut rt = runtime(LoadMethod::Replace, true);
        rt.legacy_declared = true;

        let decision = arbiter.decide(&config(LoadMethod::Replace), &rt).await;
        assert_eq!(decision.rule, DecisionRule::Dependency);
    }

    #[tokio::test]
    async fn test_null_legacy_dependency_key_forces_append() {
        let store = store_loaded_ago(500).await;
        let arbiter = LoadMethodArbiter::new(Arc::new(store));
        let row = serde_json::json!({
            "load_method": "replace",
            "is_active": true,
            "scraper_config": r#"{"depends_on": null}"#,
        });
        let rt = RuntimeConfig::from_row(row.as_object().unwrap());

        let decision = arbiter.decide(&config(LoadMethod::Replace), &rt).await;
        assert!(!decision.should_truncate);
        assert_eq!(decision.rule, DecisionRule::Dependency);
    }

    #[tokio::test]
    async fn test_inactive_skips_unless_queued() {
        let arbiter = LoadMethodArbiter::new(Arc::new(MemoryStore::new()));
        let decision = arbiter
            .decide(&config(LoadMethod::Append), &runtime(LoadMethod::Append, false))
            .await;
        assert!(decision.skip);
        assert_eq!(decision.reason, "Skipped because pipeline is inactive.");

        let mut chained = config(LoadMethod::Replace);
        chained.on_success_deactivate_self_and_activate_import = Some("sales_append".to_string());
        let decision = arbiter
            .decide(&chained, &runtime(LoadMethod::Replace, false))
            .await;
        assert!(!decision.skip);
        assert!(!decision.should_truncate);
        assert_eq!(decision.rule, DecisionRule::QueuedAutoSwitch);
    }

    #[tokio::test]
    async fn test_recent_load_joins_batch() {
        let arbiter = LoadMethodArbiter::new(Arc::new(store_loaded_ago(10).await));
        let decision = arbiter
            .decide(&config(LoadMethod::Replace), &runtime(LoadMethod::Replace, true))
            .await;
        assert!(!decision.should_truncate);
        assert!(decision.is_batch_append());
        assert!(decision.reason.contains(BATCH_DETECTION));
    }

    #[tokio::test]
    async fn test_old_load_truncates_all_destinations() {
        let arbiter = LoadMethodArbiter::new(Arc::new(store_loaded_ago(200).await));
        let cfg = config(LoadMethod::Replace);
        let decision = arbiter
            .decide(&cfg, &runtime(LoadMethod::Replace, true))
            .await;
        assert!(decision.should_truncate);
        assert_eq!(decision.rule, DecisionRule::Replace);
        assert_eq!(
            decision.tables_to_truncate(&cfg).as_deref(),
            Some("sales,sales_archive")
        );
    }

    #[tokio::test]
    async fn test_missing_timestamp_column_truncates() {
        let store = MemoryStore::new();
        store.create_table("sales", &["id"]);
        let arbiter = LoadMethodArbiter::new(Arc::new(store));
        let decision = arbiter
            .decide(&config(LoadMethod::Replace), &runtime(LoadMethod::Replace, true))
            .await;
        assert!(decision.should_truncate);
        assert_eq!(decision.rule, DecisionRule::ReplaceUnchecked);
    }

    #[tokio::test]
    async fn test_empty_destination_truncates() {
        let store = MemoryStore::new();
        store.create_table("sales", &["id", "load_timestamp"]);
        let arbiter = LoadMethodArbiter::new(Arc::new(store));
        let decision = arbiter
            .decide(&config(LoadMethod::Replace), &runtime(LoadMethod::Replace, true))
            .await;
        assert_eq!(decision.rule, DecisionRule::Replace);
    }

    #[tokio::test]
    async fn test_unknown_method_appends() {
        let arbiter = LoadMethodArbiter::new(Arc::new(MemoryStore::new()));
        let decision = arbiter
            .decide(
                &config(LoadMethod::Append),
                &runtime(LoadMethod::Other("merge".to_string()), true),
            )
            .await;
        assert!(!decision.should_truncate);
        assert_eq!(decision.rule, DecisionRule::UnknownMethod);
        assert!(decision.reason.contains("merge"));
    }

    #[tokio::test]
    async fn test_missing_runtime_row_defaults_to_append() {
        let arbiter = LoadMethodArbiter::new(Arc::new(MemoryStore::new()));
        let runtime = arbiter.fetch_runtime(&config(LoadMethod::Replace)).await;
        assert_eq!(runtime.load_method, LoadMethod::Append);
        assert!(runtime.is_active);
    }

    #[tokio::test]
    async fn test_auto_switch_activates_successor() {
        let store = MemoryStore::new();
        let mut first = config(LoadMethod::Replace);
        first.on_success_deactivate_self_and_activate_import = Some("sales_append".to_string());
        let second = PipelineConfig::builder("sales_append")
            .pipeline("Sales")
            .file_pattern("sales_*.csv")
            .file_type("csv")
            .staging_table("stg_sales")
            .destination("sales")
            .procedure("sp_sales")
            .load_method(LoadMethod::Replace)
            .active(false)
            .build()
            .unwrap();
        store.add_config(&first).unwrap();
        store.add_config(&second).unwrap();

        let arbiter = LoadMethodArbiter::new(Arc::new(store.clone()));
        let switch = arbiter
            .apply_auto_switch(&first, &runtime(LoadMethod::Replace, true))
            .await
            .unwrap()
            .unwrap();
        assert!(switch.successor_found);

        let old = RuntimeConfig::from_row(&store.config("sales_daily").unwrap());
        let new = RuntimeConfig::from_row(&store.config("sales_append").unwrap());
        assert!(!old.is_active);
        assert!(new.is_active);
        assert_eq!(new.load_method, LoadMethod::Append);
    }

    #[tokio::test]
    async fn test_broken_chain_still_deactivates() {
        let store = MemoryStore::new();
        let mut first = config(LoadMethod::Replace);
        first.on_success_deactivate_self_and_activate_import = Some("missing".to_string());
        store.add_config(&first).unwrap();

        let arbiter = LoadMethodArbiter::new(Arc::new(store.clone()));
        let switch = arbiter
            .apply_auto_switch(&first, &runtime(LoadMethod::Replace, true))
            .await
            .unwrap()
            .unwrap();
        assert!(!switch.successor_found);
        let old = RuntimeConfig::from_row(&store.config("sales_daily").unwrap());
        assert!(!old.is_active);
    }

    #[tokio::test]
    async fn test_no_auto_switch_after_append() {
        let arbiter = LoadMethodArbiter::new(Arc::new(MemoryStore::new()));
        let mut cfg = config(LoadMethod::Append);
        cfg.on_success_deactivate_self_and_activate_import = Some("next".to_string());
        let switch = arbiter
            .apply_auto_switch(&cfg, &runtime(LoadMethod::Append, true))
            .await
            .unwrap();
        assert!(switch.is_none());
    }
}
