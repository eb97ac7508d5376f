//! Run ledger
//!
//! One row per extract or transform execution. Writing a row never fails the
//! run it describes.

pub mod feedback;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Store;

pub use feedback::FeedbackLog;

/// Outcome of a unit run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Success,
    Failure,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
            RunStatus::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILURE" => Ok(RunStatus::Failure),
            "SKIPPED" => Ok(RunStatus::Skipped),
            _ => Err(format!(
                "Unknown run status: {}. Expected: SUCCESS, FAILURE, SKIPPED",
                s
            )),
        }
    }
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLedgerEntry {
    pub run_id: String,
    pub pipeline_name: String,
    pub import_name: String,
    /// Extract or transform unit name
    pub asset_name: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub rows_processed: u64,
    pub message: String,
    pub error_details: Option<String>,
    pub resolution_steps: Option<String>,
}

impl RunLedgerEntry {
    /// Start an entry; `end_time` is set when the entry is finished
    pub fn start(
        run_id: impl Into<String>,
        pipeline_name: impl Into<String>,
        import_name: impl Into<String>,
        asset_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            pipeline_name: pipeline_name.into(),
            import_name: import_name.into(),
            asset_name: asset_name.into(),
            status: RunStatus::Success,
            start_time: now,
            end_time: now,
            rows_processed: 0,
            message: String::new(),
            error_details: None,
            resolution_steps: None,
        }
    }

    /// Close the entry with a status and message
    pub fn finish(mut self, status: RunStatus, message: impl Into<String>) -> Self {
        self.status = status;
        self.message = message.into();
        self.end_time = Utc::now();
        self
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows_processed = rows;
        self
    }

    pub fn with_error(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }

    pub fn with_resolution(mut self, steps: impl Into<String>) -> Self {
        self.resolution_steps = Some(steps.into());
        self
    }
}

/// Best-effort writer for ledger rows
#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn Store>,
}

impl RunLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert a row; failures are logged and swallowed
    pub async fn record(&self, entry: &RunLedgerEntry) {
        match self.store.insert_ledger_entry(entry).await {
            Ok(()) => tracing::debug!(
                run_id = %entry.run_id,
                import = %entry.import_name,
                status = %entry.status,
                "Ledger entry recorded"
            ),
            Err(e) => tracing::error!(
                run_id = %entry.run_id,
                import = %entry.import_name,
                asset = %entry.asset_name,
                status = %entry.status,
                rows = entry.rows_processed,
                message = %entry.message,
                error = %e,
                "CRITICAL: failed to write run ledger entry"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_status_literals() {
        assert_eq!(RunStatus::Skipped.to_string(), "SKIPPED");
        assert_eq!("failure".parse::<RunStatus>().unwrap(), RunStatus::Failure);
        assert!("DONE".parse::<RunStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&RunStatus::Success).unwrap(),
            "\"SUCCESS\""
        );
    }

    #[tokio::test]
    async fn test_record_swallows_store_failure() {
        let store = MemoryStore::new();
        let ledger = RunLedger::new(Arc::new(store.clone()));
        let entry = RunLedgerEntry::start("r1", "sales", "sales_daily", "sales_daily_transform")
            .finish(RunStatus::Success, "ok");

        store.fail_ledger_writes(true);
        ledger.record(&entry).await;
        assert!(store.ledger().is_empty());

        store.fail_ledger_writes(false);
        ledger.record(&entry).await;
        assert_eq!(store.ledger(), vec![entry]);
    }

    #[test]
    fn test_entry_builder() {
        let entry = RunLedgerEntry::start("r1", "p", "i", "a")
            .with_rows(12)
            .with_error("LoadError")
            .finish(RunStatus::Failure, "boom");
        assert_eq!(entry.rows_processed, 12);
        assert_eq!(entry.error_details.as_deref(), Some("LoadError"));
        assert!(entry.end_time >= entry.start_time);
    }
}
