//! Relational store seam
//!
//! Every database interaction of the engine goes through [`Store`]. Two
//! implementations ship with the crate:
//!
//! - [`MemoryStore`]: tables held in process memory, used by tests and dry runs
//! - `PgStore`: PostgreSQL over a `deadpool-postgres` pool (feature `postgres-backend`)

pub mod memory;
#[cfg(feature = "postgres-backend")]
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::LoadMethod;
use crate::ledger::RunLedgerEntry;

pub use memory::{MemoryEvent, MemoryEventKind, MemoryProcedure, MemoryStore};
#[cfg(feature = "postgres-backend")]
pub use postgres::PgStore;

/// A row as returned by config queries, keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Column every staged row is tagged with
pub const RUN_ID_COLUMN: &str = "run_id";

/// Column written by transform procedures; batch detection reads its maximum
pub const LOAD_TIMESTAMP_COLUMN: &str = "load_timestamp";

/// Errors raised by a store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend error
    #[error("Database error: {0}")]
    Database(String),

    /// Referenced table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Referenced column does not exist
    #[error("Column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    /// A name failed identifier validation before reaching SQL
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The transform procedure is not registered or does not exist
    #[error("Procedure not found: {0}")]
    ProcedureNotFound(String),

    /// No connection could be taken from the pool
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Transaction control failed
    #[error("Transaction error: {0}")]
    Transaction(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            StoreError::TableNotFound(table) => {
                format!(
                    "Table not found: {table}\n\n\
                    Hint: Check the staging_table and destination_table values of the import."
                )
            }
            StoreError::ProcedureNotFound(name) => {
                format!(
                    "Procedure not found: {name}\n\n\
                    Hint: Deploy the procedure or fix transform_procedure in the configuration."
                )
            }
            StoreError::Pool(msg) => {
                format!("Cannot connect to the database: {msg}\n\nHint: Check [database] url.")
            }
            _ => self.to_string(),
        }
    }
}

/// Timestamps read for batch detection, both in epoch seconds from the
/// store's clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadClock {
    /// `MAX(load_timestamp)` of the table, `None` when the table is empty
    pub last_load: Option<f64>,
    /// Current time on the store
    pub db_now: f64,
}

impl LoadClock {
    /// Build from the store's own `now() - MAX(load_timestamp)` gap, so the
    /// column is read in the session's time zone rather than as UTC
    pub fn from_elapsed(elapsed: Option<f64>, db_now: f64) -> Self {
        Self {
            last_load: elapsed.map(|gap| db_now - gap),
            db_now,
        }
    }

    /// Seconds since the last load, when there was one
    pub fn seconds_since_last_load(&self) -> Option<f64> {
        self.last_load.map(|last| self.db_now - last)
    }
}

/// Relational store operations used by the engine
#[async_trait]
pub trait Store: Send + Sync {
    /// Columns present on the configuration table
    async fn config_columns(&self) -> StoreResult<Vec<String>>;

    /// Active configuration rows, restricted to the given columns
    async fn active_config_rows(&self, columns: &[String]) -> StoreResult<Vec<Row>>;

    /// The configuration row of one import regardless of its active flag
    async fn config_row(&self, import_name: &str) -> StoreResult<Option<Row>>;

    /// Active imports whose `depends_on` names the given import
    async fn active_dependents(&self, import_name: &str) -> StoreResult<Vec<String>>;

    /// Persist a generated column mapping for an import
    async fn update_column_mapping(&self, import_name: &str, mapping: &str) -> StoreResult<u64>;

    /// Column names of a table in ordinal order
    async fn table_columns(&self, table: &str) -> StoreResult<Vec<String>>;

    /// Insert rows; each row holds one optional text value per column
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> StoreResult<u64>;

    /// `MAX(load_timestamp)` and the store's current time
    async fn latest_load(&self, table: &str) -> StoreResult<LoadClock>;

    /// Delete staged rows of `run_id` matching a destination row on every key
    async fn delete_staged_duplicates(
        &self,
        staging_table: &str,
        destination_table: &str,
        keys: &[String],
        run_id: &str,
    ) -> StoreResult<u64>;

    /// Delete every staged row of `run_id`
    async fn delete_staged_run(&self, staging_table: &str, run_id: &str) -> StoreResult<u64>;

    /// Count of failed blocking quality rules for a run
    async fn quality_failures(&self, run_id: &str, table: &str) -> StoreResult<u64>;

    /// Append one ledger row
    async fn insert_ledger_entry(&self, entry: &RunLedgerEntry) -> StoreResult<()>;

    /// Begin a transaction
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// Work that must commit or roll back as a unit.
///
/// Dropping a transaction without calling [`StoreTransaction::commit`]
/// discards its effects.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Invoke a transform procedure, returning its affected row count
    async fn call_procedure(
        &mut self,
        procedure: &str,
        run_id: &str,
        tables_to_truncate: Option<&str>,
    ) -> StoreResult<u64>;

    /// Set `is_active` (and optionally `load_method`) of an import
    async fn set_import_state(
        &mut self,
        import_name: &str,
        active: bool,
        load_method: Option<&LoadMethod>,
    ) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
