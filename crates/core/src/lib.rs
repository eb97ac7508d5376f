//! ELT Core - config-driven pipeline orchestration
//!
//! Rows of a pipeline configuration table become a graph of extract and
//! transform units, file sensors and jobs. Per run the engine:
//! - loads source files into staging tables in bounded chunks
//! - decides between truncating and appending to the destination
//! - serializes writers of the same destination with a named lock
//! - runs the transform procedure in one transaction
//! - records every run in the run ledger
//!
//! All database access goes through the [`store::Store`] trait.

pub mod arbiter;
pub mod config;
pub mod graph;
pub mod ledger;
pub mod loader;
pub mod lock;
pub mod runner;
pub mod sensor;
pub mod settings;
pub mod store;
pub mod transform;

pub use arbiter::{BatchWindow, DecisionRule, LoadDecision, LoadMethodArbiter};
pub use config::{
    ColumnMapping, ConfigError, ConfigValidationError, LoadMethod, PipelineConfig, RuntimeConfig,
    load_active_configs, parse_column_mapping,
};
pub use graph::{GraphError, PipelineGraph, SensorSpec, sanitize_name};
pub use ledger::{RunLedger, RunLedgerEntry, RunStatus};
pub use loader::{BulkLoader, LoadError, LoadReport};
pub use lock::{InProcessLockManager, LockHandle, LockManager};
#[cfg(feature = "postgres-backend")]
pub use lock::PgAdvisoryLockManager;
pub use runner::{ExtractRunner, JobRunner, RunError, TransformRunner};
pub use sensor::{CursorStore, FileSensor, SensorTick, TriggerRequest};
pub use settings::EngineSettings;
#[cfg(feature = "postgres-backend")]
pub use store::PgStore;
pub use store::{MemoryStore, Store, StoreError};
pub use transform::{TransformError, TransformExecutor};

/// A fresh run identifier
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
