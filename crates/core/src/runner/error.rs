//! Error types for extract and transform unit runs
//!
//! Every run failure is also written to the run ledger; the variants carry
//! enough context to produce the ledger's resolution steps.

use thiserror::Error;

use crate::loader::LoadError;
use crate::lock::LockError;
use crate::sensor::SensorError;
use crate::store::StoreError;
use crate::transform::TransformError;

/// Errors that fail an extract or transform run
#[derive(Error, Debug)]
pub enum RunError {
    /// Loading the source file failed
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Blocking data quality rules failed for the staged rows
    #[error(
        "{failures} critical data quality rule(s) failed for {table}. Halting pipeline run. \
        Check 'data_quality_run_logs' for details."
    )]
    QualityGateFailed { table: String, failures: u64 },

    /// The transform procedure failed and was rolled back
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The serialization lock could not be taken
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A store call outside the transform transaction failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The source directory could not be scanned
    #[error(transparent)]
    Sensor(#[from] SensorError),

    /// A job name that the graph does not define
    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

/// Result type for unit runs
pub type RunResult<T> = Result<T, RunError>;

impl RunError {
    /// Whether the run ended without anything to do rather than failing
    pub fn is_benign(&self) -> bool {
        matches!(self, RunError::Load(e) if e.is_source_absent())
    }

    /// Short type name written to the ledger instead of the full error text
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Load(LoadError::SchemaMismatch { .. }) => "SchemaMismatch",
            RunError::Load(LoadError::SourceAbsent(_)) => "SourceAbsent",
            RunError::Load(LoadError::Store(_)) | RunError::Store(_) => "StoreError",
            RunError::Load(_) => "LoadError",
            RunError::QualityGateFailed { .. } => "QualityGateFailed",
            RunError::Transform(_) => "TransformError",
            RunError::Lock(_) => "LockError",
            RunError::Sensor(_) => "SensorError",
            RunError::UnknownJob(_) => "UnknownJob",
        }
    }

    /// Ledger resolution steps for a failed run of `import_name`
    pub fn resolution_steps(&self, import_name: &str, unit_name: &str) -> String {
        match self {
            RunError::Load(LoadError::SchemaMismatch {
                table,
                source_columns,
                table_columns,
            }) => format!(
                "Database schema mismatch. The columns in your data do not match the columns \
                in the staging table '{table}'.\n  \
                > Columns in your data (after mapping): {source_columns:?}\n  \
                > Columns in table '{table}': {table_columns:?}\n  \
                > ACTION: Update the 'column_mapping' for import_name '{import_name}' to map \
                your source columns to the table columns."
            ),
            RunError::QualityGateFailed { table, .. } => format!(
                "Review 'data_quality_run_logs' for run failures on '{table}' and fix the source \
                data, or lower the severity of the failing rules."
            ),
            RunError::Transform(TransformError::Procedure { procedure, .. })
            | RunError::Transform(TransformError::InvalidProcedure(procedure)) => format!(
                "Review the logs for '{unit_name}'. Inspect the SQL procedure '{procedure}'."
            ),
            _ => format!(
                "Review the logs for '{unit_name}'. Check the source file format and path, the \
                parser selection, and that the staging table schema matches the parsed data."
            ),
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            RunError::Load(e) => e.user_message(),
            RunError::Transform(e) => e.user_message(),
            RunError::Store(e) => e.user_message(),
            RunError::Sensor(e) => e.user_message(),
            RunError::QualityGateFailed { .. } => {
                format!("{self}\n\nHint: The transform step was not run; staged rows remain for inspection.")
            }
            RunError::UnknownJob(job) => {
                format!("Unknown job: {job}\n\nHint: Run 'eltctl graph' to list the jobs.")
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_source_absent_is_benign() {
        let err = RunError::from(LoadError::SourceAbsent(PathBuf::from("in.csv")));
        assert!(err.is_benign());

        let err = RunError::QualityGateFailed {
            table: "stg".to_string(),
            failures: 2,
        };
        assert!(!err.is_benign());
        assert!(err.to_string().starts_with("2 critical"));
    }

    #[test]
    fn test_schema_mismatch_resolution_lists_columns() {
        let err = RunError::from(LoadError::SchemaMismatch {
            table: "stg_sales".to_string(),
            source_columns: vec!["Amount".to_string()],
            table_columns: vec!["amount_eur".to_string(), "run_id".to_string()],
        });
        let steps = err.resolution_steps("sales", "sales_extract_and_load_staging");
        assert!(steps.contains("\"Amount\""));
        assert!(steps.contains("\"amount_eur\""));
        assert!(steps.contains("column_mapping"));
        assert_eq!(err.kind(), "SchemaMismatch");
    }

    #[test]
    fn test_transform_resolution_names_procedure() {
        let err = RunError::from(TransformError::Procedure {
            procedure: "sp_sales".to_string(),
            source: StoreError::Database("boom".to_string()),
        });
        let steps = err.resolution_steps("sales", "sales_transform");
        assert!(steps.contains("sp_sales"));
        assert!(steps.contains("sales_transform"));
    }
}
