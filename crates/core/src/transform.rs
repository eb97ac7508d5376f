//! Transform procedure execution
//!
//! A procedure truncates exactly the tables it is given and moves the rows
//! tagged with the run id from staging to the destination. It runs in one
//! transaction and is never partially applied.

use std::sync::Arc;

use thiserror::Error;

use crate::config::validate_identifier;
use crate::store::{Store, StoreError};

/// Errors raised by a transform procedure run
#[derive(Error, Debug)]
pub enum TransformError {
    /// The procedure name failed identifier validation
    #[error("Invalid procedure name: {0}")]
    InvalidProcedure(String),

    /// The procedure or transaction failed; the transaction was rolled back
    #[error("Procedure {procedure} failed: {source}")]
    Procedure {
        procedure: String,
        #[source]
        source: StoreError,
    },
}

/// Result type for transform operations
pub type TransformResult<T> = Result<T, TransformError>;

impl TransformError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            TransformError::Procedure { procedure, source } => {
                format!(
                    "Procedure {procedure} failed: {}\n\n\
                    Hint: The transaction was rolled back. Fix the procedure or its input \
                    and re-run the transform.",
                    source.user_message()
                )
            }
            _ => self.to_string(),
        }
    }
}

/// Runs transform procedures inside a transaction
#[derive(Clone)]
pub struct TransformExecutor {
    store: Arc<dyn Store>,
}

impl TransformExecutor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Call `procedure(run_id, tables_to_truncate)` and commit.
    ///
    /// Any failure rolls the transaction back before it is returned.
    pub async fn execute(
        &self,
        procedure: &str,
        run_id: &str,
        tables_to_truncate: Option<&str>,
    ) -> TransformResult<u64> {
        let procedure = validate_identifier(procedure)
            .ok_or_else(|| TransformError::InvalidProcedure(procedure.to_string()))?;
        let failed = |source: StoreError| TransformError::Procedure {
            procedure: procedure.clone(),
            source,
        };

        let mut tx = self.store.begin().await.map_err(failed)?;
        tracing::info!(procedure = %procedure, run_id, truncate = ?tables_to_truncate, "Executing transform");

        match tx.call_procedure(&procedure, run_id, tables_to_truncate).await {
            Ok(affected) => {
                tx.commit().await.map_err(failed)?;
                tracing::info!(procedure = %procedure, run_id, rows = affected, "Transform committed");
                Ok(affected)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(procedure = %procedure, run_id, error = %rollback, "Rollback failed");
                }
                tracing::warn!(procedure = %procedure, run_id, error = %e, "Transform rolled back");
                Err(failed(e))
            }
        }
    }
}
