//! CLI error type

use std::path::PathBuf;

use elt_core::config::ConfigError;
use elt_core::graph::GraphError;
use elt_core::loader::LoadError;
use elt_core::lock::LockError;
use elt_core::runner::RunError;
use elt_core::sensor::SensorError;
use elt_core::store::StoreError;
use thiserror::Error;

/// Errors surfaced by `eltctl` commands
#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No active configuration for import '{0}'")]
    UnknownImport(String),

    #[error("No pipeline configurations given")]
    NoConfigSource,

    #[error("A database connection is required for this command")]
    DatabaseRequired,

    #[error("Failed to write {0}: {1}")]
    FileWriteError(PathBuf, String),

    #[error("Failed to render output: {0}")]
    Output(String),
}

impl CliError {
    /// Error text plus a hint for the operator
    pub fn user_message(&self) -> String {
        match self {
            CliError::Config(e) => e.user_message(),
            CliError::Graph(e) => e.user_message(),
            CliError::Sensor(e) => e.user_message(),
            CliError::Run(e) => e.user_message(),
            CliError::Store(e) => e.user_message(),
            CliError::Load(e) => e.user_message(),
            CliError::Lock(_) => format!(
                "{self}\n\nHint: Check database.url and database.lock_pool_size in eltctl.toml."
            ),
            CliError::UnknownImport(import) => format!(
                "{self}\n\nHint: Check the spelling of '{import}' and that its row has \
                is_active = true. 'eltctl validate' lists the loaded imports."
            ),
            CliError::NoConfigSource => format!(
                "{self}\n\nHint: Pass --configs <file> with a TOML, YAML or JSON export, or set \
                database.url in eltctl.toml (or ELT_DATABASE_URL)."
            ),
            CliError::DatabaseRequired => {
                if cfg!(feature = "postgres-backend") {
                    format!(
                        "{self}\n\nHint: Set database.url in eltctl.toml or export ELT_DATABASE_URL."
                    )
                } else {
                    format!(
                        "{self}\n\nHint: This build has no database backend. Rebuild with \
                        '--features postgres-backend'."
                    )
                }
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hints() {
        assert!(CliError::NoConfigSource.user_message().contains("--configs"));
        assert!(CliError::DatabaseRequired.user_message().contains("Hint:"));
        let msg = CliError::UnknownImport("sales".to_string()).user_message();
        assert!(msg.starts_with("No active configuration for import 'sales'"));
    }
}
