//! Error types for configuration loading and validation

use std::path::PathBuf;
use thiserror::Error;

use crate::store::StoreError;

/// A configuration row that cannot be turned into a [`super::PipelineConfig`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// A required field is absent or blank
    #[error("Configuration '{row}' is missing required field '{field}'")]
    MissingField { row: String, field: &'static str },

    /// A field holds a value of the wrong shape
    #[error("Configuration '{row}' has an invalid value for '{field}': {reason}")]
    InvalidValue {
        row: String,
        field: &'static str,
        reason: String,
    },

    /// A table, procedure or column name fails the identifier allow-list
    #[error("Configuration '{row}' has an unsafe identifier in '{field}': '{value}'")]
    InvalidIdentifier {
        row: String,
        field: &'static str,
        value: String,
    },

    /// Two rows share one import name
    #[error("Duplicate import name '{0}'")]
    DuplicateImport(String),
}

/// Errors raised while loading configurations from the store or from an export file
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Row validation failed
    #[error(transparent)]
    Validation(#[from] ConfigValidationError),

    /// The store could not be queried
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The configuration table lacks a column every row needs
    #[error("Configuration table is missing required column '{0}'")]
    MissingColumn(String),

    /// Export file could not be read
    #[error("IO error with {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Export file could not be parsed
    #[error("Cannot parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// Engine settings are inconsistent
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            ConfigError::Validation(ConfigValidationError::MissingField { row, field }) => {
                format!(
                    "Configuration '{row}' is missing '{field}'.\n\n\
                    Hint: Fill in '{field}' for this row in the pipeline configuration table."
                )
            }
            ConfigError::Validation(ConfigValidationError::InvalidIdentifier {
                row,
                field,
                value,
            }) => {
                format!(
                    "Configuration '{row}' uses '{value}' as {field}.\n\n\
                    Hint: Table and procedure names may only contain letters, digits and \
                    underscores, optionally prefixed by a schema name."
                )
            }
            ConfigError::MissingColumn(column) => {
                format!(
                    "The configuration table has no '{column}' column.\n\n\
                    Hint: Apply the configuration table DDL with 'eltctl schema'."
                )
            }
            ConfigError::InvalidSettings(msg) => {
                format!("Invalid settings: {msg}\n\nHint: Check your eltctl.toml file.")
            }
            _ => self.to_string(),
        }
    }
}
