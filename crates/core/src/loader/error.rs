//! Error types for bulk loading

use std::path::PathBuf;
use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur while loading a source file
#[derive(Error, Debug)]
pub enum LoadError {
    /// The source file does not exist; callers treat this as benign
    #[error("Source file not found: {0}")]
    SourceAbsent(PathBuf),

    /// Source and table share no usable columns, or the table cannot hold run ids
    #[error("Schema mismatch loading into {table}: data columns {source_columns:?}, table columns {table_columns:?}")]
    SchemaMismatch {
        table: String,
        source_columns: Vec<String>,
        table_columns: Vec<String>,
    },

    /// No parser is registered for the file type
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// A configuration selected a parser that is not on the allow-list
    #[error("Parser not allowed: {0}")]
    ParserNotAllowed(String),

    /// The file could not be decoded
    #[error("Cannot decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// IO error
    #[error("IO error with {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Chunk insert failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A reader or upload task panicked or was cancelled
    #[error("Loader task failed: {0}")]
    Worker(String),
}

/// Result type for load operations
pub type LoadResult<T> = Result<T, LoadError>;

impl LoadError {
    /// Whether the error means "nothing to load" rather than a failure
    pub fn is_source_absent(&self) -> bool {
        matches!(self, LoadError::SourceAbsent(_))
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            LoadError::SchemaMismatch {
                table,
                source_columns,
                table_columns,
            } => {
                format!(
                    "The file's columns do not fit table {table}.\n\
                    Data columns: {}\nTable columns: {}\n\n\
                    Hint: Add a column_mapping ('Source > target, ...') to the import, \
                    and make sure the table has a run_id column.",
                    source_columns.join(", "),
                    table_columns.join(", ")
                )
            }
            LoadError::UnsupportedFileType(file_type) => {
                format!(
                    "Unsupported file type: {file_type}\n\n\
                    Hint: Use csv, psv, tsv or txt, or select a registered parser_function."
                )
            }
            LoadError::ParserNotAllowed(name) => {
                format!(
                    "Parser '{name}' is not allowed.\n\n\
                    Hint: Add it to [loader] allowed_parsers."
                )
            }
            LoadError::Store(e) => e.user_message(),
            _ => self.to_string(),
        }
    }
}
