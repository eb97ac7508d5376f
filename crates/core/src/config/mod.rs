//! Pipeline configuration rows
//!
//! Rows in the configuration table are validated into [`PipelineConfig`]
//! records. Column mappings and legacy dependency declarations are parsed here
//! so the rest of the engine only sees typed values.

pub mod error;
pub mod legacy;
pub mod mapping;
pub mod pipeline;
pub mod source;

pub use error::{ConfigError, ConfigResult, ConfigValidationError};
pub use legacy::LegacyDependencies;
pub use mapping::{ColumnMapping, generate_column_mapping, parse_column_mapping};
pub use pipeline::{
    EXPECTED_FIELDS, LoadMethod, PipelineConfig, PipelineConfigBuilder, RuntimeConfig,
    validate_identifier,
};
pub use source::{load_active_configs, load_config_export};
