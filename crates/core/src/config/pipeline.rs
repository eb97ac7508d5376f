//! Typed pipeline configuration rows

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ConfigValidationError;
use super::legacy::{LegacyDependencies, merge_dependencies, split_names};
use super::mapping::{ColumnMapping, parse_column_mapping};
use crate::store::Row;

/// Columns the engine knows about in the configuration table
pub const EXPECTED_FIELDS: &[&str] = &[
    "pipeline_name",
    "import_name",
    "file_pattern",
    "file_type",
    "staging_table",
    "destination_table",
    "transform_procedure",
    "load_method",
    "is_active",
    "monitored_directory",
    "column_mapping",
    "parser_function",
    "scraper_config",
    "deduplication_key",
    "on_success_deactivate_self_and_activate_import",
    "depends_on",
];

/// Columns without which no row can be valid
pub const REQUIRED_FIELDS: &[&str] = &[
    "pipeline_name",
    "import_name",
    "file_pattern",
    "file_type",
    "staging_table",
    "destination_table",
    "transform_procedure",
];

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .unwrap_or_else(|e| panic!("identifier pattern must compile: {e}"))
});

static COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_ ]*$")
        .unwrap_or_else(|e| panic!("column pattern must compile: {e}"))
});

/// Strip `[..]` and `".."` quoting from each dotted part of a name
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim()
        .split('.')
        .map(|part| {
            part.trim()
                .trim_start_matches(['[', '"'])
                .trim_end_matches([']', '"'])
                .to_string()
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Check a table or procedure name against the identifier allow-list.
///
/// Accepts an optional schema prefix; returns the unquoted form.
pub fn validate_identifier(raw: &str) -> Option<String> {
    let normalized = normalize_identifier(raw);
    IDENTIFIER.is_match(&normalized).then_some(normalized)
}

/// Check a column name (deduplication keys)
pub fn validate_column(raw: &str) -> Option<String> {
    let normalized = normalize_identifier(raw);
    (!normalized.contains('.') && COLUMN.is_match(&normalized)).then_some(normalized)
}

/// How a transform writes into its destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LoadMethod {
    /// Truncate the destination before moving staged rows
    Replace,
    /// Keep existing destination rows
    #[default]
    Append,
    /// Any other literal, kept verbatim so the arbiter can report it
    Other(String),
}

impl LoadMethod {
    pub fn as_str(&self) -> &str {
        match self {
            LoadMethod::Replace => "replace",
            LoadMethod::Append => "append",
            LoadMethod::Other(s) => s,
        }
    }

    /// Parse a stored literal; blank input means append
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => LoadMethod::Append,
            Some(s) => match s.to_lowercase().as_str() {
                "replace" => LoadMethod::Replace,
                "append" => LoadMethod::Append,
                _ => LoadMethod::Other(s.to_string()),
            },
        }
    }
}

impl std::str::FromStr for LoadMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "replace" => Ok(LoadMethod::Replace),
            "append" => Ok(LoadMethod::Append),
            _ => Err(format!(
                "Invalid load method: {}. Expected: replace, append",
                s
            )),
        }
    }
}

impl std::fmt::Display for LoadMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for LoadMethod {
    fn from(s: String) -> Self {
        LoadMethod::parse_lenient(Some(&s))
    }
}

impl From<LoadMethod> for String {
    fn from(m: LoadMethod) -> Self {
        m.as_str().to_string()
    }
}

/// One configuration row, validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_name: String,
    /// Unique key joining units, sensors and ledger rows
    pub import_name: String,
    pub file_pattern: String,
    pub file_type: String,
    pub staging_table: String,
    /// Comma-separated; the first entry is the primary destination
    pub destination_table: String,
    pub transform_procedure: String,
    #[serde(default)]
    pub load_method: LoadMethod,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub monitored_directory: Option<PathBuf>,
    #[serde(default)]
    pub column_mapping: Option<String>,
    #[serde(default)]
    pub parser_function: Option<String>,
    #[serde(default)]
    pub scraper_config: Option<String>,
    #[serde(default)]
    pub deduplication_key: Option<String>,
    #[serde(default)]
    pub on_success_deactivate_self_and_activate_import: Option<String>,
    #[serde(default)]
    pub depends_on: Option<String>,
}

fn default_active() -> bool {
    true
}

impl PipelineConfig {
    /// Create a new builder for PipelineConfig
    pub fn builder(import_name: &str) -> PipelineConfigBuilder {
        PipelineConfigBuilder::new(import_name)
    }

    /// Validate a raw row from the configuration table.
    ///
    /// Fails closed on any missing required field. A missing `load_method`
    /// is the only field that silently defaults (to append).
    pub fn from_row(row: &Row) -> Result<Self, ConfigValidationError> {
        let row_label = text_field(row, "import_name").unwrap_or_else(|| "<unnamed>".to_string());
        let required = |field: &'static str| {
            text_field(row, field).ok_or_else(|| ConfigValidationError::MissingField {
                row: row_label.clone(),
                field,
            })
        };

        let config = PipelineConfig {
            pipeline_name: required("pipeline_name")?,
            import_name: required("import_name")?,
            file_pattern: required("file_pattern")?,
            file_type: required("file_type")?,
            staging_table: required("staging_table")?,
            destination_table: required("destination_table")?,
            transform_procedure: required("transform_procedure")?,
            load_method: LoadMethod::parse_lenient(text_field(row, "load_method").as_deref()),
            is_active: bool_field(row, "is_active").unwrap_or(true),
            monitored_directory: text_field(row, "monitored_directory").map(PathBuf::from),
            column_mapping: text_field(row, "column_mapping"),
            parser_function: text_field(row, "parser_function"),
            scraper_config: text_field(row, "scraper_config"),
            deduplication_key: text_field(row, "deduplication_key"),
            on_success_deactivate_self_and_activate_import: text_field(
                row,
                "on_success_deactivate_self_and_activate_import",
            ),
            depends_on: text_field(row, "depends_on"),
        };

        config.validated()
    }

    /// Check identifiers and normalize their quoting
    pub fn validated(mut self) -> Result<Self, ConfigValidationError> {
        let row = self.import_name.clone();
        let invalid = |field: &'static str, value: &str| ConfigValidationError::InvalidIdentifier {
            row: row.clone(),
            field,
            value: value.to_string(),
        };

        self.staging_table = validate_identifier(&self.staging_table)
            .ok_or_else(|| invalid("staging_table", &self.staging_table))?;
        self.transform_procedure = validate_identifier(&self.transform_procedure)
            .ok_or_else(|| invalid("transform_procedure", &self.transform_procedure))?;

        let mut destinations = Vec::new();
        for table in split_names(&self.destination_table) {
            destinations.push(
                validate_identifier(&table).ok_or_else(|| invalid("destination_table", &table))?,
            );
        }
        if destinations.is_empty() {
            return Err(ConfigValidationError::MissingField {
                row,
                field: "destination_table",
            });
        }
        self.destination_table = destinations.join(",");

        if let Some(keys) = &self.deduplication_key {
            let mut normalized = Vec::new();
            for key in split_names(keys) {
                normalized
                    .push(validate_column(&key).ok_or_else(|| invalid("deduplication_key", &key))?);
            }
            self.deduplication_key = (!normalized.is_empty()).then(|| normalized.join(","));
        }

        Ok(self)
    }

    /// All destination tables, in configured order
    pub fn destination_tables(&self) -> Vec<String> {
        split_names(&self.destination_table)
    }

    /// The first destination table; locking, batch detection and
    /// deduplication all key on it
    pub fn primary_destination(&self) -> &str {
        self.destination_table
            .split(',')
            .next()
            .map(str::trim)
            .unwrap_or_default()
    }

    /// Serialization lock name for this import's destination
    pub fn lock_resource(&self) -> String {
        format!("lock_{}", self.primary_destination().to_lowercase())
    }

    /// Group shared by every import of the same pipeline
    pub fn group_name(&self) -> String {
        self.pipeline_name.trim().to_lowercase()
    }

    pub fn deduplication_keys(&self) -> Vec<String> {
        self.deduplication_key
            .as_deref()
            .map(split_names)
            .unwrap_or_default()
    }

    pub fn column_map(&self) -> ColumnMapping {
        self.column_mapping
            .as_deref()
            .map(parse_column_mapping)
            .unwrap_or_default()
    }

    pub fn auto_switch_target(&self) -> Option<&str> {
        self.on_success_deactivate_self_and_activate_import
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Dependencies declared in `scraper_config`
    pub fn legacy_dependencies(&self) -> LegacyDependencies {
        LegacyDependencies::parse(self.scraper_config.as_deref())
    }

    /// Upstream imports from `depends_on` and the legacy blob, merged
    pub fn upstream_imports(&self) -> Vec<String> {
        merge_dependencies(self.depends_on.as_deref(), &self.legacy_dependencies())
    }

    /// Whether this import statically declares any upstream dependency
    pub fn has_upstream_dependency(&self) -> bool {
        !self.upstream_imports().is_empty() || self.legacy_dependencies().implies_dependency()
    }
}

/// Builder for PipelineConfig
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    fn new(import_name: &str) -> Self {
        Self {
            config: PipelineConfig {
                pipeline_name: "default".to_string(),
                import_name: import_name.to_string(),
                file_pattern: "*.csv".to_string(),
                file_type: "csv".to_string(),
                staging_table: format!("stg_{import_name}"),
                destination_table: import_name.to_string(),
                transform_procedure: format!("sp_transform_{import_name}"),
                load_method: LoadMethod::Append,
                is_active: true,
                monitored_directory: None,
                column_mapping: None,
                parser_function: None,
                scraper_config: None,
                deduplication_key: None,
                on_success_deactivate_self_and_activate_import: None,
                depends_on: None,
            },
        }
    }

    pub fn pipeline(mut self, name: &str) -> Self {
        self.config.pipeline_name = name.to_string();
        self
    }

    pub fn file_pattern(mut self, pattern: &str) -> Self {
        self.config.file_pattern = pattern.to_string();
        self
    }

    pub fn file_type(mut self, file_type: &str) -> Self {
        self.config.file_type = file_type.to_string();
        self
    }

    pub fn staging_table(mut self, table: &str) -> Self {
        self.config.staging_table = table.to_string();
        self
    }

    pub fn destination(mut self, tables: &str) -> Self {
        self.config.destination_table = tables.to_string();
        self
    }

    pub fn procedure(mut self, name: &str) -> Self {
        self.config.transform_procedure = name.to_string();
        self
    }

    pub fn load_method(mut self, method: LoadMethod) -> Self {
        self.config.load_method = method;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.config.is_active = active;
        self
    }

    pub fn monitored_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.monitored_directory = Some(dir.into());
        self
    }

    pub fn column_mapping(mut self, mapping: &str) -> Self {
        self.config.column_mapping = Some(mapping.to_string());
        self
    }

    pub fn parser_function(mut self, name: &str) -> Self {
        self.config.parser_function = Some(name.to_string());
        self
    }

    pub fn scraper_config(mut self, json: &str) -> Self {
        self.config.scraper_config = Some(json.to_string());
        self
    }

    pub fn deduplication_key(mut self, keys: &str) -> Self {
        self.config.deduplication_key = Some(keys.to_string());
        self
    }

    pub fn auto_switch_to(mut self, import_name: &str) -> Self {
        self.config.on_success_deactivate_self_and_activate_import = Some(import_name.to_string());
        self
    }

    pub fn depends_on(mut self, imports: &str) -> Self {
        self.config.depends_on = Some(imports.to_string());
        self
    }

    /// Build and validate the PipelineConfig
    pub fn build(self) -> Result<PipelineConfig, ConfigValidationError> {
        self.config.validated()
    }
}

/// Lenient view of a row re-read at transform start
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub load_method: LoadMethod,
    pub is_active: bool,
    pub staging_table: Option<String>,
    /// Names from the `depends_on` column and legacy blob, merged
    pub upstream_imports: Vec<String>,
    /// The legacy blob has a `depends_on` key or could not be parsed
    pub legacy_declared: bool,
}

impl RuntimeConfig {
    /// Read whatever the row offers, never failing
    pub fn from_row(row: &Row) -> Self {
        let legacy = LegacyDependencies::parse(text_field(row, "scraper_config").as_deref());
        let depends_on = text_field(row, "depends_on");
        RuntimeConfig {
            load_method: LoadMethod::parse_lenient(text_field(row, "load_method").as_deref()),
            is_active: bool_field(row, "is_active").unwrap_or(false),
            staging_table: text_field(row, "staging_table").and_then(|t| validate_identifier(&t)),
            upstream_imports: merge_dependencies(depends_on.as_deref(), &legacy),
            legacy_declared: legacy.implies_dependency(),
        }
    }

    pub fn has_upstream_dependency(&self) -> bool {
        !self.upstream_imports.is_empty() || self.legacy_declared
    }
}

/// Case-insensitive column lookup
pub(crate) fn field<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    row.get(name).or_else(|| {
        row.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

/// A non-blank text value; numbers and booleans are rendered as text
pub(crate) fn text_field(row: &Row, name: &str) -> Option<String> {
    let value = match field(row, name)? {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    (!value.is_empty()).then_some(value)
}

pub(crate) fn bool_field(row: &Row, name: &str) -> Option<bool> {
    match field(row, name)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|v| v != 0.0)),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "y" => Some(true),
            "0" | "false" | "f" | "no" | "n" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
