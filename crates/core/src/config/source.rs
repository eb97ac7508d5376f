//! Loading pipeline configurations from the store or an export file

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use super::error::{ConfigError, ConfigResult, ConfigValidationError};
use super::pipeline::{EXPECTED_FIELDS, PipelineConfig};
use crate::store::Store;

/// Read and validate every active configuration row.
///
/// Live columns are intersected with the known field list, so a missing
/// optional column degrades to its default and unknown columns are ignored.
/// Any invalid row fails the whole load.
pub async fn load_active_configs(store: &dyn Store) -> ConfigResult<Vec<PipelineConfig>> {
    let live = store.config_columns().await?;
    let columns: Vec<String> = EXPECTED_FIELDS
        .iter()
        .filter_map(|field| live.iter().find(|c| c.eq_ignore_ascii_case(field)).cloned())
        .collect();

    if !columns.iter().any(|c| c.eq_ignore_ascii_case("import_name")) {
        return Err(ConfigError::MissingColumn("import_name".to_string()));
    }
    let missing: Vec<&&str> = EXPECTED_FIELDS
        .iter()
        .filter(|f| !columns.iter().any(|c| c.eq_ignore_ascii_case(f)))
        .collect();
    if !missing.is_empty() {
        tracing::debug!(?missing, "Configuration table lacks optional columns");
    }

    let rows = store.active_config_rows(&columns).await?;
    let mut configs = Vec::with_capacity(rows.len());
    for row in &rows {
        configs.push(PipelineConfig::from_row(row)?);
    }
    check_unique(&configs)?;

    tracing::info!(count = configs.len(), "Loaded active pipeline configurations");
    Ok(configs)
}

/// Export file layout: a list of `[[pipeline]]` tables (TOML) or a
/// `pipelines:` list (YAML/JSON)
#[derive(Debug, Deserialize)]
struct ConfigExport {
    #[serde(alias = "pipeline")]
    pipelines: Vec<PipelineConfig>,
}

/// Load configurations from a TOML, YAML or JSON export.
///
/// Inactive entries are returned too; callers filter on `is_active`.
pub fn load_config_export(path: &Path) -> ConfigResult<Vec<PipelineConfig>> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let parse_error = |reason: String| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    let export: ConfigExport = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string()))?
        }
        Some("json") => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
        other => {
            return Err(parse_error(format!(
                "unsupported extension {:?}, expected toml, yaml or json",
                other.unwrap_or("")
            )));
        }
    };

    let mut configs = Vec::with_capacity(export.pipelines.len());
    for config in export.pipelines {
        configs.push(config.validated()?);
    }
    check_unique(&configs)?;
    Ok(configs)
}

fn check_unique(configs: &[PipelineConfig]) -> Result<(), ConfigValidationError> {
    let mut seen = HashSet::new();
    for config in configs {
        if !seen.insert(config.import_name.to_lowercase()) {
            return Err(ConfigValidationError::DuplicateImport(
                config.import_name.clone(),
            ));
        }
    }
    Ok(())
}
