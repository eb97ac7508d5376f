//! Settings, configuration source and backend shared by all commands

use std::path::{Path, PathBuf};
use std::sync::Arc;

use elt_core::config::load_config_export;
use elt_core::lock::LockManager;
use elt_core::store::Store;
use elt_core::{EngineSettings, PipelineConfig};

use crate::error::CliError;
use crate::output::OutputFormat;

/// Settings file read when `--settings` is not given and it exists
pub const DEFAULT_SETTINGS_FILE: &str = "eltctl.toml";

/// Everything a command needs from the global arguments
pub struct Context {
    pub settings: EngineSettings,
    pub configs_path: Option<PathBuf>,
    pub format: OutputFormat,
}

/// Store and lock manager of a live database
pub struct Backend {
    pub store: Arc<dyn Store>,
    pub locks: Arc<dyn LockManager>,
}

impl Context {
    /// Read settings from `settings_path` (or `eltctl.toml` when present),
    /// then apply `ELT_*` environment overrides
    pub fn load(
        settings_path: Option<&Path>,
        configs_path: Option<PathBuf>,
        format: OutputFormat,
    ) -> Result<Self, CliError> {
        let settings = match settings_path {
            Some(path) => EngineSettings::load(path)?,
            None if Path::new(DEFAULT_SETTINGS_FILE).is_file() => {
                EngineSettings::load(Path::new(DEFAULT_SETTINGS_FILE))?
            }
            None => EngineSettings::new(),
        }
        .apply_env()?;
        settings.validate()?;

        Ok(Self {
            settings,
            configs_path,
            format,
        })
    }

    /// Active pipeline configurations from the export file, or from the
    /// database when no file was given
    pub async fn active_configs(&self) -> Result<Vec<PipelineConfig>, CliError> {
        if let Some(path) = &self.configs_path {
            let configs: Vec<PipelineConfig> = load_config_export(path)?
                .into_iter()
                .filter(|c| c.is_active)
                .collect();
            tracing::info!(path = %path.display(), count = configs.len(), "Loaded configuration export");
            return Ok(configs);
        }

        if self.settings.database.url.is_none() {
            return Err(CliError::NoConfigSource);
        }
        let backend = self.backend()?;
        Ok(elt_core::config::load_active_configs(backend.store.as_ref()).await?)
    }

    /// The active configuration of one import
    pub async fn config_for(&self, import_name: &str) -> Result<PipelineConfig, CliError> {
        self.active_configs()
            .await?
            .into_iter()
            .find(|c| c.import_name.eq_ignore_ascii_case(import_name))
            .ok_or_else(|| CliError::UnknownImport(import_name.to_string()))
    }

    /// Connect to the configured database
    #[cfg(feature = "postgres-backend")]
    pub fn backend(&self) -> Result<Backend, CliError> {
        use elt_core::{PgAdvisoryLockManager, PgStore};

        let db = &self.settings.database;
        let Some(url) = db.url.as_deref() else {
            return Err(CliError::DatabaseRequired);
        };
        let store = PgStore::connect(url, db.pool_size)?
            .with_tables(&db.config_table, &db.ledger_table)?;
        let locks = PgAdvisoryLockManager::connect(url, db.lock_pool_size)?;
        Ok(Backend {
            store: Arc::new(store),
            locks: Arc::new(locks),
        })
    }

    #[cfg(not(feature = "postgres-backend"))]
    pub fn backend(&self) -> Result<Backend, CliError> {
        Err(CliError::DatabaseRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn export(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_inactive_exports_are_filtered() {
        let file = export(
            r#"
[[pipeline]]
pipeline_name = "Sales"
import_name = "sales_daily"
file_pattern = "sales_*.csv"
file_type = "csv"
staging_table = "stg_sales"
destination_table = "sales"
transform_procedure = "sp_sales"

[[pipeline]]
pipeline_name = "Sales"
import_name = "sales_legacy"
file_pattern = "legacy_*.csv"
file_type = "csv"
staging_table = "stg_legacy"
destination_table = "sales"
transform_procedure = "sp_legacy"
is_active = false
"#,
        );
        let ctx = Context {
            settings: EngineSettings::new(),
            configs_path: Some(file.path().to_path_buf()),
            format: OutputFormat::Table,
        };

        let configs = ctx.active_configs().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(ctx.config_for("SALES_DAILY").await.unwrap().import_name, "sales_daily");
        assert!(matches!(
            ctx.config_for("sales_legacy").await,
            Err(CliError::UnknownImport(_))
        ));
    }

    #[tokio::test]
    async fn test_no_config_source() {
        let ctx = Context {
            settings: EngineSettings::new(),
            configs_path: None,
            format: OutputFormat::Json,
        };
        assert!(matches!(
            ctx.active_configs().await,
            Err(CliError::NoConfigSource)
        ));
    }
}
