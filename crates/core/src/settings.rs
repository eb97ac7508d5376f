//! Engine settings
//!
//! Read from a TOML file (`eltctl.toml` by convention) and overridden from
//! `ELT_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arbiter::BatchWindow;
use crate::config::{ConfigError, ConfigResult};
use crate::store::schema::{DEFAULT_CONFIG_TABLE, DEFAULT_LEDGER_TABLE};

/// All engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub database: DatabaseSettings,
    pub loader: LoaderSettings,
    pub arbiter: ArbiterSettings,
    pub sensor: SensorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// PostgreSQL connection string; unset means the in-memory store
    pub url: Option<String>,
    /// Connections for store queries, staging inserts and transactions
    pub pool_size: usize,
    /// Connections pinned by held advisory locks, one per running transform
    pub lock_pool_size: usize,
    pub config_table: String,
    pub ledger_table: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: 8,
            lock_pool_size: 4,
            config_table: DEFAULT_CONFIG_TABLE.to_string(),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// Rows per chunk
    pub chunk_size: usize,
    /// Chunk inserts in flight at once
    pub concurrency: usize,
    /// Custom parser names that configurations may select
    pub allowed_parsers: Vec<String>,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            concurrency: 4,
            allowed_parsers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterSettings {
    pub batch_window_min_secs: f64,
    pub batch_window_max_secs: f64,
}

impl Default for ArbiterSettings {
    fn default() -> Self {
        let window = BatchWindow::default();
        Self {
            batch_window_min_secs: window.min_secs,
            batch_window_max_secs: window.max_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub minimum_interval_secs: u64,
    /// Where sensor cursors are persisted
    pub cursor_file: PathBuf,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            minimum_interval_secs: 30,
            cursor_file: PathBuf::from(".elt/sensor_cursors.json"),
        }
    }
}

impl EngineSettings {
    /// Create settings with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from a TOML file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply `ELT_DATABASE_URL`, `ELT_CHUNK_SIZE` and `ELT_LOADER_CONCURRENCY`
    pub fn apply_env(self) -> ConfigResult<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<Self> {
        if let Some(url) = lookup("ELT_DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            self.database.url = Some(url);
        }
        if let Some(value) = lookup("ELT_CHUNK_SIZE") {
            self.loader.chunk_size = parse_count("ELT_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = lookup("ELT_LOADER_CONCURRENCY") {
            self.loader.concurrency = parse_count("ELT_LOADER_CONCURRENCY", &value)?;
        }
        Ok(self)
    }

    /// Set the database URL
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database.url = Some(url.into());
        self
    }

    /// Set the chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.loader.chunk_size = chunk_size;
        self
    }

    /// Set the loader concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.loader.concurrency = concurrency;
        self
    }

    /// Set the batch detection window
    pub fn with_batch_window(mut self, window: BatchWindow) -> Self {
        self.arbiter.batch_window_min_secs = window.min_secs;
        self.arbiter.batch_window_max_secs = window.max_secs;
        self
    }

    /// Set the sensor cursor file
    pub fn with_cursor_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sensor.cursor_file = path.into();
        self
    }

    pub fn batch_window(&self) -> BatchWindow {
        BatchWindow::new(
            self.arbiter.batch_window_min_secs,
            self.arbiter.batch_window_max_secs,
        )
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_secs(self.sensor.minimum_interval_secs)
    }

    /// Validate the settings
    pub fn validate(&self) -> ConfigResult<()> {
        if self.loader.chunk_size == 0 {
            return Err(ConfigError::InvalidSettings(
                "loader.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.loader.concurrency == 0 {
            return Err(ConfigError::InvalidSettings(
                "loader.concurrency must be greater than zero".to_string(),
            ));
        }
        if self.database.pool_size == 0 {
            return Err(ConfigError::InvalidSettings(
                "database.pool_size must be greater than zero".to_string(),
            ));
        }
        if self.database.lock_pool_size == 0 {
            return Err(ConfigError::InvalidSettings(
                "database.lock_pool_size must be greater than zero".to_string(),
            ));
        }
        if self.arbiter.batch_window_min_secs >= self.arbiter.batch_window_max_secs {
            return Err(ConfigError::InvalidSettings(format!(
                "batch window [{}, {}) is empty",
                self.arbiter.batch_window_min_secs, self.arbiter.batch_window_max_secs
            )));
        }
        if self.sensor.minimum_interval_secs == 0 {
            return Err(ConfigError::InvalidSettings(
                "sensor.minimum_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str) -> ConfigResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidSettings(format!("{key} is not a count: '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.loader.chunk_size, 10_000);
        assert_eq!(settings.loader.concurrency, 4);
        assert_eq!(settings.database.config_table, "elt_pipeline_configs");
        assert_eq!(settings.batch_window(), BatchWindow::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[loader]\nchunk_size = 500\n\n[arbiter]\nbatch_window_max_secs = 60").unwrap();

        let settings = EngineSettings::load(file.path()).unwrap();
        assert_eq!(settings.loader.chunk_size, 500);
        assert_eq!(settings.loader.concurrency, 4);
        assert_eq!(settings.arbiter.batch_window_min_secs, -5.0);
        assert_eq!(settings.arbiter.batch_window_max_secs, 60.0);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ELT_DATABASE_URL", "postgresql://etl@db/warehouse"),
            ("ELT_LOADER_CONCURRENCY", "2"),
        ]
        .into_iter()
        .collect();
        let settings = EngineSettings::new()
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(
            settings.database.url.as_deref(),
            Some("postgresql://etl@db/warehouse")
        );
        assert_eq!(settings.loader.concurrency, 2);

        let bad = EngineSettings::new().apply_overrides(|k| {
            (k == "ELT_CHUNK_SIZE").then(|| "lots".to_string())
        });
        assert!(matches!(bad, Err(ConfigError::InvalidSettings(_))));
    }

    #[test]
    fn test_lock_pool_is_separate_from_store_pool() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\npool_size = 1").unwrap();

        let settings = EngineSettings::load(file.path()).unwrap();
        assert_eq!(settings.database.pool_size, 1);
        assert_eq!(settings.database.lock_pool_size, 4);
        assert!(settings.validate().is_ok());

        let mut no_locks = EngineSettings::new();
        no_locks.database.lock_pool_size = 0;
        assert!(matches!(
            no_locks.validate(),
            Err(ConfigError::InvalidSettings(msg)) if msg.contains("lock_pool_size")
        ));
    }

    #[test]
    fn test_validation() {
        assert!(EngineSettings::new().with_chunk_size(0).validate().is_err());
        assert!(EngineSettings::new().with_concurrency(0).validate().is_err());
        assert!(
            EngineSettings::new()
                .with_batch_window(BatchWindow::new(10.0, 10.0))
                .validate()
                .is_err()
        );
    }
}
