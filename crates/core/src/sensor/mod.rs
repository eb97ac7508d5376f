//! File-trigger sensors
//!
//! A sensor watches one import's monitored directory. Each tick lists the
//! directory, matches basenames against the import's pattern and emits one
//! [`TriggerRequest`] for every file modified after the cursor. The cursor
//! is the highest modification time seen and only moves forward; callers
//! persist it after the triggers have been handed off, so delivery is
//! at-least-once.

pub mod cursor;
pub mod pattern;

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::graph::{SENSOR_MINIMUM_INTERVAL_SECS, SensorSpec, import_job_name};

pub use cursor::CursorStore;
pub use pattern::{FilePattern, is_lock_file, mtime_secs, newest_match, resolve_lock_file};

/// Errors raised by sensors
#[derive(Error, Debug)]
pub enum SensorError {
    /// The import's file pattern is not a valid glob
    #[error("Invalid file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The import has no monitored directory
    #[error("Import '{0}' has no monitored directory")]
    NotMonitored(String),

    /// The cursor file could not be parsed or serialized
    #[error("Invalid cursor file {path}: {reason}")]
    Cursor { path: PathBuf, reason: String },

    /// IO error
    #[error("IO error with {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for sensor operations
pub type SensorResult<T> = Result<T, SensorError>;

impl SensorError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            SensorError::InvalidPattern { .. } => {
                format!("{self}\n\nHint: Patterns support *, ? and [...] and match file names only.")
            }
            SensorError::NotMonitored(import) => {
                format!("{self}\n\nHint: Set monitored_directory for '{import}'.")
            }
            SensorError::Cursor { path, .. } => {
                format!(
                    "{self}\n\nHint: Delete {} to rescan every file from the beginning.",
                    path.display()
                )
            }
            _ => self.to_string(),
        }
    }
}

/// A request to run an import's job for one source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// `<import>:<path>:<mtime>`; the scheduler de-duplicates on it
    pub run_key: String,
    pub import_name: String,
    pub job_name: String,
    pub source_file_path: PathBuf,
}

/// Result of one sensor evaluation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorTick {
    pub triggers: Vec<TriggerRequest>,
    /// Cursor to persist once the triggers are handed off
    pub cursor: f64,
    /// Why nothing was evaluated
    pub skip_reason: Option<String>,
}

/// Watches one import's monitored directory
#[derive(Debug, Clone)]
pub struct FileSensor {
    name: String,
    import_name: String,
    job_name: String,
    directory: PathBuf,
    pattern: FilePattern,
    interval: Duration,
}

impl FileSensor {
    pub fn new(import_name: &str, directory: impl Into<PathBuf>, pattern: &str) -> SensorResult<Self> {
        Ok(Self {
            name: format!("sensor_{}", crate::graph::sanitize_name(import_name)),
            import_name: import_name.to_string(),
            job_name: import_job_name(import_name),
            directory: directory.into(),
            pattern: FilePattern::new(pattern)?,
            interval: Duration::from_secs(SENSOR_MINIMUM_INTERVAL_SECS),
        })
    }

    pub fn from_spec(spec: &SensorSpec) -> SensorResult<Self> {
        Ok(Self {
            name: spec.name.clone(),
            import_name: spec.import_name.clone(),
            job_name: spec.job_name.clone(),
            directory: spec.directory.clone(),
            pattern: FilePattern::new(&spec.file_pattern)?,
            interval: Duration::from_secs(spec.minimum_interval_secs),
        })
    }

    pub fn for_config(config: &PipelineConfig) -> SensorResult<Self> {
        let directory = config
            .monitored_directory
            .clone()
            .ok_or_else(|| SensorError::NotMonitored(config.import_name.clone()))?;
        Self::new(&config.import_name, directory, &config.file_pattern)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn import_name(&self) -> &str {
        &self.import_name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Evaluate the directory once against `cursor`
    pub fn tick(&self, cursor: f64) -> SensorResult<SensorTick> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SensorTick {
                    triggers: Vec::new(),
                    cursor,
                    skip_reason: Some(format!(
                        "Monitored directory not found: {}",
                        self.directory.display()
                    )),
                });
            }
            Err(e) => {
                return Err(SensorError::Io {
                    path: self.directory.clone(),
                    source: e,
                });
            }
        };

        let mut found: Vec<(f64, PathBuf)> = Vec::new();
        let mut seen = HashSet::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(sensor = %self.name, error = %e, "Unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !self.pattern.matches(file_name) {
                continue;
            }

            let Some(path) = resolve_lock_file(&path) else {
                tracing::debug!(sensor = %self.name, file = file_name, "Orphan lock file ignored");
                continue;
            };
            let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    tracing::warn!(
                        sensor = %self.name,
                        file = %path.display(),
                        error = %e,
                        "File disappeared during sensor evaluation"
                    );
                    continue;
                }
            };

            let mtime = mtime_secs(modified);
            if mtime > cursor && seen.insert(path.clone()) {
                found.push((mtime, path));
            }
        }

        found.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let next_cursor = found.iter().map(|(m, _)| *m).fold(cursor, f64::max);
        let triggers = found
            .into_iter()
            .map(|(mtime, path)| TriggerRequest {
                run_key: format!("{}:{}:{}", self.import_name, path.display(), mtime),
                import_name: self.import_name.clone(),
                job_name: self.job_name.clone(),
                source_file_path: path,
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            sensor = %self.name,
            triggers = triggers.len(),
            cursor = next_cursor,
            "Sensor tick"
        );
        Ok(SensorTick {
            triggers,
            cursor: next_cursor,
            skip_reason: None,
        })
    }

    /// Tick once, hand triggers to `on_trigger`, then persist the cursor
    pub fn tick_and_commit<F>(&self, cursors: &mut CursorStore, mut on_trigger: F) -> SensorResult<SensorTick>
    where
        F: FnMut(&TriggerRequest),
    {
        let tick = self.tick(cursors.get(&self.import_name))?;
        for trigger in &tick.triggers {
            on_trigger(trigger);
        }
        if cursors.advance(&self.import_name, tick.cursor) {
            cursors.save()?;
        }
        Ok(tick)
    }

    /// Poll on the sensor interval until `shutdown` completes.
    ///
    /// Tick errors are logged and polling continues.
    pub async fn run<F, S>(&self, cursors: &mut CursorStore, mut on_trigger: F, shutdown: S)
    where
        F: FnMut(&TriggerRequest),
        S: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            sensor = %self.name,
            directory = %self.directory.display(),
            pattern = self.pattern.as_str(),
            "Sensor started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick_and_commit(cursors, &mut on_trigger) {
                        tracing::warn!(sensor = %self.name, error = %e, "Sensor tick failed");
                    }
                }
            }
        }
        tracing::info!(sensor = %self.name, "Sensor stopped");
    }
}
