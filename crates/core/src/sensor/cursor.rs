//! Sensor cursor persistence

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SensorError, SensorResult};

/// On-disk cursor document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CursorFile {
    /// When the document was last written
    updated_at: Option<DateTime<Utc>>,
    /// Highest observed mtime per import
    cursors: BTreeMap<String, f64>,
}

/// Per-import sensor cursors backed by a JSON file.
///
/// Cursors only move forward: [`CursorStore::advance`] ignores values lower
/// than the stored one.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
    state: CursorFile,
}

impl CursorStore {
    /// An empty store that will be written to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: CursorFile::default(),
        }
    }

    /// Load cursors from file; a missing file yields an empty store
    pub fn load(path: &Path) -> SensorResult<Self> {
        if !path.exists() {
            return Ok(Self::new(path));
        }
        let json = std::fs::read_to_string(path).map_err(|e| SensorError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let state: CursorFile = serde_json::from_str(&json).map_err(|e| SensorError::Cursor {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    /// Save cursors to file, creating parent directories
    pub fn save(&mut self) -> SensorResult<()> {
        let io_error = |source| SensorError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        self.state.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(&self.state).map_err(|e| SensorError::Cursor {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&self.path, json).map_err(io_error)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cursor of an import; 0 when it never ticked
    pub fn get(&self, import_name: &str) -> f64 {
        self.state.cursors.get(import_name).copied().unwrap_or(0.0)
    }

    /// Move an import's cursor forward; returns whether it changed
    pub fn advance(&mut self, import_name: &str, cursor: f64) -> bool {
        if cursor > self.get(import_name) {
            self.state.cursors.insert(import_name.to_string(), cursor);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.state.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.cursors.is_empty()
    }
}
