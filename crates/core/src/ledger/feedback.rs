//! Daily run-history file next to the monitored source files
//!
//! Gives operators who only see the drop folder a record of what happened to
//! their files. Days are UTC days and only the current day's file is kept.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};

use super::RunStatus;

const FILE_SUFFIX: &str = "__run_history.log";

/// Writer for `<dir>/<YYYY-MM-DD>__run_history.log`
#[derive(Debug, Clone)]
pub struct FeedbackLog {
    dir: PathBuf,
}

impl FeedbackLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Log file path for a given day
    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}{FILE_SUFFIX}", day.format("%Y-%m-%d")))
    }

    /// Log file path for the current UTC day
    pub fn current_path(&self) -> PathBuf {
        self.path_for(Utc::now().date_naive())
    }

    /// Append one line. A missing directory is a no-op and I/O errors are
    /// logged, never returned.
    pub fn append(&self, status: RunStatus, source_file: Option<&Path>, details: &str) {
        self.append_at(Utc::now(), status, source_file, details);
    }

    fn append_at(
        &self,
        now: DateTime<Utc>,
        status: RunStatus,
        source_file: Option<&Path>,
        details: &str,
    ) {
        if !self.dir.is_dir() {
            tracing::debug!(dir = %self.dir.display(), "Feedback directory missing, skipping");
            return;
        }

        let today = self.path_for(now.date_naive());
        self.remove_stale(&today);

        let file_name = source_file
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "N/A".to_string());
        let line = format!(
            "[{}] - {status} - File: {file_name} - Details: {details}\n",
            now.format("%Y-%m-%dT%H:%M:%S")
        );

        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&today)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = written {
            tracing::warn!(path = %today.display(), error = %e, "Cannot write feedback log");
        }
    }

    fn remove_stale(&self, keep: &Path) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Cannot list feedback directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_history = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(FILE_SUFFIX));
            if is_history && path != keep {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot remove old feedback log");
                }
            }
        }
    }
}
