//! File pattern matching against basenames

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use glob::Pattern;

use super::{SensorError, SensorResult};

/// Prefix of lock files written next to documents being edited
pub const LOCK_FILE_PREFIX: &str = "~$";

/// A glob matched against file names only
#[derive(Debug, Clone)]
pub struct FilePattern {
    raw: String,
    pattern: Pattern,
}

impl FilePattern {
    /// Compile a configured pattern; any directory part is ignored
    pub fn new(raw: &str) -> SensorResult<Self> {
        let sanitized = sanitize_pattern(raw);
        let pattern = Pattern::new(&sanitized).map_err(|e| SensorError::InvalidPattern {
            pattern: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw: sanitized,
            pattern,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.pattern.matches(file_name)
    }
}

/// Strip directory components from a pattern
pub fn sanitize_pattern(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

pub fn is_lock_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(LOCK_FILE_PREFIX))
}

/// Resolve a lock file to the document it guards.
///
/// Ordinary paths are returned unchanged. A `~$name` path resolves to
/// `name` in the same directory if that file exists, otherwise to `None`.
pub fn resolve_lock_file(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let Some(real_name) = name.strip_prefix(LOCK_FILE_PREFIX) else {
        return Some(path.to_path_buf());
    };
    let real = path.with_file_name(real_name);
    real.is_file().then_some(real)
}

/// Modification time in fractional epoch seconds
pub fn mtime_secs(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// The most recently modified file in `dir` matching `pattern`, lock files
/// excluded. A missing directory yields `None`.
pub fn newest_match(dir: &Path, pattern: &FilePattern) -> SensorResult<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SensorError::Io {
                path: dir.to_path_buf(),
                source: e,
            });
        }
    };

    let mut newest: Option<(f64, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(LOCK_FILE_PREFIX) || !pattern.matches(name) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let mtime = mtime_secs(modified);
        if newest.as_ref().is_none_or(|(best, _)| mtime > *best) {
            newest = Some((mtime, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, secs: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
        path
    }

    #[test]
    fn test_pattern_ignores_directories() {
        let pattern = FilePattern::new(r"C:\drops\sales_*.csv").unwrap();
        assert_eq!(pattern.as_str(), "sales_*.csv");
        assert!(pattern.matches("sales_2024.csv"));
        assert!(!pattern.matches("stock_2024.csv"));

        let pattern = FilePattern::new("in/report_?.[tc]sv").unwrap();
        assert!(pattern.matches("report_1.tsv"));
        assert!(!pattern.matches("report_12.csv"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            FilePattern::new("sales_[.csv"),
            Err(SensorError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_lock_file_redirect() {
        let dir = TempDir::new().unwrap();
        let real = touch(dir.path(), "budget.csv", 100);
        let lock = dir.path().join("~$budget.csv");

        assert!(is_lock_file(&lock));
        assert_eq!(resolve_lock_file(&lock), Some(real.clone()));
        assert_eq!(resolve_lock_file(&real), Some(real));
        assert_eq!(resolve_lock_file(&dir.path().join("~$gone.csv")), None);
    }

    #[test]
    fn test_newest_match_skips_lock_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "sales_1.csv", 100);
        let newest = touch(dir.path(), "sales_2.csv", 300);
        touch(dir.path(), "~$sales_3.csv", 900);
        touch(dir.path(), "other.csv", 1000);

        let pattern = FilePattern::new("*sales_*.csv").unwrap();
        assert_eq!(newest_match(dir.path(), &pattern).unwrap(), Some(newest));
        assert_eq!(
            newest_match(&dir.path().join("missing"), &pattern).unwrap(),
            None
        );
    }
}
