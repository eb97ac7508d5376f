//! Progress reporting for bulk loads
//!
//! The indicatif-backed reporter is only built with the `progress` feature.

/// Receives load progress from the loader
pub trait ProgressSink: Send + Sync {
    /// A chunk finished inserting
    fn chunk_loaded(&self, rows: u64, total_rows: u64);

    /// The load ended; `error` is set when it failed
    fn finished(&self, total_rows: u64, error: Option<&str>);
}

/// Format a number with thousand separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(feature = "progress")]
pub use bar::LoadProgress;

#[cfg(feature = "progress")]
mod bar {
    use std::time::Duration;

    use indicatif::{ProgressBar, ProgressStyle};

    use super::{ProgressSink, format_number};

    /// Spinner showing rows loaded into one table
    pub struct LoadProgress {
        bar: ProgressBar,
        table: String,
    }

    impl LoadProgress {
        pub fn new(table: &str) -> Self {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}") {
                bar.set_style(style);
            }
            bar.set_message(format!("Loading {table}"));
            bar.enable_steady_tick(Duration::from_millis(100));
            Self {
                bar,
                table: table.to_string(),
            }
        }

        /// A reporter that draws nothing
        pub fn hidden(table: &str) -> Self {
            Self {
                bar: ProgressBar::hidden(),
                table: table.to_string(),
            }
        }
    }

    impl ProgressSink for LoadProgress {
        fn chunk_loaded(&self, _rows: u64, total_rows: u64) {
            self.bar.set_message(format!(
                "Loading {}: {} rows",
                self.table,
                format_number(total_rows)
            ));
        }

        fn finished(&self, total_rows: u64, error: Option<&str>) {
            match error {
                None => self.bar.finish_with_message(format!(
                    "✓ Loaded {} rows into {}",
                    format_number(total_rows),
                    self.table
                )),
                Some(e) => self
                    .bar
                    .abandon_with_message(format!("✗ Loading {} failed: {e}", self.table)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(40_000), "40,000");
        assert_eq!(format_number(1_000_000), "1,000,000");
    }

    #[cfg(feature = "progress")]
    #[test]
    fn test_hidden_progress_accepts_updates() {
        let progress = LoadProgress::hidden("stg_orders");
        progress.chunk_loaded(10, 10);
        progress.finished(10, None);
    }
}
