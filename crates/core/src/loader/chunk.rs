//! Per-chunk column shaping and the in-memory chunk gauge

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::error::{LoadError, LoadResult};
use crate::config::ColumnMapping;
use crate::store::RUN_ID_COLUMN;

/// Column name fragments marking boolean-like columns
const BOOL_LIKE_MARKERS: &[&str] = &["checkbox", "canbecompleted"];

/// Whether missing values in this column are coerced to false
pub fn is_bool_like(column: &str) -> bool {
    let lower = column.to_lowercase();
    BOOL_LIKE_MARKERS.iter().any(|m| lower.contains(m))
}

/// How source records map onto the destination table's columns
#[derive(Debug, Clone)]
pub struct ChunkShape {
    /// Insert column list; the run id column is last
    columns: Vec<String>,
    /// Source index and bool-like flag for each non-run-id column
    sources: Vec<(usize, bool)>,
}

impl ChunkShape {
    /// Match renamed headers to table columns case-insensitively.
    ///
    /// Source columns without a table counterpart are dropped.
    pub fn new(
        table: &str,
        headers: &[String],
        mapping: &ColumnMapping,
        table_columns: &[String],
    ) -> LoadResult<Self> {
        let renamed = mapping.rename(headers);
        let mismatch = || LoadError::SchemaMismatch {
            table: table.to_string(),
            source_columns: renamed.clone(),
            table_columns: table_columns.to_vec(),
        };

        let run_id_column = table_columns
            .iter()
            .find(|c| c.eq_ignore_ascii_case(RUN_ID_COLUMN))
            .cloned()
            .ok_or_else(mismatch)?;

        let mut columns = Vec::new();
        let mut sources = Vec::new();
        for column in table_columns {
            if column.eq_ignore_ascii_case(RUN_ID_COLUMN) {
                continue;
            }
            if let Some(index) = renamed.iter().position(|h| h.eq_ignore_ascii_case(column)) {
                columns.push(column.clone());
                sources.push((index, is_bool_like(column)));
            }
        }
        if sources.is_empty() {
            return Err(mismatch());
        }

        let dropped: Vec<&String> = renamed
            .iter()
            .filter(|h| !columns.iter().any(|c| c.eq_ignore_ascii_case(h)))
            .collect();
        if !dropped.is_empty() {
            tracing::debug!(table, ?dropped, "Source columns without a table column are dropped");
        }

        columns.push(run_id_column);
        Ok(Self { columns, sources })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Reorder a chunk into insert rows tagged with `run_id`
    pub fn apply(&self, records: Vec<Vec<String>>, run_id: &str) -> Vec<Vec<Option<String>>> {
        records
            .into_iter()
            .map(|record| {
                let mut row: Vec<Option<String>> = self
                    .sources
                    .iter()
                    .map(|&(index, bool_like)| {
                        let value = record.get(index).filter(|v| !v.is_empty()).cloned();
                        match value {
                            None if bool_like => Some("0".to_string()),
                            other => other,
                        }
                    })
                    .collect();
                row.push(Some(run_id.to_string()));
                row
            })
            .collect()
    }
}

/// Counts chunks alive between read and insert completion
#[derive(Debug, Clone, Default)]
pub struct ChunkGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl ChunkGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more chunk until the token is dropped
    pub fn acquire(&self) -> ChunkToken {
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(live, Ordering::SeqCst);
        ChunkToken {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

/// One chunk held in memory
#[derive(Debug)]
pub struct ChunkToken {
    inner: Arc<GaugeInner>,
}

impl Drop for ChunkToken {
    fn drop(&mut self) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}
