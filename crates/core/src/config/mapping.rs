//! Column mapping parsing and generation
//!
//! Mappings are stored in the configuration table as `"Source > Target, ..."`
//! strings. A string with any malformed pair yields an empty mapping.

use serde::{Deserialize, Serialize};

use crate::store::RUN_ID_COLUMN;

/// Ordered source-to-target column renames
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pairs: Vec<(String, String)>,
}

impl ColumnMapping {
    /// Create an empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rename; a later rename for the same source replaces the earlier one
    pub fn insert(&mut self, source: impl Into<String>, target: impl Into<String>) {
        let source = source.into();
        let target = target.into();
        if let Some(pair) = self.pairs.iter_mut().find(|(s, _)| *s == source) {
            pair.1 = target;
        } else {
            self.pairs.push((source, target));
        }
    }

    /// Look up the target for a source column.
    ///
    /// Exact matches win; otherwise the first case-insensitive match is used.
    pub fn target_for(&self, source: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(s, _)| s == source)
            .or_else(|| self.pairs.iter().find(|(s, _)| s.eq_ignore_ascii_case(source)))
            .map(|(_, t)| t.as_str())
    }

    /// Apply the mapping to a header row
    pub fn rename(&self, headers: &[String]) -> Vec<String> {
        headers
            .iter()
            .map(|h| self.target_for(h).unwrap_or(h).to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }

    /// Serialize back to the stored `"A > B, C > D"` form
    pub fn to_config_string(&self) -> String {
        self.pairs
            .iter()
            .map(|(s, t)| format!("{s} > {t}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl<S: Into<String>, T: Into<String>> FromIterator<(S, T)> for ColumnMapping {
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        let mut mapping = ColumnMapping::new();
        for (s, t) in iter {
            mapping.insert(s, t);
        }
        mapping
    }
}

/// Parse a `"Src1 > Dst1, Src2 > Dst2"` string.
///
/// Returns an empty mapping for empty input and for any malformed pair.
pub fn parse_column_mapping(raw: &str) -> ColumnMapping {
    let mut mapping = ColumnMapping::new();
    if raw.trim().is_empty() {
        return mapping;
    }

    for pair in raw.split(',') {
        let mut parts = pair.splitn(2, '>');
        let (Some(source), Some(target)) = (parts.next(), parts.next()) else {
            return ColumnMapping::new();
        };
        let (source, target) = (source.trim(), target.trim());
        if source.is_empty() || target.is_empty() {
            return ColumnMapping::new();
        }
        mapping.insert(source, target);
    }

    mapping
}

/// Build a positional mapping pairing the n-th source header with the n-th
/// table column. The run identifier column is never a mapping target.
pub fn generate_column_mapping(source_headers: &[String], table_columns: &[String]) -> String {
    let targets: Vec<&String> = table_columns
        .iter()
        .filter(|c| !c.eq_ignore_ascii_case(RUN_ID_COLUMN))
        .collect();

    if source_headers.len() != targets.len() {
        tracing::warn!(
            source_columns = source_headers.len(),
            table_columns = targets.len(),
            "Column count mismatch, mapping by position"
        );
    }

    source_headers
        .iter()
        .zip(targets)
        .map(|(s, t)| format!("{s} > {t}"))
        .collect::<Vec<_>>()
        .join(", ")
}
