//! Migration adapter for dependencies embedded in `scraper_config`
//!
//! Older configuration rows declare upstream imports inside the free-form
//! `scraper_config` JSON blob instead of the `depends_on` column. Everything
//! outside this module sees a single merged dependency list.
//!
//! A `depends_on` key counts as a dependency even when its value names no
//! import (`null`, `""` or `[]`): the row still asks for append mode.

use serde_json::Value;

/// Dependencies found in a `scraper_config` blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyDependencies {
    /// No blob, or a blob without a `depends_on` key
    None,
    /// A `depends_on` key is present; the names it declares, possibly none
    Declared(Vec<String>),
    /// The blob is not valid JSON; callers treat this as "has a dependency"
    Unparsable(String),
}

impl LegacyDependencies {
    /// Parse the raw `scraper_config` column value
    pub fn parse(scraper_config: Option<&str>) -> Self {
        let Some(raw) = scraper_config.map(str::trim).filter(|s| !s.is_empty()) else {
            return LegacyDependencies::None;
        };

        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => match map.get("depends_on") {
                None => LegacyDependencies::None,
                Some(value) => LegacyDependencies::Declared(names_from_value(value)),
            },
            Ok(_) => LegacyDependencies::None,
            Err(e) => LegacyDependencies::Unparsable(e.to_string()),
        }
    }

    /// Whether this blob forces dependency handling
    pub fn implies_dependency(&self) -> bool {
        !matches!(self, LegacyDependencies::None)
    }

    /// Declared names (empty for `None` and `Unparsable`)
    pub fn names(&self) -> &[String] {
        match self {
            LegacyDependencies::Declared(names) => names,
            _ => &[],
        }
    }
}

fn names_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => split_names(s),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .flat_map(split_names)
            .collect(),
        other => split_names(&other.to_string()),
    }
}

/// Split a comma-separated name list, dropping blanks
pub fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Merge the `depends_on` column with legacy declarations.
///
/// Order is preserved and names are de-duplicated case-insensitively.
pub fn merge_dependencies(column: Option<&str>, legacy: &LegacyDependencies) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let column_names = column.map(split_names).unwrap_or_default();
    for name in column_names.into_iter().chain(legacy.names().iter().cloned()) {
        if !merged.iter().any(|m| m.eq_ignore_ascii_case(&name)) {
            merged.push(name);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_dependency() {
        let deps = LegacyDependencies::parse(Some(r#"{"depends_on": "orders_full"}"#));
        assert_eq!(deps.names(), ["orders_full".to_string()]);
    }

    #[test]
    fn test_parse_list_dependency() {
        let deps = LegacyDependencies::parse(Some(r#"{"url": "x", "depends_on": ["a", "b"]}"#));
        assert_eq!(deps.names(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parse_without_key() {
        assert_eq!(
            LegacyDependencies::parse(Some(r#"{"url": "x"}"#)),
            LegacyDependencies::None
        );
        assert_eq!(LegacyDependencies::parse(None), LegacyDependencies::None);
        assert_eq!(LegacyDependencies::parse(Some("  ")), LegacyDependencies::None);
    }

    #[test]
    fn test_null_key_still_implies_dependency() {
        let deps = LegacyDependencies::parse(Some(r#"{"depends_on": null}"#));
        assert_eq!(deps, LegacyDependencies::Declared(Vec::new()));
        assert!(deps.implies_dependency());
        assert!(deps.names().is_empty());

        let empty = LegacyDependencies::parse(Some(r#"{"depends_on": []}"#));
        assert!(empty.implies_dependency());
    }

    #[test]
    fn test_unparsable_implies_dependency() {
        let deps = LegacyDependencies::parse(Some("{not json"));
        assert!(matches!(deps, LegacyDependencies::Unparsable(_)));
        assert!(deps.implies_dependency());
        assert!(deps.names().is_empty());
    }

    #[test]
    fn test_merge_dependencies() {
        let legacy = LegacyDependencies::Declared(vec!["A".to_string(), "c".to_string()]);
        let merged = merge_dependencies(Some("a, b"), &legacy);
        assert_eq!(merged, vec!["a", "b", "c"]);
    }
}
