use crate::error::{AbError, Result};
use ahash::{HashMap, HashMapExt};
use csv::StringRecord;
use regex::Regex;
use std::sync::LazyLock;

static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex is valid"));

/// Canonical lower-case snake form of a header, e.g. `"Variant Name"` -> `variant_name`.
pub fn normalize_column_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    NON_ALNUM
        .replace_all(&lower, "_")
        .trim_matches('_')
        .to_string()
}

/// Position of each required column inside a CSV record.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    mapping: HashMap<&'static str, usize>,
}

impl ColumnMapping {
    /// Resolve `required` columns against a header row. Headers are normalized
    /// first; columns that are not required are ignored.
    pub fn from_headers(headers: &StringRecord, required: &[&'static str]) -> Result<Self> {
        let normalized: Vec<String> = headers.iter().map(normalize_column_name).collect();
        let mut mapping = HashMap::new();
        let mut missing = Vec::new();
        for &column in required {
            match normalized.iter().position(|h| h == column) {
                Some(idx) => {
                    mapping.insert(column, idx);
                }
                None => missing.push(column),
            }
        }
        if !missing.is_empty() {
            return Err(AbError::contract(format!(
                "missing required column(s): {} (found: {})",
                missing.join(", "),
                normalized.join(", ")
            )));
        }
        Ok(Self { mapping })
    }

    pub fn idx(&self, column: &str) -> Option<usize> {
        self.mapping.get(column).copied()
    }

    /// Trimmed field for `column`; empty when the record is short.
    pub fn field<'r>(&self, record: &'r StringRecord, column: &str) -> &'r str {
        self.idx(column)
            .and_then(|idx| record.get(idx))
            .unwrap_or("")
            .trim()
    }
}

/// 1-based line of a record, for error messages.
pub fn record_line(record: &StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_column_name() {
        for (raw, expected) in vec![
            ("USER_ID", "user_id"),
            ("Variant Name", "variant_name"),
            ("  revenue ", "revenue"),
            ("total-revenue", "total_revenue"),
            ("__Converted__", "converted"),
            ("", ""),
        ] {
            assert_eq!(normalize_column_name(raw), expected)
        }
    }

    #[test]
    fn test_mapping_ignores_extra_columns() {
        let headers = StringRecord::from(vec!["", "USER_ID", "VARIANT_NAME", "REVENUE"]);
        let mapping =
            ColumnMapping::from_headers(&headers, &["user_id", "variant_name", "revenue"]).unwrap();
        assert_eq!(mapping.idx("user_id"), Some(1));
        assert_eq!(mapping.idx("revenue"), Some(3));

        let record = StringRecord::from(vec!["0", "737", " control ", "0.0"]);
        assert_eq!(mapping.field(&record, "variant_name"), "control");
    }

    #[test]
    fn test_mapping_reports_missing_columns() {
        let headers = StringRecord::from(vec!["user_id", "revenue"]);
        let err = ColumnMapping::from_headers(&headers, &["user_id", "variant_name", "revenue"])
            .unwrap_err();
        match err {
            AbError::DataContractViolation(msg) => assert!(msg.contains("variant_name"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }
}
