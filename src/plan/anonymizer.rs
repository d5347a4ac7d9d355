//! SQL literal scrubbing and query fingerprints.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;
use xxhash_rust::xxh3::xxh3_64;

static STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"'(?:[^'\\]|\\.|'')*'|"(?:[^"\\]|\\.)*""#).expect("valid string literal regex"));
static IN_LIST: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bIN\s*\([^)]*\)").expect("valid IN list regex"));
static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .expect("valid uuid regex")
});
static HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b0[xX][0-9a-fA-F]+\b").expect("valid hex regex"));
static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\b\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b").expect("valid number regex"));
static BOOLEAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(?:true|false)\b").expect("valid boolean regex"));
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/|--[^\n]*").expect("valid comment regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Replaces literals in SQL text with `?`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryAnonymizer;

impl QueryAnonymizer {
    pub fn anonymize(&self, query: &str) -> String {
        if query.is_empty() {
            return String::new();
        }
        // Strings first so digits inside quotes are not matched on their own.
        let text = STRING_LITERAL.replace_all(query, "?");
        let text = IN_LIST.replace_all(&text, "IN (?)");
        let text = UUID.replace_all(&text, "?");
        let text = HEX.replace_all(&text, "?");
        let text = NUMBER.replace_all(&text, "?");
        let text = BOOLEAN.replace_all(&text, "?");
        let text = WHITESPACE.replace_all(text.trim(), " ");
        text.trim_end_matches([';', ' ']).to_string()
    }

    /// Lower-cased anonymised text without comments.
    pub fn normalize(&self, query: &str) -> String {
        let without_comments: Cow<'_, str> = COMMENT.replace_all(query, " ");
        self.anonymize(&without_comments).to_lowercase()
    }

    /// Stable fingerprint of the normalised query.
    pub fn fingerprint(&self, query: &str) -> u64 {
        xxh3_64(self.normalize(query).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("SELECT * FROM users WHERE id = 42;", "SELECT * FROM users WHERE id = ?")]
    #[case("select a from t where name = 'O''Brien'", "select a from t where name = ?")]
    #[case("SELECT 1 FROM t WHERE id IN (1, 2, 3)", "SELECT ? FROM t WHERE id IN (?)")]
    #[case(
        "DELETE FROM s WHERE token = 'a1' AND uid = 0xFF and ok = TRUE",
        "DELETE FROM s WHERE token = ? AND uid = ? and ok = ?"
    )]
    #[case(
        "UPDATE t SET x = -1.5e3  WHERE k = 'c0ffee00-0000-4000-8000-000000000000'",
        "UPDATE t SET x = ? WHERE k = ?"
    )]
    #[case("", "")]
    fn test_anonymize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(QueryAnonymizer.anonymize(input), expected);
    }

    #[test]
    fn test_fingerprint_ignores_literals_case_and_comments() {
        let a = QueryAnonymizer.fingerprint("SELECT * FROM t WHERE id = 1");
        let b = QueryAnonymizer.fingerprint("select *  from t /* hint */ where id = 999;");
        let c = QueryAnonymizer.fingerprint("SELECT * FROM t WHERE name = 1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_identifiers_with_digits_survive() {
        assert_eq!(
            QueryAnonymizer.anonymize("SELECT col1 FROM table2 WHERE v = 3"),
            "SELECT col1 FROM table2 WHERE v = ?"
        );
    }
}
