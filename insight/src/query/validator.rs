//! Read-only query validation.
//!
//! A statement is rejected when any mutating keyword appears as a
//! whole token anywhere in it, case-insensitively, not only as the
//! leading token. Token-boundary matching matters: a column named
//! `created_at` contains "create" as a substring and must pass.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{EngineError, EngineResult};

static MUTATING_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(DROP|DELETE|INSERT|UPDATE|ALTER|TRUNCATE|CREATE|GRANT|REVOKE)\b")
        .expect("static keyword pattern")
});

/// Reject any statement that is not a pure read operation.
pub fn validate_read_only(query: &str) -> EngineResult<()> {
    if let Some(found) = MUTATING_KEYWORDS.find(query) {
        return Err(EngineError::UnsafeQuery(format!(
            "statement contains mutating keyword '{}'",
            found.as_str().to_uppercase()
        )));
    }
    Ok(())
}

/// Normalize raw LLM output into exactly one statement: strip an
/// optional trailing semicolon, reject empty text and anything still
/// containing a statement separator.
pub fn normalize_statement(raw: &str) -> EngineResult<String> {
    let text = crate::llm::strip_code_fences(raw).trim();
    let text = text.strip_suffix(';').unwrap_or(text).trim();
    if text.is_empty() {
        return Err(EngineError::MalformedQuery(
            "query text is empty".to_string(),
        ));
    }
    if text.contains(';') {
        return Err(EngineError::MalformedQuery(
            "expected exactly one statement".to_string(),
        ));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_every_mutating_keyword_any_position() {
        let keywords = [
            "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
        ];
        for kw in keywords {
            let leading = format!("{} TABLE records", kw);
            assert!(validate_read_only(&leading).is_err(), "leading {}", kw);

            let embedded = format!("SELECT 1 WHERE x = 2; {} TABLE records", kw);
            assert!(validate_read_only(&embedded).is_err(), "embedded {}", kw);

            let lowercase = format!("select 1 where exists (select {} from t)", kw.to_lowercase());
            assert!(validate_read_only(&lowercase).is_err(), "lowercase {}", kw);
        }
    }

    #[test]
    fn test_accepts_substring_lookalikes() {
        // Column names containing keywords as substrings are fine.
        assert!(validate_read_only("SELECT created_at FROM records").is_ok());
        assert!(validate_read_only("SELECT updated_on, inserted_by FROM records").is_ok());
        assert!(validate_read_only("SELECT granted_total FROM records").is_ok());
        assert!(validate_read_only("SELECT dropped_calls FROM records").is_ok());
    }

    #[test]
    fn test_accepts_plain_select() {
        assert!(validate_read_only("SELECT AVG(revenue) FROM records").is_ok());
    }

    #[test]
    fn test_normalize_strips_fences_and_semicolon() {
        let raw = "```sql\nSELECT 1 FROM records;\n```";
        assert_eq!(normalize_statement(raw).unwrap(), "SELECT 1 FROM records");
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(matches!(
            normalize_statement("   "),
            Err(EngineError::MalformedQuery(_))
        ));
        assert!(matches!(
            normalize_statement("```sql\n```"),
            Err(EngineError::MalformedQuery(_))
        ));
    }

    #[test]
    fn test_normalize_rejects_multiple_statements() {
        assert!(matches!(
            normalize_statement("SELECT 1; SELECT 2"),
            Err(EngineError::MalformedQuery(_))
        ));
    }
}
