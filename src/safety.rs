//! SQL Safety Gate
//!
//! Coarse textual filter restricting candidate SQL to a single read-only
//! SELECT. This is not a parser: keyword text smuggled inside string
//! literals is rejected, identifiers like `insert_count` are not.

use regex::Regex;
use std::sync::OnceLock;

/// Keywords that must not appear anywhere in an executable statement.
const BLOCKED_KEYWORDS: [&str; 13] = [
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "CREATE", "TRUNCATE", "EXEC", "EXECUTE",
    "MERGE", "CALL", "GRANT", "REVOKE",
];

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^```(?:sql)?\s*|\s*```$").unwrap())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn blocked_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(r"\b(?:{})\b", BLOCKED_KEYWORDS.join("|"));
        Regex::new(&pattern).unwrap()
    })
}

/// Sanitize a candidate SQL string. Returns the cleaned statement with its
/// original casing, or `None` if it is anything other than a plain SELECT.
///
/// Deterministic and side-effect free; callers re-run it before execution
/// regardless of what produced the string.
pub fn sanitize(raw_sql: &str) -> Option<String> {
    let mut sql = raw_sql.trim().to_string();
    if sql.starts_with("```") {
        sql = fence_re().replace_all(&sql, "").to_string();
    }
    let sql = whitespace_re().replace_all(sql.trim(), " ").to_string();
    if sql.is_empty() {
        return None;
    }

    let upper = sql.to_uppercase();
    if !upper.starts_with("SELECT") {
        return None;
    }
    if blocked_re().is_match(&upper) {
        return None;
    }

    Some(sql)
}
