//! SQL-safe identifiers and well-known names.
//!
//! Taxon slugs can contain characters that are not valid in unquoted SQL identifiers
//! (`|`, `:`, `@`, `-`, ...). Every column the compiler emits goes through
//! [`safe_identifier`], which is idempotent: once a name is safe it is returned unchanged.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Column carrying the virtual data source name of every per-source row.
pub const DATA_SOURCE_COLUMN: &str = "__data_source";

/// Separator between a data source namespace and a taxon name.
pub const NAMESPACE_DELIMITER: char = '|';

/// Prefix of TEL expressions queried directly in a request (`=m:...`, `=d:...`).
pub const TEL_EXPR_QUERY_PREFIX: &str = "=";
pub const TEL_EXPR_METRIC_QUERY_PREFIX: &str = "=m:";
pub const TEL_EXPR_DIMENSION_QUERY_PREFIX: &str = "=d:";

/// Prefix of comparison taxon columns.
pub const COMPARISON_PREFIX: &str = "comparison@";

/// Character used to escape `%` and `_` in LIKE patterns.
pub const LIKE_ESCAPE_CHAR: char = '/';

const MAX_COLUMN_NAME_LENGTH: usize = 63;
const HASH_SIZE: usize = 18;

static UNSAFE_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new("[^0-9a-zA-Z_]").unwrap());

/// Returns an identifier containing only `[0-9a-z_]`, starting with a letter or `_`.
///
/// When the input is already safe it is returned as-is. Otherwise the sanitized prefix is
/// suffixed with a hash of the original value, so `spend+1` and `spend-1` never collide.
pub fn safe_identifier(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let prefixed = match value.chars().next() {
        Some(c) if c.is_alphabetic() || c == '_' => value.to_string(),
        _ => format!("_{value}"),
    };
    let sanitized = UNSAFE_CHARS.replace_all(&prefixed, "_").to_lowercase();
    if sanitized == value {
        return sanitized;
    }

    let keep = MAX_COLUMN_NAME_LENGTH - HASH_SIZE - 1;
    let before_hash: String = sanitized.chars().take(keep).collect();
    let digest = Sha256::digest(prefixed.as_bytes());
    let hash: String = digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(HASH_SIZE)
        .collect();
    format!("{before_hash}_{hash}")
}

/// Escapes `%` and `_` so they match literally inside a LIKE pattern.
pub fn escape_like_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c == '%' || c == '_' {
            out.push(LIKE_ESCAPE_CHAR);
        }
        out.push(c);
    }
    out
}

/// Namespace part of a `namespace|name` slug.
pub fn data_source_from_slug(slug: &str) -> Option<&str> {
    slug.split_once(NAMESPACE_DELIMITER).map(|(ns, _)| ns)
}

/// Prefixes a slug with a data source namespace.
pub fn prefix_with_data_source(data_source: &str, slug: &str) -> String {
    format!("{data_source}{NAMESPACE_DELIMITER}{slug}")
}

/// Removes the namespace of a slug, when present.
pub fn strip_data_source(slug: &str) -> &str {
    slug.split_once(NAMESPACE_DELIMITER)
        .map(|(_, name)| name)
        .unwrap_or(slug)
}

/// Slug of the comparison counterpart of a taxon.
pub fn comparison_slug(slug: &str) -> String {
    format!("{COMPARISON_PREFIX}{slug}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_identifier_keeps_safe_names() {
        assert_eq!(safe_identifier("spend"), "spend");
        assert_eq!(safe_identifier("_tmp_1"), "_tmp_1");
        assert_eq!(safe_identifier(""), "");
    }

    #[test]
    fn test_safe_identifier_sanitizes_and_hashes() {
        let id = safe_identifier("fb_tw|spend");
        assert!(id.starts_with("fb_tw_spend_"), "{id}");
        assert_eq!(id.len(), "fb_tw_spend_".len() + HASH_SIZE);
        assert_ne!(safe_identifier("spend+1"), safe_identifier("spend-1"));
        assert!(safe_identifier("1day").starts_with("_1day_"));
        assert!(safe_identifier("Spend").starts_with("spend_"));
    }

    #[test]
    fn test_safe_identifier_is_idempotent() {
        for raw in ["fb|spend", "comparison@cpm", "1day", "Spend", "a".repeat(100).as_str()] {
            let once = safe_identifier(raw);
            assert_eq!(safe_identifier(&once), once);
        }
    }

    #[test]
    fn test_safe_identifier_truncates_long_names() {
        let id = safe_identifier(&format!("{}|x", "a".repeat(100)));
        assert_eq!(id.len(), MAX_COLUMN_NAME_LENGTH);
    }

    #[test]
    fn test_escape_like_pattern() {
        assert_eq!(escape_like_pattern("50%_off"), "50/%/_off");
        assert_eq!(escape_like_pattern("plain"), "plain");
    }

    #[test]
    fn test_slug_namespaces() {
        assert_eq!(data_source_from_slug("fb|spend"), Some("fb"));
        assert_eq!(data_source_from_slug("spend"), None);
        assert_eq!(strip_data_source("fb|spend"), "spend");
        assert_eq!(prefix_with_data_source("fb", "spend"), "fb|spend");
    }
}
