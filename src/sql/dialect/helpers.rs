//! Shared helper functions for SQL dialect implementations.
//!
//! This module provides reusable building blocks that dialects can compose
//! to implement the `SqlDialect` trait with minimal duplication.

use super::super::token::{Token, TokenStream};
use super::{CastType, DialectFunction};

// =============================================================================
// Identifier Quoting
// =============================================================================

/// Quote identifier with double quotes (ANSI style).
/// Used by: Snowflake, Postgres
pub fn quote_double(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote identifier with backticks.
/// Used by: BigQuery, MySQL
pub fn quote_backtick(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

// =============================================================================
// String Quoting
// =============================================================================

/// Quote string with single quotes (standard SQL).
pub fn quote_string_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Quote string with single quotes, escaping backslashes as well.
/// Used by: BigQuery, MySQL (backslash is an escape character there)
pub fn quote_string_backslash(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

// =============================================================================
// Boolean Formatting
// =============================================================================

/// Format boolean as literal true/false.
/// Used by: Snowflake, BigQuery, Postgres
pub fn format_bool_literal(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// Format boolean as numeric 1/0.
/// Used by: MySQL
pub fn format_bool_numeric(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

// =============================================================================
// Pagination
// =============================================================================

/// Emit LIMIT ... OFFSET ... (standard SQL).
pub fn emit_limit_offset_standard(limit: Option<u64>, offset: Option<u64>) -> TokenStream {
    let mut ts = TokenStream::new();

    if let Some(lim) = limit {
        ts.push(Token::Limit)
            .space()
            .push(Token::LitInt(lim as i64));
    }

    if let Some(off) = offset {
        if limit.is_some() {
            ts.space();
        }
        ts.push(Token::Offset)
            .space()
            .push(Token::LitInt(off as i64));
    }

    ts
}

// =============================================================================
// Function Remapping
// =============================================================================

/// Remap functions for Snowflake dialect.
pub fn remap_function_snowflake(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "NOW" => Some("CURRENT_TIMESTAMP"),
        "IFNULL" => Some("COALESCE"),
        _ => None,
    }
}

/// Remap functions for BigQuery dialect.
pub fn remap_function_bigquery(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "NOW" => Some("CURRENT_DATETIME"),
        "NVL" | "IFNULL" => Some("COALESCE"),
        _ => None,
    }
}

/// Remap functions for Postgres dialect.
pub fn remap_function_postgres(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "NVL" | "IFNULL" => Some("COALESCE"),
        _ => None,
    }
}

/// Remap functions for MySQL dialect.
pub fn remap_function_mysql(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "NVL" => Some("COALESCE"),
        "SPLIT_PART" => Some("SUBSTRING_INDEX"),
        _ => None,
    }
}

// =============================================================================
// Cast Types
// =============================================================================

/// Cast target names shared by Snowflake and Postgres.
pub fn emit_cast_type_standard(ty: &CastType) -> String {
    match ty {
        CastType::Text => "VARCHAR".into(),
        CastType::Boolean => "BOOLEAN".into(),
        CastType::Date => "DATE".into(),
        CastType::Numeric { precision } => format!("NUMERIC({precision})"),
        CastType::Decimal { precision, scale } => format!("DECIMAL({precision}, {scale})"),
    }
}

pub fn emit_cast_type_bigquery(ty: &CastType) -> String {
    match ty {
        CastType::Text => "STRING".into(),
        CastType::Boolean => "BOOL".into(),
        CastType::Date => "DATE".into(),
        CastType::Numeric { .. } => "NUMERIC".into(),
        CastType::Decimal { precision, scale } => format!("NUMERIC({precision}, {scale})"),
    }
}

pub fn emit_cast_type_mysql(ty: &CastType) -> String {
    match ty {
        CastType::Text => "CHAR".into(),
        CastType::Boolean => "UNSIGNED".into(),
        CastType::Date => "DATE".into(),
        CastType::Numeric { precision } => format!("DECIMAL({precision})"),
        CastType::Decimal { precision, scale } => format!("DECIMAL({precision}, {scale})"),
    }
}

// =============================================================================
// Dialect Functions
// =============================================================================

/// Render a dialect function in Snowflake shape, which doubles as the default.
///
/// `args` are already serialized, in the canonical order documented on
/// [`DialectFunction`].
pub fn emit_dialect_function_snowflake(func: DialectFunction, args: &[String]) -> String {
    match func {
        DialectFunction::ConvertTimezone => match args {
            [expr, from, to] => format!("CONVERT_TIMEZONE({from}, {to}, {expr})"),
            [expr, from] => format!("CONVERT_TIMEZONE({from}, {expr})"),
            _ => call("CONVERT_TIMEZONE", args),
        },
        DialectFunction::SplitPart => call("SPLIT_PART", args),
        DialectFunction::DateTrunc => match args {
            [unit, expr] => format!("DATE_TRUNC({unit}, {expr})"),
            _ => call("DATE_TRUNC", args),
        },
        DialectFunction::ToDate => call("TO_DATE", args),
        DialectFunction::TimestampDiff => call("TIMESTAMPDIFF", args),
    }
}

pub fn emit_dialect_function_bigquery(func: DialectFunction, args: &[String]) -> String {
    match func {
        DialectFunction::ConvertTimezone => match args {
            [expr, from, to] => format!("DATETIME(DATETIME({expr}, {from}), {to})"),
            [expr, from] => format!("DATETIME({expr}, {from})"),
            _ => call("DATETIME", args),
        },
        DialectFunction::SplitPart => match args {
            [expr, delimiter, position] => {
                format!("SPLIT({expr}, {delimiter})[SAFE_ORDINAL({position})]")
            }
            _ => call("SPLIT", args),
        },
        DialectFunction::DateTrunc => match args {
            [unit, expr] => format!("DATETIME_TRUNC({expr}, {})", unit.trim_matches('\'')),
            _ => call("DATETIME_TRUNC", args),
        },
        DialectFunction::ToDate => match args {
            [expr, format] => format!("PARSE_DATE({format}, {expr})"),
            [expr] => format!("CAST({expr} AS DATE)"),
            _ => call("PARSE_DATE", args),
        },
        DialectFunction::TimestampDiff => match args {
            [unit, start, end] => format!("DATETIME_DIFF({end}, {start}, {unit})"),
            _ => call("DATETIME_DIFF", args),
        },
    }
}

pub fn emit_dialect_function_postgres(func: DialectFunction, args: &[String]) -> String {
    match func {
        DialectFunction::ConvertTimezone => match args {
            [expr, from, to] => format!("(({expr} AT TIME ZONE {from}) AT TIME ZONE {to})"),
            [expr, from] => format!("({expr} AT TIME ZONE {from})"),
            _ => call("TIMEZONE", args),
        },
        DialectFunction::TimestampDiff => match args {
            [unit, start, end] => format!(
                "EXTRACT({} FROM ({end} - {start}))",
                unit.trim_matches('\'').to_uppercase()
            ),
            _ => call("AGE", args),
        },
        other => emit_dialect_function_snowflake(other, args),
    }
}

pub fn emit_dialect_function_mysql(func: DialectFunction, args: &[String]) -> String {
    match func {
        DialectFunction::ConvertTimezone => match args {
            [expr, from, to] => format!("CONVERT_TZ({expr}, {from}, {to})"),
            [expr, from] => format!("CONVERT_TZ({expr}, {from}, 'UTC')"),
            _ => call("CONVERT_TZ", args),
        },
        DialectFunction::SplitPart => match args {
            [expr, delimiter, position] => format!(
                "SUBSTRING_INDEX(SUBSTRING_INDEX({expr}, {delimiter}, {position}), {delimiter}, -1)"
            ),
            _ => call("SUBSTRING_INDEX", args),
        },
        DialectFunction::ToDate => match args {
            [expr, format] => format!("STR_TO_DATE({expr}, {format})"),
            [expr] => format!("DATE({expr})"),
            _ => call("STR_TO_DATE", args),
        },
        DialectFunction::TimestampDiff => match args {
            [unit, start, end] => format!(
                "TIMESTAMPDIFF({}, {start}, {end})",
                unit.trim_matches('\'').to_uppercase()
            ),
            _ => call("TIMESTAMPDIFF", args),
        },
        DialectFunction::DateTrunc => emit_dialect_function_snowflake(func, args),
    }
}

fn call(name: &str, args: &[String]) -> String {
    format!("{}({})", name, args.join(", "))
}

// =============================================================================
// Output Aliases
// =============================================================================

/// Rewrite aliases to `[A-Za-z0-9_]`, prefixing `_` when they start with a digit.
/// Used by: BigQuery, which rejects most punctuation in column names.
pub fn correct_alias_word_chars(alias: &str) -> String {
    let mut out: String = alias
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote_double("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_backtick("a`b"), "`a``b`");
        assert_eq!(quote_string_single("it's"), "'it''s'");
        assert_eq!(quote_string_backslash("it's"), "'it\\'s'");
    }

    #[test]
    fn test_limit_offset() {
        let ts = emit_limit_offset_standard(Some(10), Some(5));
        assert_eq!(ts.serialize(super::super::Dialect::Snowflake), "LIMIT 10 OFFSET 5");
        let ts = emit_limit_offset_standard(None, Some(5));
        assert_eq!(ts.serialize(super::super::Dialect::Snowflake), "OFFSET 5");
    }

    #[test]
    fn test_correct_alias_word_chars() {
        assert_eq!(correct_alias_word_chars("fb|spend"), "fb_spend");
        assert_eq!(correct_alias_word_chars("1day"), "_1day");
        assert_eq!(correct_alias_word_chars("ok_name"), "ok_name");
    }

    #[test]
    fn test_split_part_shapes() {
        let args = vec!["x".to_string(), "'-'".to_string(), "2".to_string()];
        assert_eq!(
            emit_dialect_function_snowflake(DialectFunction::SplitPart, &args),
            "SPLIT_PART(x, '-', 2)"
        );
        assert_eq!(
            emit_dialect_function_bigquery(DialectFunction::SplitPart, &args),
            "SPLIT(x, '-')[SAFE_ORDINAL(2)]"
        );
    }
}
