//! BigQuery SQL dialect.
//!
//! BigQuery features:
//! - Backtick identifier quoting
//! - Column names restricted to letters, digits and underscores
//! - DATETIME_TRUNC/DATETIME_DIFF with the expression first
//! - Backslash escapes in string literals

use super::helpers;
use super::{CastType, DialectFunction, SqlDialect};

/// BigQuery SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct BigQuery;

impl SqlDialect for BigQuery {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_backtick(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_backslash(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_literal(b)
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_bigquery(name)
    }

    fn emit_dialect_function(&self, func: DialectFunction, args: &[String]) -> String {
        helpers::emit_dialect_function_bigquery(func, args)
    }

    fn emit_cast_type(&self, ty: &CastType) -> String {
        helpers::emit_cast_type_bigquery(ty)
    }

    fn correct_alias(&self, alias: &str) -> String {
        helpers::correct_alias_word_chars(alias)
    }
}
