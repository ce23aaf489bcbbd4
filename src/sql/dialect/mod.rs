//! SQL Dialect definitions and formatting rules.
//!
//! This module provides a trait-based abstraction for SQL dialect differences.
//! Each dialect implements `SqlDialect` to handle its specific syntax:
//!
//! - Identifier quoting: `"` (Snowflake/Postgres), `` ` `` (BigQuery/MySQL)
//! - Boolean literals: true/false vs 1/0
//! - Cast target type names
//! - Function names and the argument shape of date/time/string helpers
//! - Output alias restrictions
//!
//! # Usage
//!
//! ```ignore
//! use husky::sql::{Dialect, SqlDialect};
//!
//! let dialect: Dialect = "bigquery".parse()?;
//! let quoted = dialect.quote_identifier("spend");  // `spend`
//! ```
//!
//! Snowflake is the default dialect; every query the compiler builds is valid Snowflake
//! SQL, and other dialects only change the rendering.

mod bigquery;
pub mod helpers;
mod mysql;
mod postgres;
mod snowflake;

use std::fmt;
use std::str::FromStr;

pub use bigquery::BigQuery;
pub use mysql::MySql;
pub use postgres::Postgres;
pub use snowflake::Snowflake;

use super::token::TokenStream;
use crate::error::HuskyError;

/// Target type of a `CAST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastType {
    Text,
    Boolean,
    Date,
    Numeric { precision: u32 },
    Decimal { precision: u32, scale: u32 },
}

/// Functions whose name or argument order differ between dialects.
///
/// Arguments are always passed in the following canonical order:
///
/// | Function | Arguments |
/// |---|---|
/// | `ConvertTimezone` | expr, tz_from[, tz_to] |
/// | `SplitPart` | expr, delimiter, position |
/// | `DateTrunc` | unit, expr |
/// | `ToDate` | expr[, format] |
/// | `TimestampDiff` | unit, start, end |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialectFunction {
    ConvertTimezone,
    SplitPart,
    DateTrunc,
    ToDate,
    TimestampDiff,
}

/// SQL dialect trait - defines how SQL constructs are rendered.
///
/// The default implementations follow Snowflake where possible.
pub trait SqlDialect: std::fmt::Debug {
    /// Dialect name for display/logging.
    fn name(&self) -> &'static str;

    // =========================================================================
    // Identifier and Literal Quoting
    // =========================================================================

    /// Quote an identifier (table, column, alias).
    fn quote_identifier(&self, ident: &str) -> String;

    /// Quote a string literal.
    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_single(s)
    }

    /// Format a boolean literal.
    fn format_bool(&self, b: bool) -> &'static str;

    // =========================================================================
    // Pagination
    // =========================================================================

    /// Emit LIMIT/OFFSET or equivalent pagination clause.
    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        helpers::emit_limit_offset_standard(limit, offset)
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    /// Whether this dialect supports NULLS FIRST/LAST in ORDER BY.
    fn supports_nulls_ordering(&self) -> bool {
        true
    }

    // =========================================================================
    // Functions and Types
    // =========================================================================

    /// Remap a function name for this dialect.
    ///
    /// Returns `Some(new_name)` if the function should be remapped, `None` to keep original.
    /// The input is matched case-insensitively.
    fn remap_function(&self, name: &str) -> Option<&'static str> {
        let _ = name;
        None
    }

    /// Render one of the dialect-sensitive functions from serialized arguments.
    fn emit_dialect_function(&self, func: DialectFunction, args: &[String]) -> String {
        helpers::emit_dialect_function_snowflake(func, args)
    }

    /// Name of a cast target type.
    fn emit_cast_type(&self, ty: &CastType) -> String {
        helpers::emit_cast_type_standard(ty)
    }

    // =========================================================================
    // Output Aliases
    // =========================================================================

    /// Rewrite an output column alias into a form the dialect accepts.
    ///
    /// The result may collide with another corrected alias; callers de-duplicate.
    fn correct_alias(&self, alias: &str) -> String {
        alias.to_string()
    }
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    #[default]
    Snowflake,
    BigQuery,
    Postgres,
    MySql,
}

impl Dialect {
    /// Get the dialect implementation.
    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::Snowflake => &Snowflake,
            Dialect::BigQuery => &BigQuery,
            Dialect::Postgres => &Postgres,
            Dialect::MySql => &MySql,
        }
    }

    pub fn all() -> [Dialect; 4] {
        [
            Dialect::Snowflake,
            Dialect::BigQuery,
            Dialect::Postgres,
            Dialect::MySql,
        ]
    }
}

impl FromStr for Dialect {
    type Err = HuskyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "snowflake" => Ok(Dialect::Snowflake),
            "bigquery" => Ok(Dialect::BigQuery),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            _ => Err(HuskyError::UnsupportedDialect(s.to_string())),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl serde::Serialize for Dialect {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> serde::Deserialize<'de> for Dialect {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// Implement SqlDialect for Dialect enum by delegating to concrete types
impl SqlDialect for Dialect {
    fn name(&self) -> &'static str {
        self.dialect().name()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        self.dialect().quote_identifier(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        self.dialect().quote_string(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        self.dialect().format_bool(b)
    }

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        self.dialect().emit_limit_offset(limit, offset)
    }

    fn supports_nulls_ordering(&self) -> bool {
        self.dialect().supports_nulls_ordering()
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        self.dialect().remap_function(name)
    }

    fn emit_dialect_function(&self, func: DialectFunction, args: &[String]) -> String {
        self.dialect().emit_dialect_function(func, args)
    }

    fn emit_cast_type(&self, ty: &CastType) -> String {
        self.dialect().emit_cast_type(ty)
    }

    fn correct_alias(&self, alias: &str) -> String {
        self.dialect().correct_alias(alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("Snowflake".parse::<Dialect>().unwrap(), Dialect::Snowflake);
        assert_eq!("postgresql".parse::<Dialect>().unwrap(), Dialect::Postgres);
        let err = "oracle".parse::<Dialect>().unwrap_err();
        assert!(matches!(err, HuskyError::UnsupportedDialect(ref d) if d == "oracle"));
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        for dialect in Dialect::all() {
            assert_eq!(dialect.to_string().parse::<Dialect>().unwrap(), dialect);
        }
    }

    #[test]
    fn test_quoting_per_dialect() {
        assert_eq!(Dialect::Snowflake.quote_identifier("spend"), "\"spend\"");
        assert_eq!(Dialect::BigQuery.quote_identifier("spend"), "`spend`");
        assert_eq!(Dialect::MySql.format_bool(true), "1");
        assert_eq!(Dialect::Postgres.format_bool(false), "false");
    }

    #[test]
    fn test_alias_correction() {
        assert_eq!(Dialect::Snowflake.correct_alias("fb|spend"), "fb|spend");
        assert_eq!(Dialect::BigQuery.correct_alias("fb|spend"), "fb_spend");
    }

    #[test]
    fn test_cast_types() {
        let decimal = CastType::Decimal {
            precision: 16,
            scale: 2,
        };
        assert_eq!(Dialect::Snowflake.emit_cast_type(&decimal), "DECIMAL(16, 2)");
        assert_eq!(Dialect::BigQuery.emit_cast_type(&CastType::Text), "STRING");
    }
}
