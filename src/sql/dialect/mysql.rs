//! MySQL SQL dialect.
//!
//! MySQL differences from Snowflake:
//! - Backtick identifier quoting (`` `name` ``)
//! - Boolean is TINYINT(1), returns 1/0
//! - No NULLS FIRST/LAST
//! - CONVERT_TZ / STR_TO_DATE / SUBSTRING_INDEX helpers

use super::helpers;
use super::{CastType, DialectFunction, SqlDialect};

/// MySQL SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct MySql;

impl SqlDialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_backtick(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_backslash(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_numeric(b)
    }

    fn supports_nulls_ordering(&self) -> bool {
        false
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_mysql(name)
    }

    fn emit_dialect_function(&self, func: DialectFunction, args: &[String]) -> String {
        helpers::emit_dialect_function_mysql(func, args)
    }

    fn emit_cast_type(&self, ty: &CastType) -> String {
        helpers::emit_cast_type_mysql(ty)
    }
}
