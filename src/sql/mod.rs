//! SQL generation module.
//!
//! This module provides a type-safe SQL builder that generates multi-dialect SQL.
//! It includes:
//!
//! - [`query`] - SELECT query builder (CTEs, derived tables, joins, UNION ALL)
//! - [`expr`] - Expression AST and builder DSL
//! - [`token`] - Token types for SQL generation
//! - [`dialect`] - SQL dialect implementations

pub mod dialect;
pub mod expr;
pub mod query;
pub mod token;

// Re-export commonly used types at the sql module level
pub use dialect::{CastType, Dialect, DialectFunction, SqlDialect};
pub use expr::{
    avg, case_when, cast, coalesce, col, count, count_distinct, dialect_func, func, lit_bool,
    lit_float, lit_int, lit_null, lit_str, max, min, nullif, paren, sum, table_col, template,
    BinaryOperator, Expr, ExprExt, Literal, NullsOrder, SortDir, UnaryOperator, WindowExt,
    WindowFrame, WindowOrderBy,
};
pub use query::{
    sort_select, Cte, Join, JoinType, LimitOffset, OrderByExpr, Query, SelectExpr, TableRef,
    TableSource,
};
pub use token::{Token, TokenStream};
