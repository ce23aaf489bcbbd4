//! Query builder - construct SQL queries with a fluent API.
//!
//! Queries nest freely (subqueries in FROM/JOIN, CTEs inside subqueries). When rendered,
//! every CTE reachable from the statement is hoisted into a single top-level WITH clause,
//! de-duplicated by name, so the output is valid in every supported dialect.

use super::dialect::{Dialect, SqlDialect};
use super::expr::{Expr, ExprExt, NullsOrder, SortDir};
use super::token::{Token, TokenStream};

// =============================================================================
// Select Expression (column with optional alias)
// =============================================================================

/// A SELECT list item: expression with optional alias.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct SelectExpr {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectExpr {
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name under which the column is visible to an outer query.
    pub fn output_name(&self) -> Option<&str> {
        match (&self.alias, &self.expr) {
            (Some(alias), _) => Some(alias),
            (None, Expr::Column { column, .. }) => Some(column),
            _ => None,
        }
    }

    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = self.expr.to_tokens_for_dialect(dialect);
        if let Some(alias) = &self.alias {
            ts.space()
                .push(Token::As)
                .space()
                .push(Token::Ident(alias.clone()));
        }
        ts
    }
}

impl From<Expr> for SelectExpr {
    fn from(expr: Expr) -> Self {
        SelectExpr::new(expr)
    }
}

/// Sort select items alphabetically by output name.
///
/// Generated SQL must not depend on map iteration order, so every stage of the
/// compiler emits its columns through this.
pub fn sort_select(mut items: Vec<SelectExpr>) -> Vec<SelectExpr> {
    items.sort_by(|a, b| {
        let key_a = a.output_name().map(str::to_string).unwrap_or_else(|| a.expr.to_string());
        let key_b = b.output_name().map(str::to_string).unwrap_or_else(|| b.expr.to_string());
        key_a.cmp(&key_b)
    });
    items
}

// =============================================================================
// Table Reference
// =============================================================================

/// What a FROM / JOIN item reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    /// A (possibly fully qualified) table name, or the name of a CTE.
    Table { parts: Vec<String> },
    /// A derived table.
    Subquery(Box<Query>),
}

/// A table reference with optional alias.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct TableRef {
    pub source: TableSource,
    pub alias: Option<String>,
}

impl TableRef {
    /// Single-part table or CTE name.
    pub fn new(table: &str) -> Self {
        Self {
            source: TableSource::Table {
                parts: vec![table.into()],
            },
            alias: None,
        }
    }

    /// Fully qualified name (`database.schema.table`), each part quoted separately.
    pub fn qualified(parts: &[String]) -> Self {
        Self {
            source: TableSource::Table {
                parts: parts.to_vec(),
            },
            alias: None,
        }
    }

    /// Derived table; an alias is mandatory in most dialects.
    pub fn subquery(query: Query, alias: &str) -> Self {
        Self {
            source: TableSource::Subquery(Box::new(query)),
            alias: Some(alias.into()),
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.into());
        self
    }

    fn collect_ctes(&self, out: &mut Vec<Cte>) {
        if let TableSource::Subquery(query) = &self.source {
            query.collect_ctes(out);
        }
    }

    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        match &self.source {
            TableSource::Table { parts } => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        ts.push(Token::Dot);
                    }
                    ts.push(Token::Ident(part.clone()));
                }
            }
            TableSource::Subquery(query) => {
                ts.lparen()
                    .newline()
                    .append(&query.body_tokens(dialect))
                    .newline()
                    .rparen();
            }
        }
        if let Some(alias) = &self.alias {
            ts.space()
                .push(Token::As)
                .space()
                .push(Token::Ident(alias.clone()));
        }
        ts
    }
}

// =============================================================================
// Joins
// =============================================================================

/// Type of join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    pub on: Expr,
}

impl Join {
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();

        ts.push(match self.join_type {
            JoinType::Inner => Token::Inner,
            JoinType::Left => Token::Left,
            JoinType::Right => Token::Right,
        });

        ts.space().push(Token::Join).space();
        ts.append(&self.table.to_tokens_for_dialect(dialect));
        ts.space().push(Token::On).space();
        ts.append(&self.on.to_tokens_for_dialect(dialect));

        ts
    }
}

// =============================================================================
// ORDER BY
// =============================================================================

/// An ORDER BY expression.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct OrderByExpr {
    pub expr: Expr,
    pub dir: Option<SortDir>,
    pub nulls: Option<NullsOrder>,
}

impl OrderByExpr {
    pub fn new(expr: Expr, dir: SortDir) -> Self {
        Self {
            expr,
            dir: Some(dir),
            nulls: None,
        }
    }

    pub fn asc(expr: Expr) -> Self {
        Self::new(expr, SortDir::Asc)
    }

    pub fn desc(expr: Expr) -> Self {
        Self::new(expr, SortDir::Desc)
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = Some(NullsOrder::Last);
        self
    }

    /// Convert to tokens for a specific dialect.
    ///
    /// Skips NULLS FIRST/LAST for dialects that don't support it.
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = self.expr.to_tokens_for_dialect(dialect);

        if let Some(dir) = &self.dir {
            ts.space().push(match dir {
                SortDir::Asc => Token::Asc,
                SortDir::Desc => Token::Desc,
            });
        }

        if let Some(nulls) = &self.nulls {
            if dialect.supports_nulls_ordering() {
                ts.space().push(match nulls {
                    NullsOrder::First => Token::NullsFirst,
                    NullsOrder::Last => Token::NullsLast,
                });
            }
        }

        ts
    }
}

// =============================================================================
// LIMIT / OFFSET
// =============================================================================

/// LIMIT and OFFSET clause.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitOffset {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl LimitOffset {
    /// Delegates to `SqlDialect::emit_limit_offset()` for the actual formatting.
    pub fn to_tokens(&self, dialect: Dialect) -> TokenStream {
        dialect.emit_limit_offset(self.limit, self.offset)
    }
}

// =============================================================================
// Set Operations
// =============================================================================

/// `UNION ALL` over two or more queries.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "SetOperation has no effect until converted to SQL with to_sql()"]
pub struct SetOperation {
    pub queries: Vec<Query>,
}

impl SetOperation {
    fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        for (i, query) in self.queries.iter().enumerate() {
            if i > 0 {
                ts.newline().push(Token::Union).space().push(Token::All).newline();
            }
            ts.lparen();
            ts.append(&query.body_tokens(dialect));
            ts.rparen();
        }
        ts
    }
}

// =============================================================================
// CTE (Common Table Expression)
// =============================================================================

/// A Common Table Expression (WITH clause).
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct Cte {
    pub name: String,
    pub query: Box<Query>,
}

impl Cte {
    pub fn new(name: &str, query: Query) -> Self {
        Self {
            name: name.into(),
            query: Box::new(query),
        }
    }

    fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.push(Token::Ident(self.name.clone()));
        ts.space()
            .push(Token::As)
            .space()
            .lparen()
            .newline()
            .append(&self.query.body_tokens(dialect))
            .newline()
            .rparen();
        ts
    }
}

// =============================================================================
// Query Builder
// =============================================================================

/// A SELECT query, or a `UNION ALL` of queries when `set_op` is present.
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use = "Query has no effect until converted to SQL with to_sql()"]
pub struct Query {
    pub with: Vec<Cte>,
    pub select: Vec<SelectExpr>,
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit_offset: Option<LimitOffset>,
    pub set_op: Option<SetOperation>,
}

impl Query {
    /// Create a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// `UNION ALL` of the given queries. A single query is returned unchanged.
    pub fn union_all(mut queries: Vec<Query>) -> Self {
        if queries.len() == 1 {
            return queries.remove(0);
        }
        Query {
            set_op: Some(SetOperation { queries }),
            ..Default::default()
        }
    }

    /// Add a CTE (WITH clause).
    pub fn with_cte(mut self, cte: Cte) -> Self {
        self.with.push(cte);
        self
    }

    /// Set the SELECT list.
    pub fn select(mut self, exprs: Vec<impl Into<SelectExpr>>) -> Self {
        self.select = exprs.into_iter().map(|e| e.into()).collect();
        self
    }

    /// Set the FROM table.
    pub fn from(mut self, table: TableRef) -> Self {
        self.from = Some(table);
        self
    }

    /// Add a JOIN.
    pub fn join(mut self, join_type: JoinType, table: TableRef, on: Expr) -> Self {
        self.joins.push(Join {
            join_type,
            table,
            on,
        });
        self
    }

    /// Add a LEFT JOIN.
    pub fn left_join(self, table: TableRef, on: Expr) -> Self {
        self.join(JoinType::Left, table, on)
    }

    /// Add a WHERE condition (ANDed with existing conditions).
    pub fn filter(mut self, condition: Expr) -> Self {
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    /// Set the GROUP BY clause.
    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by = exprs;
        self
    }

    /// Set the ORDER BY clause.
    pub fn order_by(mut self, exprs: Vec<OrderByExpr>) -> Self {
        self.order_by = exprs;
        self
    }

    /// Set LIMIT.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit_offset.get_or_insert_with(LimitOffset::default).limit = Some(limit);
        self
    }

    /// Set OFFSET.
    pub fn offset(mut self, offset: u64) -> Self {
        self.limit_offset.get_or_insert_with(LimitOffset::default).offset = Some(offset);
        self
    }

    /// Output column names of the SELECT list (the first branch of a union).
    pub fn output_names(&self) -> Vec<String> {
        if let Some(set_op) = &self.set_op {
            return set_op
                .queries
                .first()
                .map(Query::output_names)
                .unwrap_or_default();
        }
        self.select
            .iter()
            .filter_map(|s| s.output_name().map(str::to_string))
            .collect()
    }

    /// Wrap this query as a derived table and select from it.
    pub fn wrap(self, alias: &str) -> Query {
        Query::new().from(TableRef::subquery(self, alias))
    }

    /// Every CTE used by this query or its subqueries, dependencies first.
    fn collect_ctes(&self, out: &mut Vec<Cte>) {
        for cte in &self.with {
            cte.query.collect_ctes(out);
            if !out.iter().any(|c| c.name == cte.name) {
                out.push(Cte {
                    name: cte.name.clone(),
                    query: Box::new(Query {
                        with: vec![],
                        ..(*cte.query).clone()
                    }),
                });
            }
        }
        if let Some(from) = &self.from {
            from.collect_ctes(out);
        }
        for join in &self.joins {
            join.table.collect_ctes(out);
        }
        if let Some(set_op) = &self.set_op {
            for query in &set_op.queries {
                query.collect_ctes(out);
            }
        }
    }

    /// Convert to token stream for a specific dialect.
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ctes = Vec::new();
        self.collect_ctes(&mut ctes);

        let mut ts = TokenStream::new();
        if !ctes.is_empty() {
            ts.push(Token::With).space();
            for (i, cte) in ctes.iter().enumerate() {
                if i > 0 {
                    ts.comma().newline();
                }
                ts.append(&cte.to_tokens_for_dialect(dialect));
            }
            ts.newline();
        }
        ts.append(&self.body_tokens(dialect));
        ts
    }

    /// The query without its WITH clause.
    fn body_tokens(&self, dialect: Dialect) -> TokenStream {
        if let Some(set_op) = &self.set_op {
            return set_op.to_tokens_for_dialect(dialect);
        }

        let mut ts = TokenStream::new();

        // SELECT
        ts.push(Token::Select);
        for (i, select_expr) in self.select.iter().enumerate() {
            if i == 0 {
                ts.newline().indent(1);
            } else {
                ts.comma().newline().indent(1);
            }
            ts.append(&select_expr.to_tokens_for_dialect(dialect));
        }
        if self.select.is_empty() {
            ts.space().push(Token::Star);
        }

        // FROM
        if let Some(from) = &self.from {
            ts.newline().push(Token::From).space();
            ts.append(&from.to_tokens_for_dialect(dialect));
        }

        // JOINs
        for join in &self.joins {
            ts.newline();
            ts.append(&join.to_tokens_for_dialect(dialect));
        }

        // WHERE
        if let Some(where_clause) = &self.where_clause {
            ts.newline().push(Token::Where).space();
            ts.append(&where_clause.to_tokens_for_dialect(dialect));
        }

        // GROUP BY
        if !self.group_by.is_empty() {
            ts.newline().push(Token::GroupBy).space();
            for (i, expr) in self.group_by.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.append(&expr.to_tokens_for_dialect(dialect));
            }
        }

        // ORDER BY
        if !self.order_by.is_empty() {
            ts.newline().push(Token::OrderBy).space();
            for (i, order_expr) in self.order_by.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.append(&order_expr.to_tokens_for_dialect(dialect));
            }
        }

        // LIMIT / OFFSET
        if let Some(lo) = &self.limit_offset {
            let paging = lo.to_tokens(dialect);
            if !paging.is_empty() {
                ts.newline();
                ts.append(&paging);
            }
        }

        ts
    }

    /// Generate SQL string for a specific dialect.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        self.to_tokens_for_dialect(dialect).serialize(dialect)
    }
}

impl std::fmt::Display for Query {
    /// Formats the query as Snowflake SQL.
    ///
    /// For dialect-specific SQL, use [`Query::to_sql`] instead.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql(Dialect::default()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::expr::{col, lit_int, lit_str, sum, table_col};
    use insta::assert_snapshot;

    #[test]
    fn test_simple_select() {
        let query = Query::new()
            .select(vec![SelectExpr::from(col("campaign")), sum(col("spend")).alias("spend")])
            .from(TableRef::qualified(&["db".into(), "ads".into(), "stats".into()]).with_alias("s"))
            .group_by(vec![col("campaign")]);

        assert_snapshot!(query.to_sql(Dialect::Snowflake), @r#"
        SELECT
          "campaign",
          SUM("spend") AS "spend"
        FROM "db"."ads"."stats" AS "s"
        GROUP BY "campaign"
        "#);
    }

    #[test]
    fn test_join_and_filter() {
        let query = Query::new()
            .select(vec![table_col("a", "x")])
            .from(TableRef::new("left_table").with_alias("a"))
            .left_join(
                TableRef::new("right_table").with_alias("b"),
                table_col("a", "id").eq(table_col("b", "id")),
            )
            .filter(table_col("a", "x").gt(lit_int(1)))
            .filter(table_col("b", "y").is_not_null());

        let sql = query.to_sql(Dialect::BigQuery);
        assert!(sql.contains("LEFT JOIN `right_table` AS `b` ON `a`.`id` = `b`.`id`"), "{sql}");
        assert!(sql.contains("WHERE `a`.`x` > 1 AND `b`.`y` IS NOT NULL"), "{sql}");
    }

    #[test]
    fn test_order_by_nulls_last_per_dialect() {
        let query = Query::new()
            .select(vec![col("spend")])
            .from(TableRef::new("t"))
            .order_by(vec![OrderByExpr::desc(col("spend")).nulls_last()])
            .limit(10)
            .offset(5);

        let snowflake = query.to_sql(Dialect::Snowflake);
        assert!(snowflake.contains("ORDER BY \"spend\" DESC NULLS LAST"), "{snowflake}");
        assert!(snowflake.ends_with("LIMIT 10 OFFSET 5"), "{snowflake}");

        let mysql = query.to_sql(Dialect::MySql);
        assert!(mysql.contains("ORDER BY `spend` DESC\n"), "{mysql}");
    }

    #[test]
    fn test_ctes_are_hoisted_and_deduplicated() {
        let mapping = Query::new().select(vec![lit_str("a").alias("original")]);
        let inner = Query::new()
            .with_cte(Cte::new("__om", mapping.clone()))
            .select(vec![col("original")])
            .from(TableRef::new("__om"));
        let outer = Query::new()
            .with_cte(Cte::new("__om", mapping))
            .select(vec![col("original")])
            .from(TableRef::subquery(inner, "q0"));

        let sql = outer.to_sql(Dialect::Snowflake);
        assert!(sql.starts_with("WITH \"__om\" AS ("), "{sql}");
        assert_eq!(sql.matches("WITH").count(), 1, "{sql}");
        assert_eq!(sql.matches("\"__om\" AS (").count(), 1, "{sql}");
    }

    #[test]
    fn test_union_all() {
        let a = Query::new().select(vec![lit_int(1).alias("x")]);
        let b = Query::new().select(vec![lit_int(2).alias("x")]);
        let union = Query::union_all(vec![a, b]);
        assert_eq!(union.output_names(), vec!["x".to_string()]);
        assert_snapshot!(union.to_sql(Dialect::Postgres), @r#"
        (SELECT
          1 AS "x")
        UNION ALL
        (SELECT
          2 AS "x")
        "#);
    }

    #[test]
    fn test_sort_select_orders_by_output_name() {
        let items = sort_select(vec![
            col("b").into(),
            lit_int(1).alias("a"),
            table_col("q", "c").into(),
        ]);
        let names: Vec<_> = items.iter().filter_map(|s| s.output_name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
