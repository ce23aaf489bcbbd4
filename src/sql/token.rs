//! Token layer of the SQL builder.
//!
//! Expressions and queries flatten into [`Token`]s; only identifiers, literals and
//! function names depend on the dialect when a stream is written out.

use super::dialect::{Dialect, SqlDialect};

/// One lexical element of generated SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // === Keywords ===
    Select,
    From,
    Where,
    And,
    Or,
    Not,
    As,
    On,
    Join,
    Inner,
    Left,
    Right,
    GroupBy,
    OrderBy,
    Asc,
    Desc,
    NullsFirst,
    NullsLast,
    Limit,
    Offset,
    Case,
    When,
    Then,
    Else,
    End,
    In,
    Like,
    ILike,
    Escape,
    IsNull,
    IsNotNull,
    Distinct,
    All,
    Union,
    With,
    True,
    False,
    Cast,
    Extract,

    // === Window Function Keywords ===
    Over,
    PartitionBy,
    Rows,
    Between,
    Unbounded,
    Preceding,
    CurrentRow,

    // === Punctuation ===
    Comma,
    Dot,
    Star,
    LParen,
    RParen,

    // === Operators ===
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    Plus,
    Minus,
    Mul,
    Div,

    // === Whitespace / Formatting ===
    Space,
    Newline,
    Indent(usize),

    // === Dynamic Content ===
    /// Simple identifier (table, column, alias)
    Ident(String),
    /// Qualified identifier: table.column or just column
    QualifiedIdent {
        qualifier: Option<String>,
        name: String,
    },
    /// Integer literal
    LitInt(i64),
    /// Float literal
    LitFloat(f64),
    /// String literal
    LitString(String),
    /// Boolean literal
    LitBool(bool),
    /// NULL literal
    LitNull,

    // === Function Names ===
    /// Function name, remapped per dialect
    FunctionName(String),

    // === Escape Hatch ===
    /// Raw SQL passed directly to output without escaping.
    ///
    /// **Never pass user input to this variant.** Only trusted fragments (type names,
    /// time-unit keywords validated by the caller) end up here.
    Raw(String),
}

impl Token {
    /// Fixed text of keywords, punctuation, operators and whitespace.
    fn keyword(&self) -> Option<&'static str> {
        let text = match self {
            Token::Select => "SELECT",
            Token::From => "FROM",
            Token::Where => "WHERE",
            Token::And => "AND",
            Token::Or => "OR",
            Token::Not => "NOT",
            Token::As => "AS",
            Token::On => "ON",
            Token::Join => "JOIN",
            Token::Inner => "INNER",
            Token::Left => "LEFT",
            Token::Right => "RIGHT",
            Token::GroupBy => "GROUP BY",
            Token::OrderBy => "ORDER BY",
            Token::Asc => "ASC",
            Token::Desc => "DESC",
            Token::NullsFirst => "NULLS FIRST",
            Token::NullsLast => "NULLS LAST",
            Token::Limit => "LIMIT",
            Token::Offset => "OFFSET",
            Token::Case => "CASE",
            Token::When => "WHEN",
            Token::Then => "THEN",
            Token::Else => "ELSE",
            Token::End => "END",
            Token::In => "IN",
            Token::Like => "LIKE",
            Token::ILike => "ILIKE",
            Token::Escape => "ESCAPE",
            Token::IsNull => "IS NULL",
            Token::IsNotNull => "IS NOT NULL",
            Token::Distinct => "DISTINCT",
            Token::All => "ALL",
            Token::Union => "UNION",
            Token::With => "WITH",
            Token::True => "TRUE",
            Token::False => "FALSE",
            Token::Cast => "CAST",
            Token::Extract => "EXTRACT",
            Token::Over => "OVER",
            Token::PartitionBy => "PARTITION BY",
            Token::Rows => "ROWS",
            Token::Between => "BETWEEN",
            Token::Unbounded => "UNBOUNDED",
            Token::Preceding => "PRECEDING",
            Token::CurrentRow => "CURRENT ROW",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Star | Token::Mul => "*",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Eq => "=",
            Token::Ne => "<>",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Lte => "<=",
            Token::Gte => ">=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Div => "/",
            Token::Space => " ",
            Token::Newline => "\n",
            Token::LitNull => "NULL",
            _ => return None,
        };
        Some(text)
    }

    /// Text of this token in `dialect`.
    pub fn serialize(&self, dialect: Dialect) -> String {
        match self {
            Token::Indent(depth) => "  ".repeat(*depth),
            Token::Ident(name) => dialect.quote_identifier(name),
            Token::QualifiedIdent {
                qualifier: Some(qualifier),
                name,
            } => format!(
                "{}.{}",
                dialect.quote_identifier(qualifier),
                dialect.quote_identifier(name)
            ),
            Token::QualifiedIdent {
                qualifier: None,
                name,
            } => dialect.quote_identifier(name),
            Token::LitInt(n) => n.to_string(),
            // TEL constant folding can divide by zero; SQL has no NaN/Infinity literal
            Token::LitFloat(f) if !f.is_finite() => "NULL".into(),
            Token::LitFloat(f) => ryu::Buffer::new().format(*f).to_string(),
            Token::LitString(s) => dialect.quote_string(s),
            Token::LitBool(b) => dialect.format_bool(*b).into(),
            Token::FunctionName(name) => dialect
                .remap_function(name)
                .unwrap_or(name.as_str())
                .to_uppercase(),
            Token::Raw(sql) => sql.clone(),
            fixed => fixed.keyword().unwrap_or_default().to_string(),
        }
    }
}

/// A stream of tokens that can be serialized to SQL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    /// Create an empty token stream.
    pub fn new() -> Self {
        Self { tokens: vec![] }
    }

    /// Push a single token.
    pub fn push(&mut self, token: Token) -> &mut Self {
        self.tokens.push(token);
        self
    }

    /// Extend with multiple tokens.
    pub fn extend(&mut self, tokens: impl IntoIterator<Item = Token>) -> &mut Self {
        self.tokens.extend(tokens);
        self
    }

    /// Append another token stream.
    pub fn append(&mut self, other: &TokenStream) -> &mut Self {
        self.tokens.extend(other.tokens.iter().cloned());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Serialize all tokens to a SQL string.
    pub fn serialize(&self, dialect: Dialect) -> String {
        self.tokens.iter().map(|t| t.serialize(dialect)).collect()
    }

    // Convenience methods for common tokens
    pub fn space(&mut self) -> &mut Self {
        self.push(Token::Space)
    }
    pub fn newline(&mut self) -> &mut Self {
        self.push(Token::Newline)
    }
    pub fn indent(&mut self, n: usize) -> &mut Self {
        self.push(Token::Indent(n))
    }
    pub fn comma(&mut self) -> &mut Self {
        self.push(Token::Comma)
    }
    pub fn lparen(&mut self) -> &mut Self {
        self.push(Token::LParen)
    }
    pub fn rparen(&mut self) -> &mut Self {
        self.push(Token::RParen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_serialize() {
        assert_eq!(Token::Select.serialize(Dialect::Snowflake), "SELECT");
        assert_eq!(Token::GroupBy.serialize(Dialect::MySql), "GROUP BY");
    }

    #[test]
    fn test_ident_serialize() {
        let tok = Token::Ident("fb|spend".into());
        assert_eq!(tok.serialize(Dialect::Snowflake), "\"fb|spend\"");
        assert_eq!(tok.serialize(Dialect::BigQuery), "`fb|spend`");
    }

    #[test]
    fn test_qualified_ident() {
        let tok = Token::QualifiedIdent {
            qualifier: Some("q0".into()),
            name: "spend".into(),
        };
        assert_eq!(tok.serialize(Dialect::Postgres), "\"q0\".\"spend\"");
    }

    #[test]
    fn test_token_stream() {
        let mut ts = TokenStream::new();
        ts.push(Token::Select)
            .space()
            .push(Token::Ident("spend".into()))
            .space()
            .push(Token::From)
            .space()
            .push(Token::Ident("ads".into()));

        assert_eq!(
            ts.serialize(Dialect::Snowflake),
            "SELECT \"spend\" FROM \"ads\""
        );
    }

    #[test]
    fn test_function_name_remap() {
        let tok = Token::FunctionName("now".into());
        assert_eq!(tok.serialize(Dialect::Snowflake), "CURRENT_TIMESTAMP");
        assert_eq!(tok.serialize(Dialect::Postgres), "NOW");
    }

    #[test]
    fn test_float_serialize() {
        assert_eq!(Token::LitFloat(3.25).serialize(Dialect::Snowflake), "3.25");
        assert_eq!(Token::LitFloat(1.0).serialize(Dialect::Snowflake), "1.0");
        assert_eq!(Token::LitFloat(-42.5).serialize(Dialect::Snowflake), "-42.5");
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert_eq!(Token::LitFloat(f64::NAN).serialize(Dialect::Snowflake), "NULL");
        assert_eq!(
            Token::LitFloat(f64::INFINITY).serialize(Dialect::Snowflake),
            "NULL"
        );
    }
}
