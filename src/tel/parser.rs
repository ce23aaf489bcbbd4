//! Parser for TEL using chumsky.
//!
//! Turns the token stream from the [lexer](super::lexer) into a [`Syntax`] tree. The tree
//! only knows about surface syntax; the [dialect](super::dialect) visitor resolves taxons
//! and functions when it turns it into a [`TelExpr`](super::expr::TelExpr).
//!
//! Operator precedence, tightest first: `NOT`, `* /`, `+ -`, comparisons and logical
//! operators and postfix `IS [NOT] NULL` (one left-associative level).

use std::ops::Range;

use chumsky::input::ValueInput;
use chumsky::prelude::*;

use super::lexer::{lexer, Token};
use crate::error::{HuskyError, Result};
use crate::identifier::NAMESPACE_DELIMITER;
use crate::sql::BinaryOperator;

/// Binary operators of TEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl BinaryOp {
    pub fn is_numeric(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div)
    }

    /// Whether both operands must be valid for the operation to be valid.
    pub fn is_strict(self) -> bool {
        matches!(self, BinaryOp::Mul | BinaryOp::Div)
    }

    /// Name used in validation messages.
    pub fn description(self) -> &'static str {
        match self {
            BinaryOp::Add => "addition",
            BinaryOp::Sub => "subtraction",
            BinaryOp::Mul => "multiplication",
            BinaryOp::Div => "division",
            _ => "logical",
        }
    }

    pub fn sql_operator(self) -> BinaryOperator {
        match self {
            BinaryOp::Add => BinaryOperator::Plus,
            BinaryOp::Sub => BinaryOperator::Minus,
            BinaryOp::Mul => BinaryOperator::Mul,
            BinaryOp::Div => BinaryOperator::Div,
            BinaryOp::And => BinaryOperator::And,
            BinaryOp::Or => BinaryOperator::Or,
            BinaryOp::Eq => BinaryOperator::Eq,
            BinaryOp::Ne => BinaryOperator::Ne,
            BinaryOp::Gt => BinaryOperator::Gt,
            BinaryOp::Gte => BinaryOperator::Gte,
            BinaryOp::Lt => BinaryOperator::Lt,
            BinaryOp::Lte => BinaryOperator::Lte,
        }
    }
}

/// Reference to a taxon, e.g. `fb|spend?`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonRef<'src> {
    pub namespace: Option<&'src str>,
    /// Name without namespace; tag parts are joined with `:`.
    pub name: String,
    pub optional: bool,
}

impl TaxonRef<'_> {
    pub fn slug(&self) -> String {
        match self.namespace {
            Some(ns) => format!("{ns}{NAMESPACE_DELIMITER}{}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyntaxKind<'src> {
    Integer(i64),
    Float(f64),
    Bool(bool),
    /// Single-quoted string constant.
    String(&'src str),
    /// Double-quoted string, meaning depends on the dialect.
    DoubleQuoted(&'src str),
    Taxon(TaxonRef<'src>),
    Call {
        name: &'src str,
        args: Vec<Syntax<'src>>,
    },
    Paren(Box<Syntax<'src>>),
    Binary {
        op: BinaryOp,
        left: Box<Syntax<'src>>,
        right: Box<Syntax<'src>>,
    },
    Not(Box<Syntax<'src>>),
    IsNull {
        operand: Box<Syntax<'src>>,
        negated: bool,
    },
}

/// A node of the parsed expression with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Syntax<'src> {
    pub kind: SyntaxKind<'src>,
    pub span: SimpleSpan,
}

impl<'src> Syntax<'src> {
    fn new(kind: SyntaxKind<'src>, span: SimpleSpan) -> Self {
        Self { kind, span }
    }

    fn spanning(kind: SyntaxKind<'src>, start: usize, end: usize) -> Self {
        Self::new(kind, (start..end).into())
    }
}

/// A syntax error with the byte range of the offending input.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    /// Offending token text, `<EOF>` at the end of input.
    pub found: String,
    pub span: Range<usize>,
}

impl SyntaxError {
    pub fn message(&self) -> String {
        format!("Unexpected symbol \"{}\"", self.found)
    }

    /// Convert into an [`HuskyError::InvalidExpression`] pointing at the error column.
    pub fn into_error(self, text: &str) -> HuskyError {
        let (line, column) = line_and_column(text, self.span.start);
        HuskyError::invalid_expression(self.message(), column + 1, line, text.trim())
    }
}

/// Number of characters before a byte offset.
pub fn char_offset(text: &str, offset: usize) -> usize {
    text.get(..offset).unwrap_or(text).chars().count()
}

/// 1-based line and 0-based column of a byte offset.
pub fn line_and_column(text: &str, offset: usize) -> (usize, usize) {
    let before = text.get(..offset).unwrap_or(text);
    let line = before.matches('\n').count() + 1;
    let column = before
        .rsplit_once('\n')
        .map(|(_, last)| last)
        .unwrap_or(before)
        .chars()
        .count();
    (line, column)
}

fn number_kind<'src>(digits: &str, is_int: bool, negative: bool) -> SyntaxKind<'src> {
    let sign = if negative { "-" } else { "" };
    let text = format!("{sign}{digits}");
    if is_int {
        if let Ok(n) = text.parse::<i64>() {
            return SyntaxKind::Integer(n);
        }
    }
    SyntaxKind::Float(text.parse::<f64>().unwrap_or_default())
}

/// What may follow an operand at the lowest precedence level.
enum Suffix<'src> {
    Operator(BinaryOp, Syntax<'src>),
    NullTest { negated: bool, end: usize },
}

/// Create the TEL expression parser.
pub fn parser<'tokens, 'src: 'tokens, I>(
) -> impl Parser<'tokens, I, Syntax<'src>, extra::Err<Rich<'tokens, Token<'src>, SimpleSpan>>>
where
    I: ValueInput<'tokens, Token = Token<'src>, Span = SimpleSpan>,
{
    let word = select! {
        Token::Word(s) => s,
    }
    .labelled("word");

    let number = select! {
        Token::Int(s) => (s, true),
        Token::Real(s) => (s, false),
    }
    .labelled("number");

    let expr = recursive(|expr| {
        // ======================================================================
        // Atoms
        // ======================================================================

        let call = word
            .clone()
            .then(
                expr.clone()
                    .separated_by(just(Token::Comma))
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map_with(|(name, args), e| Syntax::new(SyntaxKind::Call { name, args }, e.span()));

        let taxon = word
            .clone()
            .then_ignore(just(Token::Pipe))
            .or_not()
            .then(
                word.clone()
                    .separated_by(just(Token::Colon))
                    .at_least(1)
                    .collect::<Vec<_>>(),
            )
            .then(just(Token::Question).or_not())
            .map_with(|((namespace, parts), optional), e| {
                let taxon = TaxonRef {
                    namespace,
                    name: parts.join(":"),
                    optional: optional.is_some(),
                };
                Syntax::new(SyntaxKind::Taxon(taxon), e.span())
            });

        let boolean = select! {
            Token::True => SyntaxKind::Bool(true),
            Token::False => SyntaxKind::Bool(false),
        }
        .map_with(|kind, e| Syntax::new(kind, e.span()));

        let parens = expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .map_with(|inner, e| Syntax::new(SyntaxKind::Paren(Box::new(inner)), e.span()));

        let strings = select! {
            Token::SingleQuoted(s) => SyntaxKind::String(s),
            Token::DoubleQuoted(s) => SyntaxKind::DoubleQuoted(s),
        }
        .map_with(|kind, e| Syntax::new(kind, e.span()));

        let numeric = just(Token::Minus)
            .or_not()
            .then(number.clone())
            .map_with(|(minus, (digits, is_int)), e| {
                Syntax::new(number_kind(digits, is_int, minus.is_some()), e.span())
            });

        let atom = choice((call, taxon, boolean, parens, strings, numeric)).labelled("expression");

        // ======================================================================
        // Operators
        // ======================================================================

        let unary = just(Token::Not)
            .map_with(|_, e| e.span())
            .repeated()
            .foldr(atom, |not: SimpleSpan, operand: Syntax<'src>| {
                let end = operand.span.end;
                Syntax::spanning(SyntaxKind::Not(Box::new(operand)), not.start, end)
            });

        let binary = |left: Syntax<'src>, (op, right): (BinaryOp, Syntax<'src>)| {
            let (start, end) = (left.span.start, right.span.end);
            Syntax::spanning(
                SyntaxKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                start,
                end,
            )
        };

        let product = unary.clone().foldl(
            choice((
                just(Token::Star).to(BinaryOp::Mul),
                just(Token::Slash).to(BinaryOp::Div),
            ))
            .then(unary)
            .repeated(),
            binary,
        );

        let sum = product.clone().foldl(
            choice((
                just(Token::Plus).to(BinaryOp::Add),
                just(Token::Minus).to(BinaryOp::Sub),
            ))
            .then(product)
            .repeated(),
            binary,
        );

        let null_test = just(Token::Is)
            .ignore_then(just(Token::Not).or_not())
            .then_ignore(just(Token::Null))
            .map_with(|not, e| Suffix::NullTest {
                negated: not.is_some(),
                end: { let span: SimpleSpan = e.span(); span.end },
            });

        let logical_op = select! {
            Token::And => BinaryOp::And,
            Token::Or => BinaryOp::Or,
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Gt => BinaryOp::Gt,
            Token::Gte => BinaryOp::Gte,
            Token::Lt => BinaryOp::Lt,
            Token::Lte => BinaryOp::Lte,
        };

        // A null test applies to everything on its left; the chain may continue after it.
        sum.clone().foldl(
            choice((
                logical_op
                    .then(sum)
                    .map(|(op, right)| Suffix::Operator(op, right)),
                null_test,
            ))
            .repeated(),
            move |left: Syntax<'src>, suffix: Suffix<'src>| match suffix {
                Suffix::Operator(op, right) => binary(left, (op, right)),
                Suffix::NullTest { negated, end } => {
                    let start = left.span.start;
                    Syntax::spanning(
                        SyntaxKind::IsNull {
                            operand: Box::new(left),
                            negated,
                        },
                        start,
                        end,
                    )
                }
            },
        )
    });

    expr.then_ignore(end())
}

fn found_at(text: &str, span: Range<usize>, single_char: bool) -> String {
    if span.start >= text.len() {
        return "<EOF>".to_string();
    }
    if single_char {
        return text[span.start..]
            .chars()
            .next()
            .map(String::from)
            .unwrap_or_else(|| "<EOF>".to_string());
    }
    text.get(span.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or("<EOF>")
        .to_string()
}

/// Parse a TEL expression, returning every syntax error on failure.
pub fn parse_syntax(text: &str) -> std::result::Result<Syntax<'_>, Vec<SyntaxError>> {
    use chumsky::input::Input;

    let (tokens, lex_errs) = lexer().parse(text).into_output_errors();
    if !lex_errs.is_empty() {
        return Err(lex_errs
            .into_iter()
            .map(|e: Rich<'_, char>| {
                let span = e.span().start..e.span().end;
                SyntaxError {
                    found: found_at(text, span.clone(), true),
                    span,
                }
            })
            .collect());
    }
    let tokens = tokens.unwrap_or_default();

    let len = text.len();
    let eoi: SimpleSpan = (len..len).into();
    let token_stream = tokens
        .as_slice()
        .map(eoi, |(tok, span): &(Token<'_>, SimpleSpan)| (tok, span));

    let (syntax, parse_errs) = parser().parse(token_stream).into_output_errors();
    match syntax {
        Some(syntax) if parse_errs.is_empty() => Ok(syntax),
        _ => Err(parse_errs
            .into_iter()
            .map(|e: Rich<'_, Token<'_>, SimpleSpan>| {
                let span = e.span().start..e.span().end;
                SyntaxError {
                    found: found_at(text, span.clone(), false),
                    span,
                }
            })
            .collect()),
    }
}

/// Parse a TEL expression, failing on the first syntax error.
pub fn parse(text: &str) -> Result<Syntax<'_>> {
    parse_syntax(text).map_err(|errors| match errors.into_iter().next() {
        Some(err) => err.into_error(text),
        None => HuskyError::invalid_expression("Unexpected symbol \"<EOF>\"", 1, 1, text.trim()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(text: &str) -> SyntaxKind<'_> {
        parse(text).unwrap().kind
    }

    fn binary_op(text: &str) -> BinaryOp {
        match kind(text) {
            SyntaxKind::Binary { op, .. } => op,
            other => panic!("not a binary expression: {other:?}"),
        }
    }

    #[test]
    fn test_literals() {
        assert_eq!(kind("42"), SyntaxKind::Integer(42));
        assert_eq!(kind("-42"), SyntaxKind::Integer(-42));
        assert_eq!(kind("1.5"), SyntaxKind::Float(1.5));
        assert_eq!(kind("true"), SyntaxKind::Bool(true));
        assert_eq!(kind("'abc'"), SyntaxKind::String("abc"));
        assert_eq!(kind("\"col\""), SyntaxKind::DoubleQuoted("col"));
    }

    #[test]
    fn test_taxon_reference() {
        let SyntaxKind::Taxon(taxon) = kind("fb|spend?") else {
            panic!("expected taxon");
        };
        assert_eq!(taxon.namespace, Some("fb"));
        assert_eq!(taxon.slug(), "fb|spend");
        assert!(taxon.optional);

        let SyntaxKind::Taxon(taxon) = kind("spend:tag") else {
            panic!("expected taxon");
        };
        assert_eq!(taxon.slug(), "spend:tag");
        assert!(!taxon.optional);
    }

    #[test]
    fn test_precedence() {
        // (a * b) + c
        let SyntaxKind::Binary { op, left, .. } = kind("a * b + c") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(left.kind, SyntaxKind::Binary { op: BinaryOp::Mul, .. }));

        assert_eq!(binary_op("a + b > c"), BinaryOp::Gt);
        assert_eq!(binary_op("a = 1 AND b = 2"), BinaryOp::Eq);
        assert!(matches!(kind("a > 1 IS NOT NULL"), SyntaxKind::IsNull { negated: true, .. }));
    }

    #[test]
    fn test_null_test_continues_logical_chain() {
        let SyntaxKind::Binary { op, left, right } = kind("a IS NULL OR b") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
        assert!(matches!(left.kind, SyntaxKind::IsNull { negated: false, .. }));
        assert!(matches!(right.kind, SyntaxKind::Taxon(_)));

        let syntax = parse("fb|campaign IS NOT NULL AND fb|spend").unwrap();
        assert_eq!((syntax.span.start, syntax.span.end), (0, 36));
        let SyntaxKind::Binary { op: BinaryOp::And, left, .. } = syntax.kind else {
            panic!("expected AND");
        };
        assert_eq!((left.span.start, left.span.end), (0, 23));
    }

    #[test]
    fn test_function_call() {
        let SyntaxKind::Call { name, args } = kind("iff(a > 1, 'x', NOT b)") else {
            panic!("expected call");
        };
        assert_eq!(name, "iff");
        assert_eq!(args.len(), 3);
        assert!(matches!(args[2].kind, SyntaxKind::Not(_)));
        assert!(matches!(kind("now()"), SyntaxKind::Call { ref args, .. } if args.is_empty()));
    }

    #[test]
    fn test_spans_cover_whole_node() {
        let syntax = parse("  spend / clicks").unwrap();
        assert_eq!((syntax.span.start, syntax.span.end), (2, 16));
    }

    #[test]
    fn test_syntax_error_position() {
        let err = parse("spend + )").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unexpected symbol \")\". Occurred at position 9, line 1 in expression \"spend + )\""
        );
    }

    #[test]
    fn test_syntax_error_at_end() {
        let err = parse("spend +").unwrap_err();
        assert!(err.to_string().starts_with("Unexpected symbol \"<EOF>\""), "{err}");
    }

    #[test]
    fn test_line_and_column() {
        assert_eq!(line_and_column("a\nbc", 3), (2, 1));
        assert_eq!(char_offset("äb", 2), 1);
    }
}
