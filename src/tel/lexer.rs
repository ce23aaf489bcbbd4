//! Lexer for TEL expressions using chumsky.
//!
//! Words are lexed greedily over `[.0-9A-Za-z_]` and classified afterwards, so
//! `1`, `1.5`, `and` and `fb_spend` all come out of the same rule.

use std::fmt;

use chumsky::prelude::*;

/// Token types for TEL.
#[derive(Debug, Clone, PartialEq)]
pub enum Token<'src> {
    // ==========================================================================
    // Keywords (case-insensitive)
    // ==========================================================================
    True,
    False,
    Not,
    Is,
    Null,
    And,
    Or,

    // ==========================================================================
    // Literals
    // ==========================================================================
    /// Integer literal
    Int(&'src str),
    /// Decimal literal
    Real(&'src str),
    /// Function or taxon name part
    Word(&'src str),
    /// `"..."`, content without quotes
    DoubleQuoted(&'src str),
    /// `'...'`, content without quotes
    SingleQuoted(&'src str),

    // ==========================================================================
    // Symbols
    // ==========================================================================
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `|`
    Pipe,
    /// `:`
    Colon,
    /// `,`
    Comma,
    /// `?`
    Question,
    /// `=` or `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Gte,
    /// `<=`
    Lte,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::True => write!(f, "TRUE"),
            Token::False => write!(f, "FALSE"),
            Token::Not => write!(f, "NOT"),
            Token::Is => write!(f, "IS"),
            Token::Null => write!(f, "NULL"),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),

            Token::Int(s) | Token::Real(s) | Token::Word(s) => write!(f, "{s}"),
            Token::DoubleQuoted(s) => write!(f, "\"{s}\""),
            Token::SingleQuoted(s) => write!(f, "'{s}'"),

            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Pipe => write!(f, "|"),
            Token::Colon => write!(f, ":"),
            Token::Comma => write!(f, ","),
            Token::Question => write!(f, "?"),
            Token::Eq => write!(f, "="),
            Token::Ne => write!(f, "!="),
            Token::Gt => write!(f, ">"),
            Token::Lt => write!(f, "<"),
            Token::Gte => write!(f, ">="),
            Token::Lte => write!(f, "<="),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
        }
    }
}

/// Classify a word run as a number, a keyword or a plain word.
fn classify_word(s: &str) -> Token<'_> {
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return Token::Int(s);
    }
    if let Some((int, frac)) = s.split_once('.') {
        if int.bytes().all(|b| b.is_ascii_digit())
            && !frac.is_empty()
            && frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Token::Real(s);
        }
    }
    match s.to_ascii_uppercase().as_str() {
        "TRUE" => Token::True,
        "FALSE" => Token::False,
        "NOT" => Token::Not,
        "IS" => Token::Is,
        "NULL" => Token::Null,
        "AND" => Token::And,
        "OR" => Token::Or,
        _ => Token::Word(s),
    }
}

/// Create a lexer for TEL.
///
/// Returns a parser that tokenizes the input string into a sequence of
/// tokens with span information, skipping whitespace.
pub fn lexer<'src>(
) -> impl Parser<'src, &'src str, Vec<(Token<'src>, SimpleSpan)>, extra::Err<Rich<'src, char>>> {
    let word = any()
        .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .repeated()
        .at_least(1)
        .to_slice()
        .map(classify_word);

    let double_quoted = just('"')
        .ignore_then(none_of('"').repeated().to_slice())
        .then_ignore(just('"'))
        .map(Token::DoubleQuoted);

    let single_quoted = just('\'')
        .ignore_then(none_of('\'').repeated().to_slice())
        .then_ignore(just('\''))
        .map(Token::SingleQuoted);

    // Multi-char symbols first
    let symbol = choice((
        just("||").to(Token::Or),
        just("&&").to(Token::And),
        just("==").to(Token::Eq),
        just("!=").to(Token::Ne),
        just(">=").to(Token::Gte),
        just("<=").to(Token::Lte),
        just('=').to(Token::Eq),
        just('>').to(Token::Gt),
        just('<').to(Token::Lt),
        just('(').to(Token::LParen),
        just(')').to(Token::RParen),
        just('|').to(Token::Pipe),
        just(':').to(Token::Colon),
        just(',').to(Token::Comma),
        just('?').to(Token::Question),
        just('+').to(Token::Plus),
        just('-').to(Token::Minus),
        just('*').to(Token::Star),
        just('/').to(Token::Slash),
    ));

    let token = choice((word, double_quoted, single_quoted, symbol))
        .map_with(|tok, e| (tok, e.span()));

    token.padded().repeated().collect().padded().then_ignore(end())
}
