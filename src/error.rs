//! Error types for the husky compiler.
//!
//! Every failure the compiler can produce is a variant of [`HuskyError`]. All of them are
//! local, synchronous and carry enough context to reproduce the failing request.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::config::SettingsError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HuskyError>;

#[derive(Debug, Error)]
pub enum HuskyError {
    /// Malformed or semantically invalid TEL expression.
    #[error("{}", format_expression_error(.message, .position, .line, .text))]
    InvalidExpression {
        message: String,
        /// 1-based character position of the offending token, 0 when unknown.
        position: usize,
        line: usize,
        text: String,
    },

    /// Plain TEL error without a source location (e.g. depth limit).
    #[error("{0}")]
    Tel(String),

    #[error("Cyclic reference detected on taxon \"{slug}\"")]
    CyclicReference { slug: String },

    #[error("Taxons not found: {}", join_slugs(.slugs))]
    TaxonsNotFound { slugs: BTreeSet<String> },

    #[error("Unexpected taxons found: {}", join_slugs(.slugs))]
    UnexpectedTaxonsFound { slugs: BTreeSet<String> },

    #[error("Invalid taxon \"{slug}\": {reason}")]
    InvalidTaxon { slug: String, reason: String },

    #[error("Impossible taxon combination in data source \"{data_source}\": {}", join_slugs(.slugs))]
    ImpossibleTaxonCombination {
        slugs: BTreeSet<String>,
        data_source: String,
    },

    #[error("Join from model \"{from}\" to model \"{to}\" has no join taxons")]
    MissingJoinTaxons { from: String, to: String },

    #[error("Model \"{name}\" is defined more than once in data source \"{data_source}\"")]
    DuplicateModel { name: String, data_source: String },

    #[error("Cannot build a model graph over multiple data sources: {}", join_slugs(.data_sources))]
    MultipleDataSources { data_sources: BTreeSet<String> },

    #[error("No model found for data sources: {}", join_slugs(.data_sources))]
    ModelNotFound { data_sources: BTreeSet<String> },

    #[error("Invalid comparison request: {0}")]
    InvalidComparisonRequest(String),

    #[error("Too many override mappings requested ({count}), maximum is {max}")]
    TooManyOverrideMappings { count: usize, max: usize },

    #[error("Invalid override mapping \"{slug}\": {reason}")]
    InvalidOverrideMapping { slug: String, reason: String },

    #[error("Override mappings not found: {}", join_slugs(.slugs))]
    OverrideMappingNotFound { slugs: BTreeSet<String> },

    #[error("You are trying to use unsupported dialect - \"{0}\"")]
    UnsupportedDialect(String),

    #[error("Request spans more than one physical data source: {}", join_slugs(.data_sources))]
    TooManyPhysicalDataSources { data_sources: BTreeSet<String> },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] SettingsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A broken internal invariant; always a bug in the compiler.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HuskyError {
    pub fn invalid_expression(
        message: impl Into<String>,
        position: usize,
        line: usize,
        text: impl Into<String>,
    ) -> Self {
        HuskyError::InvalidExpression {
            message: message.into(),
            position,
            line,
            text: text.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        HuskyError::InvalidRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HuskyError::Internal(message.into())
    }
}

fn format_expression_error(message: &str, position: &usize, line: &usize, text: &str) -> String {
    if *position == 0 && *line == 0 {
        return message.to_string();
    }
    format!("{message}. Occurred at position {position}, line {line} in expression \"{text}\"")
}

fn join_slugs(slugs: &BTreeSet<String>) -> String {
    slugs.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_expression_display() {
        let err = HuskyError::invalid_expression("Unexpected symbol \")\"", 7, 1, "spend + )");
        assert_eq!(
            err.to_string(),
            "Unexpected symbol \")\". Occurred at position 7, line 1 in expression \"spend + )\""
        );
    }

    #[test]
    fn test_slug_sets_are_sorted() {
        let err = HuskyError::TaxonsNotFound {
            slugs: ["spend", "clicks"].iter().map(|s| s.to_string()).collect(),
        };
        assert_eq!(err.to_string(), "Taxons not found: clicks, spend");
    }

    #[test]
    fn test_unsupported_dialect_message() {
        let err = HuskyError::UnsupportedDialect("oracle".into());
        assert_eq!(
            err.to_string(),
            "You are trying to use unsupported dialect - \"oracle\""
        );
    }
}
