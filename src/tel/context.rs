//! Evaluation and validation contexts shared by every TEL node.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{HuskyError, Result};
use crate::sql::Expr;
use crate::taxonomy::{AggregationDefinition, Taxon, TaxonMap, TaxonType};

/// Maximum nesting of taxon calculations referencing other calculated taxons.
pub const MAX_TAXON_REFERENCE_DEPTH: usize = 10;

/// Which flavour of TEL is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelDialectType {
    /// Taxon calculations: identifiers are taxons, double quotes are string constants.
    Taxon,
    /// Model attribute transformations: double quotes are physical columns.
    Model,
}

impl fmt::Display for TelDialectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelDialectType::Taxon => f.write_str("TAXON"),
            TelDialectType::Model => f.write_str("MODEL"),
        }
    }
}

/// Resolves taxon references inside a model attribute transformation.
///
/// Implemented by models: a reference to another taxon of the same model expands to that
/// attribute's own SQL. `depth` lets the implementation stop runaway recursion.
pub trait ModelSqlAccessor {
    fn taxon_sql(&self, slug: &str, depth: usize) -> Result<Expr>;
}

/// Model dialect parameters.
#[derive(Clone, Copy)]
pub struct ModelDialect<'a> {
    /// Table alias columns are qualified with.
    pub unique_object_name: &'a str,
    pub virtual_data_source: &'a str,
    pub accessor: &'a dyn ModelSqlAccessor,
    /// Nesting of attribute references already being expanded.
    pub depth: usize,
}

impl fmt::Debug for ModelDialect<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDialect")
            .field("unique_object_name", &self.unique_object_name)
            .field("virtual_data_source", &self.virtual_data_source)
            .field("depth", &self.depth)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TelDialect<'a> {
    Taxon,
    Model(ModelDialect<'a>),
}

impl TelDialect<'_> {
    pub fn dialect_type(&self) -> TelDialectType {
        match self {
            TelDialect::Taxon => TelDialectType::Taxon,
            TelDialect::Model(_) => TelDialectType::Model,
        }
    }
}

/// Generates the temporary column labels of phase transitions (`__{prefix}{n}`).
#[derive(Debug, Default)]
pub struct LabelMaker {
    prefix: String,
    counter: Cell<usize>,
}

impl LabelMaker {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: Cell::new(0),
        }
    }

    pub fn next_label(&self) -> String {
        let n = self.counter.get() + 1;
        self.counter.set(n);
        format!("__{}{}", self.prefix, n)
    }
}

/// Everything a node needs to know about the request it is evaluated for.
#[derive(Debug)]
pub struct TelRootContext<'a> {
    pub dialect: TelDialect<'a>,
    pub taxon_map: &'a TaxonMap,
    /// `None` means every data source is allowed.
    pub allowed_data_sources: Option<BTreeSet<String>>,
    pub is_benchmark: bool,
    pub taxon_type: TaxonType,
    /// Slug of the taxon whose calculation is evaluated.
    pub taxon_slug: String,
    pub aggregation: Option<AggregationDefinition>,
    pub subrequest_only: bool,
    labels: LabelMaker,
}

impl<'a> TelRootContext<'a> {
    pub fn new(dialect: TelDialect<'a>, taxon_map: &'a TaxonMap) -> Self {
        Self {
            dialect,
            taxon_map,
            allowed_data_sources: None,
            is_benchmark: false,
            taxon_type: TaxonType::Metric,
            taxon_slug: String::new(),
            aggregation: None,
            subrequest_only: false,
            labels: LabelMaker::default(),
        }
    }

    pub fn with_taxon_slug(mut self, slug: &str) -> Self {
        self.taxon_slug = slug.to_string();
        self.labels = LabelMaker::new(slug);
        self
    }

    pub fn with_taxon_type(mut self, taxon_type: TaxonType) -> Self {
        self.taxon_type = taxon_type;
        self
    }

    pub fn with_data_sources<I, S>(mut self, data_sources: Option<I>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_data_sources =
            data_sources.map(|ds| ds.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_benchmark(mut self, is_benchmark: bool) -> Self {
        self.is_benchmark = is_benchmark;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Option<AggregationDefinition>) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_subrequest_only(mut self, subrequest_only: bool) -> Self {
        self.subrequest_only = subrequest_only;
        self
    }

    pub fn is_data_source_allowed(&self, data_source: &str) -> bool {
        self.allowed_data_sources
            .as_ref()
            .map_or(true, |allowed| allowed.contains(data_source))
    }

    pub fn taxon(&self, slug: &str) -> Option<&'a Taxon> {
        self.taxon_map.get(slug)
    }

    pub fn new_label(&self) -> String {
        self.labels.next_label()
    }

    pub fn dialect_type(&self) -> TelDialectType {
        self.dialect.dialect_type()
    }
}

/// Source location of a node: 1-based character position, line and the whole expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub position: usize,
    pub line: usize,
    pub text: Arc<str>,
}

impl Location {
    pub fn new(position: usize, line: usize, text: Arc<str>) -> Self {
        Self {
            position,
            line,
            text,
        }
    }
}

/// Accumulates semantic errors over one tree walk.
#[derive(Debug, Default)]
pub struct ValidationContext {
    errors: Vec<String>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(&mut self, error: impl fmt::Display, location: &Location) -> &mut Self {
        self.errors.push(format!(
            "{error}. Occurred at position {}, line {} in expression \"{}\"",
            location.position, location.line, location.text
        ));
        self
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// All collected errors as one `InvalidExpression`.
    pub fn to_error(&self) -> HuskyError {
        HuskyError::invalid_expression(self.errors.join("\n"), 0, 0, "")
    }

    pub fn raise_for_errors(&self) -> Result<()> {
        if self.has_errors() {
            return Err(self.to_error());
        }
        Ok(())
    }
}
