//! End-to-end compilation from a blending request to SQL.
//!
//! ```text
//! BlendingDataRequest → BlendingContext::build → Dataframe → output aliases → SQL
//! ```
//!
//! # Example
//!
//! ```ignore
//! use husky::compile::{compile, Catalog, CompileOptions};
//! use husky::sql::Dialect;
//!
//! let catalog = Catalog::from_json(&std::fs::read_to_string("fixtures.json")?)?;
//! let request = serde_json::from_str(&std::fs::read_to_string("request.json")?)?;
//! let options = CompileOptions::default().with_dialect(Dialect::BigQuery);
//! let output = compile(&catalog, &request, &options)?;
//! println!("{}", output.sql);
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::blending::{
    BlendingContext, BlendingDataRequest, DataRequest, Dataframe, TaxonDataOrder,
    DEFAULT_MAX_OVERRIDE_MAPPINGS,
};
use crate::config::CompilerSettings;
use crate::error::{HuskyError, Result};
use crate::filter::FilterClause;
use crate::model::{Model, ModelStore, ModelVisibility, Scope};
use crate::sql::{col, Dialect, ExprExt, Query, SqlDialect};
use crate::taxonomy::{OverrideMapping, OverrideMappingStore, Taxon, TaxonResolver, Taxonomy};

/// Alias of the compiled dataframe inside the final SELECT.
const RESULT_ALIAS: &str = "husky_result";

// ============================================================================
// Catalog
// ============================================================================

/// Everything a request is compiled against: taxons, models and override mappings.
#[derive(Debug)]
pub struct Catalog {
    pub taxonomy: Taxonomy,
    pub models: ModelStore,
    pub override_mappings: OverrideMappingStore,
}

/// JSON shape of a catalog file.
#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    taxons: Vec<Taxon>,
    #[serde(default)]
    models: Vec<Model>,
    #[serde(default)]
    override_mappings: Vec<OverrideMapping>,
}

impl Catalog {
    pub fn new(
        taxons: Vec<Taxon>,
        models: Vec<Model>,
        override_mappings: Vec<OverrideMapping>,
    ) -> Result<Self> {
        Ok(Self {
            taxonomy: Taxonomy::new(taxons),
            models: ModelStore::new(models)?,
            override_mappings: OverrideMappingStore::new(override_mappings)?,
        })
    }

    /// Parse a catalog from JSON with optional `taxons`, `models` and `override_mappings`
    /// arrays.
    pub fn from_json(source: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(source)?;
        Self::new(file.taxons, file.models, file.override_mappings)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json(&source)
    }

    /// Blending context reading from this catalog.
    pub fn context(&self, options: &CompileOptions) -> BlendingContext<'_> {
        BlendingContext::new(&self.taxonomy, &self.models, &self.override_mappings)
            .with_fallback_aggregations(options.use_fallback_aggregations)
            .with_max_override_mappings(options.max_override_mappings)
    }
}

// ============================================================================
// Options
// ============================================================================

/// Options for compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// SQL dialect to generate.
    pub dialect: Dialect,
    pub use_fallback_aggregations: bool,
    pub max_override_mappings: usize,
    /// Visibility of scopes built by the compiler (transformation requests).
    pub model_visibility: ModelVisibility,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            dialect: Dialect::Snowflake,
            use_fallback_aggregations: true,
            max_override_mappings: DEFAULT_MAX_OVERRIDE_MAPPINGS,
            model_visibility: ModelVisibility::Available,
        }
    }
}

impl CompileOptions {
    /// Set the SQL dialect.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }
}

impl From<&CompilerSettings> for CompileOptions {
    fn from(settings: &CompilerSettings) -> Self {
        Self {
            dialect: settings.dialect,
            use_fallback_aggregations: settings.use_fallback_aggregations,
            max_override_mappings: settings.max_override_mappings,
            model_visibility: settings.model_visibility,
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Result of compiling a request to SQL.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// The generated SQL string.
    pub sql: String,

    /// The SQL query AST (for further manipulation if needed).
    pub query: Query,

    /// The dialect used for generation.
    pub dialect: Dialect,

    /// Physical data source the query runs against, if any model was used.
    pub physical_data_source: Option<String>,

    /// Taxon slug to output column alias, in output order.
    pub columns: Vec<(String, String)>,
}

/// Request compiling a flat list of taxons, data sources inferred from the taxons.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformRequest {
    pub requested_fields: Vec<String>,
    #[serde(default)]
    pub filters: Option<FilterClause>,
    #[serde(default)]
    pub order_by: Vec<TaxonDataOrder>,
    #[serde(default)]
    pub limit: Option<u64>,
}

// ============================================================================
// Compilation Functions
// ============================================================================

/// Compile a blending request to SQL for `options.dialect`.
///
/// Fails with [`HuskyError::TooManyPhysicalDataSources`] when the models the request uses live
/// in more than one physical data source, since one SQL string cannot span connections.
pub fn compile(
    catalog: &Catalog,
    request: &BlendingDataRequest,
    options: &CompileOptions,
) -> Result<CompileOutput> {
    let dataframe = catalog.context(options).build(request)?;
    finish(dataframe, options.dialect)
}

/// Compile a [`TransformRequest`] for `company_id`.
///
/// One subrequest is created per data source namespace used by the requested taxons,
/// including namespaces reached through calculations.
pub fn compile_transformation_request(
    catalog: &Catalog,
    request: &TransformRequest,
    company_id: &str,
    physical_data_source: Option<&str>,
    options: &CompileOptions,
) -> Result<CompileOutput> {
    let requested: BTreeSet<String> = request.requested_fields.iter().cloned().collect();
    let used = TaxonResolver::new(&catalog.taxonomy)
        .resolve(&requested)?
        .all_taxons();
    let data_sources: BTreeSet<&str> = used
        .values()
        .filter_map(|taxon| taxon.data_source.as_deref())
        .collect();
    if data_sources.is_empty() {
        return Err(HuskyError::invalid_request(
            "Requested fields do not use any data source.",
        ));
    }
    debug!(?data_sources, "transformation request");

    let scope = Scope::new(company_id).with_visibility(options.model_visibility);
    let subrequests = data_sources
        .into_iter()
        .map(|data_source| DataRequest::new(data_source, scope.clone(), &[]))
        .collect();
    let mut blending = BlendingDataRequest::new(subrequests);
    blending.taxons = requested.into_iter().collect();
    blending.filters = request.filters.clone();
    blending.order_by = request.order_by.clone();
    blending.limit = request.limit;
    blending.physical_data_sources = physical_data_source.map(|p| vec![p.to_string()]);

    compile(catalog, &blending, options)
}

/// Select every column of `dataframe` under its dialect-corrected alias and render SQL.
fn finish(dataframe: Dataframe, dialect: Dialect) -> Result<CompileOutput> {
    if dataframe.used_physical_data_sources.len() > 1 {
        return Err(HuskyError::TooManyPhysicalDataSources {
            data_sources: dataframe.used_physical_data_sources,
        });
    }

    let columns = output_aliases(dataframe.slug_to_column.keys().map(String::as_str), dialect);
    let select: Vec<_> = columns
        .iter()
        .filter_map(|(slug, alias)| {
            dataframe
                .slug_to_column
                .get(slug)
                .map(|column| col(&column.name).alias(alias))
        })
        .collect();
    let query = dataframe.query.wrap(RESULT_ALIAS).select(select);
    let sql = query.to_sql(dialect);
    info!(%dialect, columns = columns.len(), "compiled request");

    Ok(CompileOutput {
        sql,
        query,
        dialect,
        physical_data_source: dataframe.used_physical_data_sources.into_iter().next(),
        columns,
    })
}

/// Output alias of every slug for `dialect`.
///
/// Aliases the dialect rewrites into the same text are numbered `_1`, `_2`, ... in slug
/// order.
pub fn output_aliases<'s>(
    slugs: impl IntoIterator<Item = &'s str>,
    dialect: Dialect,
) -> Vec<(String, String)> {
    let mut used = BTreeSet::new();
    slugs
        .into_iter()
        .map(|slug| {
            let base = dialect.correct_alias(slug);
            let mut alias = base.clone();
            let mut n = 0;
            while !used.insert(alias.clone()) {
                n += 1;
                alias = format!("{base}_{n}");
            }
            (slug.to_string(), alias)
        })
        .collect()
}

/// Parse a dialect name, failing with [`HuskyError::UnsupportedDialect`].
pub fn parse_dialect(name: &str) -> Result<Dialect> {
    name.parse()
}
