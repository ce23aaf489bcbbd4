//! TEL planning: splits every projected taxon into the formulas each query phase computes.
//!
//! Dimension formulas that read a single data source are pushed down into that source's
//! query as [`SqlFormulaTemplate`]s. Metrics become pre-aggregation formulas plus a post
//! formula evaluated over the aggregated columns.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use super::request::BlendingDataRequest;
use crate::error::{HuskyError, Result};
use crate::filter::FilterClause;
use crate::sql::{col, template};
use crate::taxonomy::{sql_friendly_slug, AggregationDefinition, Taxon, TaxonMap};
use crate::tel::{
    render_taxon, ExprResult, OverrideMappingTelInfo, PostFormula, PreFormula, SqlFormulaTemplate,
    TelDialect, TelRootContext,
};

/// Label prefix of comparison join dimensions.
const COMPARISON_JOIN_PREFIX: &str = "comp_join_col_";

/// Filter taxon slug to the template evaluating it inside one data source.
pub type FilterTemplates = BTreeMap<String, SqlFormulaTemplate>;

#[derive(Debug, Clone, Default)]
pub struct TelPlan {
    /// Dimension templates per data source.
    pub data_source_formula_templates: BTreeMap<String, Vec<SqlFormulaTemplate>>,
    pub comparison_data_source_formula_templates: BTreeMap<String, Vec<SqlFormulaTemplate>>,
    pub dimension_formulas: Vec<PreFormula>,
    pub comparison_dimension_formulas: Vec<PreFormula>,
    pub metric_pre: Vec<PreFormula>,
    /// Formulas of the last phase with the taxon they produce.
    pub metric_post: Vec<(PostFormula, Taxon)>,
    pub data_source_filter_templates: BTreeMap<String, FilterTemplates>,
    /// Columns joining the data and comparison dataframes.
    pub comparison_join_columns: Vec<String>,
    pub comparison_raw_taxon_slugs: Vec<String>,
    pub override_mappings: BTreeSet<OverrideMappingTelInfo>,
    pub comparison_override_mappings: BTreeSet<OverrideMappingTelInfo>,
}

impl TelPlan {
    fn add_data_source_templates(&mut self, templates: &[SqlFormulaTemplate]) {
        for template in templates {
            self.data_source_formula_templates
                .entry(template.data_source.clone())
                .or_default()
                .push(template.clone());
        }
    }
}

/// Plans the projection taxons of a preprocessed request.
pub fn plan(
    request: &BlendingDataRequest,
    projection_taxons: &TaxonMap,
    all_taxons: &TaxonMap,
    taxon_to_ds: &BTreeMap<String, BTreeSet<String>>,
) -> Result<TelPlan> {
    let mut plan = TelPlan::default();
    let all_data_sources: BTreeSet<String> = request
        .data_subrequests
        .iter()
        .map(|s| s.data_source().map(str::to_string))
        .collect::<Result<_>>()?;

    for taxon in projection_taxons.values() {
        if taxon.calculation.is_some() {
            let origin = taxon.comparison_taxon_slug_origin.as_deref().unwrap_or(&taxon.slug);
            let data_sources = taxon_to_ds.get(origin).cloned().unwrap_or_default();
            let result = render(taxon, &taxon.slug, data_sources, all_taxons, false)?;
            plan.add_data_source_templates(&result.data_source_formula_templates);
            plan.dimension_formulas.extend(result.dimension_formulas);
            plan.metric_pre.extend(result.pre_formulas);
            plan.metric_post.push((result.post_formula, taxon.clone()));
            plan.override_mappings.extend(result.override_mappings);
        } else {
            let column = col(&taxon.safe_slug());
            let aggregation = taxon
                .tel_metadata
                .as_ref()
                .and_then(|m| m.aggregation_definition.clone())
                .or_else(|| taxon.aggregation.clone())
                .unwrap_or_else(|| {
                    if taxon.is_dimension() {
                        AggregationDefinition::group_by()
                    } else {
                        AggregationDefinition::sum()
                    }
                });
            plan.metric_pre
                .push(PreFormula::new(column.clone(), &taxon.slug, Some(aggregation)));
            plan.metric_post
                .push((PostFormula::new(column, None, BTreeSet::new()), taxon.clone()));
        }
    }

    let comparison_taxons = request
        .comparison
        .as_ref()
        .and_then(|c| c.taxons.as_deref())
        .unwrap_or_default();
    for slug in comparison_taxons {
        let taxon = all_taxons
            .get(&sql_friendly_slug(slug))
            .ok_or_else(|| HuskyError::internal(format!("Comparison taxon {slug} was not loaded")))?;
        if taxon.calculation.is_some() {
            let prefix = format!("{COMPARISON_JOIN_PREFIX}{}", taxon.slug);
            let result = render(taxon, &prefix, all_data_sources.clone(), all_taxons, false)?;
            plan.add_data_source_templates(&result.data_source_formula_templates);
            for template in &result.data_source_formula_templates {
                plan.comparison_data_source_formula_templates
                    .entry(template.data_source.clone())
                    .or_default()
                    .push(template.clone());
            }
            plan.override_mappings.extend(result.override_mappings.iter().cloned());
            plan.comparison_override_mappings.extend(result.override_mappings);
            plan.comparison_join_columns
                .extend(result.dimension_formulas.iter().map(|f| f.label.clone()));
            plan.dimension_formulas.extend(result.dimension_formulas.iter().cloned());
            plan.comparison_dimension_formulas.extend(result.dimension_formulas);
        } else {
            plan.comparison_join_columns.push(taxon.safe_slug());
            plan.comparison_raw_taxon_slugs.push(taxon.slug.clone());
        }
    }

    for subrequest in &request.data_subrequests {
        let data_source = subrequest.data_source()?;
        let templates = preaggregation_filter_templates(
            &[
                subrequest.preaggregation_filters.as_ref(),
                subrequest.scope.preaggregation_filters.as_ref(),
            ],
            all_taxons,
            data_source,
        )?;
        plan.data_source_filter_templates.insert(data_source.to_string(), templates);
    }

    debug!(
        metric_pre = plan.metric_pre.len(),
        metric_post = plan.metric_post.len(),
        dimension_formulas = plan.dimension_formulas.len(),
        override_mappings = plan.override_mappings.len(),
        "planned request"
    );
    Ok(plan)
}

/// Templates evaluating the taxons of pre-aggregation filters inside `data_source`.
///
/// Only dimensions can filter rows before aggregation.
pub fn preaggregation_filter_templates(
    filters: &[Option<&FilterClause>],
    all_taxons: &TaxonMap,
    data_source: &str,
) -> Result<FilterTemplates> {
    let mut templates = FilterTemplates::new();
    for filter in filters.iter().flatten() {
        for slug in filter.taxon_slugs() {
            let taxon = all_taxons
                .get(&slug)
                .ok_or_else(|| HuskyError::internal(format!("Filter taxon {slug} was not loaded")))?;
            if !taxon.is_dimension() {
                return Err(HuskyError::invalid_request(format!(
                    "Metric taxons are not allowed in preaggregation filters. Remove filter for taxon {}",
                    taxon.slug
                )));
            }
            let filter_template = if taxon.calculation.is_some() {
                let result = render(taxon, &taxon.slug, [data_source.to_string()], all_taxons, true)?;
                result
                    .data_source_formula_templates
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        HuskyError::internal(format!(
                            "Filter taxon {} has no template in data source {data_source}",
                            taxon.slug
                        ))
                    })?
            } else {
                SqlFormulaTemplate::new(
                    template(&taxon.slug),
                    &taxon.slug,
                    data_source,
                    BTreeSet::from([taxon.slug.clone()]),
                )
            };
            trace!(slug = %taxon.slug, label = %filter_template.label, "filter template");
            templates.insert(taxon.slug.clone(), filter_template);
        }
    }
    Ok(templates)
}

fn render(
    taxon: &Taxon,
    prefix: &str,
    data_sources: impl IntoIterator<Item = String>,
    all_taxons: &TaxonMap,
    subrequest_only: bool,
) -> Result<ExprResult> {
    let calculation = taxon
        .calculation
        .as_deref()
        .ok_or_else(|| HuskyError::internal(format!("Taxon {} has no calculation", taxon.slug)))?;
    let ctx = TelRootContext::new(TelDialect::Taxon, all_taxons)
        .with_taxon_slug(prefix)
        .with_taxon_type(taxon.taxon_type)
        .with_data_sources(Some(data_sources))
        .with_benchmark(taxon.is_comparison_taxon())
        .with_aggregation(taxon.aggregation.clone())
        .with_subrequest_only(subrequest_only);
    render_taxon(calculation, &ctx).map_err(|e| {
        if matches!(e, HuskyError::InvalidExpression { .. } | HuskyError::Tel(_)) {
            HuskyError::InvalidTaxon {
                slug: taxon.slug.clone(),
                reason: e.to_string(),
            }
        } else {
            e
        }
    })
}
