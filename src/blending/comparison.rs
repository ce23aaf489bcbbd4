//! Comparison (benchmark) dataframe: the same metrics over the comparison scope.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::blend::blend;
use super::dataframe::{Dataframe, DataframeColumn};
use super::dimension::dimension_phase;
use super::override_mapping::OverrideMappingManager;
use super::planner::preaggregation_filter_templates;
use super::request::{BlendingDataRequest, ComparisonConfig, ComparisonScope, DataRequest};
use super::source::SourceQueryBuilder;
use super::taxon_manager::BlendingTaxonManager;
use crate::error::{HuskyError, Result};
use crate::filter::{FilterClause, SimpleFilterOperator};
use crate::identifier::{comparison_slug, safe_identifier};
use crate::model::augment::COMPANY_ID;
use crate::model::ModelLoader;
use crate::sql::{col, sort_select, sum, ExprExt, Query, TableRef};
use crate::taxonomy::AggregationType;

const COMPARISON_SOURCE_ALIAS: &str = "comparison_source";

/// Subrequest selecting the comparison taxons of `subrequest` over the comparison scope.
fn comparison_subrequest(
    subrequest: &DataRequest,
    comparison: &ComparisonConfig,
    manager: &BlendingTaxonManager<'_>,
) -> Result<DataRequest> {
    let mut comparison_request = subrequest.clone();
    comparison_request.preaggregation_filters = None;
    comparison_request.limit = None;
    comparison_request.offset = None;
    comparison_request.order_by = vec![];
    comparison_request.taxons = manager
        .comparison_subrequest_raw_taxons(subrequest, comparison)?
        .into_iter()
        .collect();
    match comparison.scope {
        ComparisonScope::Company => {
            let company_id = comparison_request.scope.company_id.clone();
            comparison_request.scope.preaggregation_filters = Some(FilterClause::value(
                COMPANY_ID,
                SimpleFilterOperator::Eq,
                company_id.as_str(),
            ));
        }
    }
    Ok(comparison_request)
}

/// Builds the comparison dataframe, `None` when no subrequest has comparable taxons.
///
/// Metric columns are renamed to their `comparison@` slugs; dimensions keep theirs so
/// the result can be joined to the data.
pub fn comparison_dataframe(
    request: &BlendingDataRequest,
    manager: &BlendingTaxonManager<'_>,
    overrides: &OverrideMappingManager,
    models: &dyn ModelLoader,
    physical_data_sources: Option<&BTreeSet<String>>,
) -> Result<Option<Dataframe>> {
    let Some(comparison) = &request.comparison else {
        return Ok(None);
    };
    let plan = &manager.plan;
    let taxons = manager.taxon_map();

    let mut dataframes = Vec::new();
    for subrequest in &request.data_subrequests {
        let subrequest = comparison_subrequest(subrequest, comparison, manager)?;
        if subrequest.taxons.is_empty() {
            continue;
        }
        let data_source = subrequest.data_source()?;
        let filter_templates = preaggregation_filter_templates(
            &[None, subrequest.scope.preaggregation_filters.as_ref()],
            taxons,
            data_source,
        )?;
        let dimension_templates = plan
            .comparison_data_source_formula_templates
            .get(data_source)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let df = SourceQueryBuilder::new(&subrequest, taxons)
            .with_dimension_templates(dimension_templates)
            .with_filter_templates(&filter_templates)
            .with_physical_data_sources(physical_data_sources)
            .build(models)?;
        dataframes.push(df);
    }
    if dataframes.is_empty() {
        debug!("no comparison taxons in any subrequest");
        return Ok(None);
    }
    let source_count = dataframes.len();
    let blended = blend(dataframes, &plan.comparison_data_source_formula_templates, taxons)?;

    let mut select = Vec::new();
    let mut slug_to_column = BTreeMap::new();
    let mut metrics = BTreeMap::new();
    for (slug, column) in &blended.slug_to_column {
        let taxon = manager.taxon(slug)?;
        let (new_slug, new_name) = if taxon.is_dimension() {
            (slug.clone(), column.name.clone())
        } else {
            let new_slug = comparison_slug(slug);
            let new_name = safe_identifier(&new_slug);
            metrics.insert(new_name.clone(), taxon.tel_metadata_aggregation_type());
            (new_slug, new_name)
        };
        select.push(col(&column.name).alias(&new_name));
        slug_to_column.insert(
            new_slug.clone(),
            DataframeColumn::new(&new_name, &new_slug, column.quantity_type),
        );
    }
    select.extend(
        plan.comparison_data_source_formula_templates
            .values()
            .flatten()
            .map(|t| col(&t.label).alias(&t.label)),
    );
    let query = Query::new()
        .select(sort_select(select))
        .from(TableRef::subquery(blended.query.clone(), COMPARISON_SOURCE_ALIAS));
    let df = blended.derive(query, slug_to_column);
    debug!(sources = source_count, metrics = metrics.len(), "built comparison dataframe");

    if plan.comparison_dimension_formulas.is_empty() {
        return Ok(Some(df));
    }
    let df = dimension_phase(
        df,
        &plan.comparison_dimension_formulas,
        &plan.comparison_override_mappings,
        overrides,
    )?;
    let mut group_by: BTreeSet<String> = plan
        .comparison_dimension_formulas
        .iter()
        .map(|f| f.label.clone())
        .collect();
    let mut select = Vec::new();
    for column in df.slug_to_column.values() {
        match metrics.get(&column.name) {
            Some(Some(
                AggregationType::Sum | AggregationType::CountAll | AggregationType::CountDistinct,
            )) => select.push(sum(col(&column.name)).alias(&column.name)),
            Some(_) => {
                return Err(HuskyError::InvalidComparisonRequest(format!(
                    "Unsupported aggregation type for taxon {}",
                    column.taxon
                )))
            }
            None => {
                group_by.insert(column.name.clone());
            }
        }
    }
    select.extend(group_by.iter().map(|name| col(name).alias(name)));
    let query = Query::new()
        .select(sort_select(select))
        .from(TableRef::subquery(df.query.clone(), COMPARISON_SOURCE_ALIAS))
        .group_by(group_by.iter().map(|name| col(name)).collect());
    Ok(Some(df.derive(query, df.slug_to_column.clone())))
}
