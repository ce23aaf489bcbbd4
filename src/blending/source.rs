//! Query of a single data source.
//!
//! The select query reads raw taxons from the join tree of the source's models and applies
//! scope and subrequest filters. `first_by`/`last_by` taxons need a window pass over the
//! joined rows first. The projection query then aggregates per source.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::dataframe::{Dataframe, DataframeColumn};
use super::planner::FilterTemplates;
use super::request::DataRequest;
use crate::error::{HuskyError, Result};
use crate::filter::{TaxonSqlInfo, TaxonSqlInfoMap};
use crate::graph::{ModelGraph, QueryJoins};
use crate::identifier::{safe_identifier, DATA_SOURCE_COLUMN};
use crate::model::{Model, ModelLoader};
use crate::sql::{
    avg, col, count, count_distinct, func, lit_str, max, min, sort_select, sum, Expr, ExprExt,
    NullsOrder, OrderByExpr, Query, SelectExpr, SortDir, TableRef, WindowExt, WindowOrderBy,
};
use crate::taxonomy::{AggregationParams, AggregationType, Taxon, TaxonMap, TaxonOrderType};
use crate::tel::SqlFormulaTemplate;

const WINDOW_SOURCE_ALIAS: &str = "window_source";
const SELECT_SOURCE_ALIAS: &str = "source_query";

/// Per-source query over the raw taxons of one subrequest.
#[derive(Debug)]
pub struct SourceQueryBuilder<'a> {
    subrequest: &'a DataRequest,
    taxons: &'a TaxonMap,
    dimension_templates: &'a [SqlFormulaTemplate],
    filter_templates: Option<&'a FilterTemplates>,
    physical_data_sources: Option<&'a BTreeSet<String>>,
}

impl<'a> SourceQueryBuilder<'a> {
    /// `taxons` must contain every raw taxon the subrequest selects or filters by.
    pub fn new(subrequest: &'a DataRequest, taxons: &'a TaxonMap) -> Self {
        Self {
            subrequest,
            taxons,
            dimension_templates: &[],
            filter_templates: None,
            physical_data_sources: None,
        }
    }

    pub fn with_dimension_templates(mut self, templates: &'a [SqlFormulaTemplate]) -> Self {
        self.dimension_templates = templates;
        self
    }

    pub fn with_filter_templates(mut self, templates: &'a FilterTemplates) -> Self {
        self.filter_templates = Some(templates);
        self
    }

    pub fn with_physical_data_sources(mut self, allowed: Option<&'a BTreeSet<String>>) -> Self {
        self.physical_data_sources = allowed;
        self
    }

    pub fn build(&self, loader: &dyn ModelLoader) -> Result<Dataframe> {
        let data_source = self.subrequest.data_source()?;
        let data_sources = BTreeSet::from([data_source.to_string()]);

        let projection = self.projection_taxons()?;
        let graph_select = self.graph_select_taxons(&projection)?;

        let models = loader.load_models(
            &data_sources,
            &self.subrequest.scope,
            self.subrequest.properties.model_name.as_deref(),
            self.physical_data_sources,
        )?;
        let graph = ModelGraph::build(&data_sources, models)?;
        let wanted: BTreeSet<String> = graph_select.keys().cloned().collect();
        let joins = graph.find_join_tree(&wanted)?;
        let taxon_to_model = joins.taxon_to_model();
        let infos = self.model_infos(&graph_select, &taxon_to_model)?;

        let (select, infos) = if requires_window(&graph_select) {
            self.window_query(&projection, &graph_select, &taxon_to_model, &joins, &graph, infos)?
        } else {
            (self.distribution_query(&projection, &joins, &graph, &infos)?, infos)
        };
        let select = match &self.subrequest.preaggregation_filters {
            Some(filters) => select.filter(filters.to_expr(&infos)?),
            None => select,
        };

        let used_physical_data_sources: BTreeSet<String> = joins
            .bfs_ordered()
            .iter()
            .map(|node| node.model.physical_data_source().to_string())
            .collect();
        debug!(
            data_source,
            models = ?joins.model_names(),
            taxons = projection.len(),
            "built source query"
        );
        Ok(self.projection(select, &infos, &projection, data_source, used_physical_data_sources))
    }

    /// Raw taxons selected by the subrequest or used in its ordering.
    fn projection_taxons(&self) -> Result<TaxonMap> {
        let slugs = self
            .subrequest
            .taxons
            .iter()
            .chain(self.subrequest.order_by.iter().map(|o| &o.taxon));
        self.raw_taxons(slugs)
    }

    /// Projection plus every raw taxon templates and aggregations read.
    fn graph_select_taxons(&self, projection: &TaxonMap) -> Result<TaxonMap> {
        let template_slugs: BTreeSet<&String> = self
            .filter_templates
            .into_iter()
            .flat_map(|t| t.values())
            .chain(self.dimension_templates)
            .flat_map(|t| t.used_taxons.iter())
            .collect();
        let mut graph_select = self.raw_taxons(template_slugs)?;
        graph_select.extend(projection.iter().map(|(k, v)| (k.clone(), v.clone())));

        let aggregation_slugs: BTreeSet<String> = graph_select
            .values()
            .filter_map(|t| t.tel_metadata.as_ref()?.aggregation_definition.as_ref())
            .flat_map(|agg| agg.used_taxon_slugs())
            .collect();
        graph_select.extend(self.raw_taxons(&aggregation_slugs)?);
        Ok(graph_select)
    }

    fn raw_taxons<'s>(&self, slugs: impl IntoIterator<Item = &'s String>) -> Result<TaxonMap> {
        let mut taxons = TaxonMap::new();
        for slug in slugs {
            let taxon = self
                .taxons
                .get(slug)
                .ok_or_else(|| HuskyError::internal(format!("Taxon \"{slug}\" was not loaded")))?;
            if !taxon.is_computed() {
                taxons.insert(taxon.slug.clone(), taxon.clone());
            }
        }
        Ok(taxons)
    }

    /// Accessors of graph taxons in their models, plus the filter templates they render.
    fn model_infos(
        &self,
        graph_select: &TaxonMap,
        taxon_to_model: &BTreeMap<String, &Model>,
    ) -> Result<TaxonSqlInfoMap> {
        let mut infos = TaxonSqlInfoMap::new();
        for slug in graph_select.keys() {
            let model = model_for(taxon_to_model, slug)?;
            infos.insert(
                slug.clone(),
                TaxonSqlInfo {
                    accessor: model.taxon_sql_accessor(slug, false)?,
                    model_name: Some(model.name.clone()),
                    quantity_type: model
                        .attribute(slug)
                        .map(|a| a.quantity_type)
                        .unwrap_or_default(),
                },
            );
        }
        for (slug, template) in self.filter_templates.into_iter().flatten() {
            if !infos.contains_key(slug) {
                let accessor = render_template(template, &infos);
                infos.insert(slug.clone(), TaxonSqlInfo::new(accessor));
            }
        }
        Ok(infos)
    }

    fn distribution_query(
        &self,
        projection: &TaxonMap,
        joins: &QueryJoins<'_>,
        graph: &ModelGraph,
        infos: &TaxonSqlInfoMap,
    ) -> Result<Query> {
        let mut select: Vec<SelectExpr> = projection
            .values()
            .map(|taxon| Ok(accessor(infos, &taxon.slug)?.alias(&taxon.safe_slug())))
            .collect::<Result<_>>()?;
        select.extend(
            self.dimension_templates
                .iter()
                .map(|t| render_template(t, infos).alias(&t.label)),
        );
        let query = joins.apply_to(Query::new().select(sort_select(select)), graph)?;
        self.scope_filter(query, infos)
    }

    /// Window pass computing `first_by`/`last_by` values per model row identity.
    ///
    /// Returns the outer query and the accessors valid on top of the inner one.
    fn window_query(
        &self,
        projection: &TaxonMap,
        graph_select: &TaxonMap,
        taxon_to_model: &BTreeMap<String, &Model>,
        joins: &QueryJoins<'_>,
        graph: &ModelGraph,
        infos: TaxonSqlInfoMap,
    ) -> Result<(Query, TaxonSqlInfoMap)> {
        let mut inner_select = Vec::with_capacity(graph_select.len());
        for taxon in graph_select.values() {
            let model = model_for(taxon_to_model, &taxon.slug)?;
            let value = accessor(&infos, &taxon.slug)?;
            let expr = match window_function(taxon) {
                Some((function, sort_dimensions)) => {
                    let partition_by = model
                        .identifier_attributes()
                        .map(|a| model.taxon_sql_accessor(&a.taxon, false))
                        .collect::<Result<Vec<_>>>()?;
                    let order_by = sort_dimensions
                        .iter()
                        .map(|(slug, order)| {
                            Ok(WindowOrderBy {
                                expr: accessor(&infos, slug)?,
                                dir: Some(match order {
                                    TaxonOrderType::Asc => SortDir::Asc,
                                    TaxonOrderType::Desc => SortDir::Desc,
                                }),
                                nulls: Some(NullsOrder::Last),
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    func(function, vec![value])
                        .over()
                        .partition_by(partition_by)
                        .order_by(order_by)
                        .build()
                }
                None => value,
            };
            inner_select.push(expr.alias(&taxon.safe_slug()));
        }
        let inner = joins.apply_to(Query::new().select(sort_select(inner_select)), graph)?;
        let inner = self.scope_filter(inner, &infos)?;

        let mut outer_infos: TaxonSqlInfoMap = infos
            .into_iter()
            .map(|(slug, info)| {
                let accessor = col(&safe_identifier(&slug));
                (slug, TaxonSqlInfo { accessor, ..info })
            })
            .collect();
        for (slug, template) in self.filter_templates.into_iter().flatten() {
            let accessor = render_template(template, &outer_infos);
            if let Some(info) = outer_infos.get_mut(slug) {
                info.accessor = accessor;
            }
        }

        let mut select: Vec<SelectExpr> = projection
            .values()
            .map(|taxon| col(&taxon.safe_slug()).alias(&taxon.safe_slug()))
            .collect();
        select.extend(
            self.dimension_templates
                .iter()
                .map(|t| render_template(t, &outer_infos).alias(&t.label)),
        );
        let outer = Query::new()
            .select(sort_select(select))
            .from(TableRef::subquery(inner, WINDOW_SOURCE_ALIAS));
        Ok((outer, outer_infos))
    }

    fn scope_filter(&self, query: Query, infos: &TaxonSqlInfoMap) -> Result<Query> {
        Ok(match &self.subrequest.scope.preaggregation_filters {
            Some(filters) => query.filter(filters.to_expr(infos)?),
            None => query,
        })
    }

    /// Aggregates the select query per data source.
    fn projection(
        &self,
        select: Query,
        infos: &TaxonSqlInfoMap,
        projection: &TaxonMap,
        data_source: &str,
        used_physical_data_sources: BTreeSet<String>,
    ) -> Dataframe {
        let mut columns = Vec::new();
        let mut group_by = BTreeSet::new();
        let mut slug_to_column = BTreeMap::new();
        for taxon in projection.values() {
            let name = taxon.safe_slug();
            let column = col(&name);
            let aggregated = match taxon.tel_metadata_aggregation_type() {
                Some(AggregationType::Sum) => Some(sum(column)),
                Some(AggregationType::Min) => Some(min(column)),
                Some(AggregationType::Max) => Some(max(column)),
                Some(AggregationType::CountAll) => Some(count(column)),
                Some(AggregationType::CountDistinct) => Some(count_distinct(column)),
                Some(AggregationType::Avg) => Some(avg(column)),
                _ => None,
            };
            match aggregated {
                Some(expr) => columns.push(expr.alias(&name)),
                None => {
                    columns.push(col(&name).alias(&name));
                    group_by.insert(name.clone());
                }
            }
            let quantity_type = infos
                .get(&taxon.slug)
                .map(|info| info.quantity_type)
                .unwrap_or_default();
            slug_to_column.insert(
                taxon.slug.clone(),
                DataframeColumn::new(&name, &taxon.slug, quantity_type),
            );
        }
        for template in self.dimension_templates {
            columns.push(col(&template.label).alias(&template.label));
            group_by.insert(template.label.clone());
        }
        columns.push(lit_str(data_source).alias(DATA_SOURCE_COLUMN));

        let order_by = self
            .subrequest
            .order_by
            .iter()
            .map(|order| {
                let column = col(&safe_identifier(&order.taxon));
                match order.order_type {
                    TaxonOrderType::Asc => OrderByExpr::asc(column),
                    TaxonOrderType::Desc => OrderByExpr::desc(column),
                }
                .nulls_last()
            })
            .collect();
        let mut query = Query::new()
            .select(sort_select(columns))
            .from(TableRef::subquery(select, SELECT_SOURCE_ALIAS))
            .group_by(group_by.iter().map(|name| col(name)).collect())
            .order_by(order_by);
        if let Some(limit) = self.subrequest.limit {
            query = query.limit(limit);
        }
        if let Some(offset) = self.subrequest.offset {
            query = query.offset(offset);
        }

        let used_model_names = infos.values().filter_map(|i| i.model_name.clone()).collect();
        Dataframe::new(query, slug_to_column, used_model_names, used_physical_data_sources)
    }
}

fn model_for<'m>(taxon_to_model: &BTreeMap<String, &'m Model>, slug: &str) -> Result<&'m Model> {
    taxon_to_model
        .get(slug)
        .copied()
        .ok_or_else(|| HuskyError::internal(format!("No model selected for taxon \"{slug}\"")))
}

fn accessor(infos: &TaxonSqlInfoMap, slug: &str) -> Result<Expr> {
    infos
        .get(slug)
        .map(|info| info.accessor.clone())
        .ok_or_else(|| HuskyError::internal(format!("No accessor for taxon \"{slug}\"")))
}

fn render_template(template: &SqlFormulaTemplate, infos: &TaxonSqlInfoMap) -> Expr {
    let columns: BTreeMap<String, Expr> = template
        .used_taxons
        .iter()
        .filter_map(|slug| infos.get(slug).map(|info| (slug.clone(), info.accessor.clone())))
        .collect();
    template.render(&columns)
}

fn requires_window(taxons: &TaxonMap) -> bool {
    taxons.values().any(|t| window_function(t).is_some())
}

/// Window function and sort dimensions of a `first_by`/`last_by` taxon.
fn window_function(taxon: &Taxon) -> Option<(&'static str, Vec<(String, TaxonOrderType)>)> {
    let definition = taxon
        .tel_metadata
        .as_ref()
        .and_then(|m| m.aggregation_definition.as_ref())
        .or(taxon.aggregation.as_ref())?;
    let function = match definition.agg_type {
        AggregationType::FirstBy => "FIRST_VALUE",
        AggregationType::LastBy => "LAST_VALUE",
        _ => return None,
    };
    match &definition.params {
        Some(AggregationParams::SortDimension { sort_dimensions }) => Some((
            function,
            sort_dimensions
                .iter()
                .map(|d| (d.taxon.clone(), d.order_by.unwrap_or(TaxonOrderType::Asc)))
                .collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterClause, SimpleFilterOperator};
    use crate::model::{ModelAttribute, ModelStore, Scope};
    use crate::sql::Dialect;
    use crate::taxonomy::{
        AggregationDefinition, AggregationOrderByTaxon, TaxonResolver, TaxonType, Taxonomy,
    };

    fn taxons() -> TaxonMap {
        let taxonomy = Taxonomy::new([
            Taxon::raw("fb|spend", TaxonType::Metric, AggregationDefinition::sum()),
            Taxon::raw("fb|ad_id", TaxonType::Dimension, AggregationDefinition::group_by()),
            Taxon::raw("fb|ad_name", TaxonType::Dimension, AggregationDefinition::group_by()),
            Taxon::raw("fb|updated_at", TaxonType::Dimension, AggregationDefinition::group_by()),
            Taxon::raw(
                "fb|status",
                TaxonType::Dimension,
                AggregationDefinition::sort_by(
                    AggregationType::LastBy,
                    vec![AggregationOrderByTaxon {
                        taxon: "fb|updated_at".into(),
                        order_by: None,
                    }],
                )
                .unwrap(),
            ),
        ]);
        let slugs = taxonomy.taxons().map(|t| t.slug.clone()).collect();
        let mut map = crate::taxonomy::TaxonLoader::load_taxons(&taxonomy, &slugs, true).unwrap();
        TaxonResolver::new(&taxonomy)
            .complete_tel_metadata(&mut map, false)
            .unwrap();
        map
    }

    fn store() -> ModelStore {
        ModelStore::new(vec![Model::new("fb_ads", "fb", "50", &["db", "fb", "ads"])
            .with_attribute(ModelAttribute::column("fb|ad_id", "AD_ID").as_identifier())
            .with_attribute(ModelAttribute::column("fb|ad_name", "AD_NAME"))
            .with_attribute(ModelAttribute::column("fb|spend", "SPEND"))
            .with_attribute(ModelAttribute::column("fb|status", "STATUS"))
            .with_attribute(ModelAttribute::column("fb|updated_at", "UPDATED_AT"))])
        .unwrap()
    }

    #[test]
    fn test_distribution_query() {
        let taxons = taxons();
        let subrequest = DataRequest::new("fb", Scope::new("50"), &["fb|ad_name", "fb|spend"])
            .with_preaggregation_filters(FilterClause::value(
                "fb|ad_name",
                SimpleFilterOperator::Neq,
                "test",
            ));
        let dataframe = SourceQueryBuilder::new(&subrequest, &taxons)
            .build(&store())
            .unwrap();
        let sql = dataframe.query.to_sql(Dialect::Snowflake);
        let spend = safe_identifier("fb|spend");
        assert!(sql.contains(&format!("SUM(\"{spend}\")")), "{sql}");
        assert!(sql.contains("'fb' AS \"__data_source\""), "{sql}");
        assert!(sql.contains("<> 'test'"), "{sql}");
        assert_eq!(
            dataframe.used_model_names,
            BTreeSet::from(["fb_ads".to_string()])
        );
        assert_eq!(
            dataframe.used_physical_data_sources,
            BTreeSet::from(["fb".to_string()])
        );
        assert_eq!(
            dataframe.slug_to_column.keys().collect::<Vec<_>>(),
            vec!["fb|ad_name", "fb|spend"]
        );
    }

    #[test]
    fn test_last_by_uses_window_pass() {
        let taxons = taxons();
        let subrequest = DataRequest::new("fb", Scope::new("50"), &["fb|status", "fb|spend"]);
        let dataframe = SourceQueryBuilder::new(&subrequest, &taxons)
            .build(&store())
            .unwrap();
        let sql = dataframe.query.to_sql(Dialect::Snowflake);
        assert!(sql.contains("LAST_VALUE"), "{sql}");
        assert!(sql.contains("PARTITION BY"), "{sql}");
        assert!(sql.contains("NULLS LAST"), "{sql}");
        assert!(sql.contains("\"window_source\""), "{sql}");
    }

    #[test]
    fn test_unknown_taxon_is_internal_error() {
        let taxons = taxons();
        let subrequest = DataRequest::new("fb", Scope::new("50"), &["fb|clicks"]);
        let err = SourceQueryBuilder::new(&subrequest, &taxons)
            .build(&store())
            .unwrap_err();
        assert!(matches!(err, HuskyError::Internal(_)));
    }
}
