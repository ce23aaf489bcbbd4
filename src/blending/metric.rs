//! Metric phase: aggregation of the blended rows and post-aggregation formulas.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::dataframe::{Dataframe, DataframeColumn};
use super::planner::TelPlan;
use crate::error::Result;
use crate::filter::{FilterClause, TaxonSqlInfo, TaxonSqlInfoMap};
use crate::identifier::safe_identifier;
use crate::sql::{
    cast, col, lit_str, sort_select, sum, CastType, Cte, Expr, ExprExt, Query, SelectExpr, TableRef,
};
use crate::taxonomy::AggregationType;

/// CTE with the stringified dimension columns every grouping set reads.
const GROUPING_SETS_CTE: &str = "__cte_grouping_sets";

/// Stands in for the dimensions a grouping set does not group by.
pub const GROUPING_SETS_NULL: &str = "PANORAMIC_GROUPINGSETS_NULL";

const METRIC_SOURCE_ALIAS: &str = "metric_source";
const METRIC_RESULT_ALIAS: &str = "metric_result";

/// Aggregations summed in this phase; every other pre-formula is grouped by.
fn is_summed(agg_type: AggregationType) -> bool {
    matches!(
        agg_type,
        AggregationType::Sum | AggregationType::CountAll | AggregationType::CountDistinct
    )
}

/// Aggregates `df` with the pre-formulas of `plan` and computes its post formulas.
///
/// With grouping sets, one grouped query per set is unioned. `filters` are applied
/// to the aggregated result.
pub fn metric_phase(
    df: Dataframe,
    plan: &TelPlan,
    grouping_sets: Option<&[Vec<String>]>,
    filters: Option<&FilterClause>,
) -> Result<Dataframe> {
    let mut seen = BTreeSet::new();
    let mut aggregated = Vec::new();
    let mut group_columns: Vec<(String, Expr)> = Vec::new();
    for pre in &plan.metric_pre {
        if !seen.insert(pre.label.clone()) {
            continue;
        }
        if is_summed(pre.aggregation.agg_type) {
            aggregated.push(sum(pre.formula.clone()).alias(&pre.label));
        } else {
            group_columns.push((pre.label.clone(), pre.formula.clone()));
        }
    }
    group_columns.sort_by(|a, b| a.0.cmp(&b.0));
    let dimension_labels: BTreeSet<String> = group_columns.iter().map(|(l, _)| l.clone()).collect();

    let pre_query = match grouping_sets.filter(|sets| !sets.is_empty()) {
        Some(sets) => grouping_sets_query(&df.query, &group_columns, &aggregated, sets),
        None => {
            let mut select = aggregated.clone();
            select.extend(group_columns.iter().map(|(l, f)| f.clone().alias(l)));
            Query::new()
                .select(sort_select(select))
                .from(TableRef::subquery(df.query.clone(), METRIC_SOURCE_ALIAS))
                .group_by(group_columns.iter().map(|(_, f)| f.clone()).collect())
        }
    };

    let mut post_select = Vec::new();
    let mut slug_to_column = BTreeMap::new();
    for (post, taxon) in &plan.metric_post {
        let name = taxon.safe_slug();
        if slug_to_column.contains_key(&taxon.slug) {
            continue;
        }
        post_select.push(post.render(&dimension_labels).alias(&name));
        let quantity_type = df
            .slug_to_column
            .get(&taxon.slug)
            .map(|c| c.quantity_type)
            .unwrap_or_default();
        slug_to_column.insert(
            taxon.slug.clone(),
            DataframeColumn::new(&name, &taxon.slug, quantity_type),
        );
    }
    let mut query = Query::new()
        .select(sort_select(post_select))
        .from(TableRef::subquery(pre_query, METRIC_SOURCE_ALIAS));

    if let Some(filters) = filters {
        let infos: TaxonSqlInfoMap = slug_to_column
            .values()
            .map(|c| {
                let info = TaxonSqlInfo {
                    quantity_type: c.quantity_type,
                    ..TaxonSqlInfo::new(col(&c.name))
                };
                (c.taxon.clone(), info)
            })
            .collect();
        let columns: Vec<SelectExpr> = query.output_names().iter().map(|n| col(n).alias(n)).collect();
        query = Query::new()
            .select(columns)
            .from(TableRef::subquery(query, METRIC_RESULT_ALIAS))
            .filter(filters.to_expr(&infos)?);
    }
    debug!(
        aggregated = aggregated.len(),
        grouped = group_columns.len(),
        grouping_sets = grouping_sets.map_or(0, <[_]>::len),
        filtered = filters.is_some(),
        "metric phase"
    );
    Ok(df.derive(query, slug_to_column))
}

/// `UNION ALL` of one aggregation per grouping set over stringified dimensions.
fn grouping_sets_query(
    source: &Query,
    group_columns: &[(String, Expr)],
    aggregated: &[SelectExpr],
    grouping_sets: &[Vec<String>],
) -> Query {
    let labels: BTreeSet<&str> = group_columns.iter().map(|(l, _)| l.as_str()).collect();
    let stringified: Vec<SelectExpr> = source
        .output_names()
        .iter()
        .map(|name| {
            if labels.contains(name.as_str()) {
                cast(col(name), CastType::Text).alias(name)
            } else {
                col(name).alias(name)
            }
        })
        .collect();
    let cte = Cte::new(
        GROUPING_SETS_CTE,
        Query::new()
            .select(sort_select(stringified))
            .from(TableRef::subquery(source.clone(), METRIC_SOURCE_ALIAS)),
    );

    let queries = grouping_sets
        .iter()
        .map(|set| {
            let members: BTreeSet<String> = set.iter().map(|s| safe_identifier(s)).collect();
            let mut select = aggregated.to_vec();
            let mut group_by = Vec::new();
            for (label, formula) in group_columns {
                if members.contains(label) {
                    select.push(formula.clone().alias(label));
                    group_by.push(formula.clone());
                } else {
                    select.push(lit_str(GROUPING_SETS_NULL).alias(label));
                }
            }
            Query::new()
                .with_cte(cte.clone())
                .select(sort_select(select))
                .from(TableRef::new(GROUPING_SETS_CTE))
                .group_by(group_by)
        })
        .collect();
    Query::union_all(queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SimpleFilterOperator;
    use crate::model::ValueQuantityType;
    use crate::sql::Dialect;
    use crate::taxonomy::{AggregationDefinition, Taxon, TaxonType};
    use crate::tel::{PostFormula, PreFormula};

    fn raw(
        slug: &str,
        taxon_type: TaxonType,
        aggregation: AggregationDefinition,
    ) -> (PreFormula, (PostFormula, Taxon)) {
        let column = col(&safe_identifier(slug));
        let taxon = Taxon::raw(slug, taxon_type, aggregation.clone());
        (
            PreFormula::new(column.clone(), slug, Some(aggregation)),
            (PostFormula::new(column, None, BTreeSet::new()), taxon),
        )
    }

    fn plan() -> TelPlan {
        let (date_pre, date_post) = raw("date", TaxonType::Dimension, AggregationDefinition::group_by());
        let (name_pre, name_post) = raw("ad_name", TaxonType::Dimension, AggregationDefinition::group_by());
        let (spend_pre, spend_post) = raw("spend", TaxonType::Metric, AggregationDefinition::sum());
        TelPlan {
            metric_pre: vec![date_pre, name_pre, spend_pre.clone(), spend_pre],
            metric_post: vec![date_post, name_post, spend_post],
            ..Default::default()
        }
    }

    fn dataframe() -> Dataframe {
        let names = ["ad_name", "date", "spend"];
        let query = Query::new()
            .select(names.iter().map(|n| col(n).alias(n)).collect::<Vec<_>>())
            .from(TableRef::new("blended"));
        let columns = names
            .iter()
            .map(|n| (n.to_string(), DataframeColumn::new(n, n, ValueQuantityType::Scalar)))
            .collect();
        Dataframe::new(query, columns, BTreeSet::new(), BTreeSet::new())
    }

    #[test]
    fn test_group_by_dimensions_and_sum_metrics() {
        let result = metric_phase(dataframe(), &plan(), None, None).unwrap();
        assert_eq!(result.query.output_names(), vec!["ad_name", "date", "spend"]);
        let sql = result.query.to_sql(Dialect::Snowflake);
        assert!(sql.contains("SUM(\"spend\") AS \"spend\""), "{sql}");
        assert!(sql.contains("GROUP BY \"ad_name\", \"date\""), "{sql}");
        assert_eq!(sql.matches("SUM(").count(), 1, "{sql}");
    }

    #[test]
    fn test_grouping_sets_union_with_placeholder() {
        let sets = vec![vec!["date".to_string()], vec!["date".to_string(), "ad_name".to_string()]];
        let result = metric_phase(dataframe(), &plan(), Some(&sets), None).unwrap();
        let sql = result.query.to_sql(Dialect::Snowflake);
        assert!(sql.contains("\"__cte_grouping_sets\" AS ("), "{sql}");
        assert_eq!(sql.matches("\"__cte_grouping_sets\" AS (").count(), 1, "{sql}");
        assert!(sql.contains("'PANORAMIC_GROUPINGSETS_NULL' AS \"ad_name\""), "{sql}");
        assert!(sql.contains("UNION ALL"), "{sql}");
    }

    #[test]
    fn test_filters_apply_after_aggregation() {
        let filter = FilterClause::value("spend", SimpleFilterOperator::Gt, 100i64);
        let result = metric_phase(dataframe(), &plan(), None, Some(&filter)).unwrap();
        let sql = result.query.to_sql(Dialect::Snowflake);
        assert!(sql.contains("\"metric_result\""), "{sql}");
        assert!(sql.contains("WHERE \"spend\" > 100"), "{sql}");
    }
}
