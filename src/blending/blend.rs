//! Combining dataframes: the blend of per-source dataframes and the comparison join.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::dataframe::{Dataframe, DataframeColumn};
use super::planner::TelPlan;
use crate::error::{HuskyError, Result};
use crate::identifier::COMPARISON_PREFIX;
use crate::sql::{
    col, lit_bool, lit_null, sort_select, sum, table_col, ExprExt, Query, SelectExpr, TableRef,
};
use crate::taxonomy::TaxonMap;
use crate::tel::SqlFormulaTemplate;

const BLEND_ALIAS: &str = "blended";
const DATA_ALIAS: &str = "data_dataframe";
const COMPARISON_ALIAS: &str = "comparison_dataframe";

/// Blends per-source dataframes into one, aggregated over the shared dimensions.
///
/// Every source contributes a `UNION ALL` branch with NULL for the taxons it lacks.
/// Dimensions and dimension template labels are grouped, metrics summed.
pub fn blend(
    dataframes: Vec<Dataframe>,
    templates: &BTreeMap<String, Vec<SqlFormulaTemplate>>,
    taxons: &TaxonMap,
) -> Result<Dataframe> {
    if dataframes.is_empty() {
        return Err(HuskyError::internal("Nothing to blend"));
    }
    let mut slug_to_column: BTreeMap<String, DataframeColumn> = BTreeMap::new();
    let mut used_model_names = BTreeSet::new();
    let mut used_physical_data_sources = BTreeSet::new();
    for df in &dataframes {
        slug_to_column.extend(df.slug_to_column.clone());
        used_model_names.extend(df.used_model_names.iter().cloned());
        used_physical_data_sources.extend(df.used_physical_data_sources.iter().cloned());
    }
    let labels: BTreeSet<&str> = templates
        .values()
        .flatten()
        .map(|t| t.label.as_str())
        .collect();

    let branches: Vec<Query> = dataframes
        .into_iter()
        .enumerate()
        .map(|(idx, df)| {
            let outputs: BTreeSet<String> = df.query.output_names().into_iter().collect();
            let mut select: Vec<SelectExpr> = slug_to_column
                .iter()
                .map(|(slug, column)| {
                    let value = if df.slug_to_column.contains_key(slug) {
                        col(&column.name)
                    } else {
                        lit_null()
                    };
                    value.alias(&column.name)
                })
                .collect();
            select.extend(labels.iter().map(|label| {
                let value = if outputs.contains(*label) { col(label) } else { lit_null() };
                value.alias(label)
            }));
            Query::new()
                .select(sort_select(select))
                .from(TableRef::subquery(df.query, &format!("q{idx}")))
        })
        .collect();
    let branch_count = branches.len();

    let mut select = Vec::new();
    let mut group_by = Vec::new();
    for (slug, column) in &slug_to_column {
        let taxon = taxons
            .get(slug)
            .ok_or_else(|| HuskyError::internal(format!("Blended taxon \"{slug}\" was not loaded")))?;
        if taxon.is_dimension() {
            select.push(col(&column.name).alias(&column.name));
            group_by.push(col(&column.name));
        } else {
            select.push(sum(col(&column.name)).alias(&column.name));
        }
    }
    for label in &labels {
        select.push(col(label).alias(label));
        group_by.push(col(label));
    }
    let query = Query::new()
        .select(sort_select(select))
        .from(TableRef::subquery(Query::union_all(branches), BLEND_ALIAS))
        .group_by(group_by);
    debug!(
        dataframes = branch_count,
        columns = slug_to_column.len(),
        templates = labels.len(),
        "blended dataframes"
    );
    Ok(Dataframe::new(
        query,
        slug_to_column,
        used_model_names,
        used_physical_data_sources,
    ))
}

/// Left joins the comparison dataframe to the data on the comparison join columns.
///
/// NULLs match NULLs. Without join columns every data row gets every comparison row.
pub fn left_join(data: Dataframe, comparison: Dataframe, plan: &TelPlan) -> Dataframe {
    let mut select: BTreeMap<String, SelectExpr> = BTreeMap::new();
    for column in data.slug_to_column.values() {
        select.insert(
            column.name.clone(),
            table_col(DATA_ALIAS, &column.name).alias(&column.name),
        );
    }
    for (slug, column) in &comparison.slug_to_column {
        if slug.starts_with(COMPARISON_PREFIX) {
            select.insert(
                column.name.clone(),
                table_col(COMPARISON_ALIAS, &column.name).alias(&column.name),
            );
        }
    }
    for formula in &plan.dimension_formulas {
        select.insert(
            formula.label.clone(),
            table_col(DATA_ALIAS, &formula.label).alias(&formula.label),
        );
    }

    let on = plan
        .comparison_join_columns
        .iter()
        .map(|name| {
            let left = table_col(DATA_ALIAS, name);
            let right = table_col(COMPARISON_ALIAS, name);
            left.clone()
                .eq(right.clone())
                .or(left.is_null().and(right.is_null()))
        })
        .reduce(|on, condition| on.and(condition))
        .unwrap_or_else(|| lit_bool(true));

    let mut slug_to_column = data.slug_to_column.clone();
    slug_to_column.extend(comparison.slug_to_column.clone());
    let used_model_names = data
        .used_model_names
        .union(&comparison.used_model_names)
        .cloned()
        .collect();
    let used_physical_data_sources = data
        .used_physical_data_sources
        .union(&comparison.used_physical_data_sources)
        .cloned()
        .collect();
    let query = Query::new()
        .select(sort_select(select.into_values().collect()))
        .from(TableRef::subquery(data.query, DATA_ALIAS))
        .left_join(TableRef::subquery(comparison.query, COMPARISON_ALIAS), on);
    Dataframe::new(query, slug_to_column, used_model_names, used_physical_data_sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{comparison_slug, safe_identifier};
    use crate::model::ValueQuantityType;
    use crate::sql::Dialect;
    use crate::taxonomy::{AggregationDefinition, Taxon, TaxonType};

    fn dataframe(alias: &str, slugs: &[&str], labels: &[&str]) -> Dataframe {
        let mut select: Vec<SelectExpr> = slugs
            .iter()
            .map(|s| col(&safe_identifier(s)).alias(&safe_identifier(s)))
            .collect();
        select.extend(labels.iter().map(|l| col(l).alias(l)));
        let columns = slugs
            .iter()
            .map(|s| {
                let column = DataframeColumn::new(&safe_identifier(s), s, ValueQuantityType::Scalar);
                (s.to_string(), column)
            })
            .collect();
        Dataframe::new(
            Query::new().select(select).from(TableRef::new(alias)),
            columns,
            BTreeSet::from([format!("{alias}_model")]),
            BTreeSet::from([alias.to_string()]),
        )
    }

    fn taxons() -> TaxonMap {
        [
            Taxon::raw("date", TaxonType::Dimension, AggregationDefinition::group_by()),
            Taxon::raw("fb|spend", TaxonType::Metric, AggregationDefinition::sum()),
            Taxon::raw("tw|spend", TaxonType::Metric, AggregationDefinition::sum()),
        ]
        .into_iter()
        .map(|t| (t.slug.clone(), t))
        .collect()
    }

    #[test]
    fn test_blend_fills_missing_columns_with_null() {
        let fb = dataframe("fb", &["date", "fb|spend"], &["fb_label"]);
        let tw = dataframe("tw", &["date", "tw|spend"], &[]);
        let templates = BTreeMap::from([(
            "fb".to_string(),
            vec![SqlFormulaTemplate::new(col("x"), "fb_label", "fb", BTreeSet::new())],
        )]);
        let blended = blend(vec![fb, tw], &templates, &taxons()).unwrap();

        assert_eq!(
            blended.slug_to_column.keys().collect::<Vec<_>>(),
            vec!["date", "fb|spend", "tw|spend"]
        );
        assert_eq!(blended.used_physical_data_sources.len(), 2);
        let sql = blended.query.to_sql(Dialect::Snowflake);
        assert!(sql.contains("UNION ALL"), "{sql}");
        assert!(sql.contains("NULL AS \"fb_label\""), "{sql}");
        assert!(sql.contains(&format!("SUM(\"{}\")", safe_identifier("tw|spend"))), "{sql}");
        assert!(sql.contains("GROUP BY \"date\", \"fb_label\""), "{sql}");
    }

    #[test]
    fn test_blend_requires_loaded_taxons() {
        let df = dataframe("fb", &["fb|clicks"], &[]);
        let err = blend(vec![df], &BTreeMap::new(), &taxons()).unwrap_err();
        assert!(matches!(err, HuskyError::Internal(_)));
    }

    #[test]
    fn test_left_join_on_null_safe_columns() {
        let data = dataframe("data", &["date", "fb|spend"], &[]);
        let comparison_spend = comparison_slug("fb|spend");
        let comparison = dataframe("comp", &["date", comparison_spend.as_str()], &[]);
        let plan = TelPlan {
            comparison_join_columns: vec!["date".into()],
            ..Default::default()
        };
        let joined = left_join(data, comparison, &plan);

        assert!(joined.slug_to_column.contains_key(&comparison_spend));
        let sql = joined.query.to_sql(Dialect::Snowflake);
        assert!(sql.contains("LEFT JOIN"), "{sql}");
        assert!(
            sql.contains("\"data_dataframe\".\"date\" IS NULL AND \"comparison_dataframe\".\"date\" IS NULL"),
            "{sql}"
        );
        assert_eq!(
            joined.query.output_names(),
            vec![
                "date".to_string(),
                safe_identifier(&comparison_spend),
                safe_identifier("fb|spend"),
            ]
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_left_join_without_columns_joins_everything() {
        let data = dataframe("data", &["fb|spend"], &[]);
        let comparison = dataframe("comp", &[], &[]);
        let joined = left_join(data, comparison, &TelPlan::default());
        let sql = joined.query.to_sql(Dialect::Snowflake);
        assert!(sql.contains("ON true"), "{sql}");
    }
}
