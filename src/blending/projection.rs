//! Final projection: the requested taxons in the requested order.

use std::collections::BTreeMap;

use tracing::debug;

use super::dataframe::{Dataframe, DataframeColumn};
use super::request::TaxonDataOrder;
use crate::error::{HuskyError, Result};
use crate::model::ValueQuantityType;
use crate::sql::{cast, col, sort_select, CastType, ExprExt, OrderByExpr, Query, TableRef};
use crate::taxonomy::{sql_friendly_slug, TaxonMap, TaxonOrderType};

const PROJECTION_SOURCE_ALIAS: &str = "projection_source";

/// Selects `return_taxons` from `df`, ordered and limited.
///
/// Array columns are cast to text. Every ordered taxon must be returned.
pub fn project(
    df: Dataframe,
    return_taxons: &TaxonMap,
    order_by: &[TaxonDataOrder],
    limit: Option<u64>,
    offset: Option<u64>,
) -> Result<Dataframe> {
    let order_by = order_by
        .iter()
        .map(|order| {
            let taxon = return_taxons.get(&sql_friendly_slug(&order.taxon)).ok_or_else(|| {
                HuskyError::invalid_request(format!(
                    "Taxon \"{}\" used in order_by clause must be also selected.",
                    order.taxon
                ))
            })?;
            let column = col(&taxon.safe_slug());
            Ok(match order.order_type {
                TaxonOrderType::Asc => OrderByExpr::asc(column),
                TaxonOrderType::Desc => OrderByExpr::desc(column),
            }
            .nulls_last())
        })
        .collect::<Result<Vec<_>>>()?;

    let mut select = Vec::with_capacity(return_taxons.len());
    let mut slug_to_column = BTreeMap::new();
    for taxon in return_taxons.values() {
        let name = taxon.safe_slug();
        let source = df.slug_to_column.get(&taxon.slug).ok_or_else(|| {
            HuskyError::internal(format!("Taxon \"{}\" was not computed", taxon.slug))
        })?;
        let column = match source.quantity_type {
            ValueQuantityType::Array => cast(col(&source.name), CastType::Text),
            ValueQuantityType::Scalar => col(&source.name),
        };
        select.push(column.alias(&name));
        slug_to_column.insert(
            taxon.slug.clone(),
            DataframeColumn::new(&name, &taxon.slug, ValueQuantityType::Scalar),
        );
    }

    let mut query = Query::new()
        .select(sort_select(select))
        .from(TableRef::subquery(df.query.clone(), PROJECTION_SOURCE_ALIAS))
        .order_by(order_by);
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    if let Some(offset) = offset {
        query = query.offset(offset);
    }
    debug!(columns = slug_to_column.len(), ?limit, ?offset, "projected result");
    Ok(df.derive(query, slug_to_column))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::identifier::safe_identifier;
    use crate::sql::Dialect;
    use crate::taxonomy::{AggregationDefinition, Taxon, TaxonType};

    fn dataframe() -> Dataframe {
        let columns = [
            ("fb|spend", ValueQuantityType::Scalar),
            ("fb|tags", ValueQuantityType::Array),
            ("fb|clicks", ValueQuantityType::Scalar),
        ]
        .into_iter()
        .map(|(slug, quantity)| {
            (slug.to_string(), DataframeColumn::new(&safe_identifier(slug), slug, quantity))
        })
        .collect();
        Dataframe::new(
            Query::new().from(TableRef::new("metrics")),
            columns,
            BTreeSet::new(),
            BTreeSet::new(),
        )
    }

    fn return_taxons() -> TaxonMap {
        [
            Taxon::raw("fb|spend", TaxonType::Metric, AggregationDefinition::sum()),
            Taxon::raw("fb|tags", TaxonType::Dimension, AggregationDefinition::group_by()),
        ]
        .into_iter()
        .map(|t| (t.slug.clone(), t))
        .collect()
    }

    #[test]
    fn test_projection_casts_arrays_and_orders() {
        let projected = project(
            dataframe(),
            &return_taxons(),
            &[TaxonDataOrder::desc("fb|spend")],
            Some(10),
            Some(20),
        )
        .unwrap();
        assert_eq!(
            projected.slug_to_column.keys().collect::<Vec<_>>(),
            vec!["fb|spend", "fb|tags"]
        );
        let sql = projected.query.to_sql(Dialect::Snowflake);
        let tags = safe_identifier("fb|tags");
        let spend = safe_identifier("fb|spend");
        assert!(sql.contains(&format!("CAST(\"{tags}\" AS")), "{sql}");
        assert!(sql.contains(&format!("\"{spend}\" DESC NULLS LAST")), "{sql}");
        assert!(sql.contains("LIMIT 10"), "{sql}");
        assert!(sql.contains("OFFSET 20"), "{sql}");
        assert!(!sql.contains(&safe_identifier("fb|clicks")), "{sql}");
    }

    #[test]
    fn test_order_by_must_be_selected() {
        let err = project(
            dataframe(),
            &return_taxons(),
            &[TaxonDataOrder::asc("fb|clicks")],
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid request: Taxon \"fb|clicks\" used in order_by clause must be also selected."
        );
    }
}
