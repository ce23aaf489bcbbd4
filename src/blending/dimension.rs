//! Dimension phase: dimension formulas spanning data sources, over the blended rows.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::dataframe::Dataframe;
use super::override_mapping::OverrideMappingManager;
use crate::error::Result;
use crate::sql::{col, sort_select, ExprExt, Query, SelectExpr, TableRef};
use crate::tel::{OverrideMappingTelInfo, PreFormula};

const DIMENSION_SOURCE_ALIAS: &str = "dimension_source";

/// Adds `formulas` as columns next to every column of `df`.
///
/// The override mappings the formulas read are joined in. Nothing to add returns `df`.
pub fn dimension_phase(
    df: Dataframe,
    formulas: &[PreFormula],
    override_mappings: &BTreeSet<OverrideMappingTelInfo>,
    overrides: &OverrideMappingManager,
) -> Result<Dataframe> {
    if formulas.is_empty() {
        return Ok(df);
    }
    let mut select: BTreeMap<String, SelectExpr> = df
        .query
        .output_names()
        .into_iter()
        .map(|name| (name.clone(), col(&name).alias(&name)))
        .collect();
    for formula in formulas {
        select
            .entry(formula.label.clone())
            .or_insert_with(|| formula.formula.clone().alias(&formula.label));
    }
    debug!(
        formulas = formulas.len(),
        override_mappings = override_mappings.len(),
        "dimension phase"
    );
    let query = Query::new()
        .select(sort_select(select.into_values().collect()))
        .from(TableRef::subquery(df.query.clone(), DIMENSION_SOURCE_ALIAS));
    let query = overrides.insert_joins(query, override_mappings)?;
    Ok(df.derive(query, df.slug_to_column.clone()))
}
