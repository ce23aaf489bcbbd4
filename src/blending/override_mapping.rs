//! Override mapping CTEs and their joins.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{HuskyError, Result};
use crate::identifier::safe_identifier;
use crate::sql::{
    cast, lit_bool, lit_null, lit_str, table_col, CastType, Cte, ExprExt, JoinType, Query, TableRef,
};
use crate::taxonomy::{OverrideMapping, OverrideMappingLoader};
use crate::tel::{
    OverrideMappingTelInfo, OVERRIDE_CHANGED_COLUMN, OVERRIDE_NULL_VALUE, OVERRIDE_ORIGINAL_COLUMN,
};

/// Name of the CTE holding one mapping's values.
pub fn override_cte_name(slug: &str) -> String {
    safe_identifier(&format!("__om_{slug}"))
}

/// Constant table of a mapping: one `(original, changed)` row per pair.
///
/// NULL changed values are stored as [`OVERRIDE_NULL_VALUE`].
pub fn render_direct_mapping(mapping: &OverrideMapping) -> Query {
    let rows: Vec<Query> = mapping
        .definition
        .iter()
        .map(|(original, changed)| {
            let original = match original {
                Some(value) => lit_str(value),
                None => cast(lit_null(), CastType::Text),
            };
            let changed = lit_str(changed.as_deref().unwrap_or(OVERRIDE_NULL_VALUE));
            Query::new().select(vec![
                original.alias(OVERRIDE_ORIGINAL_COLUMN),
                changed.alias(OVERRIDE_CHANGED_COLUMN),
            ])
        })
        .collect();
    if rows.is_empty() {
        return Query::new()
            .select(vec![
                cast(lit_null(), CastType::Text).alias(OVERRIDE_ORIGINAL_COLUMN),
                cast(lit_null(), CastType::Text).alias(OVERRIDE_CHANGED_COLUMN),
            ])
            .filter(lit_bool(false));
    }
    Query::union_all(rows)
}

/// Mappings used by a request and the CTEs rendering them.
#[derive(Debug, Clone, Default)]
pub struct OverrideMappingManager {
    ctes: BTreeMap<String, Cte>,
}

impl OverrideMappingManager {
    /// Loads every mapping referenced by the main or the comparison plan.
    pub fn load<'i>(
        loader: &dyn OverrideMappingLoader,
        company_id: &str,
        infos: impl IntoIterator<Item = &'i OverrideMappingTelInfo>,
        max_mappings: usize,
    ) -> Result<Self> {
        let slugs: BTreeSet<String> = infos
            .into_iter()
            .map(|info| info.override_mapping_slug.clone())
            .collect();
        if slugs.is_empty() {
            return Ok(Self::default());
        }
        if slugs.len() > max_mappings {
            return Err(HuskyError::TooManyOverrideMappings {
                count: slugs.len(),
                max: max_mappings,
            });
        }
        let mappings = loader.load_override_mappings(&slugs, company_id)?;
        debug!(company = company_id, ?slugs, "loaded override mappings");
        let ctes = mappings
            .iter()
            .map(|m| {
                let cte = Cte::new(&override_cte_name(&m.slug), render_direct_mapping(m));
                (m.slug.clone(), cte)
            })
            .collect();
        Ok(Self { ctes })
    }

    /// Joins the mapping CTE of every info to `query`, sorted by info.
    ///
    /// Mappings keeping missing values are left joined, the rest inner joined.
    pub fn insert_joins<'i>(
        &self,
        mut query: Query,
        infos: impl IntoIterator<Item = &'i OverrideMappingTelInfo>,
    ) -> Result<Query> {
        let infos: BTreeSet<&OverrideMappingTelInfo> = infos.into_iter().collect();
        for info in infos {
            let cte = self.ctes.get(&info.override_mapping_slug).ok_or_else(|| {
                HuskyError::internal(format!(
                    "Override mapping \"{}\" was not loaded",
                    info.override_mapping_slug
                ))
            })?;
            let identifier = info.identifier();
            let mapped = table_col(&identifier, OVERRIDE_ORIGINAL_COLUMN);
            let on = mapped
                .clone()
                .eq(info.original.clone())
                .or(mapped.is_null().and(info.original.clone().is_null()));
            let join_type = if info.include_missing_values {
                JoinType::Left
            } else {
                JoinType::Inner
            };
            query = query
                .join(join_type, TableRef::new(&cte.name).with_alias(&identifier), on)
                .with_cte(cte.clone());
        }
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{col, Dialect};
    use crate::taxonomy::OverrideMappingStore;

    fn info(slug: &str, include_missing_values: bool) -> OverrideMappingTelInfo {
        OverrideMappingTelInfo {
            column: "\"gender\"".into(),
            original: col("gender"),
            override_mapping_slug: slug.into(),
            include_missing_values,
        }
    }

    fn store() -> OverrideMappingStore {
        OverrideMappingStore::new(vec![
            OverrideMapping::new("gender", "50", &[(Some("m"), Some("male")), (None, None)]),
            OverrideMapping::new("empty", "50", &[]),
        ])
        .unwrap()
    }

    #[test]
    fn test_direct_mapping_rows() {
        let mapping = OverrideMapping::new("gender", "50", &[(Some("m"), Some("male")), (None, None)]);
        let sql = render_direct_mapping(&mapping).to_sql(Dialect::Snowflake);
        assert!(sql.contains("'m' AS \"original\""), "{sql}");
        assert!(sql.contains("'male' AS \"changed\""), "{sql}");
        assert!(sql.contains("'--PANO-NULL--' AS \"changed\""), "{sql}");
        assert!(sql.contains("UNION ALL"), "{sql}");
    }

    #[test]
    fn test_empty_mapping_has_no_rows() {
        let mapping = OverrideMapping::new("empty", "50", &[]);
        let sql = render_direct_mapping(&mapping).to_sql(Dialect::Snowflake);
        assert!(sql.contains("WHERE false"), "{sql}");
    }

    #[test]
    fn test_join_type_follows_missing_values_flag() {
        let infos = [info("gender", true), info("empty", false)];
        let manager = OverrideMappingManager::load(&store(), "50", &infos, 10).unwrap();
        let query = Query::new()
            .select(vec![col("gender")])
            .from(TableRef::new("data"));
        let query = manager.insert_joins(query, &infos).unwrap();

        assert_eq!(query.joins.len(), 2);
        assert_eq!(query.joins[0].join_type, JoinType::Inner);
        assert_eq!(query.joins[1].join_type, JoinType::Left);
        let sql = query.to_sql(Dialect::Snowflake);
        assert!(sql.contains(&format!("\"{}\" AS (", override_cte_name("gender"))), "{sql}");
        assert!(sql.contains("IS NULL"), "{sql}");
    }

    #[test]
    fn test_too_many_mappings() {
        let infos = [info("gender", true), info("empty", false)];
        let err = OverrideMappingManager::load(&store(), "50", &infos, 1).unwrap_err();
        assert!(matches!(
            err,
            HuskyError::TooManyOverrideMappings { count: 2, max: 1 }
        ));
    }

    #[test]
    fn test_no_mappings_skip_loading() {
        let manager = OverrideMappingManager::load(&store(), "other", [], 10).unwrap();
        let query = manager.insert_joins(Query::new(), []).unwrap();
        assert!(query.joins.is_empty());
    }
}
