//! Evaluation results of TEL nodes and the final rendering contract handed to the planner.

use std::collections::{BTreeMap, BTreeSet};

use crate::identifier::safe_identifier;
use crate::sql::{col, lit_null, Expr};
use crate::taxonomy::{AggregationDefinition, Taxon, TaxonMap};

use super::phase::TelPhase;
use super::types::{TelDataType, TelType};

/// Placeholder substituted with the request dimension columns (window partitions).
pub const DIMENSION_SLUGS_TEMPLATE: &str = "dimension_slugs";

/// Column computed before the aggregation it feeds.
#[derive(Debug, Clone, PartialEq)]
pub struct PreFormula {
    pub formula: Expr,
    /// Temporary column name the post formula refers to.
    pub label: String,
    pub aggregation: AggregationDefinition,
}

impl PreFormula {
    /// Missing aggregation defaults to `sum`.
    pub fn new(formula: Expr, label: &str, aggregation: Option<AggregationDefinition>) -> Self {
        Self {
            formula,
            label: safe_identifier(label),
            aggregation: aggregation.unwrap_or_else(AggregationDefinition::sum),
        }
    }
}

/// Dimension formula pushed down into the query of a single data source.
///
/// The template references taxons of that data source through [`Expr::Template`]
/// placeholders named by slug; they are replaced by the source's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFormulaTemplate {
    pub template: Expr,
    pub label: String,
    pub data_source: String,
    pub used_taxons: BTreeSet<String>,
}

impl SqlFormulaTemplate {
    pub fn new(template: Expr, label: &str, data_source: &str, used_taxons: BTreeSet<String>) -> Self {
        Self {
            template,
            label: safe_identifier(label),
            data_source: data_source.to_string(),
            used_taxons,
        }
    }

    pub fn render(&self, columns: &BTreeMap<String, Expr>) -> Expr {
        self.template.substitute(&|slug| columns.get(slug).cloned())
    }
}

/// Formula evaluated after aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct PostFormula {
    pub sql: Expr,
    pub template: Option<Expr>,
    /// Columns left out of the dimension list rendered into the template.
    pub exclude_slugs: BTreeSet<String>,
}

impl PostFormula {
    pub fn new(sql: Expr, template: Option<Expr>, exclude_slugs: BTreeSet<String>) -> Self {
        Self {
            sql,
            template,
            exclude_slugs,
        }
    }

    /// Renders the formula for the dimension columns of the aggregation query.
    pub fn render(&self, dimension_columns: &BTreeSet<String>) -> Expr {
        let dimensions: Vec<Expr> = dimension_columns
            .difference(&self.exclude_slugs)
            .map(|name| col(name))
            .collect();
        match &self.template {
            Some(template) if !dimensions.is_empty() => {
                let list = Expr::List(dimensions);
                template.substitute(&|name| (name == DIMENSION_SLUGS_TEMPLATE).then(|| list.clone()))
            }
            _ => self.sql.clone(),
        }
    }
}

/// Override mapping referenced by an `override()` call.
///
/// Identified by `(column, override_mapping_slug, include_missing_values)`.
#[derive(Debug, Clone)]
pub struct OverrideMappingTelInfo {
    /// Original dimension SQL (Snowflake rendering).
    pub column: String,
    /// Original dimension, joined with the mapping's original values.
    pub original: Expr,
    pub override_mapping_slug: String,
    pub include_missing_values: bool,
}

impl OverrideMappingTelInfo {
    pub fn identifier(&self) -> String {
        override_identifier(&self.column, &self.override_mapping_slug, self.include_missing_values)
    }

    fn key(&self) -> (&str, &str, bool) {
        (&self.column, &self.override_mapping_slug, self.include_missing_values)
    }
}

impl PartialEq for OverrideMappingTelInfo {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for OverrideMappingTelInfo {}

impl PartialOrd for OverrideMappingTelInfo {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OverrideMappingTelInfo {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Column of an override mapping CTE holding the original value.
pub const OVERRIDE_ORIGINAL_COLUMN: &str = "original";

/// Column of an override mapping CTE holding the replacement value.
pub const OVERRIDE_CHANGED_COLUMN: &str = "changed";

/// Stands in for NULL in mapping values, so a mapping can turn a value into NULL.
pub const OVERRIDE_NULL_VALUE: &str = "--PANO-NULL--";

/// Alias of the joined override mapping CTE for one (column, mapping, flag) triple.
pub fn override_identifier(column: &str, slug: &str, include_missing_values: bool) -> String {
    let flag = if include_missing_values { "True" } else { "False" };
    safe_identifier(&format!("__om_{column}_{slug}_{flag}"))
}

/// Taxons referenced by an expression, split by optionality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsedTaxonsContainer {
    pub required: TaxonMap,
    pub optional: TaxonMap,
}

impl UsedTaxonsContainer {
    pub fn optional(taxon: &Taxon) -> Self {
        let mut result = Self::default();
        result.optional.insert(taxon.slug.clone(), taxon.clone());
        result
    }

    pub fn required(taxon: &Taxon) -> Self {
        let mut result = Self::default();
        result.required.insert(taxon.slug.clone(), taxon.clone());
        result
    }

    pub fn update_from(&mut self, other: UsedTaxonsContainer) {
        self.required.extend(other.required);
        self.optional.extend(other.optional);
    }

    pub fn merge(mut left: UsedTaxonsContainer, right: UsedTaxonsContainer) -> Self {
        left.update_from(right);
        left
    }

    pub fn has_some(&self) -> bool {
        !self.required.is_empty() || !self.optional.is_empty()
    }

    /// Required taxons win over optional ones with the same slug.
    pub fn all_taxons(&self) -> TaxonMap {
        let mut all = self.optional.clone();
        all.extend(self.required.iter().map(|(k, v)| (k.clone(), v.clone())));
        all
    }

    pub fn required_slugs(&self) -> BTreeSet<String> {
        self.required.keys().cloned().collect()
    }

    pub fn optional_slugs(&self) -> BTreeSet<String> {
        self.optional.keys().cloned().collect()
    }
}

/// Slugs referenced by an expression, split by optionality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsedTaxonSlugsContainer {
    pub required_slugs: BTreeSet<String>,
    pub optional_slugs: BTreeSet<String>,
}

impl UsedTaxonSlugsContainer {
    pub fn add_slug(&mut self, slug: &str, optional: bool) {
        if optional {
            self.optional_slugs.insert(slug.to_string());
        } else {
            self.required_slugs.insert(slug.to_string());
        }
    }

    pub fn update_from(&mut self, other: &UsedTaxonSlugsContainer) {
        self.required_slugs.extend(other.required_slugs.iter().cloned());
        self.optional_slugs.extend(other.optional_slugs.iter().cloned());
    }

    pub fn has_some(&self) -> bool {
        !self.required_slugs.is_empty() || !self.optional_slugs.is_empty()
    }

    pub fn all_slugs(&self) -> BTreeSet<String> {
        self.required_slugs
            .union(&self.optional_slugs)
            .cloned()
            .collect()
    }
}

impl From<&UsedTaxonsContainer> for UsedTaxonSlugsContainer {
    fn from(container: &UsedTaxonsContainer) -> Self {
        Self {
            required_slugs: container.required_slugs(),
            optional_slugs: container.optional_slugs(),
        }
    }
}

/// Output of evaluating a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct TelQueryResult {
    pub sql: Expr,
    /// Variant of `sql` containing placeholders resolved by later pipeline stages.
    pub template: Option<Expr>,
    pub aggregations: Vec<PreFormula>,
    pub dimension_formulas: Vec<PreFormula>,
    pub data_source_formula_templates: Vec<SqlFormulaTemplate>,
    pub override_mappings: BTreeSet<OverrideMappingTelInfo>,
    pub exclude_slugs: BTreeSet<String>,
    pub label: Option<String>,
}

impl TelQueryResult {
    pub fn new(sql: Expr) -> Self {
        Self {
            sql,
            template: None,
            aggregations: vec![],
            dimension_formulas: vec![],
            data_source_formula_templates: vec![],
            override_mappings: BTreeSet::new(),
            exclude_slugs: BTreeSet::new(),
            label: None,
        }
    }

    pub fn with_template(mut self, template: Expr) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(safe_identifier(label));
        self
    }

    /// Combines the formulas collected by `others` under a new SQL fragment.
    pub fn merge<'r>(
        sql: Expr,
        template: Option<Expr>,
        others: impl IntoIterator<Item = Option<&'r TelQueryResult>>,
    ) -> Self {
        let mut result = TelQueryResult::new(sql);
        result.template = template;
        for other in others.into_iter().flatten() {
            result.aggregations.extend(other.aggregations.iter().cloned());
            result
                .dimension_formulas
                .extend(other.dimension_formulas.iter().cloned());
            result
                .data_source_formula_templates
                .extend(other.data_source_formula_templates.iter().cloned());
            result
                .override_mappings
                .extend(other.override_mappings.iter().cloned());
            result.exclude_slugs.extend(other.exclude_slugs.iter().cloned());
        }
        result
    }

    /// Replaces the SQL fragment and template, keeping everything collected so far.
    pub fn update(mut self, sql: Expr, template: Option<Expr>) -> Self {
        self.sql = sql;
        if template.is_some() {
            self.template = template;
        }
        self
    }

    pub fn template_or_sql(&self) -> &Expr {
        self.template.as_ref().unwrap_or(&self.sql)
    }

    /// Applies `f` to both the SQL and the template (or SQL) of this result.
    pub fn map_both(&self, f: impl Fn(Expr) -> Expr) -> (Expr, Expr) {
        (f(self.sql.clone()), f(self.template_or_sql().clone()))
    }
}

/// Final output of rendering a TEL expression in the taxon dialect.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprResult {
    pub pre_formulas: Vec<PreFormula>,
    pub post_formula: PostFormula,
    pub dimension_formulas: Vec<PreFormula>,
    pub data_source_formula_templates: Vec<SqlFormulaTemplate>,
    pub phase: TelPhase,
    pub used_taxons: UsedTaxonSlugsContainer,
    pub invalid_value: bool,
    pub return_data_sources: BTreeSet<Option<String>>,
    pub return_type: TelType,
    pub template_slugs: BTreeSet<String>,
    pub override_mappings: BTreeSet<OverrideMappingTelInfo>,
}

impl ExprResult {
    /// Post formula without dimension substitution, NULL for invalid expressions.
    pub fn sql(&self) -> Expr {
        if self.invalid_value {
            return lit_null();
        }
        self.post_formula.render(&BTreeSet::new())
    }
}

impl Default for ExprResult {
    fn default() -> Self {
        Self {
            pre_formulas: vec![],
            post_formula: PostFormula::new(lit_null(), None, BTreeSet::new()),
            dimension_formulas: vec![],
            data_source_formula_templates: vec![],
            phase: TelPhase::Any,
            used_taxons: UsedTaxonSlugsContainer::default(),
            invalid_value: false,
            return_data_sources: BTreeSet::new(),
            return_type: TelType::constant(TelDataType::Any),
            template_slugs: BTreeSet::new(),
            override_mappings: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{func, template, Dialect, ExprExt, WindowExt};

    #[test]
    fn test_pre_formula_defaults_to_sum() {
        let formula = PreFormula::new(col("spend"), "__cpm1", None);
        assert_eq!(formula.aggregation, AggregationDefinition::sum());
        assert_eq!(formula.label, "__cpm1");
    }

    #[test]
    fn test_post_formula_renders_dimension_list() {
        let window = func("sum", vec![col("spend")])
            .over()
            .partition_by(vec![template(DIMENSION_SLUGS_TEMPLATE)])
            .build();
        let post = PostFormula::new(
            col("spend"),
            Some(window),
            BTreeSet::from(["date".to_string()]),
        );
        let dims: BTreeSet<String> = ["date", "campaign", "ad"].iter().map(|s| s.to_string()).collect();
        insta::assert_snapshot!(
            post.render(&dims).to_sql(Dialect::Snowflake),
            @r#"SUM("spend") OVER (PARTITION BY "ad", "campaign")"#
        );

        let only_excluded = BTreeSet::from(["date".to_string()]);
        assert_eq!(post.render(&only_excluded), col("spend"));
    }

    #[test]
    fn test_merge_collects_children() {
        let mut left = TelQueryResult::new(col("a"));
        left.aggregations.push(PreFormula::new(col("a"), "__x1", None));
        let mut right = TelQueryResult::new(col("b"));
        right.exclude_slugs.insert("date".into());

        let merged = TelQueryResult::merge(col("a").add(col("b")), None, [Some(&left), None, Some(&right)]);
        assert_eq!(merged.aggregations.len(), 1);
        assert!(merged.exclude_slugs.contains("date"));
        assert_eq!(merged.label, None);
    }

    #[test]
    fn test_required_taxons_override_optional() {
        let spend = Taxon::computed("spend", crate::taxonomy::TaxonType::Metric, "1");
        let mut used = UsedTaxonsContainer::optional(&spend);
        used.update_from(UsedTaxonsContainer::required(&spend));
        assert_eq!(used.all_taxons().len(), 1);

        let slugs = UsedTaxonSlugsContainer::from(&used);
        assert!(slugs.required_slugs.contains("spend"));
        assert_eq!(slugs.all_slugs().len(), 1);
    }

    #[test]
    fn test_override_identifier() {
        let id = override_identifier("\"gender\"", "gender_map", true);
        assert!(id.starts_with("__om__gender__gender_map_true_"), "{id}");
    }
}
