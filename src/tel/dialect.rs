//! TEL dialects: turning expression text into a typed tree and rendering it.
//!
//! The taxon dialect evaluates taxon calculations: taxon references expand recursively into
//! their own calculations and the tree is validated, optimised and planned before SQL is
//! generated. The model dialect evaluates model attribute transformations, where double
//! quoted strings are columns of the model's table and taxon references are other attributes
//! of the same model.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::trace;

use super::context::{
    Location, TelDialect, TelRootContext, ValidationContext, MAX_TAXON_REFERENCE_DEPTH,
};
use super::expr::{Parent, TaxonNode, TelExpr, TelExprKind};
use super::functions::{FunctionCall, TelFunction};
use super::parser::{self, char_offset, line_and_column, Syntax, SyntaxKind, TaxonRef};
use super::result::{ExprResult, PostFormula, UsedTaxonSlugsContainer, UsedTaxonsContainer};
use crate::error::{HuskyError, Result};
use crate::identifier::{data_source_from_slug, prefix_with_data_source};
use crate::sql::col;
use crate::taxonomy::{Taxon, TaxonTelMetadata};

/// Parses `text` and builds its typed tree.
///
/// A root node is added on top of the outermost expression unless `skip_root` is set.
pub fn visit(text: &str, ctx: &TelRootContext, skip_root: bool) -> Result<TelExpr> {
    visit_nested(text, ctx, &VisitOptions {
        depth: 0,
        skip_root,
        force_optional: false,
        expanding: &[],
    })
}

struct VisitOptions<'o> {
    depth: usize,
    skip_root: bool,
    /// Every taxon reference is treated as optional (inside an optional reference).
    force_optional: bool,
    /// Slugs whose calculations are being expanded, outermost first.
    expanding: &'o [String],
}

fn visit_nested(text: &str, ctx: &TelRootContext, options: &VisitOptions<'_>) -> Result<TelExpr> {
    let syntax = parser::parse(text)?;
    if options.depth + 1 >= MAX_TAXON_REFERENCE_DEPTH {
        return Err(HuskyError::Tel(format!(
            "Reached maximum depth of taxon references ({MAX_TAXON_REFERENCE_DEPTH})."
        )));
    }
    let visitor = Visitor {
        ctx,
        source: text,
        text: Arc::from(text),
        options,
    };
    let expr = visitor.visit(&syntax)?;
    if options.depth == 0 && !options.skip_root {
        let location = expr.location.clone();
        return Ok(TelExpr::new(TelExprKind::Root(Box::new(expr)), location));
    }
    Ok(expr)
}

struct Visitor<'v, 'a> {
    ctx: &'v TelRootContext<'a>,
    source: &'v str,
    text: Arc<str>,
    options: &'v VisitOptions<'v>,
}

impl Visitor<'_, '_> {
    fn location(&self, offset: usize) -> Location {
        let (line, _) = line_and_column(self.source, offset);
        Location::new(
            char_offset(self.source, offset) + 1,
            line,
            Arc::clone(&self.text),
        )
    }

    fn visit(&self, syntax: &Syntax<'_>) -> Result<TelExpr> {
        let location = self.location(syntax.span.start);
        let kind = match &syntax.kind {
            SyntaxKind::Integer(i) => TelExprKind::Integer(*i),
            SyntaxKind::Float(f) => TelExprKind::Float(*f),
            SyntaxKind::Bool(b) => TelExprKind::Boolean(*b),
            SyntaxKind::String(s) => TelExprKind::String(s.to_string()),
            SyntaxKind::DoubleQuoted(s) => match self.ctx.dialect {
                TelDialect::Taxon => TelExprKind::String(s.to_string()),
                TelDialect::Model(_) => TelExprKind::Column(s.to_string()),
            },
            SyntaxKind::Paren(inner) => TelExprKind::Paren(Box::new(self.visit(inner)?)),
            SyntaxKind::Not(inner) => TelExprKind::Not(Box::new(self.visit(inner)?)),
            SyntaxKind::IsNull { operand, negated } => TelExprKind::IsNull {
                operand: Box::new(self.visit(operand)?),
                negated: *negated,
            },
            SyntaxKind::Binary { op, left, right } => TelExprKind::Binary {
                op: *op,
                left: Box::new(self.visit(left)?),
                right: Box::new(self.visit(right)?),
            },
            SyntaxKind::Call { name, args } => {
                let Some(function) = TelFunction::from_name(name) else {
                    let mut v = ValidationContext::new();
                    v.with_error(format!("Unknown function {name}"), &location);
                    return Err(v.to_error());
                };
                let args = args
                    .iter()
                    .map(|arg| self.visit(arg))
                    .collect::<Result<Vec<_>>>()?;
                TelExprKind::Function(FunctionCall::new(function, args, self.ctx))
            }
            SyntaxKind::Taxon(reference) => TelExprKind::Taxon(self.taxon(reference)?),
        };
        Ok(TelExpr::new(kind, location))
    }

    fn taxon(&self, reference: &TaxonRef<'_>) -> Result<TaxonNode> {
        let slug = reference.slug();
        let optional = reference.optional || self.options.force_optional;
        let mut node = TaxonNode {
            name: reference.name.clone(),
            namespace: reference.namespace.map(str::to_string),
            slug: slug.clone(),
            taxon: self.ctx.taxon(&slug).cloned(),
            optional,
            calculation: None,
            sql: None,
        };

        if let TelDialect::Model(model) = &self.ctx.dialect {
            let attribute = if data_source_from_slug(&slug).is_some() {
                slug
            } else {
                prefix_with_data_source(model.virtual_data_source, &slug)
            };
            node.sql = Some(model.accessor.taxon_sql(&attribute, model.depth + 1)?);
            return Ok(node);
        }

        let Some(calculation) = node.taxon.as_ref().and_then(|t| t.calculation.clone()) else {
            return Ok(node);
        };
        if slug == self.ctx.taxon_slug || self.options.expanding.contains(&slug) {
            return Err(HuskyError::CyclicReference { slug });
        }
        let mut expanding = self.options.expanding.to_vec();
        expanding.push(slug);
        let nested = VisitOptions {
            depth: self.options.depth + 1,
            skip_root: false,
            force_optional: optional,
            expanding: &expanding,
        };
        node.calculation = Some(Box::new(visit_nested(&calculation, self.ctx, &nested)?));
        Ok(node)
    }
}

/// Renders a taxon calculation, including every referenced computed taxon.
///
/// `ctx.taxon_map` must contain every taxon the expression uses, transitively.
pub fn render_taxon(text: &str, ctx: &TelRootContext) -> Result<ExprResult> {
    let expr = visit(text, ctx, false)?;

    let mut v = ValidationContext::new();
    expr.validate(ctx, &mut v);
    v.raise_for_errors()?;

    let optimized = expr.rewrite(ctx, &|e| e);
    let planned = optimized.plan(ctx, Parent::None);
    trace!(taxon = %ctx.taxon_slug, tree = %planned, "planned TEL expression");

    adapt(&planned, ctx)
}

/// Renders a model attribute transformation.
///
/// Column types are unknown to models, so the tree is not validated.
pub fn render_model(text: &str, ctx: &TelRootContext) -> Result<ExprResult> {
    let expr = visit(text, ctx, false)?;
    let optimized = expr.rewrite(ctx, &|e| e);
    adapt(&optimized, ctx)
}

fn adapt(expr: &TelExpr, ctx: &TelRootContext) -> Result<ExprResult> {
    let result = expr.result(ctx)?;
    let post_sql = match &result.label {
        Some(label) => col(label),
        None => result.sql.clone(),
    };
    Ok(ExprResult {
        pre_formulas: result.aggregations,
        post_formula: PostFormula::new(post_sql, result.template, result.exclude_slugs),
        dimension_formulas: result.dimension_formulas,
        data_source_formula_templates: result.data_source_formula_templates,
        phase: expr.phase(ctx),
        used_taxons: UsedTaxonSlugsContainer::from(&expr.used_taxons(ctx)),
        invalid_value: expr.invalid_value(ctx),
        return_data_sources: expr.return_data_sources(ctx),
        return_type: expr.return_type(ctx),
        template_slugs: expr.template_slugs(ctx),
        override_mappings: result.override_mappings,
    })
}

/// Taxon slugs referenced directly by an expression, without expanding their calculations.
///
/// With `data_sources`, namespaced references to other data sources are skipped.
pub fn used_taxon_slugs_shallow(
    text: &str,
    data_sources: Option<&BTreeSet<String>>,
) -> Result<UsedTaxonSlugsContainer> {
    fn collect(
        syntax: &Syntax<'_>,
        data_sources: Option<&BTreeSet<String>>,
        used: &mut UsedTaxonSlugsContainer,
    ) {
        match &syntax.kind {
            SyntaxKind::Taxon(reference) => {
                let slug = reference.slug();
                let allowed = match (data_sources, data_source_from_slug(&slug)) {
                    (Some(allowed), Some(ds)) => allowed.contains(ds),
                    _ => true,
                };
                if allowed {
                    used.add_slug(&slug, reference.optional);
                }
            }
            SyntaxKind::Call { args, .. } => {
                for arg in args {
                    collect(arg, data_sources, used);
                }
            }
            SyntaxKind::Paren(inner) | SyntaxKind::Not(inner) => collect(inner, data_sources, used),
            SyntaxKind::IsNull { operand, .. } => collect(operand, data_sources, used),
            SyntaxKind::Binary { left, right, .. } => {
                collect(left, data_sources, used);
                collect(right, data_sources, used);
            }
            SyntaxKind::Integer(_)
            | SyntaxKind::Float(_)
            | SyntaxKind::Bool(_)
            | SyntaxKind::String(_)
            | SyntaxKind::DoubleQuoted(_) => {}
        }
    }

    let syntax = parser::parse(text)?;
    let mut used = UsedTaxonSlugsContainer::default();
    collect(&syntax, data_sources, &mut used);
    Ok(used)
}

/// Derived TEL metadata of a taxon.
///
/// `used` holds every taxon the definition references, transitively.
pub fn tel_metadata(taxon: &Taxon, mut used: UsedTaxonsContainer) -> Result<TaxonTelMetadata> {
    used.required.remove(&taxon.slug);
    used.optional.remove(&taxon.slug);

    let raw_required: BTreeSet<String> = used
        .required
        .values()
        .filter(|t| !t.is_computed())
        .map(|t| t.slug.clone())
        .collect();
    let raw_optional: BTreeSet<String> = used
        .optional
        .values()
        .filter(|t| !t.is_computed())
        .map(|t| t.slug.clone())
        .collect();
    let used_data_sources: BTreeSet<String> = raw_required
        .iter()
        .chain(&raw_optional)
        .filter_map(|slug| data_source_from_slug(slug).map(str::to_string))
        .collect();
    let all_taxons = used.all_taxons();

    let mut metadata = TaxonTelMetadata {
        used_data_sources: used_data_sources.into_iter().map(Some).collect(),
        required_raw_taxons: raw_required.into_iter().collect(),
        optional_raw_taxons: raw_optional.into_iter().collect(),
        used_taxons: all_taxons.keys().cloned().collect(),
        aggregation_definition: taxon.aggregation.clone(),
        ..TaxonTelMetadata::default()
    };
    if let Some(calculation) = &taxon.calculation {
        let ctx = TelRootContext::new(TelDialect::Taxon, &all_taxons);
        let expr = visit(calculation, &ctx, true)?;
        metadata.phase = expr.phase(&ctx);
        metadata.can_compute_comparison = expr.can_become_comparison_metric();
        metadata.aggregation_definition = expr.aggregation_definition(&ctx);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{lit_str, Dialect, Expr};
    use crate::taxonomy::{AggregationDefinition, TaxonMap, TaxonType};
    use crate::tel::context::{ModelDialect, ModelSqlAccessor};
    use crate::tel::phase::TelPhase;

    fn taxons() -> TaxonMap {
        let mut map = TaxonMap::new();
        for taxon in [
            Taxon::raw("fb|spend", TaxonType::Metric, AggregationDefinition::sum()),
            Taxon::raw("fb|impressions", TaxonType::Metric, AggregationDefinition::sum()),
            Taxon::raw("fb|campaign", TaxonType::Dimension, AggregationDefinition::group_by()),
            Taxon::computed("cpm", TaxonType::Metric, "fb|spend / fb|impressions * 1000"),
            Taxon::computed("loop_a", TaxonType::Metric, "loop_b + 1"),
            Taxon::computed("loop_b", TaxonType::Metric, "loop_a + 1"),
        ] {
            map.insert(taxon.slug.clone(), taxon);
        }
        map
    }

    #[test]
    fn test_unknown_function_fails_immediately() {
        let map = taxons();
        let ctx = TelRootContext::new(TelDialect::Taxon, &map);
        let err = visit("foo(1)", &ctx, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown function foo. Occurred at position 1, line 1 in expression \"foo(1)\""
        );
    }

    #[test]
    fn test_cyclic_reference_is_detected_before_recursing() {
        let map = taxons();
        let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("x");
        let err = visit("loop_a", &ctx, false).unwrap_err();
        assert!(matches!(err, HuskyError::CyclicReference { slug } if slug == "loop_a"));
    }

    #[test]
    fn test_self_reference_is_cyclic() {
        let map = taxons();
        let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("cpm");
        assert!(matches!(
            visit("cpm", &ctx, false),
            Err(HuskyError::CyclicReference { .. })
        ));
    }

    #[test]
    fn test_render_ratio_metric() {
        let map = taxons();
        let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("cpm");
        let result = render_taxon("fb|spend / fb|impressions", &ctx).unwrap();
        assert_eq!(result.phase, TelPhase::MetricPost);
        assert_eq!(result.pre_formulas.len(), 2);
        assert_eq!(
            result.used_taxons.required_slugs,
            BTreeSet::from(["fb|impressions".to_string(), "fb|spend".to_string()])
        );
    }

    #[test]
    fn test_render_reports_all_validation_errors() {
        let map = taxons();
        let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("t");
        let err = render_taxon("missing + fb|campaign * 2", &ctx).unwrap_err();
        assert!(err.to_string().contains("Taxon \"missing\" not found"));
    }

    #[test]
    fn test_shallow_used_slugs() {
        let used = used_taxon_slugs_shallow("cpm + fb|spend? + tw|spend", None).unwrap();
        assert_eq!(
            used.required_slugs,
            BTreeSet::from(["cpm".to_string(), "tw|spend".to_string()])
        );
        assert_eq!(used.optional_slugs, BTreeSet::from(["fb|spend".to_string()]));

        let only_fb = BTreeSet::from(["fb".to_string()]);
        let used = used_taxon_slugs_shallow("cpm + tw|spend", Some(&only_fb)).unwrap();
        assert_eq!(used.all_slugs(), BTreeSet::from(["cpm".to_string()]));
    }

    struct Attributes;

    impl ModelSqlAccessor for Attributes {
        fn taxon_sql(&self, slug: &str, _depth: usize) -> Result<Expr> {
            Ok(lit_str(slug))
        }
    }

    #[test]
    fn test_model_dialect_columns_and_attributes() {
        let map = TaxonMap::new();
        let accessor = Attributes;
        let ctx = TelRootContext::new(
            TelDialect::Model(ModelDialect {
                unique_object_name: "db.ads",
                virtual_data_source: "fb",
                accessor: &accessor,
                depth: 0,
            }),
            &map,
        );
        let result = render_model("upper(\"name\") + campaign", &ctx).unwrap();
        let sql = result.sql().to_sql(Dialect::Snowflake);
        assert!(sql.contains("UPPER("), "{sql}");
        assert!(sql.contains(".\"name\")"), "{sql}");
        assert!(sql.contains("'fb|campaign'"), "{sql}");
    }

    #[test]
    fn test_metadata_of_computed_taxon() {
        let map = taxons();
        let cpm = &map["cpm"];
        let used = UsedTaxonsContainer {
            required: map
                .iter()
                .filter(|(slug, _)| slug.starts_with("fb|"))
                .map(|(slug, t)| (slug.clone(), t.clone()))
                .collect(),
            optional: TaxonMap::new(),
        };
        let metadata = tel_metadata(cpm, used).unwrap();
        assert_eq!(metadata.phase, TelPhase::MetricPost);
        assert_eq!(metadata.used_data_sources, vec![Some("fb".to_string())]);
        assert!(metadata.can_compute_comparison);
    }
}
