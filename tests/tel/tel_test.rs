//! Integration tests for TEL: parsing, validation, phases and planning.

use husky::error::HuskyError;
use husky::taxonomy::{AggregationDefinition, Taxon, TaxonMap, TaxonType};
use husky::tel::{parse, render_taxon, visit, TelDialect, TelPhase, TelRootContext};

fn taxons() -> TaxonMap {
    [
        Taxon::raw("fb|spend", TaxonType::Metric, AggregationDefinition::sum()),
        Taxon::raw("fb|impressions", TaxonType::Metric, AggregationDefinition::sum()),
        Taxon::raw("fb|campaign", TaxonType::Dimension, AggregationDefinition::group_by()),
        Taxon::computed("cpm", TaxonType::Metric, "fb|spend / fb|impressions * 1000"),
        Taxon::computed("ratio_a", TaxonType::Metric, "ratio_b * 2"),
        Taxon::computed("ratio_b", TaxonType::Metric, "ratio_a / 2"),
    ]
    .into_iter()
    .map(|taxon| (taxon.slug.clone(), taxon))
    .collect()
}

// ============================================================================
// Syntax
// ============================================================================

#[test]
fn test_incomplete_expression_is_invalid() {
    let err = parse("fb|spend +").unwrap_err();
    assert!(matches!(err, HuskyError::InvalidExpression { .. }), "{err}");
    assert!(err.to_string().contains("Unexpected symbol"), "{err}");
}

#[test]
fn test_surface_syntax_parses() {
    for text in [
        "fb|spend / fb|impressions",
        "fb|spend? + 1",
        "coalesce(fb|campaign, 'unknown')",
        "fb|campaign IS NOT NULL AND fb|spend > 0",
        "\"raw column\"",
        "(1 + 2) * 3.5",
    ] {
        assert!(parse(text).is_ok(), "failed to parse {text}");
    }
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_unknown_function() {
    let map = taxons();
    let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("t");
    let err = render_taxon("nope(fb|spend)", &ctx).unwrap_err();
    assert!(err.to_string().contains("Unknown function nope"), "{err}");
}

#[test]
fn test_missing_taxon() {
    let map = taxons();
    let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("t");
    let err = render_taxon("fb|clicks + fb|spend", &ctx).unwrap_err();
    assert!(err.to_string().contains("Taxon \"fb|clicks\" not found"), "{err}");
}

#[test]
fn test_cyclic_calculation() {
    let map = taxons();
    let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("t");
    let err = render_taxon("ratio_a", &ctx).unwrap_err();
    assert!(matches!(err, HuskyError::CyclicReference { .. }), "{err}");
}

// ============================================================================
// Phases
// ============================================================================

#[test]
fn test_ratio_is_post_aggregation() {
    let map = taxons();
    let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("cpm");
    let result = render_taxon("fb|spend / fb|impressions * 1000", &ctx).unwrap();
    assert_eq!(result.phase, TelPhase::MetricPost);
    assert!(result.pre_formulas.len() >= 2);
}

fn phase_and_children(text: &str, ctx: &TelRootContext) -> (TelPhase, TelPhase) {
    let expr = visit(text, ctx, true).unwrap();
    let latest_child = expr
        .children()
        .iter()
        .map(|child| child.phase(ctx))
        .max()
        .unwrap_or(TelPhase::Any);
    (expr.phase(ctx), latest_child)
}

#[test]
fn test_phase_is_latest_of_children() {
    let map = taxons();
    let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("t");

    let (phase, children) = phase_and_children("concat(fb|campaign, '-x')", &ctx);
    assert_eq!(phase, children);
    assert!(phase.is_dimension(), "{phase:?}");

    let (phase, children) = phase_and_children("fb|spend > 0", &ctx);
    assert_eq!(phase, children);
    assert!(!phase.is_dimension(), "{phase:?}");

    let (phase, children) = phase_and_children("fb|campaign = 'x' AND fb|spend > 0", &ctx);
    assert_eq!(phase, children);
    let (metric, _) = phase_and_children("fb|spend > 0", &ctx);
    assert_eq!(phase, metric);

    let (phase, children) = phase_and_children("upper(fb|campaign)", &ctx);
    assert!(phase >= children);
    assert!(phase.is_dimension(), "{phase:?}");
}

#[test]
fn test_root_is_evaluated_after_aggregation() {
    let map = taxons();
    let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("t");
    let rendered = render_taxon("upper(fb|campaign)", &ctx).unwrap();
    assert_eq!(rendered.phase, TelPhase::MetricPost);

    let nested = render_taxon("cpm + 1", &ctx).unwrap();
    let cpm = render_taxon("cpm", &ctx).unwrap();
    assert!(nested.phase >= cpm.phase);
}

#[test]
fn test_override_collects_mapping() {
    let map = taxons();
    let ctx = TelRootContext::new(TelDialect::Taxon, &map).with_taxon_slug("campaign_group");
    let result = render_taxon("override(fb|campaign, 'campaign-groups')", &ctx).unwrap();
    assert_eq!(result.override_mappings.len(), 1);
    let info = result.override_mappings.iter().next().unwrap();
    assert_eq!(info.override_mapping_slug, "campaign-groups");
    assert!(info.include_missing_values);
}
