//! Integration tests for taxon resolution over a taxonomy.

use std::collections::BTreeSet;

use husky::error::HuskyError;
use husky::taxonomy::{
    AggregationDefinition, AggregationType, Taxon, TaxonLoader, TaxonResolver, TaxonType,
    Taxonomy,
};
use husky::tel::TelPhase;

fn slugs(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn taxonomy() -> Taxonomy {
    Taxonomy::new([
        Taxon::raw("fb|spend", TaxonType::Metric, AggregationDefinition::sum()),
        Taxon::raw("fb|clicks", TaxonType::Metric, AggregationDefinition::sum()),
        Taxon::raw("fb|reach", TaxonType::Metric, AggregationDefinition::not_set()),
        Taxon::raw("fb|visits", TaxonType::Metric, AggregationDefinition::not_set()),
        Taxon::raw("date", TaxonType::Dimension, AggregationDefinition::group_by()),
        Taxon::computed("doubled_clicks", TaxonType::Metric, "fb|clicks * 2"),
        Taxon::computed("total", TaxonType::Metric, "fb|spend + doubled_clicks?"),
        Taxon::computed("visit_rate", TaxonType::Metric, "fb|visits / fb|reach"),
    ])
}

#[test]
fn test_resolution_follows_calculations() {
    let taxonomy = taxonomy();
    let used = TaxonResolver::new(&taxonomy)
        .resolve(&slugs(&["visit_rate", "date"]))
        .unwrap();
    assert_eq!(
        used.all_taxons().keys().cloned().collect::<BTreeSet<_>>(),
        slugs(&["date", "fb|reach", "fb|visits", "visit_rate"])
    );
}

#[test]
fn test_required_below_optional_is_optional() {
    let taxonomy = taxonomy();
    let used = TaxonResolver::new(&taxonomy)
        .resolve(&slugs(&["total"]))
        .unwrap();
    assert!(used.required_slugs().contains("fb|spend"));
    assert!(!used.required_slugs().contains("fb|clicks"));
    assert!(used.optional_slugs().contains("fb|clicks"));
}

#[test]
fn test_unknown_slug_is_reported() {
    let taxonomy = taxonomy();
    let err = TaxonResolver::new(&taxonomy)
        .resolve(&slugs(&["fb|cpc"]))
        .unwrap_err();
    assert!(matches!(err, HuskyError::TaxonsNotFound { .. }), "{err}");
}

#[test]
fn test_not_set_ratio_uses_fallback_only_when_asked() {
    let taxonomy = taxonomy();
    let resolver = TaxonResolver::new(&taxonomy);

    let mut plain = taxonomy.load_taxons(&slugs(&["visit_rate"]), true).unwrap();
    resolver.complete_tel_metadata(&mut plain, false).unwrap();
    assert_eq!(
        plain["visit_rate"].tel_metadata_aggregation_type(),
        Some(AggregationType::NotSet)
    );

    let mut fallback = taxonomy.load_taxons(&slugs(&["visit_rate"]), true).unwrap();
    resolver.complete_tel_metadata(&mut fallback, true).unwrap();
    assert_eq!(
        fallback["visit_rate"].tel_metadata_aggregation_type(),
        Some(AggregationType::Sum)
    );
}

#[test]
fn test_metadata_phase_is_at_least_phase_of_parts() {
    let mut taxonomy = taxonomy();
    taxonomy.precalculate_tel_metadata().unwrap();
    let phase = |slug: &str| {
        taxonomy
            .get(slug)
            .and_then(|t| t.tel_metadata.as_ref())
            .map(|m| m.phase)
            .unwrap()
    };
    assert!(phase("total") >= phase("fb|spend"));
    assert!(phase("doubled_clicks") >= phase("fb|clicks"));
    assert_eq!(phase("visit_rate"), TelPhase::MetricPost);
}

#[test]
fn test_request_formula_becomes_temporary_taxon() {
    let taxonomy = taxonomy();
    let mut resolver = TaxonResolver::new(&taxonomy);
    let map = resolver
        .resolve_request("50", &["=d:upper(date)".to_string()])
        .unwrap();
    let formula = map
        .values()
        .find(|t| t.calculation.as_deref() == Some("upper(date)"))
        .unwrap();
    assert_eq!(formula.taxon_type, TaxonType::Dimension);
    assert!(map.contains_key("date"));
}
