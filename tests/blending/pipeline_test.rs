//! Integration tests for the blending pipeline, request to dataframe.

use std::collections::BTreeSet;

use husky::blending::{
    BlendingDataRequest, ComparisonConfig, ComparisonScope, DataRequest, Dataframe, TaxonDataOrder,
};
use husky::compile::{Catalog, CompileOptions};
use husky::error::{HuskyError, Result};
use husky::filter::{FilterClause, SimpleFilterOperator};
use husky::model::{Model, ModelAttribute, Scope};
use husky::sql::Dialect;
use husky::taxonomy::{AggregationDefinition, OverrideMapping, Taxon, TaxonType};

fn catalog() -> Catalog {
    let taxons = vec![
        Taxon::raw("date", TaxonType::Dimension, AggregationDefinition::group_by()),
        Taxon::raw("company_id", TaxonType::Dimension, AggregationDefinition::group_by()),
        Taxon::raw("spend", TaxonType::Metric, AggregationDefinition::sum()),
        Taxon::raw("fb|spend", TaxonType::Metric, AggregationDefinition::sum()),
        Taxon::raw("fb|impressions", TaxonType::Metric, AggregationDefinition::sum()),
        Taxon::raw("fb|ad_name", TaxonType::Dimension, AggregationDefinition::group_by()),
        Taxon::raw("tw|spend", TaxonType::Metric, AggregationDefinition::sum()),
        Taxon::computed("cpm", TaxonType::Metric, "fb|spend / fb|impressions * 1000"),
        Taxon::computed("ad_group", TaxonType::Dimension, "override(fb|ad_name, 'ad_groups')"),
        Taxon::computed(
            "strict_group",
            TaxonType::Dimension,
            "override(fb|ad_name, 'missing_mapping')",
        ),
    ];
    let models = vec![
        Model::new("fb_ads", "fb", "50", &["db", "fb", "ads"])
            .with_attribute(ModelAttribute::column("fb|ad_name", "AD_NAME").as_identifier())
            .with_attribute(ModelAttribute::column("date", "DAY"))
            .with_attribute(ModelAttribute::column("spend", "SPEND"))
            .with_attribute(ModelAttribute::column("fb|spend", "SPEND"))
            .with_attribute(ModelAttribute::column("fb|impressions", "IMPRESSIONS")),
        Model::new("tw_ads", "tw", "50", &["db", "tw", "ads"])
            .with_attribute(ModelAttribute::column("date", "DAY"))
            .with_attribute(ModelAttribute::column("spend", "COST"))
            .with_attribute(ModelAttribute::column("tw|spend", "COST")),
    ];
    let mappings = vec![OverrideMapping::new(
        "ad_groups",
        "50",
        &[(Some("a"), Some("group 1")), (None, Some("unnamed"))],
    )];
    Catalog::new(taxons, models, mappings).unwrap()
}

fn fb(taxons: &[&str]) -> DataRequest {
    DataRequest::new("fb", Scope::new("50"), taxons)
}

fn tw(taxons: &[&str]) -> DataRequest {
    DataRequest::new("tw", Scope::new("50"), taxons)
}

fn build(request: &BlendingDataRequest) -> Result<Dataframe> {
    catalog().context(&CompileOptions::default()).build(request)
}

fn slugs(dataframe: &Dataframe) -> BTreeSet<&str> {
    dataframe.slug_to_column.keys().map(String::as_str).collect()
}

// ============================================================================
// Basic requests
// ============================================================================

#[test]
fn test_single_source_sums_metrics() {
    let request = BlendingDataRequest::new(vec![fb(&["fb|spend", "fb|impressions"])]);
    let dataframe = build(&request).unwrap();
    assert_eq!(slugs(&dataframe), BTreeSet::from(["fb|impressions", "fb|spend"]));

    let sql = dataframe.query.to_sql(Dialect::Snowflake);
    assert!(sql.contains("SUM("), "{sql}");
    assert!(sql.contains("\"db\".\"fb\".\"ads\""), "{sql}");
    assert!(!sql.contains("UNION ALL"), "{sql}");
    assert_eq!(dataframe.used_model_names, BTreeSet::from(["fb_ads".to_string()]));
}

#[test]
fn test_same_taxon_across_sources_is_blended() {
    let request = BlendingDataRequest::new(vec![fb(&[]), tw(&[])]).with_taxons(&["spend"]);
    let dataframe = build(&request).unwrap();
    assert_eq!(slugs(&dataframe), BTreeSet::from(["spend"]));
    assert_eq!(
        dataframe.used_physical_data_sources,
        BTreeSet::from(["fb".to_string(), "tw".to_string()])
    );

    let sql = dataframe.query.to_sql(Dialect::Snowflake);
    assert!(sql.contains("UNION ALL"), "{sql}");
    assert!(sql.contains("\"COST\""), "{sql}");
    assert!(sql.contains("\"SPEND\""), "{sql}");
}

#[test]
fn test_computed_metric_by_dimension() {
    let request = BlendingDataRequest::new(vec![fb(&["cpm", "date"])])
        .with_order_by(vec![TaxonDataOrder::desc("cpm")])
        .with_limit(20);
    let dataframe = build(&request).unwrap();
    assert_eq!(slugs(&dataframe), BTreeSet::from(["cpm", "date"]));

    let sql = dataframe.query.to_sql(Dialect::Snowflake);
    assert!(sql.contains("1000"), "{sql}");
    assert!(sql.contains("DESC NULLS LAST"), "{sql}");
    assert!(sql.contains("LIMIT 20"), "{sql}");
}

#[test]
fn test_order_by_needs_selected_taxon() {
    let request = BlendingDataRequest::new(vec![fb(&["fb|spend"])])
        .with_order_by(vec![TaxonDataOrder::asc("fb|impressions")]);
    let err = build(&request).unwrap_err();
    assert!(
        err.to_string().contains("used in order_by clause must be also selected"),
        "{err}"
    );
}

#[test]
fn test_post_aggregation_filter() {
    let request = BlendingDataRequest::new(vec![fb(&["date", "fb|spend"])])
        .with_filters(FilterClause::value("fb|spend", SimpleFilterOperator::Gt, 100i64));
    let sql = build(&request).unwrap().query.to_sql(Dialect::Snowflake);
    assert!(sql.contains("> 100"), "{sql}");
}

// ============================================================================
// Grouping sets
// ============================================================================

#[test]
fn test_grouping_sets_mark_absent_dimensions() {
    let request = BlendingDataRequest::new(vec![fb(&["fb|spend"])])
        .with_grouping_sets(vec![vec!["date"], vec!["date", "fb|ad_name"]]);
    let dataframe = build(&request).unwrap();
    assert!(slugs(&dataframe).contains("fb|ad_name"));

    let sql = dataframe.query.to_sql(Dialect::Snowflake);
    assert!(sql.contains("PANORAMIC_GROUPINGSETS_NULL"), "{sql}");
    assert!(sql.contains("UNION ALL"), "{sql}");
}

#[test]
fn test_grouping_sets_reject_date_gap_filling() {
    let mut request = BlendingDataRequest::new(vec![fb(&["fb|spend"])])
        .with_grouping_sets(vec![vec!["date"]]);
    request.fill_date_gaps = true;
    let err = build(&request).unwrap_err();
    assert!(matches!(err, HuskyError::InvalidRequest(_)), "{err}");
}

// ============================================================================
// Override mappings
// ============================================================================

#[test]
fn test_override_mapping_is_joined() {
    let request = BlendingDataRequest::new(vec![fb(&["ad_group", "fb|spend"])]);
    let dataframe = build(&request).unwrap();
    assert!(slugs(&dataframe).contains("ad_group"));

    let sql = dataframe.query.to_sql(Dialect::Snowflake);
    assert!(sql.contains("\"__om_ad_groups\" AS ("), "{sql}");
    assert!(sql.contains("'group 1'"), "{sql}");
    assert!(sql.contains("LEFT JOIN"), "{sql}");
}

#[test]
fn test_unknown_override_mapping() {
    let request = BlendingDataRequest::new(vec![fb(&["strict_group", "fb|spend"])]);
    let err = build(&request).unwrap_err();
    assert!(matches!(err, HuskyError::OverrideMappingNotFound { .. }), "{err}");
}

#[test]
fn test_too_many_override_mappings() {
    let catalog = catalog();
    let request = BlendingDataRequest::new(vec![fb(&["ad_group", "fb|spend"])]);
    let err = catalog
        .context(&CompileOptions::default())
        .with_max_override_mappings(0)
        .build(&request)
        .unwrap_err();
    assert!(matches!(err, HuskyError::TooManyOverrideMappings { .. }), "{err}");
}

// ============================================================================
// Comparison
// ============================================================================

#[test]
fn test_comparison_adds_benchmark_columns() {
    let request =
        BlendingDataRequest::new(vec![fb(&["fb|ad_name", "cpm"])]).with_comparison(&["fb|ad_name"]);
    let dataframe = build(&request).unwrap();
    let slugs = slugs(&dataframe);
    assert!(slugs.contains("cpm"), "{slugs:?}");
    assert!(slugs.contains("comparison@cpm"), "{slugs:?}");

    let sql = dataframe.query.to_sql(Dialect::Snowflake);
    assert!(sql.contains("\"comparison_dataframe\""), "{sql}");
    assert!(sql.contains("LEFT JOIN"), "{sql}");
    assert!(sql.contains("'50'"), "{sql}");
}

#[test]
fn test_comparison_of_raw_metrics_is_not_joined() {
    let request =
        BlendingDataRequest::new(vec![fb(&["fb|ad_name", "fb|spend"])]).with_comparison(&["fb|ad_name"]);
    let dataframe = build(&request).unwrap();
    assert_eq!(slugs(&dataframe), BTreeSet::from(["fb|ad_name", "fb|spend"]));

    let sql = dataframe.query.to_sql(Dialect::Snowflake);
    assert!(!sql.contains("comparison_dataframe"), "{sql}");
    assert!(!sql.contains("LEFT JOIN"), "{sql}");
}

#[test]
fn test_comparison_requires_taxons() {
    let mut request = BlendingDataRequest::new(vec![fb(&["fb|ad_name", "cpm"])]);
    request.comparison = Some(ComparisonConfig {
        taxons: None,
        scope: ComparisonScope::Company,
    });
    let err = build(&request).unwrap_err();
    assert!(matches!(err, HuskyError::InvalidComparisonRequest(_)), "{err}");
}
