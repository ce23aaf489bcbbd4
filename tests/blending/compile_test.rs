//! Integration tests for compiling JSON requests against a JSON catalog.

use husky::blending::BlendingDataRequest;
use husky::compile::{
    compile, compile_transformation_request, output_aliases, parse_dialect, Catalog,
    CompileOptions, TransformRequest,
};
use husky::error::HuskyError;
use husky::sql::Dialect;

const CATALOG: &str = r#"{
    "taxons": [
        {"slug": "date", "taxon_type": "dimension", "aggregation": {"type": "group_by"}},
        {"slug": "fb|spend", "taxon_type": "metric", "data_source": "fb",
         "aggregation": {"type": "sum"}},
        {"slug": "fb|impressions", "taxon_type": "metric", "data_source": "fb",
         "aggregation": {"type": "sum"}},
        {"slug": "fb|cpm", "taxon_type": "metric", "data_source": "fb",
         "calculation": "fb|spend / fb|impressions * 1000"},
        {"slug": "1st_touch", "taxon_type": "dimension", "aggregation": {"type": "group_by"}}
    ],
    "models": [{
        "name": "fb_ads",
        "data_sources": ["fb"],
        "company_id": "50",
        "visibility": "available",
        "fully_qualified_name_parts": ["db", "fb", "ads"],
        "physical_data_source": "snowflake_prod",
        "attributes": {
            "ad_id": {"taxon": "fb|ad_id", "tel_transformation": "\"AD_ID\"", "identifier": true},
            "date": {"taxon": "date", "tel_transformation": "\"DAY\""},
            "first_touch": {"taxon": "1st_touch", "tel_transformation": "\"FIRST_TOUCH\""},
            "spend": {"taxon": "fb|spend", "tel_transformation": "\"SPEND\""},
            "impressions": {"taxon": "fb|impressions", "tel_transformation": "\"IMPRESSIONS\""}
        }
    }]
}"#;

const REQUEST: &str = r#"{
    "data_subrequests": [{
        "taxons": ["date", "fb|spend", "fb|cpm", "1st_touch"],
        "properties": {"data_sources": ["fb"]},
        "scope": {"company_id": "50"}
    }],
    "order_by": [{"taxon": "date", "type": "asc"}],
    "limit": 100
}"#;

fn catalog() -> Catalog {
    Catalog::from_json(CATALOG).unwrap()
}

fn request() -> BlendingDataRequest {
    serde_json::from_str(REQUEST).unwrap()
}

#[test]
fn test_compile_snowflake() {
    let output = compile(&catalog(), &request(), &CompileOptions::default()).unwrap();
    let sql = &output.sql;
    assert!(sql.starts_with("SELECT") || sql.starts_with("WITH"), "{sql}");
    assert!(sql.contains("AS \"fb|spend\""), "{sql}");
    assert!(sql.contains("AS \"fb|cpm\""), "{sql}");
    assert!(sql.contains("AS \"1st_touch\""), "{sql}");
    assert!(sql.contains("\"db\".\"fb\".\"ads\""), "{sql}");
    assert!(sql.contains("LIMIT 100"), "{sql}");
    assert_eq!(output.physical_data_source.as_deref(), Some("snowflake_prod"));
}

#[test]
fn test_compile_bigquery_aliases() {
    let options = CompileOptions::default().with_dialect(Dialect::BigQuery);
    let output = compile(&catalog(), &request(), &options).unwrap();
    let sql = &output.sql;
    assert!(sql.contains("AS `fb_spend`"), "{sql}");
    assert!(sql.contains("AS `fb_cpm`"), "{sql}");
    assert!(sql.contains("AS `_1st_touch`"), "{sql}");
    assert!(output
        .columns
        .contains(&("fb|spend".to_string(), "fb_spend".to_string())));
}

#[test]
fn test_compile_every_dialect() {
    for dialect in Dialect::all() {
        let options = CompileOptions::default().with_dialect(dialect);
        let output = compile(&catalog(), &request(), &options).unwrap();
        assert_eq!(output.dialect, dialect);
        assert!(output.sql.contains("SUM("), "{dialect}: {}", output.sql);
    }
}

#[test]
fn test_physical_data_source_allowlist() {
    let mut request = request();
    request.physical_data_sources = Some(vec!["bigquery_prod".to_string()]);
    let err = compile(&catalog(), &request, &CompileOptions::default()).unwrap_err();
    assert!(matches!(err, HuskyError::ModelNotFound { .. }), "{err}");
}

#[test]
fn test_transformation_request() {
    let request = TransformRequest {
        requested_fields: vec!["date".into(), "fb|cpm".into()],
        ..Default::default()
    };
    let output = compile_transformation_request(
        &catalog(),
        &request,
        "50",
        Some("snowflake_prod"),
        &CompileOptions::default(),
    )
    .unwrap();
    assert!(output.sql.contains("AS \"fb|cpm\""), "{}", output.sql);
    assert!(output.sql.contains("AS \"date\""), "{}", output.sql);
}

#[test]
fn test_alias_correction() {
    let aliases = output_aliases(["1st", "fb_spend", "fb|spend"], Dialect::BigQuery)
        .into_iter()
        .map(|(slug, alias)| format!("{slug} -> {alias}"))
        .collect::<Vec<_>>()
        .join(", ");
    insta::assert_snapshot!(aliases, @"1st -> _1st, fb_spend -> fb_spend, fb|spend -> fb_spend_1");
}

#[test]
fn test_dialect_names() {
    assert_eq!(parse_dialect("snowflake").unwrap(), Dialect::Snowflake);
    assert_eq!(parse_dialect("postgresql").unwrap(), Dialect::Postgres);
    let err = parse_dialect("teradata").unwrap_err();
    insta::assert_snapshot!(err.to_string(), @r#"You are trying to use unsupported dialect - "teradata""#);
}
