//! Integration tests for model loading, graph building and join tree search.

use std::collections::BTreeSet;

use husky::error::HuskyError;
use husky::graph::ModelGraph;
use husky::model::{
    JoinDirection, Model, ModelAttribute, ModelJoin, ModelJoinType, ModelLoader, ModelStore,
    ModelVisibility, Relationship, Scope,
};
use husky::sql::{col, Dialect, Query};

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn store() -> ModelStore {
    ModelStore::new(vec![
        Model::new("fb_ads", "fb", "50", &["db", "fb", "ads"])
            .with_attribute(ModelAttribute::column("fb|ad_id", "AD_ID").as_identifier())
            .with_attribute(ModelAttribute::column("fb|campaign_id", "CAMPAIGN_ID"))
            .with_attribute(ModelAttribute::column("fb|spend", "SPEND"))
            .with_join(ModelJoin::new(
                "fb_campaigns",
                Relationship::ManyToOne,
                ModelJoinType::Left,
                &["fb|campaign_id"],
            )),
        Model::new("fb_campaigns", "fb", "50", &["db", "fb", "campaigns"])
            .with_attribute(ModelAttribute::column("fb|campaign_id", "ID").as_identifier())
            .with_attribute(ModelAttribute::column("fb|campaign_name", "NAME")),
        Model::new("fb_secret", "fb", "50", &["db", "fb", "secret"])
            .with_attribute(ModelAttribute::column("fb|margin", "MARGIN"))
            .with_visibility(ModelVisibility::Hidden),
        Model::new("tw_ads", "tw", "50", &["db", "tw", "ads"])
            .with_attribute(ModelAttribute::column("tw|spend", "SPEND")),
    ])
    .unwrap()
}

fn fb_graph() -> ModelGraph {
    let models = store()
        .load_models(&set(&["fb"]), &Scope::new("50"), None, None)
        .unwrap();
    ModelGraph::build(&set(&["fb"]), models).unwrap()
}

#[test]
fn test_loader_respects_scope() {
    let store = store();
    let models = store
        .load_models(&set(&["fb"]), &Scope::new("50"), None, None)
        .unwrap();
    let names: BTreeSet<_> = models.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, BTreeSet::from(["fb_ads", "fb_campaigns"]));

    let err = store
        .load_models(&set(&["fb"]), &Scope::new("other"), None, None)
        .unwrap_err();
    assert!(matches!(err, HuskyError::ModelNotFound { .. }), "{err}");
}

#[test]
fn test_many_to_one_is_one_outgoing_edge() {
    let graph = fb_graph();
    assert_eq!(graph.edge_count(), 1);
    assert!(graph.edge("fb_ads", "fb_campaigns").is_some());
    assert!(graph.edge("fb_campaigns", "fb_ads").is_none());
}

#[test]
fn test_join_tree_covers_wanted_taxons() {
    let graph = fb_graph();
    for wanted in [
        set(&["fb|spend"]),
        set(&["fb|campaign_name"]),
        set(&["fb|spend", "fb|campaign_name"]),
        set(&["fb|ad_id", "fb|spend", "fb|campaign_name"]),
    ] {
        let tree = graph.find_join_tree(&wanted).unwrap();
        let claimed: BTreeSet<String> = tree.taxon_to_model().into_keys().collect();
        assert_eq!(claimed, wanted);
    }
}

#[test]
fn test_uncoverable_taxon_is_impossible() {
    let graph = fb_graph();
    let err = graph
        .find_join_tree(&set(&["fb|spend", "fb|margin"]))
        .unwrap_err();
    assert!(matches!(err, HuskyError::ImpossibleTaxonCombination { .. }), "{err}");
}

#[test]
fn test_join_tree_renders_joins() {
    let graph = fb_graph();
    let tree = graph
        .find_join_tree(&set(&["fb|spend", "fb|campaign_name"]))
        .unwrap();
    assert_eq!(tree.model_names(), vec!["fb_ads", "fb_campaigns"]);

    let query = tree
        .apply_to(Query::new().select(vec![col("x")]), &graph)
        .unwrap();
    let sql = query.to_sql(Dialect::Snowflake);
    assert!(sql.contains("LEFT JOIN"), "{sql}");
    assert!(sql.contains("\"CAMPAIGN_ID\""), "{sql}");
    assert!(sql.contains("\"ID\""), "{sql}");
}

#[test]
fn test_explicit_direction_wins() {
    let models = vec![
        Model::new("fb_ads", "fb", "50", &["ads"])
            .with_attribute(ModelAttribute::column("fb|campaign_id", "CAMPAIGN_ID"))
            .with_join(
                ModelJoin::new(
                    "fb_campaigns",
                    Relationship::ManyToOne,
                    ModelJoinType::Left,
                    &["fb|campaign_id"],
                )
                .with_direction(JoinDirection::Both),
            ),
        Model::new("fb_campaigns", "fb", "50", &["campaigns"])
            .with_attribute(ModelAttribute::column("fb|campaign_id", "ID")),
    ];
    let graph = ModelGraph::build(&set(&["fb"]), models).unwrap();
    assert!(graph.edge("fb_ads", "fb_campaigns").is_some());
    assert!(graph.edge("fb_campaigns", "fb_ads").is_some());
}
