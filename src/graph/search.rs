//! Finding a join tree that covers the wanted taxons.

use std::collections::{BTreeSet, HashSet, VecDeque};

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use tracing::{debug, trace};

use super::builder::ModelGraph;
use super::query_joins::QueryJoins;
use crate::error::{HuskyError, Result};
use crate::model::{Model, TimeGranularity};

/// Identifier taxons hinting how coarse an entity model is; coarser means smaller.
const ENTITY_LEVEL_RANKS: [(&str, i64); 3] = [
    ("ad_id", 100),
    ("adgroup_id", 1000),
    ("campaign_id", 10000),
];

fn entity_level_rank(model: &Model) -> i64 {
    let identifiers: BTreeSet<&str> = model
        .identifier_attributes()
        .map(|a| a.taxon.as_str())
        .collect();
    ENTITY_LEVEL_RANKS
        .iter()
        .find(|(taxon, _)| identifiers.contains(taxon))
        .map(|(_, rank)| *rank)
        .unwrap_or(0)
}

/// Sort key of root candidates; larger is tried first.
fn root_score(model: &Model, wanted: &BTreeSet<String>) -> (usize, i64, u8, i64) {
    let matching = wanted.iter().filter(|t| model.has_taxon(t)).count();
    (
        matching,
        -(model.number_of_identifiers() as i64),
        TimeGranularity::rank(model.time_granularity()),
        entity_level_rank(model),
    )
}

/// Node of the tree under construction; `children` index into the arena.
struct Visit {
    node: NodeIndex,
    taxons: BTreeSet<String>,
    children: Vec<usize>,
}

impl ModelGraph {
    /// Join tree covering every taxon of `wanted`.
    ///
    /// Root candidates are tried best first. From each root the graph is walked
    /// breadth-first along edges that cannot multiply rows, without mixing time
    /// granularities. The first root reaching every wanted taxon wins, and subtrees
    /// bringing nothing new are pruned.
    pub fn find_join_tree(&self, wanted: &BTreeSet<String>) -> Result<QueryJoins<'_>> {
        let mut roots: Vec<NodeIndex> = self.graph.node_indices().collect();
        // Stable, so ties keep load order.
        roots.sort_by(|a, b| {
            let a = root_score(&self.models[self.graph[*a]], wanted);
            let b = root_score(&self.models[self.graph[*b]], wanted);
            b.cmp(&a)
        });

        for root in roots {
            let mut tree = self.bfs(root, wanted);
            if wanted.is_subset(&tree.selectable_taxons()) {
                prune_useless_joins(&mut tree, wanted);
                debug!(
                    data_source = %self.data_source(),
                    models = ?tree.model_names(),
                    "found join tree"
                );
                return Ok(tree);
            }
        }
        Err(HuskyError::ImpossibleTaxonCombination {
            slugs: wanted.clone(),
            data_source: self.data_source().to_string(),
        })
    }

    fn bfs(&self, root: NodeIndex, wanted: &BTreeSet<String>) -> QueryJoins<'_> {
        let taxons_of = |node: NodeIndex| -> BTreeSet<String> {
            let model = &self.models[self.graph[node]];
            wanted.iter().filter(|t| model.has_taxon(t)).cloned().collect()
        };

        let mut arena = vec![Visit {
            node: root,
            taxons: taxons_of(root),
            children: vec![],
        }];
        let mut visited: HashSet<NodeIndex> = HashSet::from([root]);
        let mut granularities: HashSet<TimeGranularity> =
            self.models[self.graph[root]].time_granularity().into_iter().collect();
        let mut queue: VecDeque<usize> = VecDeque::from([0]);

        while let Some(current) = queue.pop_front() {
            let current_node = arena[current].node;
            for edge_ref in self.graph.edges(current_node) {
                let next = edge_ref.target();
                if edge_ref.weight().relationship.causes_fanout() || visited.contains(&next) {
                    continue;
                }
                let next_model = &self.models[self.graph[next]];
                if let Some(granularity) = next_model.time_granularity() {
                    if granularities.iter().any(|g| *g != granularity) {
                        continue;
                    }
                    granularities.insert(granularity);
                }
                visited.insert(next);

                let taxons = taxons_of(next);
                trace!(model = %next_model.name, ?taxons, "reached model");
                arena.push(Visit {
                    node: next,
                    taxons,
                    children: vec![],
                });
                let child = arena.len() - 1;
                arena[current].children.push(child);
                queue.push_back(child);
            }
        }

        self.assemble(&arena, 0)
    }

    fn assemble(&self, arena: &[Visit], position: usize) -> QueryJoins<'_> {
        let visit = &arena[position];
        let mut node = QueryJoins::new(&self.models[self.graph[visit.node]], visit.taxons.clone());
        node.join_to = visit
            .children
            .iter()
            .map(|child| self.assemble(arena, *child))
            .collect();
        node
    }
}

/// Drops subtrees that bring no needed taxon the node and its earlier children lack.
fn prune_useless_joins(node: &mut QueryJoins<'_>, needed: &BTreeSet<String>) {
    if node.join_to.is_empty() {
        return;
    }
    let still_needed: BTreeSet<String> = needed
        .difference(&node.taxons_from_model)
        .cloned()
        .collect();

    let mut children = std::mem::take(&mut node.join_to);
    // Stable, so subtrees bringing the same number of taxons keep their order.
    children.sort_by_cached_key(|child| {
        std::cmp::Reverse(child.selectable_taxons().intersection(&still_needed).count())
    });

    let mut brought: BTreeSet<String> = BTreeSet::new();
    for child in children {
        let extra: BTreeSet<String> = child
            .selectable_taxons()
            .intersection(&still_needed)
            .filter(|t| !brought.contains(*t))
            .cloned()
            .collect();
        if !extra.is_empty() {
            brought.extend(extra);
            node.join_to.push(child);
        }
    }

    for child in &mut node.join_to {
        prune_useless_joins(child, &still_needed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelAttribute, ModelJoin, ModelJoinType, Relationship};

    fn taxons(slugs: &[&str]) -> BTreeSet<String> {
        slugs.iter().map(|s| s.to_string()).collect()
    }

    fn model(name: &str, attributes: &[&str]) -> Model {
        attributes.iter().fold(Model::new(name, "fb", "acme", &[name]), |m, taxon| {
            m.with_attribute(ModelAttribute::column(taxon, taxon))
        })
    }

    fn many_to_one(to: &str, on: &str) -> ModelJoin {
        ModelJoin::new(to, Relationship::ManyToOne, ModelJoinType::Left, &[on])
    }

    fn build(models: Vec<Model>) -> ModelGraph {
        ModelGraph::build(&taxons(&["fb"]), models).unwrap()
    }

    #[test]
    fn test_single_model_covers_everything() {
        let graph = build(vec![
            model("ads", &["ad_id", "fb|spend"]),
            model("ads_wide", &["ad_id", "fb|spend", "fb|clicks"]),
        ]);
        let tree = graph.find_join_tree(&taxons(&["fb|spend", "fb|clicks"])).unwrap();
        assert_eq!(tree.model.name, "ads_wide");
        assert!(tree.join_to.is_empty());
    }

    #[test]
    fn test_join_tree_is_pruned() {
        let graph = build(vec![
            model("ads", &["ad_id", "campaign_id", "adset_id", "fb|spend"])
                .with_join(many_to_one("campaigns", "campaign_id"))
                .with_join(many_to_one("adsets", "adset_id")),
            model("campaigns", &["campaign_id", "fb|campaign_name"]),
            model("adsets", &["adset_id", "fb|adset_name"]),
        ]);
        let tree = graph
            .find_join_tree(&taxons(&["fb|spend", "fb|campaign_name"]))
            .unwrap();
        assert_eq!(tree.model.name, "ads");
        assert_eq!(tree.model_names(), vec!["ads", "campaigns"]);
        assert_eq!(tree.selectable_taxons(), taxons(&["fb|spend", "fb|campaign_name"]));
    }

    #[test]
    fn test_fanout_edges_are_not_followed() {
        let graph = build(vec![
            model("campaigns", &["campaign_id", "fb|campaign_name"]).with_join(ModelJoin::new(
                "ads",
                Relationship::OneToMany,
                ModelJoinType::Left,
                &["campaign_id"],
            ).with_direction(crate::model::JoinDirection::Outgoing)),
            model("ads", &["campaign_id", "fb|spend"]),
        ]);
        let err = graph
            .find_join_tree(&taxons(&["fb|spend", "fb|campaign_name"]))
            .unwrap_err();
        assert!(matches!(err, HuskyError::ImpossibleTaxonCombination { .. }), "{err}");
    }

    #[test]
    fn test_unknown_taxon_is_impossible() {
        let graph = build(vec![model("ads", &["fb|spend"])]);
        let err = graph.find_join_tree(&taxons(&["fb|spend", "fb|reach"])).unwrap_err();
        match err {
            HuskyError::ImpossibleTaxonCombination { data_source, slugs } => {
                assert_eq!(data_source, "fb");
                assert!(slugs.contains("fb|reach"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_time_granularities_are_not_mixed() {
        let graph = build(vec![
            model("ads_daily", &["ad_id", "fb|date", "fb|spend"])
                .with_join(many_to_one("ads_hourly", "ad_id")),
            model("ads_hourly", &["ad_id", "fb|date_hour", "fb|impressions"]),
        ]);
        let err = graph
            .find_join_tree(&taxons(&["fb|spend", "fb|impressions"]))
            .unwrap_err();
        assert!(matches!(err, HuskyError::ImpossibleTaxonCombination { .. }));
    }

    #[test]
    fn test_nearest_model_claims_taxon() {
        let graph = build(vec![
            model("ads", &["ad_id", "campaign_id", "fb|spend"])
                .with_join(many_to_one("campaigns", "campaign_id")),
            model("campaigns", &["campaign_id", "fb|campaign_name"]),
        ]);
        let tree = graph
            .find_join_tree(&taxons(&["fb|spend", "campaign_id", "fb|campaign_name"]))
            .unwrap();
        assert_eq!(tree.taxon_to_model()["campaign_id"].name, "ads");
    }
}
