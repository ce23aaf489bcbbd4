//! Join graph over the models of one data source.

use std::collections::{BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use tracing::trace;

use crate::error::{HuskyError, Result};
use crate::model::{JoinDirection, Model, ModelJoinType, Relationship};

/// Edge payload: how to join the target model from the source model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelJoinEdge {
    pub taxons: BTreeSet<String>,
    pub relationship: Relationship,
    pub join_type: ModelJoinType,
}

/// Models of one data source connected by their declared joins.
#[derive(Debug, Clone)]
pub struct ModelGraph {
    pub(crate) graph: DiGraph<usize, ModelJoinEdge>,
    pub(crate) node_indices: HashMap<String, NodeIndex>,
    /// In load order; node weights index into it.
    pub(crate) models: Vec<Model>,
    data_source: String,
}

impl ModelGraph {
    /// Builds the graph for `data_sources`, which must name exactly one data source.
    ///
    /// Joins to models outside `models` are ignored: the scope does not allow them.
    pub fn build(data_sources: &BTreeSet<String>, models: Vec<Model>) -> Result<Self> {
        let data_source = match data_sources.iter().next() {
            Some(data_source) if data_sources.len() == 1 => data_source.clone(),
            _ => {
                return Err(HuskyError::MultipleDataSources {
                    data_sources: data_sources.clone(),
                })
            }
        };

        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();
        for (position, model) in models.iter().enumerate() {
            let idx = graph.add_node(position);
            if node_indices.insert(model.name.clone(), idx).is_some() {
                return Err(HuskyError::DuplicateModel {
                    name: model.name.clone(),
                    data_source,
                });
            }
        }

        for model in &models {
            let from = node_indices[&model.name];
            for join in &model.joins {
                let Some(&to) = node_indices.get(&join.to_model) else {
                    continue;
                };
                if join.taxons.is_empty() {
                    return Err(HuskyError::MissingJoinTaxons {
                        from: model.name.clone(),
                        to: join.to_model.clone(),
                    });
                }
                let taxons: BTreeSet<String> = join.taxons.iter().cloned().collect();
                let direction = join.effective_direction();
                trace!(from = %model.name, to = %join.to_model, ?direction, "adding join edge");
                match direction {
                    JoinDirection::Both => {
                        graph.update_edge(from, to, ModelJoinEdge {
                            taxons: taxons.clone(),
                            relationship: join.relationship,
                            join_type: join.join_type,
                        });
                        graph.update_edge(to, from, ModelJoinEdge {
                            taxons,
                            relationship: join.relationship,
                            join_type: join.join_type.reverse(),
                        });
                    }
                    JoinDirection::Outgoing => {
                        graph.update_edge(from, to, ModelJoinEdge {
                            taxons,
                            relationship: join.relationship,
                            join_type: join.join_type,
                        });
                    }
                    JoinDirection::Incoming => {
                        graph.update_edge(to, from, ModelJoinEdge {
                            taxons,
                            relationship: join.relationship.reverse(),
                            join_type: join.join_type.reverse(),
                        });
                    }
                }
            }
        }

        Ok(Self {
            graph,
            node_indices,
            models,
            data_source,
        })
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.node_indices
            .get(name)
            .map(|idx| &self.models[self.graph[*idx]])
    }

    /// Edge from model `from` to model `to`, if they can be joined in that direction.
    pub fn edge(&self, from: &str, to: &str) -> Option<&ModelJoinEdge> {
        let from = self.node_indices.get(from)?;
        let to = self.node_indices.get(to)?;
        self.graph
            .find_edge(*from, *to)
            .map(|edge| &self.graph[edge])
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelJoin;

    fn ds() -> BTreeSet<String> {
        BTreeSet::from(["fb".to_string()])
    }

    fn model(name: &str) -> Model {
        Model::new(name, "fb", "acme", &[name])
    }

    fn join(to: &str, relationship: Relationship) -> ModelJoin {
        ModelJoin::new(to, relationship, ModelJoinType::Left, &["ad_id"])
    }

    #[test]
    fn test_many_to_one_adds_single_outgoing_edge() {
        let graph = ModelGraph::build(&ds(), vec![
            model("ads").with_join(join("campaigns", Relationship::ManyToOne)),
            model("campaigns"),
        ])
        .unwrap();
        assert_eq!(graph.edge_count(), 1);
        let edge = graph.edge("ads", "campaigns").unwrap();
        assert_eq!(edge.relationship, Relationship::ManyToOne);
        assert!(graph.edge("campaigns", "ads").is_none());
    }

    #[test]
    fn test_duplicate_model_names_are_rejected() {
        let err = ModelGraph::build(&ds(), vec![model("ads"), model("campaigns"), model("ads")])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Model \"ads\" is defined more than once in data source \"fb\""
        );
    }

    #[test]
    fn test_one_to_one_adds_reversed_edge() {
        let graph = ModelGraph::build(&ds(), vec![
            model("ads").with_join(join("ad_meta", Relationship::OneToOne)),
            model("ad_meta"),
        ])
        .unwrap();
        assert_eq!(graph.edge("ads", "ad_meta").unwrap().join_type, ModelJoinType::Left);
        assert_eq!(graph.edge("ad_meta", "ads").unwrap().join_type, ModelJoinType::Right);
    }

    #[test]
    fn test_one_to_many_is_incoming() {
        let graph = ModelGraph::build(&ds(), vec![
            model("campaigns").with_join(join("ads", Relationship::OneToMany)),
            model("ads"),
        ])
        .unwrap();
        assert!(graph.edge("campaigns", "ads").is_none());
        let edge = graph.edge("ads", "campaigns").unwrap();
        assert_eq!(edge.relationship, Relationship::ManyToOne);
        assert_eq!(edge.join_type, ModelJoinType::Right);
    }

    #[test]
    fn test_joins_outside_scope_are_ignored() {
        let graph = ModelGraph::build(&ds(), vec![
            model("ads").with_join(join("hidden", Relationship::ManyToOne))
        ])
        .unwrap();
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_missing_join_taxons() {
        let empty = ModelJoin::new("campaigns", Relationship::ManyToOne, ModelJoinType::Left, &[]);
        let err = ModelGraph::build(&ds(), vec![model("ads").with_join(empty), model("campaigns")])
            .unwrap_err();
        assert!(matches!(err, HuskyError::MissingJoinTaxons { .. }));
    }

    #[test]
    fn test_multiple_data_sources() {
        let sources = BTreeSet::from(["fb".to_string(), "tw".to_string()]);
        let err = ModelGraph::build(&sources, vec![model("ads")]).unwrap_err();
        assert!(matches!(err, HuskyError::MultipleDataSources { .. }));
    }
}
