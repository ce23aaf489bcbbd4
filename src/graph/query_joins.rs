//! Join trees found by graph search, and their SQL.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::builder::ModelGraph;
use crate::error::{HuskyError, Result};
use crate::model::Model;
use crate::sql::{Expr, ExprExt, Join, Query};

/// A node of a join tree: a model, the wanted taxons it has, and the models joined to it.
#[derive(Debug, Clone)]
pub struct QueryJoins<'g> {
    pub model: &'g Model,
    pub taxons_from_model: BTreeSet<String>,
    pub join_to: Vec<QueryJoins<'g>>,
}

impl<'g> QueryJoins<'g> {
    pub fn new(model: &'g Model, taxons_from_model: BTreeSet<String>) -> Self {
        Self {
            model,
            taxons_from_model,
            join_to: vec![],
        }
    }

    /// Union of the taxons of every node in the subtree.
    pub fn selectable_taxons(&self) -> BTreeSet<String> {
        let mut taxons = self.taxons_from_model.clone();
        for child in &self.join_to {
            taxons.extend(child.selectable_taxons());
        }
        taxons
    }

    /// Nodes in breadth-first order, root first.
    pub fn bfs_ordered(&self) -> Vec<&QueryJoins<'g>> {
        let mut ordered = vec![];
        let mut queue = VecDeque::from([self]);
        while let Some(node) = queue.pop_front() {
            ordered.push(node);
            queue.extend(node.join_to.iter());
        }
        ordered
    }

    /// Model each taxon is read from: the nearest node having it.
    pub fn taxon_to_model(&self) -> BTreeMap<String, &'g Model> {
        let mut taxon_to_model = BTreeMap::new();
        for node in self.bfs_ordered() {
            for taxon in &node.taxons_from_model {
                taxon_to_model.entry(taxon.clone()).or_insert(node.model);
            }
        }
        taxon_to_model
    }

    pub fn model_names(&self) -> Vec<String> {
        self.bfs_ordered()
            .into_iter()
            .map(|node| node.model.name.clone())
            .collect()
    }

    /// JOIN clauses of the whole tree, parents before children.
    pub fn joins(&self, graph: &ModelGraph) -> Result<Vec<Join>> {
        let mut joins = vec![];
        for node in self.bfs_ordered() {
            for child in &node.join_to {
                joins.push(node.join_clause(child, graph)?);
            }
        }
        Ok(joins)
    }

    fn join_clause(&self, child: &QueryJoins<'_>, graph: &ModelGraph) -> Result<Join> {
        let edge = graph.edge(&self.model.name, &child.model.name).ok_or_else(|| {
            HuskyError::internal(format!(
                "No join from model {} to model {}",
                self.model.name, child.model.name
            ))
        })?;
        let mut on: Option<Expr> = None;
        for taxon in &edge.taxons {
            let condition = self
                .model
                .taxon_sql_accessor(taxon, false)?
                .eq(child.model.taxon_sql_accessor(taxon, false)?);
            on = Some(match on {
                Some(existing) => existing.and(condition),
                None => condition,
            });
        }
        let on = on.ok_or_else(|| HuskyError::MissingJoinTaxons {
            from: self.model.name.clone(),
            to: child.model.name.clone(),
        })?;
        Ok(Join {
            join_type: edge.join_type.into(),
            table: child.model.table_ref(),
            on,
        })
    }

    /// Sets FROM to the root model and appends the joins of the tree.
    pub fn apply_to(&self, query: Query, graph: &ModelGraph) -> Result<Query> {
        let mut query = query.from(self.model.table_ref());
        query.joins.extend(self.joins(graph)?);
        Ok(query)
    }
}
