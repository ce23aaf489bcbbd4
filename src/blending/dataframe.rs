//! A query together with the taxons its columns hold.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::ValueQuantityType;
use crate::sql::Query;

/// Output column of a [`Dataframe`].
#[derive(Debug, Clone, PartialEq)]
pub struct DataframeColumn {
    /// Column name in the query output (the taxon's safe identifier).
    pub name: String,
    pub taxon: String,
    pub quantity_type: ValueQuantityType,
}

impl DataframeColumn {
    pub fn new(name: &str, taxon: &str, quantity_type: ValueQuantityType) -> Self {
        Self {
            name: name.to_string(),
            taxon: taxon.to_string(),
            quantity_type,
        }
    }
}

/// Query whose columns carry known taxons, with the models it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataframe {
    pub query: Query,
    /// Taxon slug to output column.
    pub slug_to_column: BTreeMap<String, DataframeColumn>,
    pub used_model_names: BTreeSet<String>,
    pub used_physical_data_sources: BTreeSet<String>,
}

impl Dataframe {
    pub fn new(
        query: Query,
        slug_to_column: BTreeMap<String, DataframeColumn>,
        used_model_names: BTreeSet<String>,
        used_physical_data_sources: BTreeSet<String>,
    ) -> Self {
        Self {
            query,
            slug_to_column,
            used_model_names,
            used_physical_data_sources,
        }
    }

    /// Same models, new query and columns.
    pub fn derive(&self, query: Query, slug_to_column: BTreeMap<String, DataframeColumn>) -> Self {
        Self {
            query,
            slug_to_column,
            used_model_names: self.used_model_names.clone(),
            used_physical_data_sources: self.used_physical_data_sources.clone(),
        }
    }
}
