//! Model graph and join resolution.
//!
//! - [`builder`] - directed join graph over the models of one data source
//! - [`search`] - breadth-first search for a join tree covering the wanted taxons
//! - [`query_joins`] - the resulting join tree and its JOIN clauses

pub mod builder;
pub mod query_joins;
pub mod search;

pub use builder::{ModelGraph, ModelJoinEdge};
pub use query_joins::QueryJoins;
