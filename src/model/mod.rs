//! Models: the tables taxons are read from.
//!
//! - [`definition`] - models, their attributes and joins
//! - [`augment`] - attributes every model gets
//! - [`store`] - scoped model loading

pub mod augment;
pub mod definition;
pub mod store;
pub mod types;

pub use definition::{Model, ModelAttribute, ModelJoin};
pub use store::{ModelLoader, ModelStore, Scope};
pub use types::{
    JoinDirection, ModelJoinType, ModelType, ModelVisibility, Relationship, TimeGranularity,
    ValueQuantityType,
};
