//! Query blending: compiles a [`BlendingDataRequest`] into one SQL query.
//!
//! Stages, in order:
//!
//! - [`preprocess`] - moves top-level taxons into the subrequests
//! - [`taxon_manager`] / [`planner`] - loads taxons and splits them into phase formulas
//! - [`source`] - one aggregated query per data source
//! - [`blend`] - union of the per-source queries, and the comparison join
//! - [`dimension`] - dimension formulas over the blended rows
//! - [`comparison`] - the benchmark dataframe
//! - [`metric`] - aggregation, grouping sets and post-aggregation filters
//! - [`projection`] - requested columns, ordering and limits
//!
//! [`pipeline::BlendingContext`] runs them all.

pub mod blend;
pub mod comparison;
pub mod dataframe;
pub mod dimension;
pub mod metric;
pub mod override_mapping;
pub mod pipeline;
pub mod planner;
pub mod preprocess;
pub mod projection;
pub mod request;
pub mod source;
pub mod taxon_manager;

pub use dataframe::{Dataframe, DataframeColumn};
pub use pipeline::{BlendingContext, DEFAULT_MAX_OVERRIDE_MAPPINGS};
pub use request::{
    BlendingDataRequest, ComparisonConfig, ComparisonScope, DataRequest, DataRequestProperties,
    TaxonDataOrder,
};
