//! Taxonomy: taxon definitions, aggregation definitions and taxon resolution.

pub mod aggregation;
pub mod override_mapping;
pub mod resolver;
pub mod taxon;

pub use aggregation::{
    AggregationDefinition, AggregationOrderByTaxon, AggregationParams, AggregationType,
    TaxonOrderType, TaxonType,
};
pub use override_mapping::{OverrideMapping, OverrideMappingLoader, OverrideMappingStore};
pub use resolver::{TaxonLoader, TaxonResolver, Taxonomy};
pub use taxon::{sql_friendly_slug, Taxon, TaxonMap, TaxonTelMetadata, ValidationType};
