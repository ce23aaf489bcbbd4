//! Aggregation definitions attached to raw taxons or derived from calculations.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HuskyError, Result};

/// Aggregation function applied to a taxon when rows are grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Sum,
    Avg,
    Min,
    Max,
    CountAll,
    CountDistinct,
    GroupBy,
    FirstBy,
    LastBy,
    NotSet,
}

impl AggregationType {
    /// Aggregations taking no parameters.
    pub fn is_simple(self) -> bool {
        matches!(
            self,
            AggregationType::Sum
                | AggregationType::Avg
                | AggregationType::Min
                | AggregationType::Max
                | AggregationType::CountAll
                | AggregationType::GroupBy
        )
    }

    /// Aggregations ordering rows by sort dimensions.
    pub fn needs_sort_dimensions(self) -> bool {
        matches!(self, AggregationType::FirstBy | AggregationType::LastBy)
    }

    /// Aggregation types which mark a taxon as a dimension.
    pub fn is_dimension(self) -> bool {
        matches!(
            self,
            AggregationType::LastBy
                | AggregationType::FirstBy
                | AggregationType::GroupBy
                | AggregationType::Max
                | AggregationType::Min
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AggregationType::Sum => "sum",
            AggregationType::Avg => "avg",
            AggregationType::Min => "min",
            AggregationType::Max => "max",
            AggregationType::CountAll => "count_all",
            AggregationType::CountDistinct => "count_distinct",
            AggregationType::GroupBy => "group_by",
            AggregationType::FirstBy => "first_by",
            AggregationType::LastBy => "last_by",
            AggregationType::NotSet => "not_set",
        }
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a taxon is a dimension or a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxonType {
    #[default]
    Dimension,
    Metric,
}

impl fmt::Display for TaxonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaxonType::Dimension => "dimension",
            TaxonType::Metric => "metric",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxonOrderType {
    Asc,
    Desc,
}

/// One sort dimension of a `first_by`/`last_by` aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationOrderByTaxon {
    pub taxon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<TaxonOrderType>,
}

/// Parameters of the aggregations that need them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregationParams {
    SortDimension {
        sort_dimensions: Vec<AggregationOrderByTaxon>,
    },
    CountDistinct {
        #[serde(default)]
        fields: Vec<String>,
    },
}

impl AggregationParams {
    pub fn used_taxon_slugs(&self) -> BTreeSet<String> {
        match self {
            AggregationParams::SortDimension { sort_dimensions } => {
                sort_dimensions.iter().map(|d| d.taxon.clone()).collect()
            }
            AggregationParams::CountDistinct { fields } => fields.iter().cloned().collect(),
        }
    }
}

/// Aggregation type plus its parameters.
///
/// Deserialization goes through [`AggregationDefinition::new`], so parameters are always
/// consistent with the type: simple types carry none, `count_distinct` defaults to an empty
/// field list and `first_by`/`last_by` require sort dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawAggregationDefinition")]
pub struct AggregationDefinition {
    #[serde(rename = "type")]
    pub agg_type: AggregationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<AggregationParams>,
}

#[derive(Deserialize)]
struct RawAggregationDefinition {
    #[serde(rename = "type")]
    agg_type: AggregationType,
    #[serde(default)]
    params: Option<AggregationParams>,
}

impl TryFrom<RawAggregationDefinition> for AggregationDefinition {
    type Error = HuskyError;

    fn try_from(raw: RawAggregationDefinition) -> Result<Self> {
        AggregationDefinition::new(raw.agg_type, raw.params)
    }
}

impl AggregationDefinition {
    pub fn new(agg_type: AggregationType, params: Option<AggregationParams>) -> Result<Self> {
        if agg_type == AggregationType::NotSet || agg_type.is_simple() {
            return Ok(Self::simple(agg_type));
        }
        let params = match (agg_type, params) {
            (AggregationType::CountDistinct, None) => {
                AggregationParams::CountDistinct { fields: vec![] }
            }
            (AggregationType::CountDistinct, Some(p @ AggregationParams::CountDistinct { .. })) => p,
            (_, None) => {
                return Err(HuskyError::invalid_request(format!(
                    "Missing \"params\" field for aggregation {agg_type}"
                )))
            }
            (t, Some(p @ AggregationParams::SortDimension { .. })) if t.needs_sort_dimensions() => {
                p
            }
            (t, Some(_)) => {
                return Err(HuskyError::invalid_request(format!(
                    "Unsupported params for aggregation type - {t}"
                )))
            }
        };
        if let AggregationParams::CountDistinct { fields } = &params {
            if fields.iter().any(|f| f.trim().is_empty()) {
                return Err(HuskyError::invalid_request(
                    "count_distinct fields must be non-empty strings",
                ));
            }
        }
        Ok(Self {
            agg_type,
            params: Some(params),
        })
    }

    /// Definition without parameters.
    pub fn simple(agg_type: AggregationType) -> Self {
        Self {
            agg_type,
            params: None,
        }
    }

    pub fn not_set() -> Self {
        Self::simple(AggregationType::NotSet)
    }

    pub fn sum() -> Self {
        Self::simple(AggregationType::Sum)
    }

    pub fn group_by() -> Self {
        Self::simple(AggregationType::GroupBy)
    }

    pub fn sort_by(agg_type: AggregationType, sort_dimensions: Vec<AggregationOrderByTaxon>) -> Result<Self> {
        Self::new(
            agg_type,
            Some(AggregationParams::SortDimension { sort_dimensions }),
        )
    }

    pub fn used_taxon_slugs(&self) -> BTreeSet<String> {
        self.params
            .as_ref()
            .map(AggregationParams::used_taxon_slugs)
            .unwrap_or_default()
    }

    /// Reduces several definitions to the one they agree on.
    ///
    /// Returns `None` when any definition is missing or when two defined types differ.
    /// When nothing is defined (all `not_set`), the fallback picks `group_by` for
    /// dimensions and `sum` for metrics; without fallback the result stays `not_set`.
    pub fn common_defined_definition<'a>(
        definitions: impl IntoIterator<Item = Option<&'a AggregationDefinition>>,
        use_fallback: bool,
        calculation_type: TaxonType,
    ) -> Option<AggregationDefinition> {
        let definitions: Vec<_> = definitions.into_iter().collect::<Option<Vec<_>>>()?;
        let defined: Vec<&AggregationDefinition> = definitions
            .into_iter()
            .filter(|d| d.agg_type != AggregationType::NotSet)
            .collect();
        let unique: BTreeSet<AggregationType> = defined.iter().map(|d| d.agg_type).collect();

        match unique.len() {
            0 if use_fallback => Some(match calculation_type {
                TaxonType::Dimension => Self::group_by(),
                TaxonType::Metric => Self::sum(),
            }),
            0 => Some(Self::not_set()),
            1 => defined.first().map(|d| (*d).clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_types_drop_params() {
        let def = AggregationDefinition::new(
            AggregationType::Sum,
            Some(AggregationParams::CountDistinct {
                fields: vec!["x".into()],
            }),
        )
        .unwrap();
        assert_eq!(def, AggregationDefinition::sum());
    }

    #[test]
    fn test_count_distinct_defaults_to_empty_fields() {
        let def: AggregationDefinition =
            serde_json::from_str(r#"{"type": "count_distinct"}"#).unwrap();
        assert_eq!(
            def.params,
            Some(AggregationParams::CountDistinct { fields: vec![] })
        );
    }

    #[test]
    fn test_first_by_requires_params() {
        let err = serde_json::from_str::<AggregationDefinition>(r#"{"type": "first_by"}"#);
        assert!(err.is_err());

        let def: AggregationDefinition = serde_json::from_str(
            r#"{"type": "last_by", "params": {"sort_dimensions": [{"taxon": "date", "order_by": "desc"}]}}"#,
        )
        .unwrap();
        assert_eq!(
            def.used_taxon_slugs().into_iter().collect::<Vec<_>>(),
            vec!["date".to_string()]
        );
    }

    #[test]
    fn test_common_definition_without_fallback_is_not_set() {
        let not_set = AggregationDefinition::not_set();
        let common = AggregationDefinition::common_defined_definition(
            [Some(&not_set), Some(&not_set)],
            false,
            TaxonType::Metric,
        );
        assert_eq!(common, Some(AggregationDefinition::not_set()));
    }

    #[test]
    fn test_common_definition_fallback_by_taxon_type() {
        let not_set = AggregationDefinition::not_set();
        let metric =
            AggregationDefinition::common_defined_definition([Some(&not_set)], true, TaxonType::Metric);
        assert_eq!(metric, Some(AggregationDefinition::sum()));
        let dimension = AggregationDefinition::common_defined_definition(
            [Some(&not_set)],
            true,
            TaxonType::Dimension,
        );
        assert_eq!(dimension, Some(AggregationDefinition::group_by()));
    }

    #[test]
    fn test_common_definition_disagreement() {
        let sum = AggregationDefinition::sum();
        let max = AggregationDefinition::simple(AggregationType::Max);
        let not_set = AggregationDefinition::not_set();
        assert_eq!(
            AggregationDefinition::common_defined_definition(
                [Some(&sum), Some(&not_set), Some(&sum)],
                false,
                TaxonType::Metric
            ),
            Some(AggregationDefinition::sum())
        );
        assert_eq!(
            AggregationDefinition::common_defined_definition(
                [Some(&sum), Some(&max)],
                false,
                TaxonType::Metric
            ),
            None
        );
        assert_eq!(
            AggregationDefinition::common_defined_definition(
                [Some(&sum), None],
                true,
                TaxonType::Metric
            ),
            None
        );
    }
}
