//! Taxon definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::aggregation::{AggregationDefinition, AggregationType, TaxonType};
use crate::error::{HuskyError, Result};
use crate::identifier::safe_identifier;
use crate::tel::TelPhase;

/// Taxons keyed by slug.
pub type TaxonMap = BTreeMap<String, Taxon>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    Text,
    Integer,
    Numeric,
    Datetime,
    Enum,
    Percent,
    Money,
    Url,
    Boolean,
    Duration,
    Variant,
}

impl ValidationType {
    /// Type assumed when a taxon does not declare one.
    pub fn default_for(taxon_type: TaxonType) -> Self {
        match taxon_type {
            TaxonType::Metric => ValidationType::Numeric,
            TaxonType::Dimension => ValidationType::Text,
        }
    }
}

/// Facts derived from a taxon's calculation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonTelMetadata {
    pub used_data_sources: Vec<Option<String>>,
    pub required_raw_taxons: Vec<String>,
    pub optional_raw_taxons: Vec<String>,
    pub used_taxons: Vec<String>,
    pub phase: TelPhase,
    /// Whether the calculation looks like a metric that can be compared.
    pub can_compute_comparison: bool,
    pub aggregation_definition: Option<AggregationDefinition>,
}

/// A named semantic field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTaxon")]
pub struct Taxon {
    pub slug: String,
    pub display_name: String,
    /// Virtual data source namespace; `None` for generic taxons.
    pub data_source: Option<String>,
    pub taxon_type: TaxonType,
    pub calculation: Option<String>,
    pub validation_type: ValidationType,
    pub company_id: String,
    pub aggregation: Option<AggregationDefinition>,
    /// For `comparison@cpm`, the slug `cpm`.
    pub comparison_taxon_slug_origin: Option<String>,
    pub acronym: Option<String>,
    pub tel_metadata: Option<TaxonTelMetadata>,
}

#[derive(Deserialize)]
struct RawTaxon {
    slug: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    data_source: Option<String>,
    #[serde(default)]
    taxon_type: TaxonType,
    #[serde(default)]
    calculation: Option<String>,
    #[serde(default)]
    validation_type: Option<ValidationType>,
    #[serde(default)]
    company_id: String,
    #[serde(default)]
    aggregation: Option<AggregationDefinition>,
    #[serde(default)]
    comparison_taxon_slug_origin: Option<String>,
    #[serde(default)]
    acronym: Option<String>,
    #[serde(default)]
    tel_metadata: Option<TaxonTelMetadata>,
}

impl TryFrom<RawTaxon> for Taxon {
    type Error = HuskyError;

    fn try_from(raw: RawTaxon) -> Result<Self> {
        let taxon = Taxon {
            display_name: raw.display_name.unwrap_or_else(|| raw.slug.clone()),
            slug: raw.slug,
            data_source: raw.data_source,
            taxon_type: raw.taxon_type,
            calculation: raw.calculation,
            validation_type: raw
                .validation_type
                .unwrap_or_else(|| ValidationType::default_for(raw.taxon_type)),
            company_id: raw.company_id,
            aggregation: raw.aggregation,
            comparison_taxon_slug_origin: raw.comparison_taxon_slug_origin,
            acronym: raw.acronym,
            tel_metadata: raw.tel_metadata,
        };
        taxon.validate()?;
        Ok(taxon)
    }
}

impl Taxon {
    /// Raw taxon mapped directly to a model attribute.
    pub fn raw(slug: &str, taxon_type: TaxonType, aggregation: AggregationDefinition) -> Self {
        Self {
            slug: slug.to_string(),
            display_name: slug.to_string(),
            data_source: crate::identifier::data_source_from_slug(slug).map(str::to_string),
            taxon_type,
            calculation: None,
            validation_type: ValidationType::default_for(taxon_type),
            company_id: String::new(),
            aggregation: Some(aggregation),
            comparison_taxon_slug_origin: None,
            acronym: None,
            tel_metadata: None,
        }
    }

    /// Computed taxon defined by a TEL calculation.
    pub fn computed(slug: &str, taxon_type: TaxonType, calculation: &str) -> Self {
        Self {
            calculation: Some(calculation.to_string()),
            aggregation: None,
            ..Self::raw(slug, taxon_type, AggregationDefinition::not_set())
        }
    }

    /// Temporary taxon for a TEL expression queried directly in a request.
    ///
    /// Skips [`Taxon::validate`]: the calculation is the only thing that matters.
    pub fn temporary(slug: &str, calculation: &str, taxon_type: TaxonType, company_id: &str) -> Self {
        Self {
            company_id: company_id.to_string(),
            data_source: None,
            ..Self::computed(slug, taxon_type, calculation)
        }
    }

    /// Exactly one of `calculation` and `aggregation` must be set.
    pub fn validate(&self) -> Result<()> {
        let reason = match (&self.calculation, &self.aggregation) {
            (Some(_), Some(_)) => "Computed taxons cannot have aggregation definition",
            (None, None) => "Raw taxons require aggregation definition",
            _ => return Ok(()),
        };
        Err(HuskyError::InvalidTaxon {
            slug: self.slug.clone(),
            reason: reason.to_string(),
        })
    }

    pub fn is_computed(&self) -> bool {
        self.calculation.is_some()
    }

    pub fn is_comparison_taxon(&self) -> bool {
        self.comparison_taxon_slug_origin.is_some()
    }

    /// Aggregation type from the TEL metadata, falling back to the declared one.
    pub fn tel_metadata_aggregation_type(&self) -> Option<AggregationType> {
        self.tel_metadata
            .as_ref()
            .and_then(|m| m.aggregation_definition.as_ref())
            .or(self.aggregation.as_ref())
            .map(|d| d.agg_type)
    }

    pub fn is_dimension(&self) -> bool {
        self.tel_metadata_aggregation_type()
            .is_some_and(AggregationType::is_dimension)
    }

    pub fn is_metric(&self) -> bool {
        !self.is_dimension()
    }

    pub fn can_have_comparison(&self) -> bool {
        self.tel_metadata
            .as_ref()
            .is_some_and(|m| m.can_compute_comparison)
    }

    pub fn safe_slug(&self) -> String {
        safe_identifier(&self.slug)
    }
}

/// Slug of a temporary taxon created from a queried TEL expression.
pub fn sql_friendly_slug(slug: &str) -> String {
    slug.replace('"', "**")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxon_requires_exactly_one_of_calculation_and_aggregation() {
        let both: std::result::Result<Taxon, _> = serde_json::from_str(
            r#"{"slug": "cpm", "calculation": "spend / impressions", "aggregation": {"type": "sum"}}"#,
        );
        let err = both.unwrap_err().to_string();
        assert!(err.contains("Computed taxons cannot have aggregation definition"), "{err}");

        let neither: std::result::Result<Taxon, _> = serde_json::from_str(r#"{"slug": "spend"}"#);
        let err = neither.unwrap_err().to_string();
        assert!(err.contains("Raw taxons require aggregation definition"), "{err}");
    }

    #[test]
    fn test_dimension_classification_uses_tel_metadata_first() {
        let mut taxon = Taxon::computed("ratio", TaxonType::Metric, "a / b");
        assert!(!taxon.is_dimension());

        taxon.tel_metadata = Some(TaxonTelMetadata {
            aggregation_definition: Some(AggregationDefinition::group_by()),
            ..Default::default()
        });
        assert!(taxon.is_dimension());

        let raw = Taxon::raw("spend", TaxonType::Metric, AggregationDefinition::sum());
        assert!(raw.is_metric());
        assert!(raw.validate().is_ok());
    }

    #[test]
    fn test_validation_type_follows_taxon_type_unless_declared() {
        let parse = |json: &str| serde_json::from_str::<Taxon>(json).unwrap().validation_type;
        assert_eq!(
            parse(r#"{"slug": "fb|spend", "taxon_type": "metric", "aggregation": {"type": "sum"}}"#),
            ValidationType::Numeric
        );
        assert_eq!(
            parse(r#"{"slug": "fb|ad_name", "taxon_type": "dimension", "aggregation": {"type": "group_by"}}"#),
            ValidationType::Text
        );
        assert_eq!(
            parse(
                r#"{"slug": "fb|clicks", "taxon_type": "metric", "validation_type": "integer",
                    "aggregation": {"type": "sum"}}"#
            ),
            ValidationType::Integer
        );

        let raw = Taxon::raw("spend", TaxonType::Metric, AggregationDefinition::sum());
        assert_eq!(raw.validation_type, ValidationType::Numeric);
    }

    #[test]
    fn test_raw_taxon_namespace() {
        let taxon = Taxon::raw("fb|spend", TaxonType::Metric, AggregationDefinition::sum());
        assert_eq!(taxon.data_source.as_deref(), Some("fb"));
        assert_eq!(sql_friendly_slug(r#"=m:"col""#), "=m:**col**");
    }
}
