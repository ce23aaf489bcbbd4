//! Blending request types.
//!
//! A [`BlendingDataRequest`] asks for taxons across one or more data sources. Every data
//! source is queried by its own [`DataRequest`] (subrequest); the results are blended into a
//! single dataframe.

use serde::{Deserialize, Serialize};

use crate::error::{HuskyError, Result};
use crate::filter::FilterClause;
use crate::model::Scope;
use crate::taxonomy::TaxonOrderType;

/// Ordering of the result by one taxon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonDataOrder {
    pub taxon: String,
    #[serde(rename = "type")]
    pub order_type: TaxonOrderType,
}

impl TaxonDataOrder {
    pub fn asc(taxon: &str) -> Self {
        Self {
            taxon: taxon.to_string(),
            order_type: TaxonOrderType::Asc,
        }
    }

    pub fn desc(taxon: &str) -> Self {
        Self {
            taxon: taxon.to_string(),
            order_type: TaxonOrderType::Desc,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRequestProperties {
    #[serde(default)]
    pub data_sources: Vec<String>,
    /// Restricts the subrequest to a single model.
    #[serde(default)]
    pub model_name: Option<String>,
}

impl DataRequestProperties {
    pub fn new(data_source: &str) -> Self {
        Self {
            data_sources: vec![data_source.to_string()],
            model_name: None,
        }
    }

    /// The one data source a subrequest is allowed to query.
    pub fn data_source(&self) -> Result<&str> {
        match self.data_sources.as_slice() {
            [data_source] => Ok(data_source),
            _ => Err(HuskyError::MultipleDataSources {
                data_sources: self.data_sources.iter().cloned().collect(),
            }),
        }
    }
}

/// Query against a single data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    #[serde(default)]
    pub taxons: Vec<String>,
    #[serde(default)]
    pub preaggregation_filters: Option<FilterClause>,
    #[serde(default)]
    pub order_by: Vec<TaxonDataOrder>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    pub properties: DataRequestProperties,
    pub scope: Scope,
}

impl DataRequest {
    pub fn new(data_source: &str, scope: Scope, taxons: &[&str]) -> Self {
        Self {
            taxons: taxons.iter().map(|t| t.to_string()).collect(),
            preaggregation_filters: None,
            order_by: vec![],
            limit: None,
            offset: None,
            properties: DataRequestProperties::new(data_source),
            scope,
        }
    }

    pub fn with_preaggregation_filters(mut self, filters: FilterClause) -> Self {
        self.preaggregation_filters = Some(filters);
        self
    }

    pub fn data_source(&self) -> Result<&str> {
        self.properties.data_source()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonScope {
    /// Benchmark against all data of the company.
    #[default]
    Company,
}

/// Which dimensions the benchmark is computed over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonConfig {
    #[serde(default)]
    pub taxons: Option<Vec<String>>,
    #[serde(default)]
    pub scope: ComparisonScope,
}

/// Request blending several data sources into one result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendingDataRequest {
    pub data_subrequests: Vec<DataRequest>,
    /// Taxons requested across all subrequests.
    #[serde(default)]
    pub taxons: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<TaxonDataOrder>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub comparison: Option<ComparisonConfig>,
    #[serde(default)]
    pub grouping_sets: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub fill_date_gaps: bool,
    /// Filters applied after blending and aggregation.
    #[serde(default)]
    pub filters: Option<FilterClause>,
    /// Physical data sources the models may come from.
    #[serde(default)]
    pub physical_data_sources: Option<Vec<String>>,
}

impl BlendingDataRequest {
    pub fn new(data_subrequests: Vec<DataRequest>) -> Self {
        Self {
            data_subrequests,
            taxons: vec![],
            order_by: vec![],
            limit: None,
            offset: None,
            comparison: None,
            grouping_sets: None,
            fill_date_gaps: false,
            filters: None,
            physical_data_sources: None,
        }
    }

    pub fn with_taxons(mut self, taxons: &[&str]) -> Self {
        self.taxons = taxons.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<TaxonDataOrder>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_filters(mut self, filters: FilterClause) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_comparison(mut self, taxons: &[&str]) -> Self {
        self.comparison = Some(ComparisonConfig {
            taxons: Some(taxons.iter().map(|t| t.to_string()).collect()),
            scope: ComparisonScope::Company,
        });
        self
    }

    pub fn with_grouping_sets(mut self, grouping_sets: Vec<Vec<&str>>) -> Self {
        self.grouping_sets = Some(
            grouping_sets
                .into_iter()
                .map(|set| set.into_iter().map(str::to_string).collect())
                .collect(),
        );
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_subrequests.is_empty() {
            return Err(HuskyError::invalid_request(
                "At least one data subrequest is required.",
            ));
        }
        for subrequest in &self.data_subrequests {
            subrequest.data_source()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_request() {
        let request: BlendingDataRequest = serde_json::from_str(
            r#"{
                "data_subrequests": [{
                    "taxons": ["fb|spend"],
                    "properties": {"data_sources": ["fb"]},
                    "scope": {"company_id": "50"}
                }],
                "taxons": ["date"],
                "order_by": [{"taxon": "date", "type": "desc"}],
                "comparison": {"taxons": ["date"]}
            }"#,
        )
        .unwrap();
        assert_eq!(request.order_by, vec![TaxonDataOrder::desc("date")]);
        assert_eq!(request.data_subrequests[0].data_source().unwrap(), "fb");
        assert_eq!(
            request.comparison.unwrap().scope,
            ComparisonScope::Company
        );
        assert!(!request.fill_date_gaps);
    }

    #[test]
    fn test_subrequest_needs_exactly_one_data_source() {
        let mut subrequest = DataRequest::new("fb", Scope::new("50"), &["fb|spend"]);
        subrequest.properties.data_sources.push("tw".into());
        let err = BlendingDataRequest::new(vec![subrequest]).validate().unwrap_err();
        assert!(matches!(err, HuskyError::MultipleDataSources { .. }));

        let err = BlendingDataRequest::new(vec![]).validate().unwrap_err();
        assert!(err.to_string().contains("At least one data subrequest"));
    }
}
