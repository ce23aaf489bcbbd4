//! Taxons of a blending request: loading, raw taxon expansion and the return set.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use super::planner::{self, TelPlan};
use super::request::{BlendingDataRequest, ComparisonConfig, ComparisonScope, DataRequest};
use crate::error::{HuskyError, Result};
use crate::identifier::{comparison_slug, data_source_from_slug};
use crate::model::augment::COMPANY_ID;
use crate::taxonomy::{sql_friendly_slug, Taxon, TaxonLoader, TaxonMap, TaxonResolver};
use crate::tel::used_taxon_slugs_shallow;

/// Every taxon a preprocessed request uses, with its TEL plan.
#[derive(Debug)]
pub struct BlendingTaxonManager<'r> {
    request: &'r BlendingDataRequest,
    taxon_map: TaxonMap,
    data_sources: BTreeSet<String>,
    /// Taxon slug to the data sources requesting it.
    taxon_to_ds: BTreeMap<String, BTreeSet<String>>,
    grouping_set_slugs: BTreeSet<String>,
    pub plan: TelPlan,
}

impl<'r> BlendingTaxonManager<'r> {
    /// Loads every taxon the request reads and plans the projection.
    pub fn load(
        request: &'r BlendingDataRequest,
        loader: &dyn TaxonLoader,
        use_fallback_aggregations: bool,
    ) -> Result<Self> {
        let mut taxon_to_ds: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut data_sources = BTreeSet::new();
        for subrequest in &request.data_subrequests {
            let data_source = subrequest.data_source()?;
            data_sources.insert(data_source.to_string());
            let slugs = subrequest
                .taxons
                .iter()
                .chain(subrequest.order_by.iter().map(|o| &o.taxon));
            for slug in slugs {
                taxon_to_ds
                    .entry(sql_friendly_slug(slug))
                    .or_default()
                    .insert(data_source.to_string());
            }
        }
        let grouping_set_slugs: BTreeSet<String> =
            request.grouping_sets.iter().flatten().flatten().cloned().collect();

        let mut manager = Self {
            request,
            taxon_map: TaxonMap::new(),
            data_sources,
            taxon_to_ds,
            grouping_set_slugs,
            plan: TelPlan::default(),
        };
        manager.load_all_used_taxons(loader, use_fallback_aggregations)?;
        manager.validate_grouping_sets()?;
        let projection = manager.projection_taxons()?;
        manager.plan = planner::plan(request, &projection, &manager.taxon_map, &manager.taxon_to_ds)?;
        Ok(manager)
    }

    fn load_all_used_taxons(&mut self, loader: &dyn TaxonLoader, use_fallback: bool) -> Result<()> {
        let request = self.request;
        let company_id = request
            .data_subrequests
            .first()
            .map(|s| s.scope.company_id.clone())
            .ok_or_else(|| HuskyError::invalid_request("At least one data subrequest is required."))?;

        let mut slugs: BTreeSet<String> = self.grouping_set_slugs.clone();
        if let Some(filters) = &request.filters {
            slugs.extend(filters.taxon_slugs());
        }
        if let Some(comparison) = &request.comparison {
            slugs.extend(comparison.taxons.iter().flatten().cloned());
            if comparison.scope == ComparisonScope::Company {
                slugs.insert(COMPANY_ID.to_string());
            }
        }
        slugs.extend(request.order_by.iter().map(|o| o.taxon.clone()));
        for subrequest in &request.data_subrequests {
            slugs.extend(subrequest.taxons.iter().cloned());
            for filters in [&subrequest.scope.preaggregation_filters, &subrequest.preaggregation_filters]
                .into_iter()
                .flatten()
            {
                slugs.extend(filters.taxon_slugs());
            }
        }

        let slugs: Vec<String> = slugs.into_iter().collect();
        let mut resolver = TaxonResolver::new(loader)
            .with_data_sources(Some(self.data_sources.clone()))
            .with_aggregation_taxons(true);
        let mut taxon_map = resolver.resolve_request(&company_id, &slugs)?;
        resolver.complete_tel_metadata(&mut taxon_map, use_fallback)?;
        debug!(requested = slugs.len(), loaded = taxon_map.len(), "loaded request taxons");
        self.taxon_map = taxon_map;
        Ok(())
    }

    fn validate_grouping_sets(&self) -> Result<()> {
        let metrics: Vec<String> = self
            .taxons(&self.grouping_set_slugs)?
            .into_values()
            .filter(Taxon::is_metric)
            .map(|t| t.slug)
            .collect();
        if !metrics.is_empty() {
            return Err(HuskyError::invalid_request(format!(
                "Grouping sets cannot contain metric taxons: {}",
                metrics.join(", ")
            )));
        }
        Ok(())
    }

    pub fn taxon_map(&self) -> &TaxonMap {
        &self.taxon_map
    }

    pub fn data_sources(&self) -> &BTreeSet<String> {
        &self.data_sources
    }

    pub fn grouping_set_slugs(&self) -> &BTreeSet<String> {
        &self.grouping_set_slugs
    }

    pub fn taxon(&self, slug: &str) -> Result<&Taxon> {
        self.taxon_map
            .get(&sql_friendly_slug(slug))
            .ok_or_else(|| HuskyError::internal(format!("Taxon \"{slug}\" was not loaded")))
    }

    /// Loaded taxons for `slugs`, keyed by their SQL friendly slug.
    pub fn taxons<'s>(&self, slugs: impl IntoIterator<Item = &'s String>) -> Result<TaxonMap> {
        slugs
            .into_iter()
            .map(|slug| Ok((sql_friendly_slug(slug), self.taxon(slug)?.clone())))
            .collect()
    }

    /// Raw taxons used by `slugs` that `data_source` can provide.
    ///
    /// Optional references to taxons that were not loaded are skipped.
    pub fn raw_taxon_slugs<'s>(
        &self,
        slugs: impl IntoIterator<Item = &'s String>,
        data_source: &str,
    ) -> Result<BTreeSet<String>> {
        let mut raw = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut stack: Vec<String> = slugs.into_iter().map(|s| sql_friendly_slug(s)).collect();
        while let Some(slug) = stack.pop() {
            if !visited.insert(slug.clone()) {
                continue;
            }
            let Some(taxon) = self.taxon_map.get(&slug) else {
                trace!(%slug, "skipping taxon that was not loaded");
                continue;
            };
            match &taxon.calculation {
                Some(calculation) => {
                    let used = used_taxon_slugs_shallow(calculation, Some(&self.data_sources))?;
                    stack.extend(used.all_slugs());
                }
                None => {
                    if data_source_from_slug(&taxon.slug).map_or(true, |ds| ds == data_source) {
                        raw.insert(taxon.slug.clone());
                    }
                }
            }
        }
        Ok(raw)
    }

    /// Raw taxons a subrequest has to select so every later phase finds its inputs.
    pub fn subrequest_taxons(&self, subrequest: &DataRequest) -> Result<BTreeSet<String>> {
        let data_source = subrequest.data_source()?;
        let mut slugs: BTreeSet<String> = subrequest.taxons.iter().cloned().collect();
        if let Some(filters) = &subrequest.preaggregation_filters {
            slugs.extend(filters.taxon_slugs());
        }
        let mut raw = self.raw_taxon_slugs(&slugs, data_source)?;
        raw.extend(self.plan.comparison_raw_taxon_slugs.iter().cloned());
        raw.extend(self.raw_taxon_slugs(&self.grouping_set_slugs, data_source)?);
        if let Some(filters) = &self.request.filters {
            raw.extend(self.raw_taxon_slugs(&filters.taxon_slugs(), data_source)?);
        }
        Ok(raw)
    }

    /// Raw taxons the comparison subrequest of `subrequest` selects.
    pub fn comparison_subrequest_raw_taxons(
        &self,
        subrequest: &DataRequest,
        comparison: &ComparisonConfig,
    ) -> Result<BTreeSet<String>> {
        if comparison.taxons.is_none() {
            return Err(HuskyError::InvalidComparisonRequest(
                "Comparison taxons are required".into(),
            ));
        }
        let comparable: BTreeSet<String> = self
            .taxons(&subrequest.taxons)?
            .into_values()
            .filter(Taxon::can_have_comparison)
            .map(|t| t.slug)
            .collect();
        let mut raw: BTreeSet<String> = self.plan.comparison_raw_taxon_slugs.iter().cloned().collect();
        raw.extend(self.raw_taxon_slugs(&comparable, subrequest.data_source()?)?);
        Ok(raw)
    }

    /// Taxons of the final result, comparison taxons included.
    pub fn return_taxons(&self) -> Result<TaxonMap> {
        let mut return_taxons = TaxonMap::new();
        for subrequest in &self.request.data_subrequests {
            let subrequest_taxons = self.taxons(&subrequest.taxons)?;
            if self.request.comparison.is_some() {
                return_taxons.extend(
                    subrequest_taxons
                        .values()
                        .filter(|t| t.can_have_comparison())
                        .map(create_comparison_taxon),
                );
            }
            return_taxons.extend(subrequest_taxons);
        }
        if self.request.grouping_sets.is_some() {
            return_taxons.retain(|_, taxon| !taxon.is_dimension());
            return_taxons.extend(self.taxons(&self.grouping_set_slugs)?);
        }
        Ok(return_taxons)
    }

    /// Return taxons plus the taxons post-aggregation filters and ordering read.
    pub fn projection_taxons(&self) -> Result<TaxonMap> {
        let mut slugs: BTreeSet<String> =
            self.request.order_by.iter().map(|o| o.taxon.clone()).collect();
        if let Some(filters) = &self.request.filters {
            slugs.extend(filters.taxon_slugs());
        }
        let mut projection = self.taxons(&slugs)?;
        projection.extend(self.return_taxons()?);
        Ok(projection)
    }
}

/// Copy of `taxon` computed over the benchmark data.
pub fn create_comparison_taxon(taxon: &Taxon) -> (String, Taxon) {
    let slug = comparison_slug(&taxon.slug);
    let mut comparison = taxon.clone();
    comparison.slug = slug.clone();
    comparison.comparison_taxon_slug_origin = Some(taxon.slug.clone());
    (slug, comparison)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blending::request::DataRequest;
    use crate::model::Scope;
    use crate::taxonomy::{AggregationDefinition, TaxonType, Taxonomy};

    fn taxonomy() -> Taxonomy {
        Taxonomy::new([
            Taxon::raw("fb|spend", TaxonType::Metric, AggregationDefinition::sum()),
            Taxon::raw("fb|impressions", TaxonType::Metric, AggregationDefinition::sum()),
            Taxon::raw("tw|spend", TaxonType::Metric, AggregationDefinition::sum()),
            Taxon::raw("date", TaxonType::Dimension, AggregationDefinition::group_by()),
            Taxon::raw("company_id", TaxonType::Dimension, AggregationDefinition::group_by()),
            Taxon::computed("spend", TaxonType::Metric, "fb|spend? + tw|spend?"),
            Taxon::computed("cpm", TaxonType::Metric, "fb|spend / fb|impressions * 1000"),
        ])
    }

    fn request() -> BlendingDataRequest {
        BlendingDataRequest::new(vec![
            DataRequest::new("fb", Scope::new("50"), &["spend", "date"]),
            DataRequest::new("tw", Scope::new("50"), &["spend", "date"]),
        ])
    }

    #[test]
    fn test_raw_taxons_per_data_source() {
        let taxonomy = taxonomy();
        let request = request();
        let manager = BlendingTaxonManager::load(&request, &taxonomy, false).unwrap();
        let fb = manager.subrequest_taxons(&request.data_subrequests[0]).unwrap();
        let tw = manager.subrequest_taxons(&request.data_subrequests[1]).unwrap();
        assert_eq!(fb, BTreeSet::from(["date".to_string(), "fb|spend".to_string()]));
        assert_eq!(tw, BTreeSet::from(["date".to_string(), "tw|spend".to_string()]));
    }

    #[test]
    fn test_grouping_sets_reject_metrics() {
        let taxonomy = taxonomy();
        let request = request().with_grouping_sets(vec![vec!["date", "spend"]]);
        let err = BlendingTaxonManager::load(&request, &taxonomy, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid request: Grouping sets cannot contain metric taxons: spend"
        );
    }

    #[test]
    fn test_comparison_taxons_are_returned() {
        let taxonomy = taxonomy();
        let request = BlendingDataRequest::new(vec![DataRequest::new(
            "fb",
            Scope::new("50"),
            &["cpm", "date"],
        )])
        .with_comparison(&["date"]);
        let manager = BlendingTaxonManager::load(&request, &taxonomy, false).unwrap();
        let returned = manager.return_taxons().unwrap();
        assert_eq!(
            returned.keys().collect::<Vec<_>>(),
            vec!["comparison@cpm", "cpm", "date"]
        );
        assert_eq!(
            returned["comparison@cpm"].comparison_taxon_slug_origin.as_deref(),
            Some("cpm")
        );
        let comparison = request.comparison.as_ref().unwrap();
        let raw = manager
            .comparison_subrequest_raw_taxons(&request.data_subrequests[0], comparison)
            .unwrap();
        assert_eq!(
            raw,
            BTreeSet::from([
                "date".to_string(),
                "fb|impressions".to_string(),
                "fb|spend".to_string()
            ])
        );
        assert!(manager.taxon_map().contains_key("company_id"));
    }
}
