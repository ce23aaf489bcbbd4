//! The blending pipeline: a [`BlendingDataRequest`] compiled into one [`Dataframe`].

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::blend::{blend, left_join};
use super::comparison::comparison_dataframe;
use super::dataframe::Dataframe;
use super::dimension::dimension_phase;
use super::metric::metric_phase;
use super::override_mapping::OverrideMappingManager;
use super::preprocess::preprocess_request;
use super::projection::project;
use super::request::BlendingDataRequest;
use super::source::SourceQueryBuilder;
use super::taxon_manager::BlendingTaxonManager;
use crate::error::{HuskyError, Result};
use crate::identifier::COMPARISON_PREFIX;
use crate::model::ModelLoader;
use crate::taxonomy::{OverrideMappingLoader, TaxonLoader};

/// Default maximum of distinct override mappings one request may use.
pub const DEFAULT_MAX_OVERRIDE_MAPPINGS: usize = 10;

/// Loaders and options a request is compiled with.
pub struct BlendingContext<'a> {
    pub taxons: &'a dyn TaxonLoader,
    pub models: &'a dyn ModelLoader,
    pub override_mappings: &'a dyn OverrideMappingLoader,
    /// Replace `not_set` aggregations of loaded taxons with the type's fallback.
    pub use_fallback_aggregations: bool,
    pub max_override_mappings: usize,
}

impl<'a> BlendingContext<'a> {
    pub fn new(
        taxons: &'a dyn TaxonLoader,
        models: &'a dyn ModelLoader,
        override_mappings: &'a dyn OverrideMappingLoader,
    ) -> Self {
        Self {
            taxons,
            models,
            override_mappings,
            use_fallback_aggregations: true,
            max_override_mappings: DEFAULT_MAX_OVERRIDE_MAPPINGS,
        }
    }

    pub fn with_fallback_aggregations(mut self, enabled: bool) -> Self {
        self.use_fallback_aggregations = enabled;
        self
    }

    pub fn with_max_override_mappings(mut self, max: usize) -> Self {
        self.max_override_mappings = max;
        self
    }

    /// Runs every stage of the pipeline over `request`.
    pub fn build(&self, request: &BlendingDataRequest) -> Result<Dataframe> {
        request.validate()?;
        let mut request = request.clone();
        preprocess_request(&mut request)?;
        let request = &request;

        let manager =
            BlendingTaxonManager::load(request, self.taxons, self.use_fallback_aggregations)?;
        let plan = &manager.plan;
        let company_id = request
            .data_subrequests
            .first()
            .map(|s| s.scope.company_id.as_str())
            .ok_or_else(|| HuskyError::internal("Request has no subrequests"))?;
        let overrides = OverrideMappingManager::load(
            self.override_mappings,
            company_id,
            plan.override_mappings
                .iter()
                .chain(&plan.comparison_override_mappings),
            self.max_override_mappings,
        )?;
        let physical_data_sources: Option<BTreeSet<String>> = request
            .physical_data_sources
            .as_ref()
            .map(|sources| sources.iter().cloned().collect());

        let mut dataframes = Vec::with_capacity(request.data_subrequests.len());
        for subrequest in &request.data_subrequests {
            let mut subrequest = subrequest.clone();
            subrequest.taxons = manager.subrequest_taxons(&subrequest)?.into_iter().collect();
            let data_source = subrequest.data_source()?;
            let dimension_templates = plan
                .data_source_formula_templates
                .get(data_source)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut builder = SourceQueryBuilder::new(&subrequest, manager.taxon_map())
                .with_dimension_templates(dimension_templates)
                .with_physical_data_sources(physical_data_sources.as_ref());
            if let Some(filter_templates) = plan.data_source_filter_templates.get(data_source) {
                builder = builder.with_filter_templates(filter_templates);
            }
            dataframes.push(builder.build(self.models)?);
        }
        let data = blend(dataframes, &plan.data_source_formula_templates, manager.taxon_map())?;
        let data = dimension_phase(data, &plan.dimension_formulas, &plan.override_mappings, &overrides)?;

        let blended = match comparison_dataframe(
            request,
            &manager,
            &overrides,
            self.models,
            physical_data_sources.as_ref(),
        )? {
            Some(comparison)
                if comparison
                    .slug_to_column
                    .keys()
                    .any(|slug| slug.starts_with(COMPARISON_PREFIX)) =>
            {
                debug!("joining comparison dataframe");
                left_join(data, comparison, plan)
            }
            Some(_) => {
                debug!("no comparison metrics, skipping comparison join");
                data
            }
            None => data,
        };

        let calculated = metric_phase(
            blended,
            plan,
            request.grouping_sets.as_deref(),
            request.filters.as_ref(),
        )?;
        let projected = project(
            calculated,
            &manager.return_taxons()?,
            &request.order_by,
            request.limit,
            request.offset,
        )?;
        info!(
            subrequests = request.data_subrequests.len(),
            models = ?projected.used_model_names,
            columns = projected.slug_to_column.len(),
            "compiled blending request"
        );
        Ok(projected)
    }
}
