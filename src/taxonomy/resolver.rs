//! Taxon resolution: loading the full closure of taxons a request needs.
//!
//! Computed taxons reference other taxons in their calculations, which may be computed again.
//! [`TaxonResolver`] expands the requested slugs until no new slug appears, keeping track of
//! which taxons are required and which are only reachable through optional references.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use super::aggregation::{AggregationDefinition, AggregationType, TaxonType};
use super::taxon::{sql_friendly_slug, Taxon, TaxonMap};
use crate::error::{HuskyError, Result};
use crate::identifier::{
    TEL_EXPR_DIMENSION_QUERY_PREFIX, TEL_EXPR_METRIC_QUERY_PREFIX, TEL_EXPR_QUERY_PREFIX,
};
use crate::tel::{tel_metadata, used_taxon_slugs_shallow, UsedTaxonSlugsContainer, UsedTaxonsContainer};

/// Source of taxon definitions.
///
/// # Example
///
/// ```ignore
/// use husky::taxonomy::{TaxonLoader, Taxonomy};
///
/// let taxonomy = Taxonomy::new(taxons);
/// let found = taxonomy.load_taxons(&slugs, true)?;
/// ```
pub trait TaxonLoader {
    /// Loads the taxons with the given slugs.
    ///
    /// With `must_load_all`, a slug without a taxon fails with `TaxonsNotFound`;
    /// otherwise it is skipped.
    fn load_taxons(&self, slugs: &BTreeSet<String>, must_load_all: bool) -> Result<TaxonMap>;
}

/// In-memory taxonomy of one company.
#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    taxons: TaxonMap,
}

impl Taxonomy {
    pub fn new(taxons: impl IntoIterator<Item = Taxon>) -> Self {
        Self {
            taxons: taxons.into_iter().map(|t| (t.slug.clone(), t)).collect(),
        }
    }

    pub fn get(&self, slug: &str) -> Option<&Taxon> {
        self.taxons.get(slug)
    }

    pub fn taxons(&self) -> impl Iterator<Item = &Taxon> {
        self.taxons.values()
    }

    pub fn len(&self) -> usize {
        self.taxons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taxons.is_empty()
    }

    /// Computes the TEL metadata of every taxon.
    pub fn precalculate_tel_metadata(&mut self) -> Result<()> {
        let resolver = TaxonResolver::new(&*self);
        let metadata = self
            .taxons
            .values()
            .map(|taxon| {
                let used = resolver.used_in_definition(taxon)?;
                Ok((taxon.slug.clone(), tel_metadata(taxon, used)?))
            })
            .collect::<Result<Vec<_>>>()?;
        for (slug, metadata) in metadata {
            if let Some(taxon) = self.taxons.get_mut(&slug) {
                taxon.tel_metadata = Some(metadata);
            }
        }
        Ok(())
    }
}

impl TaxonLoader for Taxonomy {
    fn load_taxons(&self, slugs: &BTreeSet<String>, must_load_all: bool) -> Result<TaxonMap> {
        let found: TaxonMap = slugs
            .iter()
            .filter_map(|slug| self.taxons.get(slug).map(|t| (slug.clone(), t.clone())))
            .collect();
        if must_load_all && found.len() < slugs.len() {
            return Err(HuskyError::TaxonsNotFound {
                slugs: slugs
                    .iter()
                    .filter(|slug| !found.contains_key(*slug))
                    .cloned()
                    .collect(),
            });
        }
        Ok(found)
    }
}

/// Per-request taxon resolution over a [`TaxonLoader`].
pub struct TaxonResolver<'l> {
    loader: &'l dyn TaxonLoader,
    data_sources: Option<BTreeSet<String>>,
    include_aggregation_taxons: bool,
    /// Taxons created for TEL expressions queried directly (`=m:...`, `=d:...`).
    temporary: TaxonMap,
}

impl<'l> TaxonResolver<'l> {
    pub fn new(loader: &'l dyn TaxonLoader) -> Self {
        Self {
            loader,
            data_sources: None,
            include_aggregation_taxons: false,
            temporary: TaxonMap::new(),
        }
    }

    /// Limits expansion to references into the given data sources.
    pub fn with_data_sources(mut self, data_sources: Option<BTreeSet<String>>) -> Self {
        self.data_sources = data_sources;
        self
    }

    /// Also loads the taxons aggregation definitions refer to (sort dimensions).
    pub fn with_aggregation_taxons(mut self, include: bool) -> Self {
        self.include_aggregation_taxons = include;
        self
    }

    /// Loads `slugs` and every taxon they use, recursively.
    ///
    /// Required taxons used only by optional taxons are returned as optional.
    pub fn resolve(&self, slugs: &BTreeSet<String>) -> Result<UsedTaxonsContainer> {
        self.resolve_with(
            slugs,
            self.data_sources.as_ref(),
            self.include_aggregation_taxons,
        )
    }

    fn resolve_with(
        &self,
        slugs: &BTreeSet<String>,
        data_sources: Option<&BTreeSet<String>>,
        include_aggregation_taxons: bool,
    ) -> Result<UsedTaxonsContainer> {
        let mut used = UsedTaxonsContainer::default();
        let mut seen = UsedTaxonSlugsContainer::default();
        let mut to_get = UsedTaxonSlugsContainer {
            required_slugs: slugs.clone(),
            optional_slugs: BTreeSet::new(),
        };

        let mut iteration = 0;
        while to_get.has_some() {
            iteration += 1;
            debug!(
                iteration,
                required = to_get.required_slugs.len(),
                optional = to_get.optional_slugs.len(),
                "resolving taxons"
            );

            let mut loaded = UsedTaxonsContainer::default();
            if !to_get.required_slugs.is_empty() {
                let taxons = self.load(&to_get.required_slugs, true)?;
                if include_aggregation_taxons {
                    loaded.required.extend(self.aggregation_taxons(&taxons, true)?);
                }
                loaded.required.extend(taxons);
            }
            if !to_get.optional_slugs.is_empty() {
                let taxons = self.load(&to_get.optional_slugs, false)?;
                if include_aggregation_taxons {
                    loaded.optional.extend(self.aggregation_taxons(&taxons, false)?);
                }
                loaded.optional.extend(taxons);
            }

            let mut next = UsedTaxonSlugsContainer::default();
            for calculation in loaded.required.values().filter_map(|t| t.calculation.as_deref()) {
                let referenced = used_taxon_slugs_shallow(calculation, data_sources)?;
                next.required_slugs.extend(
                    referenced
                        .required_slugs
                        .difference(&seen.required_slugs)
                        .cloned(),
                );
                next.optional_slugs.extend(
                    referenced
                        .optional_slugs
                        .difference(&seen.optional_slugs)
                        .cloned(),
                );
            }
            for calculation in loaded.optional.values().filter_map(|t| t.calculation.as_deref()) {
                let referenced = used_taxon_slugs_shallow(calculation, data_sources)?;
                next.optional_slugs
                    .extend(referenced.all_slugs().difference(&seen.all_slugs()).cloned());
            }

            used.update_from(loaded);
            seen.update_from(&next);
            to_get = next;
        }
        Ok(used)
    }

    fn load(&self, slugs: &BTreeSet<String>, must_load_all: bool) -> Result<TaxonMap> {
        let (formulas, proper): (BTreeSet<String>, BTreeSet<String>) = slugs
            .iter()
            .cloned()
            .partition(|slug| slug.starts_with(TEL_EXPR_QUERY_PREFIX));
        let mut taxons = if proper.is_empty() {
            TaxonMap::new()
        } else {
            self.loader.load_taxons(&proper, must_load_all)?
        };
        taxons.extend(
            formulas
                .iter()
                .filter_map(|slug| self.temporary.get(slug).map(|t| (slug.clone(), t.clone()))),
        );
        Ok(taxons)
    }

    fn aggregation_taxons(&self, taxons: &TaxonMap, must_load_all: bool) -> Result<TaxonMap> {
        let slugs: BTreeSet<String> = taxons
            .values()
            .filter_map(|t| {
                t.tel_metadata
                    .as_ref()
                    .and_then(|m| m.aggregation_definition.as_ref())
                    .or(t.aggregation.as_ref())
            })
            .flat_map(|agg| agg.used_taxon_slugs())
            .collect();
        if slugs.is_empty() {
            return Ok(TaxonMap::new());
        }
        self.load(&slugs, must_load_all)
    }

    /// Taxons used in the calculation and aggregation definition of `taxon`.
    pub fn used_in_definition(&self, taxon: &Taxon) -> Result<UsedTaxonsContainer> {
        let mut used = UsedTaxonsContainer::default();

        if let Some(calculation) = &taxon.calculation {
            let referenced = used_taxon_slugs_shallow(calculation, None)?;
            used.update_from(self.resolve_with(&referenced.required_slugs, None, false)?);

            // Everything below an optional reference is optional.
            let optional = self.resolve_with(&referenced.optional_slugs, None, false)?;
            used.optional.extend(optional.required);
            used.optional.extend(optional.optional);
        }

        if let Some(aggregation) = &taxon.aggregation {
            let slugs = aggregation.used_taxon_slugs();
            if !slugs.is_empty() {
                used.required.extend(self.load(&slugs, true)?);
            }
        }
        Ok(used)
    }

    /// Computes the TEL metadata of taxons loaded without it.
    ///
    /// With `use_fallback`, an aggregation left `not_set` becomes `group_by` for dimensions and
    /// `sum` for metrics.
    pub fn complete_tel_metadata(&self, taxon_map: &mut TaxonMap, use_fallback: bool) -> Result<()> {
        for taxon in taxon_map.values_mut() {
            if taxon.tel_metadata.is_none() {
                let used = self.used_in_definition(taxon)?;
                taxon.tel_metadata = Some(tel_metadata(taxon, used)?);
            }
            if !use_fallback {
                continue;
            }
            let taxon_type = taxon.taxon_type;
            if let Some(metadata) = taxon.tel_metadata.as_mut() {
                let not_set = metadata
                    .aggregation_definition
                    .as_ref()
                    .is_some_and(|d| d.agg_type == AggregationType::NotSet);
                if not_set {
                    trace!(slug = %taxon.slug, "falling back to default aggregation");
                    metadata.aggregation_definition =
                        AggregationDefinition::common_defined_definition([], true, taxon_type);
                }
            }
        }
        Ok(())
    }

    /// Resolves the taxons of a request, where entries starting with `=m:` or `=d:` are TEL
    /// expressions queried directly as metrics or dimensions.
    ///
    /// Every expression becomes a temporary taxon keyed by its SQL friendly slug.
    pub fn resolve_request(&mut self, company_id: &str, request: &[String]) -> Result<TaxonMap> {
        let (formulas, slugs): (Vec<&String>, Vec<&String>) = request
            .iter()
            .partition(|slug| slug.starts_with(TEL_EXPR_QUERY_PREFIX));
        let slugs: BTreeSet<String> = slugs.into_iter().cloned().collect();
        let mut taxon_map = self.resolve(&slugs)?.all_taxons();
        if formulas.is_empty() {
            return Ok(taxon_map);
        }

        let mut referenced = BTreeSet::new();
        let mut formula_slugs = Vec::with_capacity(formulas.len());
        for formula in formulas {
            let (calculation, taxon_type) =
                if let Some(calc) = formula.strip_prefix(TEL_EXPR_METRIC_QUERY_PREFIX) {
                    (calc, TaxonType::Metric)
                } else if let Some(calc) = formula.strip_prefix(TEL_EXPR_DIMENSION_QUERY_PREFIX) {
                    (calc, TaxonType::Dimension)
                } else {
                    return Err(HuskyError::invalid_request(format!(
                        "Unknown TEL expression {formula}"
                    )));
                };
            referenced.extend(
                used_taxon_slugs_shallow(calculation, self.data_sources.as_ref())?.all_slugs(),
            );

            let slug = sql_friendly_slug(formula);
            trace!(%slug, %calculation, "temporary taxon");
            let taxon = Taxon::temporary(&slug, calculation, taxon_type, company_id);
            self.temporary.insert(slug.clone(), taxon.clone());
            taxon_map.insert(slug.clone(), taxon);
            formula_slugs.push(slug);
        }

        taxon_map.extend(
            self.resolve_with(&referenced, self.data_sources.as_ref(), false)?
                .all_taxons(),
        );

        for slug in formula_slugs {
            let Some(taxon) = taxon_map.get(&slug) else {
                continue;
            };
            let metadata = tel_metadata(taxon, self.used_in_definition(taxon)?)?;
            if let Some(taxon) = taxon_map.get_mut(&slug) {
                taxon.tel_metadata = Some(metadata.clone());
            }
            if let Some(taxon) = self.temporary.get_mut(&slug) {
                taxon.tel_metadata = Some(metadata);
            }
        }
        Ok(taxon_map)
    }
}
