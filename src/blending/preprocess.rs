//! Request normalization before planning.

use std::collections::BTreeSet;

use tracing::trace;

use super::request::{BlendingDataRequest, DataRequest};
use crate::error::{HuskyError, Result};
use crate::identifier::{data_source_from_slug, TEL_EXPR_QUERY_PREFIX};

/// Normalizes a blending request in place.
///
/// Subrequest orderings move to the top level, grouping set taxons become requested taxons,
/// and top-level taxons are distributed to the subrequests that can serve them.
pub fn preprocess_request(request: &mut BlendingDataRequest) -> Result<()> {
    for subrequest in &mut request.data_subrequests {
        request.order_by.append(&mut subrequest.order_by);
    }

    let grouping_set_taxons: BTreeSet<String> = request
        .grouping_sets
        .iter()
        .flatten()
        .flatten()
        .cloned()
        .collect();
    request.taxons.extend(grouping_set_taxons);

    move_top_level_to_subrequests(&request.taxons, &mut request.data_subrequests)?;

    if request.grouping_sets.is_some() && request.fill_date_gaps {
        return Err(HuskyError::invalid_request(
            "fill_date_gaps is not supported when used with grouping sets.",
        ));
    }
    Ok(())
}

/// TEL expressions and global taxons go to every subrequest, namespaced taxons to the
/// subrequest of their data source.
fn move_top_level_to_subrequests(taxons: &[String], subrequests: &mut [DataRequest]) -> Result<()> {
    for slug in taxons {
        let data_source = if slug.starts_with(TEL_EXPR_QUERY_PREFIX) {
            None
        } else {
            data_source_from_slug(slug)
        };
        match data_source {
            None => {
                for subrequest in subrequests.iter_mut() {
                    subrequest.taxons.push(slug.clone());
                }
            }
            Some(data_source) => {
                let subrequest = subrequests
                    .iter_mut()
                    .find(|s| s.properties.data_sources.first().map(String::as_str) == Some(data_source))
                    .ok_or_else(|| {
                        HuskyError::invalid_request(format!(
                            "Request does not have proper data source for taxon {slug}."
                        ))
                    })?;
                subrequest.taxons.push(slug.clone());
            }
        }
        trace!(%slug, "moved top-level taxon");
    }
    Ok(())
}
