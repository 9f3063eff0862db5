//! Candidate retrieval: keywords and filters in, recommendation items out.

use tracing::debug;

use crate::catalog::{Catalog, CatalogQuery};
use crate::error::RecommendError;
use crate::models::{RecommendationItem, SanitizedFilters};
use crate::patterns::build_search_patterns;

/// Build the catalog query for a keyword set.
///
/// The limit over-fetches past `filters.limit` (see
/// [`SanitizedFilters::fetch_limit`]). `ageGroup` is not a catalog
/// facet and does not narrow the query.
pub fn build_query(keywords: &[String], exclude: &[String], filters: &SanitizedFilters) -> CatalogQuery {
    CatalogQuery {
        media_type: filters.media_type,
        media_format: filters.media_format,
        include_patterns: build_search_patterns(keywords),
        exclude_patterns: build_search_patterns(exclude),
        limit: filters.fetch_limit() as usize,
    }
}

/// Query the catalog and map rows into [`RecommendationItem`]s.
///
/// Any storage error becomes [`RecommendError::Retrieval`]; callers must
/// finish this before opening the event stream.
pub async fn fetch_candidates(
    catalog: &dyn Catalog,
    keywords: &[String],
    exclude: &[String],
    filters: &SanitizedFilters,
) -> Result<Vec<RecommendationItem>, RecommendError> {
    let query = build_query(keywords, exclude, filters);
    let rows = catalog
        .query(&query)
        .await
        .map_err(RecommendError::Retrieval)?;
    debug!(
        include = query.include_patterns.len(),
        exclude = query.exclude_patterns.len(),
        rows = rows.len(),
        "catalog query finished"
    );
    Ok(rows
        .into_iter()
        .take(query.limit)
        .map(RecommendationItem::from)
        .collect())
}
