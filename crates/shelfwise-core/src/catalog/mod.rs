//! Catalog abstraction for Shelfwise.
//!
//! The [`Catalog`] trait is the one query the recommendation pipeline
//! needs from storage: filter by media facets, keep rows matching any
//! include pattern, drop rows matching any exclude pattern, newest first.
//! Backends are pluggable (SQLite in the application, in-memory here).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{MediaFormat, MediaRow, MediaType};
use crate::patterns::like_matches;

/// Row fields searched by include patterns.
pub const INCLUDE_FIELDS: [SearchField; 5] = [
    SearchField::Title,
    SearchField::Description,
    SearchField::Genre,
    SearchField::Subject,
    SearchField::Creator,
];

/// Row fields checked by exclude patterns. Title and creator are left
/// out so a name collision cannot hide a whole author.
pub const EXCLUDE_FIELDS: [SearchField; 3] = [
    SearchField::Description,
    SearchField::Genre,
    SearchField::Subject,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Title,
    Description,
    Genre,
    Subject,
    Creator,
}

impl SearchField {
    /// Column name in the `media` table.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Genre => "genre",
            Self::Subject => "subject",
            Self::Creator => "creator",
        }
    }

    pub fn value<'a>(&self, row: &'a MediaRow) -> Option<&'a str> {
        match self {
            Self::Title => Some(&row.title),
            Self::Description => row.description.as_deref(),
            Self::Genre => row.genre.as_deref(),
            Self::Subject => row.subject.as_deref(),
            Self::Creator => Some(&row.creator),
        }
    }
}

/// One catalog lookup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogQuery {
    pub media_type: Option<MediaType>,
    pub media_format: Option<MediaFormat>,
    /// OR-ed: a row matches if any pattern matches any [`INCLUDE_FIELDS`]
    /// field. Empty means no keyword constraint.
    pub include_patterns: Vec<String>,
    /// AND-of-NOT over [`EXCLUDE_FIELDS`]. A missing field never matches.
    pub exclude_patterns: Vec<String>,
    pub limit: usize,
}

impl CatalogQuery {
    /// Whether `row` satisfies every constraint except the limit.
    pub fn matches(&self, row: &MediaRow) -> bool {
        if let Some(media_type) = self.media_type {
            if row.media_type != media_type.as_str() {
                return false;
            }
        }
        if let Some(media_format) = self.media_format {
            if row.media_format != media_format.as_str() {
                return false;
            }
        }

        let included = self.include_patterns.is_empty()
            || self
                .include_patterns
                .iter()
                .any(|p| any_field_matches(p, row, &INCLUDE_FIELDS));
        let excluded = self
            .exclude_patterns
            .iter()
            .any(|p| any_field_matches(p, row, &EXCLUDE_FIELDS));

        included && !excluded
    }
}

fn any_field_matches(pattern: &str, row: &MediaRow, fields: &[SearchField]) -> bool {
    fields
        .iter()
        .filter_map(|f| f.value(row))
        .any(|text| like_matches(pattern, text))
}

/// Abstract catalog backend.
///
/// Results are ordered by `published_at` descending with undated rows
/// last; rows with equal dates keep store order. At most `query.limit`
/// rows are returned.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn query(&self, query: &CatalogQuery) -> Result<Vec<MediaRow>>;
}


#[cfg(test)]
mod tests {
    use super::fixtures::row;
    use super::*;

    #[test]
    fn include_patterns_are_or_across_fields() {
        let mut r = row("1", "Whiskers", None);
        r.genre = Some("Cozy Mystery".into());
        let query = CatalogQuery {
            include_patterns: vec!["%dragons%".into(), "%mystery%".into()],
            limit: 10,
            ..Default::default()
        };
        assert!(query.matches(&r));
    }

    #[test]
    fn exclude_ignores_title_and_missing_fields() {
        let r = row("1", "Gory Tales", None);
        let query = CatalogQuery {
            exclude_patterns: vec!["%gory%".into()],
            limit: 10,
            ..Default::default()
        };
        assert!(query.matches(&r));

        let mut r = r;
        r.description = Some("Very gory.".into());
        assert!(!query.matches(&r));
    }

    #[test]
    fn facet_filters_are_equality() {
        let r = row("1", "Anything", None);
        let query = CatalogQuery {
            media_type: Some(MediaType::Video),
            limit: 10,
            ..Default::default()
        };
        assert!(!query.matches(&r));
    }
}
