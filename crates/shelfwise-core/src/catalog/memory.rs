//! In-memory [`Catalog`] implementation for testing and demos.
//!
//! Rows live in a `Vec` behind `std::sync::RwLock`. Matching is a linear
//! scan using the same wildcard semantics as the SQL backend.

use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::MediaRow;

use super::{Catalog, CatalogQuery};

/// In-memory catalog. Insertion order is the store order used for ties.
pub struct InMemoryCatalog {
    rows: RwLock<Vec<MediaRow>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::with_rows(Vec::new())
    }

    pub fn with_rows(rows: Vec<MediaRow>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    /// Insert a row, replacing any existing row with the same id in place.
    pub fn upsert(&self, row: MediaRow) {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        match rows.iter_mut().find(|r| r.id == row.id) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    pub fn len(&self) -> usize {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn query(&self, query: &CatalogQuery) -> Result<Vec<MediaRow>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow!("in-memory catalog lock poisoned"))?;
        let mut matched: Vec<MediaRow> = rows.iter().filter(|r| query.matches(r)).cloned().collect();
        // `None < Some`, so descending order puts undated rows last.
        // The sort is stable: equal dates keep insertion order.
        matched.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        matched.truncate(query.limit);
        Ok(matched)
    }
}
