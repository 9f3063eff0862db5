//! Catalog seeding from a JSON file.
//!
//! The file holds an array of media records:
//!
//! ```json
//! [
//!   {
//!     "title": "The Cat Who Could Read Backwards",
//!     "creator": "Lilian Jackson Braun",
//!     "mediaType": "book",
//!     "mediaFormat": "print",
//!     "genre": "Mystery",
//!     "publishedAt": "1966-01-01"
//!   }
//! ]
//! ```
//!
//! Records without an `id` get a fresh UUID v4. Importing the same ids
//! again updates the rows in place. `publishedAt` accepts `YYYY-MM-DD`
//! or RFC 3339 and is stored as `YYYY-MM-DD` so rows sort by text.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use shelfwise_core::models::{MediaFormat, MediaRow, MediaType};

use crate::config::Config;
use crate::db;
use crate::migrate::apply_schema;
use crate::sqlite_catalog::SqliteCatalog;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub creator: String,
    pub media_type: String,
    pub media_format: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ImportRecord {
    /// Validate against the allow-lists and assign an id if missing.
    pub fn into_row(self) -> Result<MediaRow> {
        if self.title.trim().is_empty() {
            bail!("record has an empty title");
        }
        let media_type = self.media_type.trim().to_lowercase();
        if MediaType::parse(&media_type).is_none() {
            bail!("'{}': unknown mediaType '{}'", self.title, self.media_type);
        }
        let media_format = self.media_format.trim().to_lowercase();
        if MediaFormat::parse(&media_format).is_none() {
            bail!("'{}': unknown mediaFormat '{}'", self.title, self.media_format);
        }
        if let Some(metadata) = &self.metadata {
            if !metadata.is_object() {
                bail!("'{}': metadata must be a JSON object", self.title);
            }
        }

        let published_at = self
            .published_at
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| normalize_date(d).with_context(|| format!("'{}': bad publishedAt", self.title)))
            .transpose()?;

        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(MediaRow {
            id,
            title: self.title,
            creator: self.creator,
            media_type,
            media_format,
            genre: self.genre,
            subject: self.subject,
            description: self.description,
            cover_url: self.cover_url,
            published_at,
            metadata: self.metadata,
        })
    }
}

fn normalize_date(value: &str) -> Result<String> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.format("%Y-%m-%d").to_string());
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("'{}' is neither YYYY-MM-DD nor RFC 3339", value))?;
    Ok(parsed.date_naive().format("%Y-%m-%d").to_string())
}

pub fn parse_records(json: &str) -> Result<Vec<MediaRow>> {
    let records: Vec<ImportRecord> =
        serde_json::from_str(json).context("Import file must be a JSON array of media records")?;
    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| record.into_row().with_context(|| format!("record {}", i)))
        .collect()
}

pub async fn import_rows(catalog: &SqliteCatalog, rows: &[MediaRow]) -> Result<usize> {
    for row in rows {
        catalog.upsert(row).await?;
    }
    Ok(rows.len())
}

/// Entry point for `shelfwise import <file>`.
pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;
    let rows = parse_records(&content)?;

    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    let catalog = SqliteCatalog::new(pool.clone());
    let imported = import_rows(&catalog, &rows).await?;
    let total = catalog.count().await?;
    pool.close().await;

    info!(imported, total, file = %path.display(), "catalog import finished");
    println!("Imported {} records ({} in catalog).", imported, total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn assigns_uuid_when_id_missing() {
        let rows = parse_records(
            r#"[{"title":"Dune","creator":"Frank Herbert","mediaType":"Book","mediaFormat":"ebook"}]"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(Uuid::parse_str(&rows[0].id).is_ok());
        assert_eq!(rows[0].media_type, "book");
    }

    #[test]
    fn rejects_unknown_format() {
        let err = parse_records(
            r#"[{"id":"x","title":"Dune","creator":"F","mediaType":"book","mediaFormat":"scroll"}]"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("unknown mediaFormat"));
    }

    #[test]
    fn normalizes_publication_dates() {
        let rows = parse_records(
            r#"[
                {"id":"a","title":"A","creator":"X","mediaType":"book","mediaFormat":"print","publishedAt":"2019-03-01T10:00:00Z"},
                {"id":"b","title":"B","creator":"X","mediaType":"book","mediaFormat":"print","publishedAt":" "}
            ]"#,
        )
        .unwrap();
        assert_eq!(rows[0].published_at.as_deref(), Some("2019-03-01"));
        assert_eq!(rows[1].published_at, None);

        let err = parse_records(
            r#"[{"id":"c","title":"C","creator":"X","mediaType":"book","mediaFormat":"print","publishedAt":"March 2019"}]"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("bad publishedAt"));
    }

    #[test]
    fn rejects_non_array() {
        assert!(parse_records(r#"{"title":"Dune"}"#).is_err());
    }

    #[tokio::test]
    async fn reimport_updates_in_place() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        let catalog = SqliteCatalog::new(pool);

        let first = parse_records(
            r#"[{"id":"m1","title":"Dune","creator":"F","mediaType":"book","mediaFormat":"print"}]"#,
        )
        .unwrap();
        let second = parse_records(
            r#"[{"id":"m1","title":"Dune Messiah","creator":"F","mediaType":"book","mediaFormat":"print"}]"#,
        )
        .unwrap();
        import_rows(&catalog, &first).await.unwrap();
        import_rows(&catalog, &second).await.unwrap();
        assert_eq!(catalog.count().await.unwrap(), 1);
    }
}
