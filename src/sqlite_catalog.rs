//! SQLite-backed [`Catalog`] implementation.
//!
//! Wildcard patterns go straight into `LIKE ... ESCAPE '\'`. SQLite's
//! `LIKE` is case-insensitive for ASCII, which covers catalog keywords
//! after sanitizing.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use shelfwise_core::catalog::{Catalog, CatalogQuery, EXCLUDE_FIELDS, INCLUDE_FIELDS};
use shelfwise_core::models::MediaRow;

const SELECT_COLUMNS: &str = "SELECT id, title, creator, media_type, media_format, genre, \
subject, description, cover_url, published_at, metadata_json FROM media WHERE 1 = 1";

pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a row by id.
    pub async fn upsert(&self, row: &MediaRow) -> Result<()> {
        let metadata_json = row
            .metadata
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "{}".to_string());

        sqlx::query(
            r#"
            INSERT INTO media (id, title, creator, media_type, media_format, genre, subject,
                               description, cover_url, published_at, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                creator = excluded.creator,
                media_type = excluded.media_type,
                media_format = excluded.media_format,
                genre = excluded.genre,
                subject = excluded.subject,
                description = excluded.description,
                cover_url = excluded.cover_url,
                published_at = excluded.published_at,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&row.id)
        .bind(&row.title)
        .bind(&row.creator)
        .bind(&row.media_type)
        .bind(&row.media_format)
        .bind(&row.genre)
        .bind(&row.subject)
        .bind(&row.description)
        .bind(&row.cover_url)
        .bind(&row.published_at)
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn build_select(query: &CatalogQuery) -> QueryBuilder<'_, Sqlite> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);

    if let Some(media_type) = query.media_type {
        qb.push(" AND media_type = ").push_bind(media_type.as_str());
    }
    if let Some(media_format) = query.media_format {
        qb.push(" AND media_format = ").push_bind(media_format.as_str());
    }

    if !query.include_patterns.is_empty() {
        qb.push(" AND (");
        let mut first = true;
        for pattern in &query.include_patterns {
            for field in INCLUDE_FIELDS {
                if !first {
                    qb.push(" OR ");
                }
                first = false;
                qb.push(field.column())
                    .push(" LIKE ")
                    .push_bind(pattern.as_str())
                    .push(" ESCAPE '\\'");
            }
        }
        qb.push(")");
    }

    // NULL columns compare as '' so a missing field never excludes a row.
    for pattern in &query.exclude_patterns {
        for field in EXCLUDE_FIELDS {
            qb.push(" AND COALESCE(")
                .push(field.column())
                .push(", '') NOT LIKE ")
                .push_bind(pattern.as_str())
                .push(" ESCAPE '\\'");
        }
    }

    qb.push(" ORDER BY published_at IS NULL, published_at DESC, seq ASC LIMIT ")
        .push_bind(query.limit as i64);
    qb
}

fn row_to_media(row: &SqliteRow) -> Result<MediaRow> {
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(MediaRow {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        creator: row.try_get("creator")?,
        media_type: row.try_get("media_type")?,
        media_format: row.try_get("media_format")?,
        genre: row.try_get("genre")?,
        subject: row.try_get("subject")?,
        description: row.try_get("description")?,
        cover_url: row.try_get("cover_url")?,
        published_at: row.try_get("published_at")?,
        metadata: serde_json::from_str(&metadata_json).ok(),
    })
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn query(&self, query: &CatalogQuery) -> Result<Vec<MediaRow>> {
        let rows = build_select(query).build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_media).collect()
    }
}
