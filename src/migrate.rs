use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the catalog schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // `seq` preserves insertion order, which breaks ties between rows
    // with the same publication date.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS media (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            creator TEXT NOT NULL,
            media_type TEXT NOT NULL,
            media_format TEXT NOT NULL,
            genre TEXT,
            subject TEXT,
            description TEXT,
            cover_url TEXT,
            published_at TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_media_published_at ON media(published_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_media_type_format ON media(media_type, media_format)")
        .execute(pool)
        .await?;

    Ok(())
}
