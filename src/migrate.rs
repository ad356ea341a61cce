use anyhow::Result;

use crate::config::Config;
use crate::db::{self, OpenMode};

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(&config.source.path, OpenMode::Create).await?;

    // One row per capture. `capture_time` is unix seconds (UTC).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            id TEXT NOT NULL UNIQUE,
            url TEXT NOT NULL,
            capture_time INTEGER NOT NULL,
            status INTEGER,
            media_type TEXT,
            headers TEXT NOT NULL DEFAULT '{}',
            body BLOB,
            body_url TEXT,
            body_hash TEXT,
            title TEXT,
            source_metadata TEXT NOT NULL DEFAULT '{}',
            capture_kind TEXT NOT NULL DEFAULT 'page'
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Neighbor lookups walk one URL's history in time order
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_url_time ON snapshots(url, capture_time)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_capture_time ON snapshots(capture_time)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
