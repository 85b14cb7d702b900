use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Open the configured store and create its schema.
pub async fn init(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run against an existing store.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create scan_runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_runs (
            scan_id INTEGER PRIMARY KEY AUTOINCREMENT,
            path_filter TEXT NOT NULL DEFAULT '',
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            assets_seen INTEGER NOT NULL DEFAULT 0,
            assets_pruned INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create assets table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assets (
            object_path TEXT PRIMARY KEY,
            class_name TEXT NOT NULL,
            package_path TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '{}',
            last_seen_scan_id INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create thumbnails table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS thumbnails (
            object_path TEXT NOT NULL,
            requested_size INTEGER NOT NULL,
            resolution INTEGER NOT NULL DEFAULT 0,
            cache_path TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'missing',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (object_path, requested_size),
            FOREIGN KEY (object_path) REFERENCES assets(object_path) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_assets_last_seen ON assets(last_seen_scan_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_assets_class ON assets(class_name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_thumbnails_cache_path ON thumbnails(cache_path)")
        .execute(pool)
        .await?;

    Ok(())
}
