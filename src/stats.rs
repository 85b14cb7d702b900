//! Store statistics and content summary.
//!
//! Summarizes what the store holds: asset counts, a per-class breakdown,
//! thumbnail convergence, and the most recent scans. Used by `gcv stats` to
//! give confidence that syncs and refreshes are doing what they should.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::ScanRun;
use crate::store::SqliteStore;

/// Scans listed by `gcv stats`.
const RECENT_SCANS: i64 = 5;

/// Asset tag holding the on-disk size in megabytes.
pub const SIZE_TAG: &str = "file_size_mb";

#[derive(Debug, Serialize)]
pub struct ClassCount {
    pub class_name: String,
    pub count: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct ThumbnailCounts {
    pub final_count: i64,
    pub placeholder: i64,
    pub missing: i64,
}

#[derive(Debug, Serialize)]
pub struct ContentSummary {
    pub total_assets: i64,
    /// Sum of the [`SIZE_TAG`] tag over all assets; assets without it count
    /// as zero.
    pub total_size_mb: f64,
    /// Sorted by count, largest first.
    pub by_class: Vec<ClassCount>,
    pub thumbnails: ThumbnailCounts,
    /// Most recent first.
    pub recent_scans: Vec<ScanRun>,
}

pub async fn content_summary(pool: &SqlitePool) -> Result<ContentSummary> {
    let total_assets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assets")
        .fetch_one(pool)
        .await?;

    let total_size_mb: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(CAST(json_extract(tags_json, '$.' || ?) AS REAL)), 0.0) FROM assets",
    )
    .bind(SIZE_TAG)
    .fetch_one(pool)
    .await?;

    let by_class: Vec<ClassCount> = sqlx::query(
        r#"
        SELECT class_name, COUNT(*) AS n
        FROM assets
        GROUP BY class_name
        ORDER BY n DESC, class_name ASC
        "#,
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| ClassCount {
        class_name: row.get("class_name"),
        count: row.get("n"),
    })
    .collect();

    let mut thumbnails = ThumbnailCounts::default();
    for row in sqlx::query("SELECT state, COUNT(*) AS n FROM thumbnails GROUP BY state")
        .fetch_all(pool)
        .await?
    {
        let state: String = row.get("state");
        let n: i64 = row.get("n");
        match state.as_str() {
            "final" => thumbnails.final_count = n,
            "placeholder" => thumbnails.placeholder = n,
            _ => thumbnails.missing += n,
        }
    }

    let recent_scans = SqliteStore::new(pool.clone())
        .recent_scans(RECENT_SCANS)
        .await?;

    Ok(ContentSummary {
        total_assets,
        total_size_mb,
        by_class,
        thumbnails,
        recent_scans,
    })
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    crate::migrate::run_migrations(&pool).await?;
    let summary = content_summary(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Game Content Viewer · Store Stats");
    println!("=================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Assets:      {}", summary.total_assets);
    println!("  Content:     {:.3} MB", summary.total_size_mb);
    println!(
        "  Thumbnails:  {} final, {} placeholder, {} missing",
        summary.thumbnails.final_count, summary.thumbnails.placeholder, summary.thumbnails.missing
    );

    if !summary.by_class.is_empty() {
        println!();
        println!("  By class:");
        println!("  {:<40} {:>8}", "CLASS", "ASSETS");
        println!("  {}", "-".repeat(49));
        for c in &summary.by_class {
            println!("  {:<40} {:>8}", c.class_name, c.count);
        }
    }

    if !summary.recent_scans.is_empty() {
        println!();
        println!("  Recent scans:");
        println!(
            "  {:>6}  {:<24} {:<10} {:>7} {:>7}   {}",
            "SCAN", "FILTER", "STATUS", "SEEN", "PRUNED", "STARTED"
        );
        println!("  {}", "-".repeat(76));
        for s in &summary.recent_scans {
            let filter = if s.path_filter.is_empty() {
                "<all>"
            } else {
                s.path_filter.as_str()
            };
            println!(
                "  {:>6}  {:<24} {:<10} {:>7} {:>7}   {}",
                s.scan_id,
                filter,
                s.status,
                s.assets_seen,
                s.assets_pruned,
                format_ts_relative(s.started_at)
            );
            if let Some(ref err) = s.error {
                println!("          error: {}", err);
            }
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetDescriptor, PathFilter, ScanStatus, ThumbnailState};
    use crate::store::ThumbnailWrite;
    use std::collections::BTreeMap;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }

    #[tokio::test]
    async fn summary_counts_classes_and_states() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_path(&dir.path().join("gcv.sqlite")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let store = SqliteStore::new(pool.clone());

        let scan = store.begin_scan(&PathFilter::whole_tree()).await.unwrap();
        for (path, class, size) in [
            ("/Game/A.A", "StaticMesh", Some("1.5")),
            ("/Game/B.B", "StaticMesh", Some("0.25")),
            ("/Game/T.T", "Texture2D", None),
        ] {
            let mut tags = BTreeMap::new();
            if let Some(size) = size {
                tags.insert(SIZE_TAG.to_string(), size.to_string());
            }
            let d = AssetDescriptor {
                object_path: path.into(),
                class_name: class.into(),
                package_path: String::new(),
                tags,
            };
            store.upsert_asset(&d, scan.scan_id).await.unwrap();
        }
        store
            .finish_scan(scan.scan_id, ScanStatus::Completed, 3, 0, None)
            .await
            .unwrap();
        store
            .record_thumbnail(&ThumbnailWrite {
                object_path: "/Game/A.A",
                requested_size: 256,
                resolution: 256,
                state: ThumbnailState::Final,
                cache_path: None,
            })
            .await
            .unwrap();

        let s = content_summary(&pool).await.unwrap();
        assert_eq!(s.total_assets, 3);
        assert!((s.total_size_mb - 1.75).abs() < 1e-9);
        assert_eq!(s.by_class[0].class_name, "StaticMesh");
        assert_eq!(s.by_class[0].count, 2);
        assert_eq!(s.thumbnails.final_count, 1);
        assert_eq!(s.recent_scans.len(), 1);
        assert_eq!(s.recent_scans[0].status, ScanStatus::Completed);
    }
}
