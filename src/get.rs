//! Asset retrieval by object path.
//!
//! Fetches one asset with its tags and thumbnail records. Used by the
//! `gcv get` CLI command.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::models::ThumbnailRecord;
use crate::store::SqliteStore;

#[derive(Debug, Clone, Serialize)]
pub struct AssetResponse {
    pub object_path: String,
    pub class_name: String,
    pub package_path: String,
    pub tags: std::collections::BTreeMap<String, String>,
    pub last_seen_scan_id: i64,
    pub thumbnails: Vec<ThumbnailRecord>,
}

/// Core get function returning structured data.
pub async fn get_asset(config: &Config, object_path: &str) -> Result<AssetResponse> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);

    let asset = match store.get_asset(object_path).await? {
        Some(asset) => asset,
        None => {
            store.pool().close().await;
            bail!("asset not found: {}", object_path);
        }
    };
    let thumbnails = store.thumbnails_for(object_path).await?;
    store.pool().close().await;

    Ok(AssetResponse {
        object_path: asset.object_path,
        class_name: asset.class_name,
        package_path: asset.package_path,
        tags: asset.tags,
        last_seen_scan_id: asset.last_seen_scan_id,
        thumbnails,
    })
}

/// CLI entry point: calls get_asset and prints to stdout.
pub async fn run_get(config: &Config, object_path: &str, json: bool) -> Result<()> {
    let asset = get_asset(config, object_path).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&asset)?);
        return Ok(());
    }

    println!("--- Asset ---");
    println!("object_path:  {}", asset.object_path);
    println!("class:        {}", asset.class_name);
    println!("package:      {}", asset.package_path);
    println!("last_seen:    scan {}", asset.last_seen_scan_id);
    println!();

    println!("--- Tags ({}) ---", asset.tags.len());
    for (k, v) in &asset.tags {
        println!("{:<24} {}", k, v);
    }
    println!();

    println!("--- Thumbnails ({}) ---", asset.thumbnails.len());
    for t in &asset.thumbnails {
        println!(
            "[{}px] {} at {}px, {} attempt{}, updated {}",
            t.requested_size,
            t.state,
            t.resolution,
            t.attempt_count,
            if t.attempt_count == 1 { "" } else { "s" },
            format_ts_iso(t.updated_at)
        );
        if let Some(ref path) = t.cache_path {
            println!("  {}", path);
        }
    }

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
