//! SQLite-backed durable store for assets, scans, and thumbnails.
//!
//! Every write is an upsert keyed by the table's primary key and runs in its
//! own transaction, so readers only ever observe committed rows. A write that
//! fails with a store error is retried once after a short pause before the
//! error is surfaced.
//!
//! # Tables
//!
//! | Table | Key | Written by |
//! |-------|-----|------------|
//! | `scan_runs` | `scan_id` | [`crate::sync`] |
//! | `assets` | `object_path` | [`crate::sync`] |
//! | `thumbnails` | `(object_path, requested_size)` | [`crate::thumbnails`] |

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{
    AssetDescriptor, AssetRecord, PathFilter, ScanRun, ScanStatus, ThumbnailRecord, ThumbnailState,
};

/// Pause before the single retry of a failed write.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// What an asset upsert did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same object, fields refreshed.
    Updated,
    /// The path now holds an object of a different class. Thumbnails recorded
    /// for the previous object were discarded.
    Replaced,
}

/// One pipeline attempt to be merged into a thumbnail record.
#[derive(Debug, Clone)]
pub struct ThumbnailWrite<'a> {
    pub object_path: &'a str,
    pub requested_size: i64,
    pub resolution: i64,
    pub state: ThumbnailState,
    /// Cache file holding the attempt's image, if it produced one.
    pub cache_path: Option<&'a str>,
}

/// A thumbnail record before and after a merge.
#[derive(Debug, Clone)]
pub struct ThumbnailMerge {
    pub previous: Option<ThumbnailRecord>,
    pub current: ThumbnailRecord,
}

impl ThumbnailMerge {
    /// True when the merge raised the recorded resolution or state.
    pub fn improved(&self) -> bool {
        match &self.previous {
            None => self.current.state > ThumbnailState::Missing || self.current.resolution > 0,
            Some(prev) => {
                self.current.resolution > prev.resolution || self.current.state > prev.state
            }
        }
    }

    /// The cache file the record pointed to before, if the merge replaced it.
    pub fn superseded_cache_path(&self) -> Option<&str> {
        let prev = self.previous.as_ref()?.cache_path.as_deref()?;
        match self.current.cache_path.as_deref() {
            Some(cur) if cur == prev => None,
            _ => Some(prev),
        }
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ═══════════════════════════════════════════════════════════════════
    // Scan runs
    // ═══════════════════════════════════════════════════════════════════

    /// Insert a `pending` scan row and return it.
    pub async fn begin_scan(&self, filter: &PathFilter) -> Result<ScanRun> {
        let started_at = now_ts();
        let result = sqlx::query(
            "INSERT INTO scan_runs (path_filter, started_at, status) VALUES (?, ?, 'pending')",
        )
        .bind(filter.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(ScanRun {
            scan_id: result.last_insert_rowid(),
            path_filter: filter.as_str().to_string(),
            started_at,
            completed_at: None,
            status: ScanStatus::Pending,
            assets_seen: 0,
            assets_pruned: 0,
            error: None,
        })
    }

    /// Move a pending scan to a terminal state.
    ///
    /// A scan that is already terminal is left untouched; the stored row is
    /// returned either way.
    pub async fn finish_scan(
        &self,
        scan_id: i64,
        status: ScanStatus,
        assets_seen: i64,
        assets_pruned: i64,
        error: Option<&str>,
    ) -> Result<ScanRun> {
        let updated = sqlx::query(
            r#"
            UPDATE scan_runs
            SET status = ?, completed_at = ?, assets_seen = ?, assets_pruned = ?, error = ?
            WHERE scan_id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(now_ts())
        .bind(assets_seen)
        .bind(assets_pruned)
        .bind(error)
        .bind(scan_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            debug!(scan_id, "scan already terminal");
        }

        self.get_scan(scan_id)
            .await?
            .ok_or_else(|| Error::Store(sqlx::Error::RowNotFound))
    }

    pub async fn get_scan(&self, scan_id: i64) -> Result<Option<ScanRun>> {
        let row = sqlx::query("SELECT * FROM scan_runs WHERE scan_id = ?")
            .bind(scan_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| scan_from_row(&r)).transpose()
    }

    /// Most recent scans first.
    pub async fn recent_scans(&self, limit: i64) -> Result<Vec<ScanRun>> {
        let rows = sqlx::query("SELECT * FROM scan_runs ORDER BY scan_id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(scan_from_row).collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Assets
    // ═══════════════════════════════════════════════════════════════════

    /// Insert or refresh one asset and stamp it with `scan_id`.
    pub async fn upsert_asset(
        &self,
        descriptor: &AssetDescriptor,
        scan_id: i64,
    ) -> Result<UpsertOutcome> {
        retry_once(&descriptor.object_path, || {
            self.try_upsert_asset(descriptor, scan_id)
        })
        .await
    }

    async fn try_upsert_asset(
        &self,
        descriptor: &AssetDescriptor,
        scan_id: i64,
    ) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT class_name FROM assets WHERE object_path = ?")
                .bind(&descriptor.object_path)
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = match existing {
            None => UpsertOutcome::Inserted,
            Some(class_name) if class_name == descriptor.class_name => UpsertOutcome::Updated,
            Some(_) => UpsertOutcome::Replaced,
        };

        if outcome == UpsertOutcome::Replaced {
            sqlx::query("DELETE FROM thumbnails WHERE object_path = ?")
                .bind(&descriptor.object_path)
                .execute(&mut *tx)
                .await?;
        }

        let tags_json =
            serde_json::to_string(&descriptor.tags).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            r#"
            INSERT INTO assets (object_path, class_name, package_path, tags_json,
                                last_seen_scan_id, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(object_path) DO UPDATE SET
                class_name = excluded.class_name,
                package_path = excluded.package_path,
                tags_json = excluded.tags_json,
                last_seen_scan_id = excluded.last_seen_scan_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&descriptor.object_path)
        .bind(&descriptor.class_name)
        .bind(&descriptor.package_path)
        .bind(&tags_json)
        .bind(scan_id)
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    /// Delete assets in scope that were not seen by `scan_id`. Their
    /// thumbnail rows go with them.
    pub async fn prune_stale(&self, filter: &PathFilter, scan_id: i64) -> Result<u64> {
        let stale: Vec<String> = self
            .paths_in_scope(
                filter,
                "SELECT object_path FROM assets WHERE last_seen_scan_id < ? \
                 AND substr(object_path, 1, length(?)) = ? ORDER BY object_path",
                Some(scan_id),
            )
            .await?;

        if stale.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for path in &stale {
            sqlx::query("DELETE FROM assets WHERE object_path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(filter = %filter, pruned = stale.len(), "pruned stale assets");
        Ok(stale.len() as u64)
    }

    /// Object paths of stored assets under `filter`, sorted.
    pub async fn asset_paths_in_scope(&self, filter: &PathFilter) -> Result<Vec<String>> {
        self.paths_in_scope(
            filter,
            "SELECT object_path FROM assets WHERE substr(object_path, 1, length(?)) = ? \
             ORDER BY object_path",
            None,
        )
        .await
    }

    /// Run a prefix query and apply the filter's boundary rule to its rows.
    async fn paths_in_scope(
        &self,
        filter: &PathFilter,
        sql: &str,
        scan_id: Option<i64>,
    ) -> Result<Vec<String>> {
        let mut query = sqlx::query_scalar::<_, String>(sql);
        if let Some(id) = scan_id {
            query = query.bind(id);
        }
        let paths = query
            .bind(filter.as_str())
            .bind(filter.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(paths.into_iter().filter(|p| filter.contains(p)).collect())
    }

    pub async fn get_asset(&self, object_path: &str) -> Result<Option<AssetRecord>> {
        let row = sqlx::query("SELECT * FROM assets WHERE object_path = ?")
            .bind(object_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| asset_from_row(&r)))
    }

    pub async fn list_assets(&self, filter: &PathFilter) -> Result<Vec<AssetRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM assets WHERE substr(object_path, 1, length(?)) = ? ORDER BY object_path",
        )
        .bind(filter.as_str())
        .bind(filter.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(asset_from_row)
            .filter(|a| filter.contains(&a.object_path))
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Thumbnails
    // ═══════════════════════════════════════════════════════════════════

    pub async fn get_thumbnail(
        &self,
        object_path: &str,
        requested_size: i64,
    ) -> Result<Option<ThumbnailRecord>> {
        let row =
            sqlx::query("SELECT * FROM thumbnails WHERE object_path = ? AND requested_size = ?")
                .bind(object_path)
                .bind(requested_size)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| thumbnail_from_row(&r)).transpose()
    }

    pub async fn thumbnails_for(&self, object_path: &str) -> Result<Vec<ThumbnailRecord>> {
        let rows =
            sqlx::query("SELECT * FROM thumbnails WHERE object_path = ? ORDER BY requested_size")
                .bind(object_path)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(thumbnail_from_row).collect()
    }

    /// Merge one attempt into the thumbnail record.
    ///
    /// Resolution never decreases and state never moves down
    /// (`Missing < Placeholder < Final`). `attempt_count` grows by one per
    /// call. The cache path is replaced only when the attempt raises the
    /// resolution or first reaches `Final`.
    pub async fn record_thumbnail(&self, write: &ThumbnailWrite<'_>) -> Result<ThumbnailMerge> {
        retry_once(write.object_path, || self.try_record_thumbnail(write)).await
    }

    async fn try_record_thumbnail(&self, write: &ThumbnailWrite<'_>) -> Result<ThumbnailMerge> {
        let mut tx = self.pool.begin().await?;

        let asset: Option<i64> = sqlx::query_scalar("SELECT 1 FROM assets WHERE object_path = ?")
            .bind(write.object_path)
            .fetch_optional(&mut *tx)
            .await?;
        if asset.is_none() {
            return Err(Error::AssetUnavailable(write.object_path.to_string()));
        }

        let previous =
            sqlx::query("SELECT * FROM thumbnails WHERE object_path = ? AND requested_size = ?")
                .bind(write.object_path)
                .bind(write.requested_size)
                .fetch_optional(&mut *tx)
                .await?
                .map(|r| thumbnail_from_row(&r))
                .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO thumbnails (object_path, requested_size, resolution, cache_path,
                                    attempt_count, state, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
            ON CONFLICT(object_path, requested_size) DO UPDATE SET
                cache_path = CASE
                    WHEN excluded.cache_path IS NOT NULL
                         AND (excluded.resolution > thumbnails.resolution
                              OR (excluded.state = 'final' AND thumbnails.state <> 'final'))
                    THEN excluded.cache_path
                    ELSE thumbnails.cache_path
                END,
                resolution = MAX(thumbnails.resolution, excluded.resolution),
                state = CASE
                    WHEN (CASE excluded.state WHEN 'final' THEN 2 WHEN 'placeholder' THEN 1 ELSE 0 END)
                       > (CASE thumbnails.state WHEN 'final' THEN 2 WHEN 'placeholder' THEN 1 ELSE 0 END)
                    THEN excluded.state
                    ELSE thumbnails.state
                END,
                attempt_count = thumbnails.attempt_count + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(write.object_path)
        .bind(write.requested_size)
        .bind(write.resolution)
        .bind(write.cache_path)
        .bind(write.state.as_str())
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;

        let row =
            sqlx::query("SELECT * FROM thumbnails WHERE object_path = ? AND requested_size = ?")
                .bind(write.object_path)
                .bind(write.requested_size)
                .fetch_one(&mut *tx)
                .await?;
        let current = thumbnail_from_row(&row)?;

        tx.commit().await?;
        Ok(ThumbnailMerge { previous, current })
    }

    /// True when any thumbnail row still points at `cache_path`.
    pub async fn cache_path_referenced(&self, cache_path: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM thumbnails WHERE cache_path = ?")
            .bind(cache_path)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

/// Run `op`, and run it once more after [`RETRY_DELAY`] if it failed with a
/// store error. Other errors are returned as they are.
async fn retry_once<T, F, Fut>(object_path: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(Error::Store(e)) => {
            warn!(object_path, error = %e, "store write failed, retrying");
            tokio::time::sleep(RETRY_DELAY).await;
            op().await
        }
        other => other,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════

fn scan_from_row(row: &SqliteRow) -> Result<ScanRun> {
    let status: String = row.get("status");
    Ok(ScanRun {
        scan_id: row.get("scan_id"),
        path_filter: row.get("path_filter"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        status: status.parse()?,
        assets_seen: row.get("assets_seen"),
        assets_pruned: row.get("assets_pruned"),
        error: row.get("error"),
    })
}

fn asset_from_row(row: &SqliteRow) -> AssetRecord {
    let tags_json: String = row.get("tags_json");
    let tags: BTreeMap<String, String> = serde_json::from_str(&tags_json).unwrap_or_default();
    AssetRecord {
        object_path: row.get("object_path"),
        class_name: row.get("class_name"),
        package_path: row.get("package_path"),
        tags,
        last_seen_scan_id: row.get("last_seen_scan_id"),
    }
}

fn thumbnail_from_row(row: &SqliteRow) -> Result<ThumbnailRecord> {
    let state: String = row.get("state");
    Ok(ThumbnailRecord {
        object_path: row.get("object_path"),
        requested_size: row.get("requested_size"),
        resolution: row.get("resolution"),
        cache_path: row.get("cache_path"),
        attempt_count: row.get("attempt_count"),
        state: state.parse()?,
        updated_at: row.get("updated_at"),
    })
}
