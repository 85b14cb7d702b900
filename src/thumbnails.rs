//! Thumbnail acquisition.
//!
//! A refresh pass asks the engine to render every stored asset under a
//! filter, one command at a time, in batches. Between batches the pass checks
//! for cancellation and asks the engine session to collect garbage, which
//! bounds how much the engine holds onto during large passes.
//!
//! Each answer is classified and merged into the asset's thumbnail record:
//!
//! | Engine answer | Recorded state |
//! |---------------|----------------|
//! | `ready` at ≥ target size | `final` |
//! | `ready` below target, or `loading` | `placeholder` |
//! | `missing`, `unavailable`, script error, undecodable image | `missing` |
//!
//! Records only ever move up (see [`SqliteStore::record_thumbnail`]).
//! Placeholders are not retried within a pass; the engine keeps assets it
//! loaded resident, so the next pass usually finalizes them.

use base64::Engine as _;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ThumbnailCache;
use crate::client::{CommandChannel, EngineClient};
use crate::config::Config;
use crate::db;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{PathFilter, RefreshSummary, ThumbnailState};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::protocol::ExecutionResult;
use crate::scripts::{self, RenderReply};
use crate::store::{SqliteStore, ThumbnailWrite};

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// Requested edge length in pixels.
    pub target_resolution: u32,
    /// Render commands per batch.
    pub batch_size: usize,
    /// Ask the engine to collect garbage between batches.
    pub trim_between_batches: bool,
    /// Re-render assets that are already `final` at the target size.
    pub force: bool,
}

/// A decoded render answer.
#[derive(Debug)]
enum Rendered {
    Image {
        png: Vec<u8>,
        resolution: u32,
        state: ThumbnailState,
    },
    Failed(Error),
}

/// Run one refresh pass over the stored assets under `filter`.
///
/// A channel fault, a persistent store or cache error, or cancellation ends
/// the pass; everything merged before that stays committed and the fault is
/// returned in [`RefreshSummary::abort`]. Per-asset failures are recorded and
/// counted without stopping the pass.
pub async fn refresh<C>(
    channel: &mut C,
    store: &SqliteStore,
    cache: &ThumbnailCache,
    filter: &PathFilter,
    options: &RefreshOptions,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<RefreshSummary>
where
    C: CommandChannel + ?Sized,
{
    let target = options.target_resolution.max(1);
    let candidates = store.asset_paths_in_scope(filter).await?;
    let mut summary = RefreshSummary {
        requested: candidates.len() as u64,
        ..Default::default()
    };

    let mut work = Vec::with_capacity(candidates.len());
    for path in candidates {
        if !options.force {
            if let Some(existing) = store.get_thumbnail(&path, target as i64).await? {
                if existing.state == ThumbnailState::Final {
                    summary.skipped += 1;
                    continue;
                }
            }
        }
        work.push(path);
    }

    info!(
        filter = %filter,
        requested = summary.requested,
        pending = work.len(),
        target,
        "thumbnail refresh started"
    );

    for (i, batch) in work.chunks(options.batch_size.max(1)).enumerate() {
        if cancel.is_cancelled() {
            summary.abort = Some(Error::Cancelled);
            break;
        }
        if i > 0 && options.trim_between_batches {
            if let Err(e) = trim(channel).await {
                summary.abort = Some(e);
                break;
            }
        }

        for object_path in batch {
            let result = match channel
                .execute(&scripts::render_thumbnail(object_path, target))
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(object_path = %object_path, error = %e, "refresh aborted");
                    summary.abort = Some(e);
                    return Ok(summary);
                }
            };
            summary.processed += 1;

            if let Err(e) = merge(store, cache, object_path, target, &result, &mut summary).await {
                warn!(object_path = %object_path, error = %e, "refresh aborted");
                summary.abort = Some(e);
                return Ok(summary);
            }

            progress.report(ProgressEvent::Rendering {
                filter: filter.as_str().to_string(),
                n: summary.processed,
                total: work.len() as u64,
            });
        }
    }

    info!(
        processed = summary.processed,
        improved = summary.improved,
        finalized = summary.finalized,
        degraded = summary.degraded,
        failed = summary.failed,
        skipped = summary.skipped,
        "thumbnail refresh finished"
    );
    Ok(summary)
}

/// Release engine memory between batches. Only a channel fault is fatal.
async fn trim<C>(channel: &mut C) -> Result<()>
where
    C: CommandChannel + ?Sized,
{
    let result = channel.execute(scripts::trim_memory()).await?;
    if !result.succeeded {
        debug!(stderr = %result.stderr, "memory trim failed");
    }
    Ok(())
}

/// Classify one answer, write its image to the cache if it improves the
/// record, and merge it into the store.
async fn merge(
    store: &SqliteStore,
    cache: &ThumbnailCache,
    object_path: &str,
    target: u32,
    result: &ExecutionResult,
    summary: &mut RefreshSummary,
) -> Result<()> {
    let previous = store.get_thumbnail(object_path, target as i64).await?;

    let (resolution, state, cache_path) = match classify(object_path, target, result) {
        Rendered::Image {
            png,
            resolution,
            state,
        } => {
            let (prev_res, prev_state) = previous
                .as_ref()
                .map(|p| (p.resolution, p.state))
                .unwrap_or((0, ThumbnailState::Missing));
            let improves = resolution as i64 > prev_res
                || (state == ThumbnailState::Final && prev_state != ThumbnailState::Final);
            let path = if improves {
                Some(cache.write(&png).await?)
            } else {
                None
            };
            (resolution as i64, state, path)
        }
        Rendered::Failed(e) => {
            debug!(object_path, error = %e, "no preview produced");
            (0, ThumbnailState::Missing, None)
        }
    };

    let cache_path = cache_path.as_deref().map(Path::to_string_lossy);
    let merged = match store
        .record_thumbnail(&ThumbnailWrite {
            object_path,
            requested_size: target as i64,
            resolution,
            state,
            cache_path: cache_path.as_deref(),
        })
        .await
    {
        Ok(merged) => merged,
        // Pruned by a concurrent sync after the candidates were listed.
        Err(e) if e.is_item_failure() => {
            debug!(object_path, error = %e, "thumbnail not recorded");
            if let Some(written) = cache_path.as_deref() {
                if !store.cache_path_referenced(written).await? {
                    cache.remove(Path::new(written)).await?;
                }
            }
            summary.failed += 1;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if let Some(old) = merged.superseded_cache_path() {
        if !store.cache_path_referenced(old).await? {
            cache.remove(Path::new(old)).await?;
        }
    }

    match state {
        ThumbnailState::Final => summary.finalized += 1,
        ThumbnailState::Placeholder => summary.degraded += 1,
        ThumbnailState::Missing => summary.failed += 1,
    }
    if merged.improved() {
        summary.improved += 1;
    }
    Ok(())
}

fn classify(object_path: &str, target: u32, result: &ExecutionResult) -> Rendered {
    let reply: RenderReply = match result.parse_json() {
        Ok(reply) => reply,
        Err(e) => return Rendered::Failed(e),
    };

    let ready = match reply.status.as_str() {
        "ready" => true,
        "loading" => false,
        "unavailable" => return Rendered::Failed(Error::AssetUnavailable(object_path.to_string())),
        other => {
            return Rendered::Failed(Error::script(format!(
                "no preview for {} ({})",
                object_path, other
            )))
        }
    };

    let Some(data) = reply.data else {
        return Rendered::Failed(Error::protocol("render reply without image data"));
    };
    let png = match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
        Ok(png) => png,
        Err(e) => return Rendered::Failed(Error::protocol(format!("bad image encoding: {}", e))),
    };
    let resolution = match image::load_from_memory(&png) {
        Ok(img) => img.width().min(img.height()),
        Err(e) => return Rendered::Failed(Error::protocol(format!("undecodable image: {}", e))),
    };
    if resolution == 0 {
        return Rendered::Failed(Error::protocol("empty image"));
    }

    let state = if ready && resolution >= target {
        ThumbnailState::Final
    } else {
        ThumbnailState::Placeholder
    };
    Rendered::Image {
        png,
        resolution,
        state,
    }
}

/// Connect to the store and the engine, then run [`refresh`].
pub async fn request_thumbnail_refresh(
    config: &Config,
    filter: &PathFilter,
    resolution: u32,
    force: bool,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> anyhow::Result<RefreshSummary> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);
    let cache = ThumbnailCache::new(&config.thumbnails.cache_dir);
    debug!(cache = %cache.root().display(), "thumbnail cache");

    let options = RefreshOptions {
        target_resolution: resolution,
        batch_size: config.thumbnails.batch_size,
        trim_between_batches: config.thumbnails.trim_between_batches,
        force,
    };

    let summary = match EngineClient::from_config(&config.engine).await {
        Ok(mut client) => {
            refresh(&mut client, &store, &cache, filter, &options, progress, cancel).await?
        }
        Err(e) => RefreshSummary {
            requested: store.asset_paths_in_scope(filter).await?.len() as u64,
            abort: Some(e),
            ..Default::default()
        },
    };

    store.pool().close().await;
    Ok(summary)
}

/// Entry point for `gcv thumbnails refresh`.
pub async fn run_refresh(
    config: &Config,
    filter: Option<String>,
    resolution: Option<u32>,
    force: bool,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let filter = PathFilter::new(filter.as_deref().unwrap_or(&config.sync.default_filter));
    let resolution = resolution.unwrap_or(config.thumbnails.resolution);
    if resolution == 0 {
        anyhow::bail!("resolution must be > 0");
    }
    let summary =
        request_thumbnail_refresh(config, &filter, resolution, force, progress, cancel).await?;

    println!("thumbnails {} @ {}px", filter, resolution);
    println!("  requested: {}", summary.requested);
    println!("  processed: {}", summary.processed);
    println!("  improved: {}", summary.improved);
    println!("  final: {}", summary.finalized);
    println!("  placeholder: {}", summary.degraded);
    println!("  failed: {}", summary.failed);
    println!("  skipped: {}", summary.skipped);

    if let Some(e) = summary.abort {
        anyhow::bail!("thumbnail refresh {} stopped early: {}", filter, e);
    }
    if summary.degraded > 0 {
        println!("placeholders remain; run refresh again to finalize them");
    }
    println!("ok");
    Ok(())
}
