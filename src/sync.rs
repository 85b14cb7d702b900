//! Inventory synchronization.
//!
//! Drives a paged enumeration of the engine's content tree through a
//! [`CommandChannel`] and merges every descriptor into the store:
//!
//! ```text
//! begin scan (pending) → enumerate page → upsert each descriptor → … → prune → completed
//! ```
//!
//! Each upsert commits on its own, so a scan that fails half way leaves the
//! records it already merged valid. The scan row is then marked `failed` and
//! nothing is pruned. Pruning is confined to the filter's subtree; only an
//! empty filter can prune across the whole store.
//!
//! Cancellation is checked before each page is requested. A page already
//! requested is always consumed.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{CommandChannel, EngineClient};
use crate::config::Config;
use crate::db;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{AssetDescriptor, PathFilter, ScanStatus, SyncReport};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::scripts::{self, EnumerationPage};
use crate::store::{SqliteStore, UpsertOutcome};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Descriptors requested per enumeration command.
    pub page_size: usize,
    /// Remove in-scope assets the scan did not see.
    pub prune: bool,
}

#[derive(Debug, Default)]
struct Tally {
    discovered: u64,
    inserted: u64,
    updated: u64,
    rejected: u64,
}

/// Run one synchronization pass over `filter`.
///
/// Channel faults, script failures, persistent store errors and cancellation
/// end the pass early; they are returned in [`SyncReport::abort`] next to the
/// `failed` scan row. `Err` is returned only when the scan row itself cannot
/// be written.
pub async fn sync<C>(
    channel: &mut C,
    store: &SqliteStore,
    filter: &PathFilter,
    options: &SyncOptions,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<SyncReport>
where
    C: CommandChannel + ?Sized,
{
    let scan = store.begin_scan(filter).await?;
    info!(scan_id = scan.scan_id, filter = %filter, "sync started");
    progress.report(ProgressEvent::Discovering {
        filter: filter.as_str().to_string(),
    });

    let mut tally = Tally::default();
    let enumerated = enumerate(
        channel,
        store,
        filter,
        scan.scan_id,
        options.page_size.max(1),
        &mut tally,
        progress,
        cancel,
    )
    .await;

    let pruned = match enumerated {
        Ok(()) if options.prune => store.prune_stale(filter, scan.scan_id).await.map(Some),
        Ok(()) => Ok(None),
        Err(e) => Err(e),
    };

    let seen = (tally.inserted + tally.updated) as i64;
    let (scan, pruned, abort) = match pruned {
        Ok(pruned) => {
            let n = pruned.unwrap_or(0);
            let scan = store
                .finish_scan(scan.scan_id, ScanStatus::Completed, seen, n as i64, None)
                .await?;
            info!(
                scan_id = scan.scan_id,
                upserted = seen,
                pruned = n,
                rejected = tally.rejected,
                "sync completed"
            );
            (scan, n, None)
        }
        Err(e) => {
            warn!(scan_id = scan.scan_id, error = %e, "sync failed");
            let reason = match &e {
                Error::Cancelled => "cancelled".to_string(),
                other => other.to_string(),
            };
            let scan = store
                .finish_scan(scan.scan_id, ScanStatus::Failed, seen, 0, Some(&reason))
                .await?;
            (scan, 0, Some(e))
        }
    };

    Ok(SyncReport {
        scan,
        discovered: tally.discovered,
        inserted: tally.inserted,
        updated: tally.updated,
        rejected: tally.rejected,
        pruned,
        abort,
    })
}

#[allow(clippy::too_many_arguments)]
async fn enumerate<C>(
    channel: &mut C,
    store: &SqliteStore,
    filter: &PathFilter,
    scan_id: i64,
    page_size: usize,
    tally: &mut Tally,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: CommandChannel + ?Sized,
{
    let mut after: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = channel
            .execute(&scripts::enumerate_page(filter, after.as_deref(), page_size))
            .await?;
        let page: EnumerationPage = result.parse_json()?;
        debug!(
            after = after.as_deref().unwrap_or(""),
            received = page.assets.len(),
            total = page.total,
            "enumeration page"
        );

        for raw in page.assets {
            tally.discovered += 1;
            let descriptor = match serde_json::from_value::<AssetDescriptor>(raw) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "rejecting malformed descriptor");
                    tally.rejected += 1;
                    continue;
                }
            };
            if descriptor.object_path.is_empty() || descriptor.class_name.is_empty() {
                warn!(object_path = %descriptor.object_path, "rejecting incomplete descriptor");
                tally.rejected += 1;
                continue;
            }
            if !filter.contains(&descriptor.object_path) {
                warn!(object_path = %descriptor.object_path, filter = %filter, "rejecting descriptor outside filter");
                tally.rejected += 1;
                continue;
            }

            match store.upsert_asset(&descriptor, scan_id).await? {
                UpsertOutcome::Inserted => tally.inserted += 1,
                UpsertOutcome::Updated => tally.updated += 1,
                UpsertOutcome::Replaced => {
                    info!(object_path = %descriptor.object_path, class = %descriptor.class_name, "path reused by a new object");
                    tally.updated += 1;
                }
            }
        }

        progress.report(ProgressEvent::Ingesting {
            filter: filter.as_str().to_string(),
            n: tally.inserted + tally.updated,
            total: page.total,
        });

        match (page.more, page.cursor) {
            (true, Some(cursor)) => {
                if after.as_deref().is_some_and(|prev| cursor.as_str() <= prev) {
                    return Err(Error::protocol(format!(
                        "enumeration cursor went backwards at {}",
                        cursor
                    )));
                }
                after = Some(cursor);
            }
            _ => return Ok(()),
        }
    }
}

/// Connect to the store and the engine, then run [`sync`].
///
/// An unreachable engine still leaves a `failed` scan row behind.
pub async fn request_sync(
    config: &Config,
    filter: &PathFilter,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> anyhow::Result<SyncReport> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);

    let options = SyncOptions {
        page_size: config.sync.page_size,
        prune: config.sync.prune,
    };

    let report = match EngineClient::from_config(&config.engine).await {
        Ok(mut client) => sync(&mut client, &store, filter, &options, progress, cancel).await?,
        Err(e) => {
            let scan = store.begin_scan(filter).await?;
            let scan = store
                .finish_scan(scan.scan_id, ScanStatus::Failed, 0, 0, Some(&e.to_string()))
                .await?;
            SyncReport {
                scan,
                discovered: 0,
                inserted: 0,
                updated: 0,
                rejected: 0,
                pruned: 0,
                abort: Some(e),
            }
        }
    };

    store.pool().close().await;
    Ok(report)
}

/// Entry point for `gcv sync`.
pub async fn run_sync(
    config: &Config,
    filter: Option<String>,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let filter = PathFilter::new(filter.as_deref().unwrap_or(&config.sync.default_filter));
    let report = request_sync(config, &filter, progress, cancel).await?;

    println!("sync {}", filter);
    println!("  scan: {} ({})", report.scan.scan_id, report.scan.status);
    println!("  discovered: {} assets", report.discovered);
    println!("  inserted: {}", report.inserted);
    println!("  updated: {}", report.updated);
    if report.rejected > 0 {
        println!("  rejected: {}", report.rejected);
    }
    println!("  pruned: {}", report.pruned);

    if let Some(e) = report.abort {
        anyhow::bail!("sync {} failed: {}", filter, e);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentTree, ManifestAsset, SharedTree};
    use crate::executor::ScriptSession;
    use crate::progress::NoProgress;
    use crate::protocol::ExecutionResult;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Runs scripts in a local session, optionally failing after `limit` calls.
    struct LocalChannel {
        session: ScriptSession,
        calls: usize,
        limit: Option<usize>,
    }

    impl LocalChannel {
        fn new(tree: ContentTree) -> Self {
            Self {
                session: ScriptSession::new(tree, Duration::from_secs(5)).unwrap(),
                calls: 0,
                limit: None,
            }
        }
    }

    #[async_trait]
    impl CommandChannel for LocalChannel {
        async fn execute(&mut self, script: &str) -> Result<ExecutionResult> {
            if self.limit.is_some_and(|l| self.calls >= l) {
                return Err(Error::ConnectionClosed);
            }
            self.calls += 1;
            Ok(self.session.execute(script))
        }
    }

    /// Returns fixed stdout for every command.
    struct CannedChannel(String);

    #[async_trait]
    impl CommandChannel for CannedChannel {
        async fn execute(&mut self, _script: &str) -> Result<ExecutionResult> {
            Ok(ExecutionResult::success(self.0.clone()))
        }
    }

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_path(&dir.path().join("gcv.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn tree(paths: &[&str]) -> ContentTree {
        let mut t = ContentTree::new(64);
        for p in paths {
            t.insert(ManifestAsset::new(p, "StaticMesh"));
        }
        t
    }

    fn options(page_size: usize) -> SyncOptions {
        SyncOptions {
            page_size,
            prune: true,
        }
    }

    #[tokio::test]
    async fn pages_cover_every_asset() {
        let (_dir, store) = store().await;
        let paths: Vec<String> = (0..7).map(|i| format!("/Game/M{i}.M{i}")).collect();
        let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        let mut ch = LocalChannel::new(tree(&refs));

        let report = sync(
            &mut ch,
            &store,
            &PathFilter::whole_tree(),
            &options(3),
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(report.abort.is_none());
        assert_eq!(report.scan.status, ScanStatus::Completed);
        assert_eq!(report.inserted, 7);
        assert_eq!(ch.calls, 3);
        assert_eq!(store.asset_paths_in_scope(&PathFilter::whole_tree()).await.unwrap().len(), 7);
    }

    /// Removes `victim` from the tree once the first command has run.
    struct ShrinkingChannel {
        session: ScriptSession,
        tree: SharedTree,
        victim: Option<&'static str>,
    }

    #[async_trait]
    impl CommandChannel for ShrinkingChannel {
        async fn execute(&mut self, script: &str) -> Result<ExecutionResult> {
            let result = self.session.execute(script);
            if let Some(victim) = self.victim.take() {
                self.tree.lock().remove(victim);
            }
            Ok(result)
        }
    }

    #[tokio::test]
    async fn removal_between_pages_does_not_prune_live_assets() {
        let (_dir, store) = store().await;
        let tree = SharedTree::new(tree(&["/Game/A.A", "/Game/B.B", "/Game/C.C", "/Game/D.D"]));
        let mut ch = ShrinkingChannel {
            session: ScriptSession::new(tree.clone(), Duration::from_secs(5)).unwrap(),
            tree: tree.clone(),
            victim: None,
        };
        let first = sync(&mut ch, &store, &PathFilter::whole_tree(), &options(2), &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.inserted, 4);

        ch.victim = Some("/Game/A.A");
        let second = sync(&mut ch, &store, &PathFilter::whole_tree(), &options(2), &NoProgress, &CancellationToken::new())
            .await
            .unwrap();

        assert!(second.abort.is_none());
        assert_eq!(second.scan.status, ScanStatus::Completed);
        assert_eq!(second.updated, 4);
        assert_eq!(second.pruned, 0);
        for path in ["/Game/B.B", "/Game/C.C", "/Game/D.D"] {
            let rec = store.get_asset(path).await.unwrap().unwrap();
            assert_eq!(rec.last_seen_scan_id, second.scan.scan_id, "{path}");
        }

        // The removed asset goes on the next pass.
        let third = sync(&mut ch, &store, &PathFilter::whole_tree(), &options(2), &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(third.pruned, 1);
        assert!(store.get_asset("/Game/A.A").await.unwrap().is_none());
        assert!(store.get_asset("/Game/C.C").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cursor_that_goes_backwards_fails_the_scan() {
        let (_dir, store) = store().await;
        let mut ch = CannedChannel(
            r#"{"total":2,"assets":[{"object_path":"/Game/A.A","class_name":"StaticMesh"}],"cursor":"/Game/A.A","more":true}"#
                .to_string(),
        );
        let report = sync(
            &mut ch,
            &store,
            &PathFilter::whole_tree(),
            &options(1),
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(matches!(report.abort, Some(Error::Protocol(_))));
        assert_eq!(report.scan.status, ScanStatus::Failed);
        assert_eq!(report.pruned, 0);
    }

    #[tokio::test]
    async fn fault_mid_scan_keeps_merged_records_and_skips_prune() {
        let (_dir, store) = store().await;
        let mut ch = LocalChannel::new(tree(&["/Game/A.A", "/Game/B.B", "/Game/C.C"]));
        sync(&mut ch, &store, &PathFilter::whole_tree(), &options(1), &NoProgress, &CancellationToken::new())
            .await
            .unwrap();

        // Second pass dies after the first page.
        ch.calls = 0;
        ch.limit = Some(1);
        let report = sync(
            &mut ch,
            &store,
            &PathFilter::whole_tree(),
            &options(1),
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(report.abort, Some(Error::ConnectionClosed)));
        assert_eq!(report.scan.status, ScanStatus::Failed);
        assert_eq!(report.updated, 1);
        assert_eq!(report.pruned, 0);
        assert_eq!(store.asset_paths_in_scope(&PathFilter::whole_tree()).await.unwrap().len(), 3);
        let a = store.get_asset("/Game/A.A").await.unwrap().unwrap();
        assert_eq!(a.last_seen_scan_id, report.scan.scan_id);
    }

    #[tokio::test]
    async fn cancelled_before_first_page() {
        let (_dir, store) = store().await;
        let mut ch = LocalChannel::new(tree(&["/Game/A.A"]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = sync(&mut ch, &store, &PathFilter::whole_tree(), &options(10), &NoProgress, &cancel)
            .await
            .unwrap();
        assert!(matches!(report.abort, Some(Error::Cancelled)));
        assert_eq!(report.scan.error.as_deref(), Some("cancelled"));
        assert_eq!(ch.calls, 0);
    }

    #[tokio::test]
    async fn malformed_and_out_of_scope_descriptors_are_rejected() {
        let (_dir, store) = store().await;
        let mut ch = CannedChannel(
            r#"{"total":3,"assets":[{"object_path":"/Game/A/X.X","class_name":"StaticMesh"},{"object_path":"/Other/Y.Y","class_name":"StaticMesh"},{"class_name":"Nope"}]}"#
                .to_string(),
        );
        let report = sync(
            &mut ch,
            &store,
            &PathFilter::new("/Game/A"),
            &options(10),
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(report.abort.is_none());
        assert_eq!(report.discovered, 3);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected, 2);
        assert!(store.get_asset("/Other/Y.Y").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn script_failure_fails_the_scan() {
        let (_dir, store) = store().await;
        struct Failing;
        #[async_trait]
        impl CommandChannel for Failing {
            async fn execute(&mut self, _script: &str) -> Result<ExecutionResult> {
                Ok(ExecutionResult::failure(String::new(), "editor busy".into()))
            }
        }
        let report = sync(
            &mut Failing,
            &store,
            &PathFilter::whole_tree(),
            &options(10),
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(matches!(report.abort, Some(Error::ScriptExecution { .. })));
        assert_eq!(report.scan.status, ScanStatus::Failed);
        assert!(report.scan.error.unwrap().contains("editor busy"));
    }
}
