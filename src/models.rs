//! Core data models used throughout the viewer.
//!
//! These types represent the asset descriptors reported by the engine, the
//! records persisted in the store, and the summaries returned to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Raw asset metadata as reported by the engine's enumeration script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub object_path: String,
    pub class_name: String,
    #[serde(default)]
    pub package_path: String,
    #[serde(default, deserialize_with = "crate::protocol::de_string_map")]
    pub tags: BTreeMap<String, String>,
}

/// One row of the `assets` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetRecord {
    pub object_path: String,
    pub class_name: String,
    pub package_path: String,
    pub tags: BTreeMap<String, String>,
    pub last_seen_scan_id: i64,
}

/// Lifecycle state of a synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanStatus::Pending)
    }
}

impl FromStr for ScanStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            other => Err(Error::protocol(format!("unknown scan status '{}'", other))),
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `scan_runs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanRun {
    pub scan_id: i64,
    pub path_filter: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub status: ScanStatus,
    pub assets_seen: i64,
    pub assets_pruned: i64,
    pub error: Option<String>,
}

/// Thumbnail convergence state. Ordered: `Missing < Placeholder < Final`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailState {
    Missing,
    Placeholder,
    Final,
}

impl ThumbnailState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailState::Missing => "missing",
            ThumbnailState::Placeholder => "placeholder",
            ThumbnailState::Final => "final",
        }
    }
}

impl FromStr for ThumbnailState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing" => Ok(ThumbnailState::Missing),
            "placeholder" => Ok(ThumbnailState::Placeholder),
            "final" => Ok(ThumbnailState::Final),
            other => Err(Error::protocol(format!(
                "unknown thumbnail state '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ThumbnailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `thumbnails` table, keyed by `(object_path, requested_size)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThumbnailRecord {
    pub object_path: String,
    pub requested_size: i64,
    pub resolution: i64,
    pub cache_path: Option<String>,
    pub attempt_count: i64,
    pub state: ThumbnailState,
    pub updated_at: i64,
}

/// A subtree of the content tree, addressed by object-path prefix.
///
/// An empty filter covers the whole tree. Otherwise a path is in scope when
/// it equals the filter or continues it across a `/` or `.` boundary, so
/// `/Game/A` covers `/Game/A.A` and `/Game/A/Sub` but not `/Game/AB`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter(String);

impl PathFilter {
    pub fn new(filter: &str) -> Self {
        Self(filter.trim().to_string())
    }

    pub fn whole_tree() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_whole_tree(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, object_path: &str) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let Some(rest) = object_path.strip_prefix(self.0.as_str()) else {
            return false;
        };
        self.0.ends_with('/') || rest.is_empty() || rest.starts_with('/') || rest.starts_with('.')
    }
}

impl fmt::Display for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<all>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Outcome of one `sync` call.
#[derive(Debug)]
pub struct SyncReport {
    pub scan: ScanRun,
    /// Descriptors received from the engine.
    pub discovered: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Descriptors rejected as malformed or outside the filter.
    pub rejected: u64,
    pub pruned: u64,
    /// The fault that ended the scan early, if any.
    pub abort: Option<Error>,
}

impl SyncReport {
    pub fn upserted(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Outcome of one thumbnail `refresh` call.
#[derive(Debug, Default)]
pub struct RefreshSummary {
    /// Candidate assets matching the filter.
    pub requested: u64,
    /// Render commands answered by the engine.
    pub processed: u64,
    /// Records whose resolution or state went up.
    pub improved: u64,
    /// Processed assets that reached `Final`.
    pub finalized: u64,
    /// Processed assets that only produced a placeholder.
    pub degraded: u64,
    /// Processed assets with no usable preview.
    pub failed: u64,
    /// Candidates already `Final` at the target size.
    pub skipped: u64,
    /// The fault that ended the pass early, if any.
    pub abort: Option<Error>,
}
