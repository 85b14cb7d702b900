//! The content tree served by the engine host.
//!
//! [`EditorHost`] is the black-box editor capability the scripting session
//! calls into: enumerate assets, describe one, and rasterize one into a
//! preview. [`ContentTree`] is an in-memory implementation that models
//! asset residency: the first render of an asset that is not yet loaded
//! returns a low-resolution preview and loads it, so later renders in the
//! same session come back at full size.
//!
//! A tree is described by a TOML manifest:
//!
//! ```toml
//! [[assets]]
//! object_path = "/Game/Characters/Hero.Hero"
//! class_name = "SkeletalMesh"
//!
//! [assets.tags]
//! Skeleton = "/Game/Characters/Hero_Skeleton"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{info, warn};

use crate::models::{AssetDescriptor, PathFilter};

/// Largest preview edge the host will rasterize.
pub const MAX_RENDER_SIZE: u32 = 4096;

/// Editor capabilities exposed to scripts.
pub trait EditorHost: Send + 'static {
    /// Object paths under `filter`, sorted.
    fn list_assets(&mut self, filter: &PathFilter) -> Vec<String>;

    fn find_asset(&mut self, object_path: &str) -> Option<AssetDescriptor>;

    /// Rasterize `object_path` into a `size`×`size` preview.
    fn render_thumbnail(&mut self, object_path: &str, size: u32) -> RenderOutput;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// Fully loaded; the preview is at the requested size.
    Ready,
    /// Not resident yet; a reduced preview was produced.
    Loading,
    /// The object exists but cannot produce a preview.
    Missing,
    /// No live object at that path.
    Unavailable,
}

impl RenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderStatus::Ready => "ready",
            RenderStatus::Loading => "loading",
            RenderStatus::Missing => "missing",
            RenderStatus::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub status: RenderStatus,
    pub resolution: u32,
    pub png: Option<Vec<u8>>,
}

impl RenderOutput {
    fn empty(status: RenderStatus) -> Self {
        Self {
            status,
            resolution: 0,
            png: None,
        }
    }
}

/// One asset entry in a content manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestAsset {
    pub object_path: String,
    pub class_name: String,
    #[serde(default)]
    pub package_path: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default = "default_renderable")]
    pub renderable: bool,
}

fn default_renderable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    assets: Vec<ManifestAsset>,
}

impl ManifestAsset {
    pub fn new(object_path: &str, class_name: &str) -> Self {
        Self {
            object_path: object_path.to_string(),
            class_name: class_name.to_string(),
            package_path: String::new(),
            tags: BTreeMap::new(),
            renderable: true,
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn unrenderable(mut self) -> Self {
        self.renderable = false;
        self
    }

    fn descriptor(&self) -> AssetDescriptor {
        let package_path = if self.package_path.is_empty() {
            package_name(&self.object_path).to_string()
        } else {
            self.package_path.clone()
        };
        AssetDescriptor {
            object_path: self.object_path.clone(),
            class_name: self.class_name.clone(),
            package_path,
            tags: self.tags.clone(),
        }
    }
}

/// Package part of an object path: `/Game/Path/Asset.Asset` → `/Game/Path/Asset`.
pub fn package_name(object_path: &str) -> &str {
    match object_path.rsplit_once('.') {
        Some((package, _)) if !package.is_empty() => package,
        _ => object_path,
    }
}

/// In-memory content tree with residency tracking.
#[derive(Debug, Clone)]
pub struct ContentTree {
    assets: BTreeMap<String, ManifestAsset>,
    resident: HashSet<String>,
    placeholder_resolution: u32,
}

impl ContentTree {
    pub fn new(placeholder_resolution: u32) -> Self {
        Self {
            assets: BTreeMap::new(),
            resident: HashSet::new(),
            placeholder_resolution: placeholder_resolution.max(1),
        }
    }

    pub fn from_manifest_str(text: &str, placeholder_resolution: u32) -> Result<Self> {
        let manifest: Manifest =
            toml::from_str(text).context("Failed to parse content manifest")?;
        let mut tree = Self::new(placeholder_resolution);
        for asset in manifest.assets {
            tree.insert(asset);
        }
        Ok(tree)
    }

    pub fn insert(&mut self, asset: ManifestAsset) {
        self.assets.insert(asset.object_path.clone(), asset);
    }

    pub fn remove(&mut self, object_path: &str) -> Option<ManifestAsset> {
        self.resident.remove(object_path);
        self.assets.remove(object_path)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn is_resident(&self, object_path: &str) -> bool {
        self.resident.contains(object_path)
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Replace the asset set, keeping residency for paths that survive.
    fn replace_assets(&mut self, other: ContentTree) {
        self.resident.retain(|p| other.assets.contains_key(p));
        self.assets = other.assets;
    }
}

impl EditorHost for ContentTree {
    fn list_assets(&mut self, filter: &PathFilter) -> Vec<String> {
        self.assets
            .keys()
            .filter(|p| filter.contains(p))
            .cloned()
            .collect()
    }

    fn find_asset(&mut self, object_path: &str) -> Option<AssetDescriptor> {
        self.assets.get(object_path).map(ManifestAsset::descriptor)
    }

    fn render_thumbnail(&mut self, object_path: &str, size: u32) -> RenderOutput {
        let Some(asset) = self.assets.get(object_path) else {
            return RenderOutput::empty(RenderStatus::Unavailable);
        };
        if !asset.renderable {
            return RenderOutput::empty(RenderStatus::Missing);
        }

        let size = size.clamp(1, MAX_RENDER_SIZE);
        let (status, resolution) = if self.resident.contains(object_path) {
            (RenderStatus::Ready, size)
        } else {
            self.resident.insert(object_path.to_string());
            (RenderStatus::Loading, size.min(self.placeholder_resolution))
        };

        match rasterize(object_path, resolution, status == RenderStatus::Ready) {
            Ok(png) => RenderOutput {
                status,
                resolution,
                png: Some(png),
            },
            Err(e) => {
                warn!(object_path, error = %e, "failed to encode preview");
                RenderOutput::empty(RenderStatus::Missing)
            }
        }
    }
}

/// Draw a deterministic preview tinted by the object path.
fn rasterize(object_path: &str, size: u32, detailed: bool) -> image::ImageResult<Vec<u8>> {
    let digest = Sha256::digest(object_path.as_bytes());
    let base = [digest[0], digest[1], digest[2]];
    let img = image::RgbaImage::from_fn(size, size, |x, y| {
        if !detailed {
            return image::Rgba([base[0], base[1], base[2], 255]);
        }
        let t = ((x + y) * 255 / (2 * size).max(1)) as u8;
        image::Rgba([
            base[0].wrapping_add(t),
            base[1],
            base[2].wrapping_sub(t),
            255,
        ])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// A [`ContentTree`] shared between the executor and other handles, such
/// as tests that change the tree while a server is running.
#[derive(Debug, Clone)]
pub struct SharedTree(Arc<Mutex<ContentTree>>);

impl SharedTree {
    pub fn new(tree: ContentTree) -> Self {
        Self(Arc::new(Mutex::new(tree)))
    }

    pub fn lock(&self) -> MutexGuard<'_, ContentTree> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EditorHost for SharedTree {
    fn list_assets(&mut self, filter: &PathFilter) -> Vec<String> {
        self.lock().list_assets(filter)
    }

    fn find_asset(&mut self, object_path: &str) -> Option<AssetDescriptor> {
        self.lock().find_asset(object_path)
    }

    fn render_thumbnail(&mut self, object_path: &str, size: u32) -> RenderOutput {
        self.lock().render_thumbnail(object_path, size)
    }
}

/// A content tree backed by a manifest file, reloaded when the file changes.
pub struct ManifestHost {
    path: PathBuf,
    tree: ContentTree,
    modified: Option<SystemTime>,
}

impl ManifestHost {
    pub fn open(path: &Path, placeholder_resolution: u32) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read content manifest: {}", path.display()))?;
        let tree = ContentTree::from_manifest_str(&text, placeholder_resolution)?;
        info!(manifest = %path.display(), assets = tree.len(), "content tree loaded");
        Ok(Self {
            path: path.to_path_buf(),
            tree,
            modified: modified_time(path),
        })
    }

    fn reload_if_changed(&mut self) {
        let modified = modified_time(&self.path);
        if modified == self.modified {
            return;
        }
        let reloaded = std::fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|text| {
                ContentTree::from_manifest_str(&text, self.tree.placeholder_resolution)
            });
        match reloaded {
            Ok(tree) => {
                self.tree.replace_assets(tree);
                self.modified = modified;
                info!(
                    manifest = %self.path.display(),
                    assets = self.tree.len(),
                    resident = self.tree.resident_count(),
                    "content tree reloaded"
                );
            }
            Err(e) => warn!(manifest = %self.path.display(), error = %e, "keeping previous content tree"),
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl EditorHost for ManifestHost {
    fn list_assets(&mut self, filter: &PathFilter) -> Vec<String> {
        self.reload_if_changed();
        self.tree.list_assets(filter)
    }

    fn find_asset(&mut self, object_path: &str) -> Option<AssetDescriptor> {
        self.tree.find_asset(object_path)
    }

    fn render_thumbnail(&mut self, object_path: &str, size: u32) -> RenderOutput {
        self.tree.render_thumbnail(object_path, size)
    }
}
