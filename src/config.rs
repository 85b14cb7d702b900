use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub engine_host: EngineHostConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub thumbnails: ThumbnailsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where the tool reaches the engine's command channel.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:7777".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    120
}

/// Settings for `gcv engine serve`.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineHostConfig {
    #[serde(default = "default_address")]
    pub bind: String,
    #[serde(default)]
    pub content_manifest: Option<PathBuf>,
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_placeholder_resolution")]
    pub placeholder_resolution: u32,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for EngineHostConfig {
    fn default() -> Self {
        Self {
            bind: default_address(),
            content_manifest: None,
            script_timeout_secs: default_script_timeout_secs(),
            placeholder_resolution: default_placeholder_resolution(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_script_timeout_secs() -> u64 {
    300
}
fn default_placeholder_resolution() -> u32 {
    64
}
fn default_max_frame_bytes() -> usize {
    crate::channel::DEFAULT_MAX_FRAME_BYTES
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_prune")]
    pub prune: bool,
    #[serde(default = "default_filter")]
    pub default_filter: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            prune: default_prune(),
            default_filter: default_filter(),
        }
    }
}

fn default_page_size() -> usize {
    500
}
fn default_prune() -> bool {
    true
}
fn default_filter() -> String {
    "/Game/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThumbnailsConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_trim_between_batches")]
    pub trim_between_batches: bool,
}

impl Default for ThumbnailsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            resolution: default_resolution(),
            batch_size: default_batch_size(),
            trim_between_batches: default_trim_between_batches(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/thumbnails")
}
fn default_resolution() -> u32 {
    256
}
fn default_batch_size() -> usize {
    32
}
fn default_trim_between_batches() -> bool {
    true
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Reject values the synchronizer or pipeline cannot work with.
pub fn validate(config: &Config) -> Result<()> {
    if config.sync.page_size == 0 {
        anyhow::bail!("sync.page_size must be > 0");
    }

    if config.thumbnails.batch_size == 0 {
        anyhow::bail!("thumbnails.batch_size must be > 0");
    }
    if config.thumbnails.resolution == 0 {
        anyhow::bail!("thumbnails.resolution must be > 0");
    }

    if config.engine.connect_timeout_secs == 0 || config.engine.request_timeout_secs == 0 {
        anyhow::bail!("engine timeouts must be > 0");
    }
    if config.engine_host.script_timeout_secs == 0 {
        anyhow::bail!("engine_host.script_timeout_secs must be > 0");
    }
    if config.engine_host.placeholder_resolution == 0 {
        anyhow::bail!("engine_host.placeholder_resolution must be > 0");
    }
    if config.engine_host.max_frame_bytes < crate::channel::HEADER_LEN {
        anyhow::bail!(
            "engine_host.max_frame_bytes must be >= {}",
            crate::channel::HEADER_LEN
        );
    }

    Ok(())
}
