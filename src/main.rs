//! # Game Content Viewer CLI (`gcv`)
//!
//! The `gcv` binary hosts the engine side of the command channel and drives
//! the tool side: synchronizing the asset inventory into SQLite and fetching
//! thumbnails.
//!
//! ## Usage
//!
//! ```bash
//! gcv --config ./config/gcv.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gcv init` | Create the SQLite store and run schema migrations |
//! | `gcv engine serve` | Host a content tree behind the command channel |
//! | `gcv engine stop` | Ask a running engine host to shut down |
//! | `gcv exec "<lua>"` | Run a raw script in the engine session |
//! | `gcv sync [filter]` | Catalogue assets under a path filter |
//! | `gcv thumbnails refresh [filter]` | Fetch or improve thumbnails |
//! | `gcv stats` | Summarize the store |
//! | `gcv get <object_path>` | Show one asset and its thumbnails |
//!
//! ## Examples
//!
//! ```bash
//! # Start the engine host in one terminal
//! gcv engine serve --config ./config/gcv.toml
//!
//! # Catalogue everything under /Game/Characters/
//! gcv sync /Game/Characters/ --config ./config/gcv.toml
//!
//! # Fetch 256px previews; run again to finalize placeholders
//! gcv thumbnails refresh /Game/Characters/ --resolution 256
//!
//! # Poke the session directly
//! gcv exec 'print(#editor.list_assets("/Game/"))'
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use game_content_viewer::progress::ProgressMode;
use game_content_viewer::{client, config, get, migrate, server, stats, sync, thumbnails};

/// Game Content Viewer CLI: catalogue editor content and fetch thumbnails
/// over a scripted command channel.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gcv.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "gcv",
    about = "Game Content Viewer: catalogue editor content and fetch thumbnails",
    version,
    long_about = "Game Content Viewer connects to a running editor's command channel, \
    enumerates its content tree into a SQLite store, and fetches progressively \
    better thumbnails for the catalogued assets."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gcv.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema.
    ///
    /// Creates the SQLite file and the assets, scan_runs and thumbnails
    /// tables. Running it again is safe.
    Init,

    /// Run or stop the engine-side command server.
    Engine {
        #[command(subcommand)]
        action: EngineAction,
    },

    /// Run a Lua script in the engine session and print its output.
    ///
    /// Exits non-zero when the script raises.
    Exec {
        /// Inline script text.
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        script: Option<String>,

        /// Read the script from a file instead.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Catalogue assets under a path filter.
    ///
    /// Enumerates the content tree through the engine, upserts every asset,
    /// and prunes assets under the filter that no longer exist.
    Sync {
        /// Object-path prefix. Defaults to `[sync].default_filter`; pass ""
        /// for the whole tree.
        filter: Option<String>,

        /// Progress output: auto, off, human, json.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Manage thumbnails.
    Thumbnails {
        #[command(subcommand)]
        action: ThumbnailAction,
    },

    /// Show store statistics and recent scans.
    Stats,

    /// Show one asset by object path.
    Get {
        /// Object path, e.g. `/Game/Characters/Hero.Hero`.
        object_path: String,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

/// Engine host subcommands.
#[derive(Subcommand)]
enum EngineAction {
    /// Serve the configured content manifest on `[engine_host].bind`.
    Serve,
    /// Send a shutdown request to the engine at `[engine].address`.
    Stop,
}

/// Thumbnail subcommands.
#[derive(Subcommand)]
enum ThumbnailAction {
    /// Render stored assets and merge the results.
    ///
    /// Placeholders are finalized on later runs, once the engine has the
    /// assets loaded.
    Refresh {
        /// Object-path prefix. Defaults to `[sync].default_filter`.
        filter: Option<String>,

        /// Edge length in pixels. Defaults to `[thumbnails].resolution`.
        #[arg(long)]
        resolution: Option<u32>,

        /// Re-render assets that are already final.
        #[arg(long)]
        force: bool,

        /// Progress output: auto, off, human, json.
        #[arg(long, default_value = "auto")]
        progress: String,
    },
}

fn parse_progress(mode: &str) -> anyhow::Result<ProgressMode> {
    match mode {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => anyhow::bail!(
            "Unknown progress mode: '{}'. Must be auto, off, human, or json.",
            other
        ),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current command");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::init(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Engine { action } => match action {
            EngineAction::Serve => {
                server::run_engine(&cfg).await?;
            }
            EngineAction::Stop => {
                client::run_stop(&cfg.engine).await?;
            }
        },
        Commands::Exec { script, file } => {
            let script = match (script, file) {
                (Some(script), _) => script,
                (None, Some(path)) => std::fs::read_to_string(&path).map_err(|e| {
                    anyhow::anyhow!("Failed to read script {}: {}", path.display(), e)
                })?,
                (None, None) => anyhow::bail!("no script given"),
            };
            if !client::run_exec(&cfg.engine, &script).await? {
                std::process::exit(1);
            }
        }
        Commands::Sync { filter, progress } => {
            let reporter = parse_progress(&progress)?.reporter();
            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());
            sync::run_sync(&cfg, filter, reporter.as_ref(), &cancel).await?;
        }
        Commands::Thumbnails { action } => match action {
            ThumbnailAction::Refresh {
                filter,
                resolution,
                force,
                progress,
            } => {
                let reporter = parse_progress(&progress)?.reporter();
                let cancel = CancellationToken::new();
                cancel_on_interrupt(cancel.clone());
                thumbnails::run_refresh(&cfg, filter, resolution, force, reporter.as_ref(), &cancel)
                    .await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Get { object_path, json } => {
            get::run_get(&cfg, &object_path, json).await?;
        }
    }

    Ok(())
}
