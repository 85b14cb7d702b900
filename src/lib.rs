//! # Game Content Viewer
//!
//! Catalogue the content assets of a running editor process and fetch their
//! thumbnails, without direct access to the editor's object graph.
//!
//! The tool talks to the engine over a framed TCP command channel. Every
//! query is a Lua script executed in the engine's persistent scripting
//! session; results come back as captured stdout.
//!
//! ## Architecture
//!
//! ```text
//!  tool side                                  engine side
//! ┌──────────────┐   ┌─────────┐  frames  ┌──────────┐   ┌──────────┐
//! │ sync         │──▶│ client  │◀────────▶│ server   │──▶│ executor │
//! │ thumbnails   │   └─────────┘          └──────────┘   │ (Lua)    │
//! └──────┬───────┘                                       └────┬─────┘
//!        ▼                                                    ▼
//! ┌──────────────┐  ┌──────────────┐                     ┌──────────┐
//! │ SQLite store │  │ png cache    │                     │ content  │
//! └──────────────┘  └──────────────┘                     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gcv engine serve                       # host a content tree
//! gcv init                               # create the store
//! gcv sync /Game/                        # catalogue assets
//! gcv thumbnails refresh /Game/          # fetch previews (repeat to finalize)
//! gcv stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed error taxonomy |
//! | [`models`] | Core data types |
//! | [`channel`] | Length-prefixed framing over TCP |
//! | [`protocol`] | Request/response messages |
//! | [`client`] | Tool-side command channel |
//! | [`scripts`] | Lua command builders |
//! | [`content`] | Content tree and editor host capability |
//! | [`lua_runtime`] | Sandboxed Lua host modules |
//! | [`executor`] | Engine-side script session |
//! | [`server`] | Engine-side command server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Asset, scan, and thumbnail persistence |
//! | [`sync`] | Inventory synchronization |
//! | [`cache`] | Content-addressed thumbnail cache |
//! | [`thumbnails`] | Thumbnail refresh pipeline |
//! | [`progress`] | Progress reporting |
//! | [`stats`] | Store summary |
//! | [`get`] | Single-asset lookup |

pub mod cache;
pub mod channel;
pub mod client;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod executor;
pub mod get;
pub mod lua_runtime;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod protocol;
pub mod scripts;
pub mod server;
pub mod stats;
pub mod store;
pub mod sync;
pub mod thumbnails;
