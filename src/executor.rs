//! Engine-side command executor.
//!
//! A single dedicated thread owns one Lua 5.4 session for the lifetime of the
//! engine host. Scripts run strictly one at a time, in the order they were
//! queued, and state left behind by one script (globals, loaded assets) is
//! visible to the next.
//!
//! The session exposes the shared host modules from [`crate::lua_runtime`]
//! plus an `editor` module backed by an [`EditorHost`]:
//!
//! | Function | Returns |
//! |----------|---------|
//! | `editor.list_assets(filter)` | sorted array of object paths |
//! | `editor.find_asset(path)` | `{object_path, class_name, package_path, tags}` or `nil` |
//! | `editor.render_thumbnail(path, size)` | `{status, resolution, data}` |
//!
//! A script error becomes a failed [`ExecutionResult`]; it never takes the
//! thread down. A panic inside a host callback does, and every queued or
//! later request then fails with [`Error::ConnectionClosed`].

use base64::Engine as _;
use mlua::prelude::*;
use mlua::{HookTriggers, VmState};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::content::EditorHost;
use crate::error::{Error, Result};
use crate::lua_runtime::register_all_host_apis;
use crate::models::{AssetDescriptor, PathFilter};
use crate::protocol::ExecutionResult;

/// Instructions between deadline checks.
const HOOK_INTERVAL: u32 = 10_000;

/// Queued requests before callers wait for the executor.
const QUEUE_DEPTH: usize = 64;

/// A persistent scripting session.
pub struct ScriptSession {
    lua: Lua,
    stdout: Arc<Mutex<String>>,
    timeout: Duration,
}

impl ScriptSession {
    pub fn new<H: EditorHost>(host: H, timeout: Duration) -> LuaResult<Self> {
        let lua = Lua::new();
        let stdout = Arc::new(Mutex::new(String::new()));
        register_all_host_apis(&lua, stdout.clone())?;
        register_editor_api(&lua, host)?;
        Ok(Self {
            lua,
            stdout,
            timeout,
        })
    }

    /// Run `script` and capture what it printed.
    pub fn execute(&self, script: &str) -> ExecutionResult {
        lock(&self.stdout).clear();

        let deadline = Instant::now() + self.timeout;
        let timeout = self.timeout;
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
            move |_lua, _debug| {
                if Instant::now() > deadline {
                    Err(mlua::Error::RuntimeError(format!(
                        "script exceeded timeout of {}s",
                        timeout.as_secs()
                    )))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        let outcome = self.lua.load(script).set_name("command").exec();
        self.lua.remove_hook();

        let stdout = std::mem::take(&mut *lock(&self.stdout));
        match outcome {
            Ok(()) => ExecutionResult::success(stdout),
            Err(e) => {
                debug!(error = %e, "script raised");
                ExecutionResult::failure(stdout, e.to_string())
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: editor
// ═══════════════════════════════════════════════════════════════════════

fn register_editor_api<H: EditorHost>(lua: &Lua, host: H) -> LuaResult<()> {
    let host = Arc::new(Mutex::new(host));
    let editor = lua.create_table()?;

    let h = host.clone();
    editor.set(
        "list_assets",
        lua.create_function(move |lua, filter: Option<String>| {
            let filter = PathFilter::new(filter.as_deref().unwrap_or(""));
            let paths = lock(&h).list_assets(&filter);
            lua.create_sequence_from(paths)
        })?,
    )?;

    let h = host.clone();
    editor.set(
        "find_asset",
        lua.create_function(move |lua, object_path: String| {
            match lock(&h).find_asset(&object_path) {
                Some(d) => Ok(Some(descriptor_to_lua(lua, &d)?)),
                None => Ok(None),
            }
        })?,
    )?;

    let h = host;
    editor.set(
        "render_thumbnail",
        lua.create_function(move |lua, (object_path, size): (String, u32)| {
            let out = lock(&h).render_thumbnail(&object_path, size);
            let table = lua.create_table()?;
            table.set("status", out.status.as_str())?;
            table.set("resolution", out.resolution)?;
            if let Some(png) = out.png {
                table.set("data", base64::engine::general_purpose::STANDARD.encode(png))?;
            }
            Ok(table)
        })?,
    )?;

    lua.globals().set("editor", editor)?;
    Ok(())
}

fn descriptor_to_lua(lua: &Lua, d: &AssetDescriptor) -> LuaResult<LuaTable> {
    let table = lua.create_table()?;
    table.set("object_path", d.object_path.as_str())?;
    table.set("class_name", d.class_name.as_str())?;
    table.set("package_path", d.package_path.as_str())?;
    let tags = lua.create_table()?;
    for (k, v) in &d.tags {
        tags.set(k.as_str(), v.as_str())?;
    }
    table.set("tags", tags)?;
    Ok(table)
}

// ═══════════════════════════════════════════════════════════════════════
// Executor thread
// ═══════════════════════════════════════════════════════════════════════

struct Job {
    script: String,
    reply: oneshot::Sender<ExecutionResult>,
}

/// Queue into the executor thread. Cheap to clone; all clones feed the same
/// session.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<Job>,
}

impl ExecutorHandle {
    /// Queue `script` and wait for its result.
    pub async fn execute(&self, script: String) -> Result<ExecutionResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { script, reply })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }
}

/// Start the executor thread with a fresh session over `host`.
pub fn spawn_executor<H: EditorHost>(
    host: H,
    script_timeout: Duration,
) -> anyhow::Result<ExecutorHandle> {
    let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

    std::thread::Builder::new()
        .name("script-executor".to_string())
        .spawn(move || {
            let session = match ScriptSession::new(host, script_timeout) {
                Ok(session) => {
                    let _ = ready_tx.send(Ok(()));
                    session
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            info!("script session ready");
            while let Some(job) = rx.blocking_recv() {
                let result = session.execute(&job.script);
                let _ = job.reply.send(result);
            }
            debug!("script executor stopped");
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(ExecutorHandle { tx }),
        Ok(Err(e)) => anyhow::bail!("Failed to create script session: {}", e),
        Err(_) => anyhow::bail!("Script executor exited during startup"),
    }
}
