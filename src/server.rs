//! Engine-side command server.
//!
//! Listens on TCP, reads length-prefixed [`Request`] frames, and answers each
//! with exactly one [`Response`] frame. `Execute` requests from every
//! connection are funnelled into the single [`ExecutorHandle`] queue, so the
//! scripting session sees one command at a time in arrival order.
//!
//! # Requests
//!
//! | Request | Response | Effect |
//! |---------|----------|--------|
//! | `execute` | `result` | runs the script in the shared session |
//! | `shutdown` | `shutting_down` | stops accepting and closes idle connections |
//!
//! A command already read from the wire always runs to completion, even if a
//! shutdown arrives on another connection meanwhile.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::Connection;
use crate::config::Config;
use crate::content::{ContentTree, EditorHost, ManifestHost};
use crate::error::Error;
use crate::executor::{spawn_executor, ExecutorHandle};
use crate::protocol::{ExecutionResult, Request, Response};

/// A bound command server, ready to [`serve`](EngineServer::serve).
pub struct EngineServer {
    listener: TcpListener,
    executor: ExecutorHandle,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
}

impl EngineServer {
    pub async fn bind(
        addr: &str,
        executor: ExecutorHandle,
        max_frame_bytes: usize,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            executor,
            max_frame_bytes,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the server when cancelled. A `shutdown` request
    /// cancels it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shut down.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, "engine command server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "set_nodelay failed");
                        }
                        let conn = Connection::from_stream(stream, peer)
                            .with_max_frame_bytes(self.max_frame_bytes);
                        tokio::spawn(handle_connection(
                            conn,
                            self.executor.clone(),
                            self.shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!(%addr, "engine command server stopped");
        Ok(())
    }
}

/// Serve one connection's requests in order.
async fn handle_connection(
    mut conn: Connection,
    executor: ExecutorHandle,
    shutdown: CancellationToken,
) {
    let peer = conn.peer();
    debug!(%peer, "connection opened");

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = conn.receive() => frame,
        };
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(Error::ConnectionClosed) => break,
            Err(e) => {
                warn!(%peer, error = %e, "dropping connection");
                break;
            }
        };

        let response = match Request::decode(&bytes) {
            Ok(Request::Execute { script }) => match executor.execute(script).await {
                Ok(result) => Response::Result(result),
                Err(e) => {
                    error!(%peer, error = %e, "script executor is gone");
                    break;
                }
            },
            Ok(Request::Shutdown) => {
                info!(%peer, "shutdown requested");
                if let Err(e) = send(&mut conn, &Response::ShuttingDown).await {
                    debug!(%peer, error = %e, "shutdown acknowledgement not delivered");
                }
                shutdown.cancel();
                break;
            }
            Err(e) => Response::Result(ExecutionResult::failure(String::new(), e.to_string())),
        };

        if let Err(e) = send(&mut conn, &response).await {
            debug!(%peer, error = %e, "reply not delivered");
            break;
        }
    }

    debug!(%peer, "connection closed");
}

async fn send(conn: &mut Connection, response: &Response) -> crate::error::Result<()> {
    let payload = response.encode()?;
    conn.send(&payload).await
}

/// Start an engine host with `host` as its content tree and serve until a
/// shutdown request or Ctrl-C.
pub async fn run_engine_with_host<H: EditorHost>(config: &Config, host: H) -> anyhow::Result<()> {
    let executor = spawn_executor(
        host,
        Duration::from_secs(config.engine_host.script_timeout_secs),
    )?;
    let server = EngineServer::bind(
        &config.engine_host.bind,
        executor,
        config.engine_host.max_frame_bytes,
    )
    .await?;

    let token = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            token.cancel();
        }
    });

    server.serve().await
}

/// Entry point for `gcv engine serve`.
pub async fn run_engine(config: &Config) -> anyhow::Result<()> {
    let placeholder = config.engine_host.placeholder_resolution;
    match &config.engine_host.content_manifest {
        Some(path) => run_engine_with_host(config, ManifestHost::open(path, placeholder)?).await,
        None => {
            warn!("engine_host.content_manifest not set; serving an empty content tree");
            run_engine_with_host(config, ContentTree::new(placeholder)).await
        }
    }
}
