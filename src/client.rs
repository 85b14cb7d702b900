//! Tool-side client for the engine's command channel.
//!
//! [`CommandChannel`] is the seam the synchronizer and the thumbnail pipeline
//! are written against; [`EngineClient`] implements it over a real
//! [`Connection`].

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::channel::Connection;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::protocol::{ExecutionResult, Request, Response};

/// A serialized request/response conversation with the engine.
///
/// Implementations must not have more than one request in flight.
#[async_trait]
pub trait CommandChannel: Send {
    /// Run `script` in the engine's scripting session.
    ///
    /// A script that raises returns `Ok` with `succeeded == false`; only
    /// transport faults return `Err`.
    async fn execute(&mut self, script: &str) -> Result<ExecutionResult>;
}

/// A connected client with per-request timeouts.
pub struct EngineClient {
    conn: Connection,
    request_timeout: Duration,
    /// Set after a timeout or transport error; the stream may hold half a
    /// frame, so nothing more may be read from it.
    broken: bool,
}

impl EngineClient {
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let conn = Connection::connect(address, connect_timeout).await?;
        Ok(Self {
            conn,
            request_timeout,
            broken: false,
        })
    }

    pub async fn from_config(engine: &EngineConfig) -> Result<Self> {
        Self::connect(
            &engine.address,
            Duration::from_secs(engine.connect_timeout_secs),
            Duration::from_secs(engine.request_timeout_secs),
        )
        .await
    }

    /// Ask the engine to stop its command server.
    pub async fn shutdown(mut self) -> Result<()> {
        match self.round_trip(Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(Error::protocol(format!(
                "expected shutdown acknowledgement, got {:?}",
                other
            ))),
        }
    }

    async fn round_trip(&mut self, request: Request) -> Result<Response> {
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        let payload = request.encode()?;
        let conn = &mut self.conn;
        let exchange = async move {
            conn.send(&payload).await?;
            conn.receive().await
        };
        let outcome = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        };
        match outcome {
            Ok(bytes) => Response::decode(&bytes),
            Err(e) => {
                if e.is_channel_fault() {
                    warn!(peer = %self.conn.peer(), error = %e, "channel fault");
                    self.broken = true;
                }
                Err(e)
            }
        }
    }
}

/// Entry point for `gcv exec`: run one script and relay its output.
///
/// Returns whether the script succeeded.
pub async fn run_exec(engine: &EngineConfig, script: &str) -> anyhow::Result<bool> {
    let mut client = EngineClient::from_config(engine).await?;
    let result = client.execute(script).await?;
    print!("{}", result.stdout);
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr.trim_end());
    }
    Ok(result.succeeded)
}

/// Entry point for `gcv engine stop`.
pub async fn run_stop(engine: &EngineConfig) -> anyhow::Result<()> {
    let client = EngineClient::from_config(engine).await?;
    client.shutdown().await?;
    println!("engine at {} is shutting down", engine.address);
    Ok(())
}

#[async_trait]
impl CommandChannel for EngineClient {
    async fn execute(&mut self, script: &str) -> Result<ExecutionResult> {
        debug!(bytes = script.len(), "execute");
        match self
            .round_trip(Request::Execute {
                script: script.to_string(),
            })
            .await?
        {
            Response::Result(result) => Ok(result),
            Response::ShuttingDown => Err(Error::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts connections and never answers.
    async fn silent_peer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    #[tokio::test]
    async fn timeout_latches_the_connection_broken() {
        let addr = silent_peer().await;
        let mut client =
            EngineClient::connect(&addr, Duration::from_secs(2), Duration::from_millis(200))
                .await
                .unwrap();

        let first = client.execute("print(1)").await;
        assert!(matches!(first, Err(Error::Timeout(d)) if d == Duration::from_millis(200)));

        // Half a reply may still be in flight, so the connection is not reused.
        let second = client.execute("print(2)").await;
        assert!(matches!(second, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn peer_hangup_is_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        let mut client =
            EngineClient::connect(&addr, Duration::from_secs(2), Duration::from_secs(5))
                .await
                .unwrap();

        let err = client.execute("print(1)").await.unwrap_err();
        assert!(err.is_channel_fault(), "{err}");
    }
}
